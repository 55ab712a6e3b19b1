//! Requirements analysis for cloned workspaces.
//!
//! Inspects `requirements.txt` (or `pyproject.toml` / `Pipfile.lock`) at the
//! workspace root and classifies the app's Python dependencies so the
//! composer can pick a base image. Packages that historically need a
//! C/Fortran toolchain are flagged "problematic"; the numeric-stack subset
//! of those drives the datascience base selection.

use std::path::Path;

use serde::Serialize;

/// Packages that historically require native toolchains to build.
pub const PROBLEMATIC_PACKAGES: &[&str] = &[
    "numpy",
    "scipy",
    "pandas",
    "scikit-learn",
    "torch",
    "tensorflow",
    "pillow",
    "lxml",
    "h5py",
];

/// The numeric/data-science subset of [`PROBLEMATIC_PACKAGES`]. Any of
/// these pushes the auto selection to the datascience base image.
const DATASCIENCE_PACKAGES: &[&str] = &[
    "numpy",
    "scipy",
    "pandas",
    "scikit-learn",
    "torch",
    "tensorflow",
];

/// Result of scanning a workspace's dependency manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Classification {
    /// Version constraint found in `python_requires` / `requires-python`,
    /// when one exists.
    pub python_version_hint: Option<String>,
    /// True when any problematic package belongs to the numeric stack.
    pub needs_datascience: bool,
    /// Requirement specs (as written) whose package is problematic,
    /// in file order.
    pub problematic: Vec<String>,
}

/// Canonicalize a distribution name for comparison (PEP 503: lowercase,
/// `-`/`_`/`.` runs fold to a single `-`).
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dash = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c == '-' || c == '_' || c == '.' {
            if !prev_dash {
                out.push('-');
                prev_dash = true;
            }
        } else {
            out.push(c);
            prev_dash = false;
        }
    }
    out.trim_matches('-').to_string()
}

/// Extract the distribution name from one requirement line, ignoring
/// extras, version specifiers, and environment markers. Returns `None`
/// for blanks, comments, and pip options.
fn requirement_name(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
        return None;
    }
    // Strip environment markers and inline comments first
    let line = line.split(';').next().unwrap_or(line);
    let line = line.split('#').next().unwrap_or(line);
    let end = line
        .find(|c: char| ['[', '=', '<', '>', '!', '~', ' ', '@'].contains(&c))
        .unwrap_or(line.len());
    let name = line[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(canonical_name(name))
    }
}

/// Analyze the workspace's dependencies. Missing manifests yield an empty
/// classification.
pub fn analyze(workspace: &Path) -> Classification {
    let requirements = workspace.join("requirements.txt");
    if requirements.is_file() {
        if let Ok(content) = std::fs::read_to_string(&requirements) {
            return classify_requirements(&content);
        }
    }
    let pyproject = workspace.join("pyproject.toml");
    if pyproject.is_file() {
        if let Ok(content) = std::fs::read_to_string(&pyproject) {
            return classify_pyproject(&content);
        }
    }
    let pipfile_lock = workspace.join("Pipfile.lock");
    if pipfile_lock.is_file() {
        if let Ok(content) = std::fs::read_to_string(&pipfile_lock) {
            return classify_pipfile_lock(&content);
        }
    }
    Classification::default()
}

/// Classify a `requirements.txt` body.
pub fn classify_requirements(content: &str) -> Classification {
    let mut problematic = Vec::new();
    let mut needs_datascience = false;
    for line in content.lines() {
        let Some(name) = requirement_name(line) else {
            continue;
        };
        if PROBLEMATIC_PACKAGES.contains(&name.as_str()) {
            problematic.push(line.trim().to_string());
            if DATASCIENCE_PACKAGES.contains(&name.as_str()) {
                needs_datascience = true;
            }
        }
    }
    Classification {
        python_version_hint: None,
        needs_datascience,
        problematic,
    }
}

fn classify_pyproject(content: &str) -> Classification {
    let Ok(doc) = toml::from_str::<toml::Value>(content) else {
        return Classification::default();
    };
    let project = doc.get("project");
    let python_version_hint = project
        .and_then(|p| p.get("requires-python"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let deps: Vec<String> = project
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let mut classification = classify_requirements(&deps.join("\n"));
    classification.python_version_hint = python_version_hint;
    classification
}

fn classify_pipfile_lock(content: &str) -> Classification {
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(content) else {
        return Classification::default();
    };
    let python_version_hint = doc
        .pointer("/_meta/requires/python_version")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut problematic = Vec::new();
    let mut needs_datascience = false;
    if let Some(defaults) = doc.get("default").and_then(|d| d.as_object()) {
        for (name, entry) in defaults {
            let canonical = canonical_name(name);
            if PROBLEMATIC_PACKAGES.contains(&canonical.as_str()) {
                let version = entry
                    .get("version")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                problematic.push(format!("{name}{version}"));
                if DATASCIENCE_PACKAGES.contains(&canonical.as_str()) {
                    needs_datascience = true;
                }
            }
        }
    }
    Classification {
        python_version_hint,
        needs_datascience,
        problematic,
    }
}
