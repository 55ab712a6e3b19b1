//! Dockerfile composition.
//!
//! The composer is a pure function: a [`Composition`] value in, a rendered
//! Dockerfile (plus the selected variant name and a sha256 of the text)
//! out. Identical inputs produce byte-identical output: no timestamps, no
//! randomness. Base variants are complete Dockerfiles bundled with the
//! platform and loaded once at startup from a read-only directory.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::analyzer::Classification;
use crate::catalog::models::BaseImageChoice;
use crate::errors::PipelineError;

/// Version stamp embedded in the labels block so containers built by older
/// composers can be told apart.
pub const COMPOSER_VERSION: &str = "2";

/// The five bundled base variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseVariant {
    Minimal,
    Py39,
    Py310,
    Py311,
    Py310Datascience,
}

impl BaseVariant {
    pub const ALL: [BaseVariant; 5] = [
        BaseVariant::Minimal,
        BaseVariant::Py39,
        BaseVariant::Py310,
        BaseVariant::Py311,
        BaseVariant::Py310Datascience,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Py39 => "py39",
            Self::Py310 => "py310",
            Self::Py311 => "py311",
            Self::Py310Datascience => "py310-datascience",
        }
    }

    /// Bundled file name under the base-dockerfile directory.
    pub fn file_name(&self) -> String {
        format!("Dockerfile.{}", self.as_str())
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Minimal => "Slim Python 3.11, no native toolchain",
            Self::Py39 => "Python 3.9 with build-essential",
            Self::Py310 => "Python 3.10 with compiler toolchain",
            Self::Py311 => "Python 3.11 with compiler toolchain",
            Self::Py310Datascience => {
                "Python 3.10 with Fortran/BLAS toolchain and numpy/pandas/scipy preinstalled"
            }
        }
    }
}

impl std::fmt::Display for BaseVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "py39" => Ok(Self::Py39),
            "py310" => Ok(Self::Py310),
            "py311" => Ok(Self::Py311),
            "py310-datascience" => Ok(Self::Py310Datascience),
            _ => Err(format!("Unknown base variant: {}", s)),
        }
    }
}

/// Base Dockerfiles, loaded once at startup and immutable afterwards.
pub struct BaseLibrary {
    variants: BTreeMap<BaseVariant, String>,
}

impl BaseLibrary {
    /// Load all five variants from the directory; every file must exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut variants = BTreeMap::new();
        for variant in BaseVariant::ALL {
            let path = dir.join(variant.file_name());
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read base Dockerfile {}", path.display()))?;
            variants.insert(variant, content);
        }
        Ok(Self { variants })
    }

    pub fn content(&self, variant: BaseVariant) -> &str {
        // All five are guaranteed present by load()
        &self.variants[&variant]
    }

    /// Listing for the request surface: `{type, name, description}`.
    pub fn describe(&self) -> Vec<BaseDescription> {
        BaseVariant::ALL
            .iter()
            .map(|v| BaseDescription {
                variant: *v,
                name: v.file_name(),
                description: v.description().to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BaseDescription {
    #[serde(rename = "type")]
    pub variant: BaseVariant,
    pub name: String,
    pub description: String,
}

/// Everything the composer needs to render a Dockerfile.
#[derive(Debug, Clone)]
pub struct Composition<'a> {
    pub app_id: i64,
    pub entry_file: &'a str,
    pub base_image_choice: BaseImageChoice,
    pub custom_base_image: Option<&'a str>,
    pub custom_overlay: Option<&'a str>,
    pub has_requirements: bool,
    pub classification: &'a Classification,
}

/// A rendered Dockerfile plus its provenance.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub dockerfile: String,
    /// Selected base variant; `None` when a custom base image was used.
    pub variant: Option<BaseVariant>,
    /// sha256 hex digest of `dockerfile`.
    pub content_hash: String,
}

/// Pick the base variant for `auto` from the requirements classification.
pub fn select_variant(choice: BaseImageChoice, classification: &Classification) -> BaseVariant {
    match choice {
        BaseImageChoice::Minimal => BaseVariant::Minimal,
        BaseImageChoice::Py39 => BaseVariant::Py39,
        BaseImageChoice::Py310 => BaseVariant::Py310,
        BaseImageChoice::Py311 => BaseVariant::Py311,
        BaseImageChoice::Auto => {
            if classification.needs_datascience {
                BaseVariant::Py310Datascience
            } else if !classification.problematic.is_empty() {
                BaseVariant::Py311
            } else {
                BaseVariant::Minimal
            }
        }
    }
}

/// Render the final Dockerfile. Deterministic: `compose(x) == compose(x)`
/// byte for byte.
pub fn compose(bases: &BaseLibrary, input: &Composition<'_>) -> Result<Rendered, PipelineError> {
    if let Some(overlay) = input.custom_overlay {
        validate_overlay(overlay)?;
    }

    let mut out = String::new();
    let variant = if let Some(image) = input.custom_base_image {
        let image = image.trim();
        if image.is_empty() || image.contains(char::is_whitespace) {
            return Err(PipelineError::InvalidInput(format!(
                "invalid custom base image '{image}'"
            )));
        }
        out.push_str(&custom_base_header(image));
        None
    } else {
        let variant = select_variant(input.base_image_choice, input.classification);
        out.push_str(bases.content(variant).trim_end());
        out.push('\n');
        Some(variant)
    };

    out.push('\n');
    out.push_str(&labels_block(input.app_id, input.entry_file));

    if let Some(overlay) = input.custom_overlay {
        out.push_str("\n# --- user overlay ---\n");
        out.push_str(overlay.trim_end());
        out.push('\n');
    }

    out.push_str(&app_tail(
        input.entry_file,
        input.has_requirements,
        input.classification,
    ));

    let content_hash = format!("{:x}", Sha256::digest(out.as_bytes()));
    Ok(Rendered {
        dockerfile: out,
        variant,
        content_hash,
    })
}

/// Overlays run inside the app's single build stage; a second FROM would
/// silently discard the base.
pub fn validate_overlay(overlay: &str) -> Result<(), PipelineError> {
    for line in overlay.lines() {
        let first = line.trim().split_whitespace().next().unwrap_or("");
        if first.eq_ignore_ascii_case("FROM") {
            return Err(PipelineError::InvalidInput(
                "custom overlay must not contain FROM instructions".to_string(),
            ));
        }
    }
    Ok(())
}

/// Minimal header for a user-supplied base image, with the safety block
/// the bundled bases already carry.
fn custom_base_header(image: &str) -> String {
    format!(
        "FROM {image}\n\
         \n\
         WORKDIR /app\n\
         \n\
         EXPOSE 8501\n\
         \n\
         HEALTHCHECK --interval=30s --timeout=10s --start-period=30s --retries=3 \\\n    \
         CMD curl --fail http://localhost:8501/_stcore/health || exit 1\n\
         \n\
         RUN useradd -m -u 1000 streamlit 2>/dev/null || true && \\\n    \
         chown -R streamlit:streamlit /app\n"
    )
}

fn labels_block(app_id: i64, entry_file: &str) -> String {
    format!(
        "LABEL platform.app_id=\"{app_id}\"\n\
         LABEL platform.entry_file=\"{entry_file}\"\n\
         LABEL platform.composer=\"{COMPOSER_VERSION}\"\n"
    )
}

/// The fixed tail: requirements install, app copy, cache purge, non-root
/// entrypoint.
fn app_tail(entry_file: &str, has_requirements: bool, classification: &Classification) -> String {
    let mut out = String::new();

    if has_requirements {
        out.push_str("\nCOPY requirements.txt .\n");
        // Problematic packages go in one at a time so a single source build
        // failing points at the culprit.
        for spec in &classification.problematic {
            let spec = spec
                .split('#')
                .next()
                .unwrap_or(spec)
                .trim();
            if !spec.is_empty() {
                out.push_str(&format!(
                    "RUN pip install --no-cache-dir \"{}\"\n",
                    spec.replace('"', "")
                ));
            }
        }
        out.push_str(
            "RUN pip install --no-cache-dir -r requirements.txt || \\\n    \
             while IFS= read -r req; do \\\n        \
             case \"$req\" in ''|'#'*) continue ;; esac; \\\n        \
             pip install --no-cache-dir \"$req\" || true; \\\n    \
             done < requirements.txt\n",
        );
    }

    out.push_str(
        "\nCOPY . .\n\
         \n\
         RUN find . -name \"*.pyc\" -delete && \\\n    \
         find . -name \"__pycache__\" -type d -exec rm -rf {} + || true\n\
         \n\
         USER streamlit\n\n",
    );
    out.push_str(&format!(
        "ENTRYPOINT [\"streamlit\", \"run\", \"{entry_file}\", \\\n    \
         \"--server.port=8501\", \\\n    \
         \"--server.address=0.0.0.0\", \\\n    \
         \"--server.headless=true\", \\\n    \
         \"--server.enableCORS=false\", \\\n    \
         \"--server.enableXsrfProtection=false\"]\n"
    ));
    out
}

/// Sanity check that an entry file name can be embedded in the entrypoint.
pub fn validate_entry_file(entry_file: &str) -> Result<()> {
    if entry_file.is_empty() {
        bail!("entry file must not be empty");
    }
    if entry_file.contains('"') || entry_file.contains('\n') || entry_file.starts_with('/') {
        bail!("entry file '{entry_file}' contains unsupported characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::classify_requirements;

    fn library() -> BaseLibrary {
        let mut variants = BTreeMap::new();
        for v in BaseVariant::ALL {
            variants.insert(
                v,
                format!("FROM python:test-{}\nWORKDIR /app\nEXPOSE 8501\n", v),
            );
        }
        BaseLibrary { variants }
    }

    fn composition<'a>(classification: &'a Classification) -> Composition<'a> {
        Composition {
            app_id: 7,
            entry_file: "app.py",
            base_image_choice: BaseImageChoice::Auto,
            custom_base_image: None,
            custom_overlay: None,
            has_requirements: true,
            classification,
        }
    }

    #[test]
    fn auto_selects_minimal_for_clean_requirements() {
        let c = classify_requirements("streamlit==1.28.1\n");
        assert_eq!(
            select_variant(BaseImageChoice::Auto, &c),
            BaseVariant::Minimal
        );
    }

    #[test]
    fn auto_selects_datascience_for_numeric_stack() {
        let c = classify_requirements("pandas==2.0.3\nnumpy==1.24.3\n");
        assert_eq!(
            select_variant(BaseImageChoice::Auto, &c),
            BaseVariant::Py310Datascience
        );
    }

    #[test]
    fn auto_selects_py311_for_other_problematic() {
        let c = classify_requirements("pillow==10.0.0\n");
        assert_eq!(
            select_variant(BaseImageChoice::Auto, &c),
            BaseVariant::Py311
        );
    }

    #[test]
    fn explicit_choice_wins_over_classification() {
        let c = classify_requirements("pandas==2.0.3\n");
        assert_eq!(
            select_variant(BaseImageChoice::Py39, &c),
            BaseVariant::Py39
        );
    }

    #[test]
    fn compose_is_deterministic() {
        let bases = library();
        let c = classify_requirements("pandas==2.0.3\nstreamlit\n");
        let input = composition(&c);
        let first = compose(&bases, &input).unwrap();
        let second = compose(&bases, &input).unwrap();
        assert_eq!(first.dockerfile, second.dockerfile);
        assert_eq!(first.content_hash, second.content_hash);
    }

    #[test]
    fn compose_orders_base_labels_overlay_tail() {
        let bases = library();
        let c = classify_requirements("streamlit\n");
        let mut input = composition(&c);
        input.custom_overlay = Some("RUN apt-get install -y ffmpeg");
        let rendered = compose(&bases, &input).unwrap();
        let text = &rendered.dockerfile;

        let base = text.find("FROM python:test-minimal").unwrap();
        let labels = text.find("LABEL platform.app_id=\"7\"").unwrap();
        let overlay = text.find("RUN apt-get install -y ffmpeg").unwrap();
        let copy_all = text.find("COPY . .").unwrap();
        let entrypoint = text.find("ENTRYPOINT [\"streamlit\"").unwrap();
        assert!(base < labels && labels < overlay && overlay < copy_all && copy_all < entrypoint);
        assert_eq!(rendered.variant, Some(BaseVariant::Minimal));
    }

    #[test]
    fn problematic_packages_install_individually_before_bulk() {
        let bases = library();
        let c = classify_requirements("numpy==1.24.3\npandas==2.0.3\nstreamlit\n");
        let rendered = compose(&bases, &composition(&c)).unwrap();
        let text = &rendered.dockerfile;

        let numpy = text.find("RUN pip install --no-cache-dir \"numpy==1.24.3\"").unwrap();
        let pandas = text.find("RUN pip install --no-cache-dir \"pandas==2.0.3\"").unwrap();
        let bulk = text.find("-r requirements.txt").unwrap();
        assert!(numpy < pandas && pandas < bulk);
        // The bulk install falls back to a per-line loop
        assert!(text.contains("done < requirements.txt"));
    }

    #[test]
    fn no_requirements_skips_install_section() {
        let bases = library();
        let c = Classification::default();
        let mut input = composition(&c);
        input.has_requirements = false;
        let rendered = compose(&bases, &input).unwrap();
        assert!(!rendered.dockerfile.contains("requirements.txt"));
        assert!(rendered.dockerfile.contains("COPY . ."));
    }

    #[test]
    fn custom_base_image_gets_safety_block() {
        let bases = library();
        let c = Classification::default();
        let mut input = composition(&c);
        input.custom_base_image = Some("mycorp/python-base:3.12");
        let rendered = compose(&bases, &input).unwrap();
        let text = &rendered.dockerfile;
        assert!(text.starts_with("FROM mycorp/python-base:3.12\n"));
        assert!(text.contains("WORKDIR /app"));
        assert!(text.contains("EXPOSE 8501"));
        assert!(text.contains("HEALTHCHECK"));
        assert!(text.contains("useradd -m -u 1000 streamlit"));
        assert_eq!(rendered.variant, None);
    }

    #[test]
    fn overlay_with_from_is_rejected() {
        let bases = library();
        let c = Classification::default();
        let mut input = composition(&c);
        input.custom_overlay = Some("RUN echo ok\nFROM alpine\n");
        let err = compose(&bases, &input).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));

        // Case-insensitive
        input.custom_overlay = Some("from alpine");
        assert!(compose(&bases, &input).is_err());

        // FROM in a comment or mid-line is fine
        input.custom_overlay = Some("# FROM is rejected elsewhere\nRUN echo FROM");
        assert!(compose(&bases, &input).is_ok());
    }

    #[test]
    fn invalid_custom_base_image_is_rejected() {
        let bases = library();
        let c = Classification::default();
        let mut input = composition(&c);
        input.custom_base_image = Some("bad image name");
        assert!(compose(&bases, &input).is_err());
        input.custom_base_image = Some("  ");
        assert!(compose(&bases, &input).is_err());
    }

    #[test]
    fn entrypoint_flags_are_complete() {
        let bases = library();
        let c = Classification::default();
        let rendered = compose(&bases, &composition(&c)).unwrap();
        for flag in [
            "--server.port=8501",
            "--server.address=0.0.0.0",
            "--server.headless=true",
            "--server.enableCORS=false",
            "--server.enableXsrfProtection=false",
        ] {
            assert!(rendered.dockerfile.contains(flag), "missing {flag}");
        }
    }

    #[test]
    fn base_variant_roundtrip() {
        for v in BaseVariant::ALL {
            assert_eq!(v.as_str().parse::<BaseVariant>().unwrap(), v);
        }
        assert!("py312".parse::<BaseVariant>().is_err());
    }

    #[test]
    fn library_load_requires_all_variants() {
        let dir = tempfile::tempdir().unwrap();
        for v in &BaseVariant::ALL[..4] {
            std::fs::write(dir.path().join(v.file_name()), "FROM python:3.11\n").unwrap();
        }
        // Missing datascience file fails the load
        assert!(BaseLibrary::load(dir.path()).is_err());

        std::fs::write(
            dir.path()
                .join(BaseVariant::Py310Datascience.file_name()),
            "FROM python:3.10\n",
        )
        .unwrap();
        let library = BaseLibrary::load(dir.path()).unwrap();
        assert_eq!(library.describe().len(), 5);
    }

    #[test]
    fn bundled_base_dockerfiles_load() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("base_dockerfiles");
        let library = BaseLibrary::load(&dir).unwrap();
        for v in BaseVariant::ALL {
            let content = library.content(v);
            assert!(content.starts_with('#'), "{v} missing header comment");
            assert!(content.contains("FROM python:"), "{v} missing FROM");
            assert!(content.contains("EXPOSE 8501"), "{v} missing EXPOSE");
            assert!(content.contains("HEALTHCHECK"), "{v} missing HEALTHCHECK");
            assert!(
                content.contains("useradd -m -u 1000 streamlit"),
                "{v} missing non-root user"
            );
            assert!(
                !content.contains("COPY"),
                "{v} must end before any COPY of app code"
            );
        }
    }

    #[test]
    fn validate_entry_file_rules() {
        assert!(validate_entry_file("app.py").is_ok());
        assert!(validate_entry_file("src/main.py").is_ok());
        assert!(validate_entry_file("").is_err());
        assert!(validate_entry_file("/etc/passwd").is_err());
        assert!(validate_entry_file("a\"b.py").is_err());
    }
}
