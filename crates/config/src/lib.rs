//! Layered configuration.
//!
//! Later layers win:
//! 1. built-in defaults,
//! 2. a configuration file (`--config`, or `vitrine.toml` in the platform's
//!    configuration directory when it exists),
//! 3. `VITRINE_` environment variables, nested with `__`
//!    (`VITRINE_STORE__BUCKET=photos`),
//! 4. command-line overrides.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::{BaseDirs, ProjectDirs, UserDirs};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZero;
use std::path::{Path, PathBuf};
use vitrine_media::DerivativeSettings;

const ENV_PREFIX: &str = "VITRINE_";
const FILE_NAME: &str = "vitrine.toml";

/// A credential that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);
impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}
impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    S3 {
        bucket: String,
        region: String,
        /// For S3-compatible services; AWS when unset.
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: Secret,
        /// Key prefix every object is stored under.
        #[serde(default)]
        prefix: Option<String>,
        /// Base URL consumers fetch objects from, typically a CDN.
        #[serde(default)]
        public_url: Option<String>,
    },
    Local {
        root: PathBuf,
        #[serde(default)]
        public_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub concurrency: usize,
    /// Where temporary working storage goes; the system temporary directory
    /// when unset.
    pub temp_dir: Option<PathBuf>,
}
impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism().map(NonZero::get).unwrap_or(4),
            temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root of the source tree; its subdirectories are sections.
    pub source: PathBuf,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub derivatives: DerivativeSettings,
    /// Delete blobs the newly published catalog doesn't reference.
    #[serde(default)]
    pub prune: bool,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            source: default_source(),
            store: None,
            pipeline: PipelineConfig::default(),
            derivatives: DerivativeSettings::default(),
            prune: false,
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub source: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub prune: Option<bool>,
}

/// The user's Pictures directory, falling back to `~/Pictures`.
fn default_source() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.picture_dir().map(Path::to_path_buf))
        .or_else(|| BaseDirs::new().map(|dirs| dirs.home_dir().join("Pictures")))
        .unwrap_or_else(|| PathBuf::from("Pictures"))
}

/// `vitrine.toml` in the platform configuration directory.
pub fn default_config_file() -> Option<PathBuf> {
    ProjectDirs::from("", "", "vitrine").map(|dirs| dirs.config_dir().join(FILE_NAME))
}

fn file_provider(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file_exact(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}

impl Config {
    /// Every layer except command-line overrides.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match file {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::FileNotFound(path.to_path_buf())),
            Some(path) => figment = file_provider(figment, path)?,
            None => {
                if let Some(path) = default_config_file().filter(|p| p.is_file()) {
                    tracing::debug!(path = %path.display(), "Using default configuration file");
                    figment = file_provider(figment, &path)?;
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load, apply overrides and validate.
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut figment = Self::figment(file)?;
        if let Some(source) = &overrides.source {
            figment = figment.merge(Serialized::default("source", source));
        }
        if let Some(concurrency) = overrides.concurrency {
            figment = figment.merge(Serialized::default("pipeline.concurrency", concurrency));
        }
        if let Some(prune) = overrides.prune {
            figment = figment.merge(Serialized::default("prune", prune));
        }
        let config: Config = figment.extract().map_err(|err| exn::Exn::from(ErrorKind::Extract(err.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| exn::Exn::from(ErrorKind::Invalid(message.to_string()));
        if self.pipeline.concurrency == 0 {
            return Err(invalid("pipeline.concurrency must be at least 1"));
        }
        let derivatives = &self.derivatives;
        if !(1..=100).contains(&derivatives.thumbnail_quality) {
            return Err(invalid("derivatives.thumbnail_quality must be between 1 and 100"));
        }
        if derivatives.thumbnail_max_width == 0 || derivatives.preview_height == 0 || derivatives.preview_seconds == 0 {
            return Err(invalid("derivative sizes and durations must be greater than zero"));
        }
        if !derivatives.frame_offset_seconds.is_finite() || derivatives.frame_offset_seconds < 0.0 {
            return Err(invalid("derivatives.frame_offset_seconds must be zero or positive"));
        }
        match &self.store {
            None => exn::bail!(ErrorKind::MissingStore),
            Some(StoreConfig::Local { root, .. }) if !root.is_absolute() => {
                return Err(invalid("store.root must be an absolute path"));
            },
            Some(StoreConfig::S3 { bucket, key_id, key_secret, .. })
                if bucket.is_empty() || key_id.is_empty() || key_secret.expose().is_empty() =>
            {
                return Err(invalid("store.bucket, store.key_id and store.key_secret must not be empty"));
            },
            Some(_) => {},
        }
        Ok(())
    }
}
