use rollcall_core::{EmbedderSpec, Normalization};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown normalization {0:?} (expected \"standardize\" or \"unit\")")]
    Normalization(String),
    #[error("{key} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        key: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
}

/// Runtime configuration.
///
/// Built from an optional TOML file named by `ROLLCALL_CONFIG`, then
/// `ROLLCALL_*` environment variables, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detector file name, relative to `model_dir`.
    pub detector_model: String,
    /// FaceNet embedder file name, relative to `model_dir`.
    pub embedder_model: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Similarity gap under which a rival candidate marks a match contested.
    pub tie_margin: f32,
    /// Descriptor dimensionality produced by the embedder.
    pub descriptor_dim: usize,
    /// Pixel normalization the embedder was trained with.
    pub normalization: Normalization,
    /// Location recorded when `mark` is given none.
    pub default_location: String,
}

/// Values accepted from the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub detector_model: Option<String>,
    pub embedder_model: Option<String>,
    pub db_path: Option<PathBuf>,
    pub similarity_threshold: Option<f32>,
    pub tie_margin: Option<f32>,
    pub descriptor_dim: Option<usize>,
    pub normalization: Option<String>,
    pub default_location: Option<String>,
}

impl FileConfig {
    pub fn read(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                tracing::debug!(path = %path.display(), "reading config file");
                FileConfig::read(&path)?
            }
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge `file` with variables looked up through `env`. Env wins.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let normalization = env("ROLLCALL_NORMALIZATION")
            .or(file.normalization)
            .map(|v| parse_normalization(&v))
            .transpose()?
            .unwrap_or(Normalization::Standardize);

        let similarity_threshold = parsed(&env, "ROLLCALL_SIMILARITY_THRESHOLD")
            .or(file.similarity_threshold)
            .unwrap_or(rollcall_core::matcher::DEFAULT_THRESHOLD);
        let tie_margin = parsed(&env, "ROLLCALL_TIE_MARGIN")
            .or(file.tie_margin)
            .unwrap_or(rollcall_core::decision::DEFAULT_TIE_MARGIN);

        Ok(Self {
            model_dir: env("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            detector_model: env("ROLLCALL_DETECTOR_MODEL")
                .or(file.detector_model)
                .unwrap_or_else(|| "det_10g.onnx".to_string()),
            embedder_model: env("ROLLCALL_EMBEDDER_MODEL")
                .or(file.embedder_model)
                .unwrap_or_else(|| "facenet.onnx".to_string()),
            db_path: env("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            similarity_threshold: in_range("similarity_threshold", similarity_threshold, -1.0, 1.0)?,
            tie_margin: in_range("tie_margin", tie_margin, 0.0, 1.0)?,
            descriptor_dim: parsed(&env, "ROLLCALL_DESCRIPTOR_DIM")
                .or(file.descriptor_dim)
                .unwrap_or(128),
            normalization,
            default_location: env("ROLLCALL_LOCATION")
                .or(file.default_location)
                .unwrap_or_else(|| "Main Gate".to_string()),
        })
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedder_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Embedding backend description for this deployment.
    pub fn embedder_spec(&self) -> EmbedderSpec {
        let preset = match self.normalization {
            Normalization::Standardize => EmbedderSpec::facenet(),
            Normalization::UnitRange => EmbedderSpec::facenet_unit(),
        };
        EmbedderSpec {
            dimension: self.descriptor_dim,
            ..preset
        }
    }
}

/// Unparseable values fall back to the next source.
fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable value");
            None
        }
    }
}

/// NaN fails both comparisons and is rejected with the rest.
fn in_range(key: &'static str, value: f32, min: f32, max: f32) -> Result<f32, ConfigError> {
    if value >= min && value <= max {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange { key, value, min, max })
    }
}

fn parse_normalization(value: &str) -> Result<Normalization, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "standardize" | "standard" => Ok(Normalization::Standardize),
        "unit" | "unit_range" => Ok(Normalization::UnitRange),
        _ => Err(ConfigError::Normalization(value.to_string())),
    }
}
