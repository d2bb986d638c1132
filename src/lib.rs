//! # SFC Dev Server
//!
//! Development-time content pipeline. Requests for single-file components,
//! plain ES modules and virtual packages are transformed on demand into
//! browser-executable modules and cached until their source changes.
//!
//! The pipeline never bundles. It classifies a request path, obtains the
//! output from the freshness-aware cache (or computes it exactly once per
//! key), and hands anything it does not recognize back to the host.

pub mod dispatch;
pub mod packages;
pub mod plugin;
pub mod rewrite;
pub mod server;
pub mod sfc;
pub mod source;
pub mod utils;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dispatch::{BufferedResponse, ContentDispatcher, DevRequest, Dispatch, ResponseSink};

/// Compiled module code shared between the cache and in-flight requests.
pub type Payload = Arc<str>;

pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// File looked up in the project root by [`PipelineConfig::load`].
pub const CONFIG_FILE_NAME: &str = "sfc-dev-server.json";

/// Default aggregate cache weight (32 MiB of weighted payload).
pub const DEFAULT_CACHE_MAX_WEIGHT: usize = 32 * 1024 * 1024;

/// Describes HOW requests are served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Enable the freshness-aware cache. Without it every request
    /// runs the full compute path.
    pub cache: bool,
    /// Embed base64 source maps into compiled component blocks.
    pub source_maps: bool,
    /// Suffix that marks a single-file component request.
    pub component_suffix: String,
    /// Upper bound on the summed weight of all cached entries.
    pub cache_max_weight: usize,
    /// Extra virtual packages (name → vendored ESM file). Relative paths
    /// resolve against the project root.
    pub packages: BTreeMap<String, PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache: true,
            source_maps: false,
            component_suffix: ".vue".to_string(),
            cache_max_weight: DEFAULT_CACHE_MAX_WEIGHT,
            packages: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Read `sfc-dev-server.json` from `root`, or fall back to defaults
    /// when the file is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.component_suffix.starts_with('.') || self.component_suffix.len() < 2 {
            return Err(PipelineError::Config(format!(
                "component_suffix must look like `.ext`, got `{}`",
                self.component_suffix
            )));
        }
        if self.component_suffix == utils::SCRIPT_SUFFIX {
            return Err(PipelineError::Config(
                "component_suffix must differ from the plain script suffix".into(),
            ));
        }
        if self.cache_max_weight == 0 {
            return Err(PipelineError::Config(
                "cache_max_weight must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn with_source_maps(mut self, enabled: bool) -> Self {
        self.source_maps = enabled;
        self
    }

    pub fn with_component_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.component_suffix = suffix.into();
        self
    }

    pub fn with_cache_max_weight(mut self, weight: usize) -> Self {
        self.cache_max_weight = weight;
        self
    }

    pub fn with_package(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.packages.insert(name.into(), path.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic reported by a component compiler or preprocessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message: message.into(),
            context: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagnosticLevel::Error
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Errors that abort a single request.
///
/// `Clone` so one failed computation can be handed to every request that
/// was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Compile error in {}: {message}", filepath.display())]
    Compile { filepath: PathBuf, message: String },

    #[error("Unsupported package '{name}': npm imports are not supported yet")]
    UnsupportedPackage { name: String },

    #[error("Rewrite error at line {line}: {message}")]
    Rewrite { line: usize, message: String },

    #[error("Path escapes the project root: {path}")]
    PathEscapesRoot { path: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Classify an IO failure on `path`; a missing file becomes `NotFound`.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            PipelineError::NotFound { path }
        } else {
            PipelineError::Io {
                path,
                source: Arc::new(err),
            }
        }
    }

    pub fn compile(filepath: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        PipelineError::Compile {
            filepath: filepath.into(),
            message: message.into(),
        }
    }
}
