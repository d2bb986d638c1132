//! Vendored package resolution for the virtual module namespace.
//!
//! There is no general npm resolution. Only packages provisioned up front
//! (the framework's browser build plus whatever the config names) can be
//! served; everything else is an [`PipelineError::UnsupportedPackage`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::plugin::PackageResolver;
use crate::{PipelineConfig, PipelineError, Result};

/// Package every project gets without configuration.
pub const DEFAULT_PACKAGE: &str = "vue";

/// Browser ESM build of [`DEFAULT_PACKAGE`], relative to the project root.
pub const DEFAULT_VUE_BUILD: &str = "node_modules/vue/dist/vue.esm.browser.js";

/// Fixed name → file table of provisioned packages.
#[derive(Debug, Clone, Default)]
pub struct VendoredPackages {
    entries: BTreeMap<String, PathBuf>,
}

impl VendoredPackages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` resolvable from the file at `path`.
    pub fn provision(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.entries.insert(name.into(), path.into());
        self
    }

    /// The default table for a project: the framework build from
    /// `node_modules` plus every package in `config.packages`.
    pub fn for_project(root: &Path, config: &PipelineConfig) -> Self {
        let mut packages = Self::new().provision(DEFAULT_PACKAGE, root.join(DEFAULT_VUE_BUILD));
        for (name, path) in &config.packages {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            };
            packages = packages.provision(name.clone(), path);
        }
        packages
    }

    pub fn is_provisioned(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[async_trait]
impl PackageResolver for VendoredPackages {
    async fn resolve(&self, name: &str) -> Result<Vec<u8>> {
        let path = self
            .entries
            .get(name)
            .ok_or_else(|| PipelineError::UnsupportedPackage {
                name: name.to_string(),
            })?;
        debug!(package = name, path = %path.display(), "resolving vendored package");
        fs::read(path).await.map_err(|e| PipelineError::io(path, e))
    }
}
