//! Layered configuration loading.
//!
//! Later layers override earlier ones: built-in defaults, the user file, the
//! project file, the local file, then `GCPROBE_*` environment variables.
//! Zero-valued knobs are normalized after the merge, so a file that sets
//! `region_count = 0` still ends up with the default.

use crate::{GcProbeConfig, paths};
use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};

/// A file layer, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// `~/.config/gcprobe/config.toml`
    User(PathBuf),
    /// `gcprobe.toml` in the project directory
    Project(PathBuf),
    /// `gcprobe.local.toml`, meant to stay out of version control
    Local(PathBuf),
}

impl Layer {
    pub fn path(&self) -> &Path {
        match self {
            Layer::User(p) | Layer::Project(p) | Layer::Local(p) => p,
        }
    }
}

pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user: bool,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "GCPROBE".to_string(),
            include_user: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Environment prefix; `GCPROBE` unless overridden.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip the per-user file.
    pub fn without_user_file(mut self) -> Self {
        self.include_user = false;
        self
    }

    /// File layers that would be consulted, lowest precedence first.
    /// Layers whose file does not exist are included.
    pub fn layers(&self) -> Vec<Layer> {
        let mut layers = Vec::with_capacity(3);
        if self.include_user {
            if let Ok(file) = paths::user_file() {
                layers.push(Layer::User(file));
            }
        }
        layers.push(Layer::Project(paths::project_file(&self.project_dir)));
        layers.push(Layer::Local(paths::local_file(&self.project_dir)));
        layers
    }

    pub fn load(self) -> Result<GcProbeConfig> {
        let merged: GcProbeConfig = self
            .builder()?
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(merged.normalize())
    }

    fn builder(&self) -> Result<ConfigBuilder<DefaultState>> {
        let defaults = config::Config::try_from(&GcProbeConfig::default())
            .context("Failed to encode built-in defaults")?;

        let builder = self
            .layers()
            .into_iter()
            .filter(|layer| layer.path().exists())
            .fold(
                config::Config::builder().add_source(defaults),
                |builder, layer| {
                    builder.add_source(
                        File::from(layer.path())
                            .required(false)
                            .format(FileFormat::Toml),
                    )
                },
            );

        // GCPROBE_WORKLOAD__REGION_COUNT=... maps to workload.region_count
        Ok(builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        ))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
