use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Hidden directory under a function root holding builds and caches.
pub const RUN_DATA_DIR: &str = ".func";
/// Descriptor file read by [`Function::load`].
pub const FUNCTION_FILE: &str = "func.yaml";
pub const BUILD_IGNORE_FILE: &str = ".funcignore";

/// A function project as handed to the image builder.
///
/// The builder treats this as read-only input for the duration of a build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub run: RunSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value.into()),
        }
    }

    /// `NAME=value` form used in container configs; unnamed entries yield `None`.
    pub fn to_assignment(&self) -> Option<String> {
        let name = self.name.as_deref()?.trim();
        if name.is_empty() {
            return None;
        }
        Some(format!("{name}={}", self.value.as_deref().unwrap_or_default()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub config_map: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl Function {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
            runtime: runtime.into(),
            ..Self::default()
        }
    }

    /// Reads `func.yaml` from `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(FUNCTION_FILE);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut function: Function = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        function.root = root.to_path_buf();
        Ok(function)
    }

    /// Declared env vars as `NAME=value` strings, in declaration order.
    pub fn env_assignments(&self) -> Vec<String> {
        self.run.envs.iter().filter_map(EnvVar::to_assignment).collect()
    }

    /// Declared volume mount paths, skipping entries without one.
    pub fn volume_paths(&self) -> Vec<String> {
        self.run
            .volumes
            .iter()
            .filter_map(|volume| volume.path.clone())
            .collect()
    }
}
