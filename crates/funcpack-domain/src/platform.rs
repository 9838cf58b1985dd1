use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// An OS / architecture / variant build target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Targets used when a build names none.
pub const DEFAULT_PLATFORMS: &[(&str, &str, Option<&str>)] = &[
    ("linux", "amd64", None),
    ("linux", "arm64", None),
    ("linux", "arm", Some("v7")),
];

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        let variant = variant.into();
        self.variant = (!variant.is_empty()).then_some(variant);
        self
    }

    pub fn defaults() -> Vec<Platform> {
        DEFAULT_PLATFORMS
            .iter()
            .map(|(os, arch, variant)| {
                let platform = Platform::new(*os, *arch);
                match variant {
                    Some(variant) => platform.with_variant(*variant),
                    None => platform,
                }
            })
            .collect()
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let parts = value.trim().split('/').collect::<Vec<_>>();
        if parts.iter().any(|part| part.trim().is_empty()) {
            bail!("invalid platform `{value}` (expected os/arch[/variant])");
        }
        match parts.as_slice() {
            [os, arch] => Ok(Platform::new(*os, *arch)),
            [os, arch, variant] => Ok(Platform::new(*os, *arch).with_variant(*variant)),
            _ => bail!("invalid platform `{value}` (expected os/arch[/variant])"),
        }
    }
}

/// Applies the defaults to an empty request and drops repeated entries,
/// keeping first-seen order.
pub fn resolve_platforms(requested: &[Platform]) -> Vec<Platform> {
    if requested.is_empty() {
        return Platform::defaults();
    }
    let mut resolved: Vec<Platform> = Vec::with_capacity(requested.len());
    for platform in requested {
        if !resolved.contains(platform) {
            resolved.push(platform.clone());
        }
    }
    resolved
}
