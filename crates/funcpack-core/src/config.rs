use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host CA bundles, checked in order when `FUNCPACK_CA_BUNDLE` is unset.
const CA_BUNDLE_CANDIDATES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/tls/cacert.pem",
    "/etc/ssl/cert.pem",
];

#[derive(Clone, Debug, Default)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        self.var(key).is_some_and(|value| {
            matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Host-level knobs for the builder, read from `FUNCPACK_*` variables.
#[derive(Clone, Debug)]
pub struct BuilderConfig {
    pub ca_bundle: Option<PathBuf>,
    pub go_binary: String,
    pub python_binary: String,
    pub git_binary: String,
    pub cache_max_bytes: Option<u64>,
    pub cache_gc_disabled: bool,
    pub insecure_registries: Vec<String>,
    pub toolchain_timeout: Option<Duration>,
    pub source_date_epoch: Option<i64>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self::from_snapshot(&EnvSnapshot::default())
    }
}

impl BuilderConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        let ca_bundle = snapshot.var("FUNCPACK_CA_BUNDLE").map_or_else(
            || {
                CA_BUNDLE_CANDIDATES
                    .iter()
                    .map(Path::new)
                    .find(|candidate| candidate.is_file())
                    .map(Path::to_path_buf)
            },
            |value| Some(PathBuf::from(value)),
        );
        let mut insecure_registries = vec!["localhost".to_string()];
        if let Some(raw) = snapshot.var("FUNCPACK_INSECURE_REGISTRIES") {
            for host in raw.split(',').map(str::trim).filter(|host| !host.is_empty()) {
                if !insecure_registries.iter().any(|known| known == host) {
                    insecure_registries.push(host.to_string());
                }
            }
        }
        Self {
            ca_bundle,
            go_binary: snapshot.var("FUNCPACK_GO_PATH").unwrap_or("go").to_string(),
            python_binary: snapshot
                .var("FUNCPACK_PYTHON_PATH")
                .unwrap_or("python")
                .to_string(),
            git_binary: snapshot.var("FUNCPACK_GIT_PATH").unwrap_or("git").to_string(),
            cache_max_bytes: snapshot
                .var("FUNCPACK_BLOB_CACHE_MAX_BYTES")
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|value| *value > 0),
            cache_gc_disabled: snapshot.flag_is_enabled("FUNCPACK_BLOB_CACHE_GC_DISABLE"),
            insecure_registries,
            toolchain_timeout: snapshot
                .var("FUNCPACK_TOOLCHAIN_TIMEOUT_SECS")
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            source_date_epoch: snapshot
                .var("SOURCE_DATE_EPOCH")
                .and_then(|raw| raw.trim().parse::<i64>().ok()),
        }
    }

    #[must_use]
    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_source_date_epoch(mut self, epoch: i64) -> Self {
        self.source_date_epoch = Some(epoch);
        self
    }

    /// Size cap for the base layer cache, unless eviction is switched off.
    #[must_use]
    pub fn cache_limit(&self) -> Option<u64> {
        if self.cache_gc_disabled {
            None
        } else {
            self.cache_max_bytes
        }
    }
}
