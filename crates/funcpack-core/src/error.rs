use std::io;
use std::path::{Path, PathBuf};

/// Errors surfaced by a build.
///
/// Only [`BuildError::InProgress`] is expected during normal operation; a
/// caller may retry once the competing process exits. Everything else is
/// terminal for the invocation.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("[FP101] a build is already running for {}", .dir.display())]
    InProgress { dir: PathBuf },
    #[error("[FP102] {runtime} functions are not yet supported by the host builder")]
    UnsupportedRuntime { runtime: String },
    #[error("[FP103] unsafe link {}: {reason} (target `{target}`)", .path.display())]
    UnsafeLink {
        path: PathBuf,
        target: String,
        reason: &'static str,
    },
    #[error("[FP104] {program} exited with {status}: {stderr}")]
    Toolchain {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("[FP105] {program} was cancelled")]
    Cancelled { program: String },
    #[error("[FP106] base image {image}: {reason}")]
    Registry { image: String, reason: String },
    #[error("[FP107] {0}")]
    Invariant(String),
    #[error("[FP110] {context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("[FP111] failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("[FP112] failed to fingerprint {}: {source}", .root.display())]
    Fingerprint {
        root: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

pub type BuildResult<T> = Result<T, BuildError>;

impl BuildError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InProgress { .. } => "FP101",
            Self::UnsupportedRuntime { .. } => "FP102",
            Self::UnsafeLink { .. } => "FP103",
            Self::Toolchain { .. } => "FP104",
            Self::Cancelled { .. } => "FP105",
            Self::Registry { .. } => "FP106",
            Self::Invariant(_) => "FP107",
            Self::Io { .. } => "FP110",
            Self::Encode { .. } => "FP111",
            Self::Fingerprint { .. } => "FP112",
        }
    }

    /// True for the contention case, where waiting and retrying is sensible.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }

    /// Errors caused by the function project itself rather than the host.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InProgress { .. } | Self::UnsupportedRuntime { .. } | Self::UnsafeLink { .. }
        )
    }

    pub(crate) fn io(context: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Attaches a path and short description to raw I/O results.
pub(crate) trait IoContext<T> {
    fn at(self, context: &'static str, path: impl AsRef<Path>) -> BuildResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, context: &'static str, path: impl AsRef<Path>) -> BuildResult<T> {
        self.map_err(|source| BuildError::io(context, path, source))
    }
}
