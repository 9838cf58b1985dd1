#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod fingerprint;
pub mod function;
pub mod platform;

pub use fingerprint::fingerprint;
pub use function::{
    EnvVar, Function, Volume, BUILD_IGNORE_FILE, FUNCTION_FILE, RUN_DATA_DIR,
};
pub use platform::{resolve_platforms, Platform, DEFAULT_PLATFORMS};
