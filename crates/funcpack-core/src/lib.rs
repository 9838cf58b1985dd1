#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

pub mod base;
pub mod blob;
pub mod builder;
pub mod cancel;
pub mod config;
pub mod containerize;
pub mod error;
pub mod job;
pub mod layers;
pub mod lifecycle;
pub mod oci;
pub mod process;
pub mod scaffold;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use base::{BaseImage, BlobCache, OciRegistrySource, PruneSummary, RegistrySource};
pub use builder::{clean, BuildOutput, Builder};
pub use cancel::CancelToken;
pub use config::BuilderConfig;
pub use error::{BuildError, BuildResult};
pub use job::BuildJob;
pub use lifecycle::{collect_garbage, last_build_dir, GarbageReport};
pub use oci::{ConfigFile, Descriptor, ImageIndex, ImageManifest};
pub use scaffold::{InPlace, Scaffolder};
pub use strategy::{is_supported, strategy_for, LanguageBuilder, SUPPORTED_RUNTIMES};
