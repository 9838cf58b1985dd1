//! Layers shared by every platform image: the function source (data layer)
//! and the trusted root certificates.

mod certs;
mod data;
mod tar;

pub use certs::{write_certs_layer, CERT_PATHS};
pub use data::{append_tree, validated_link_target, write_data_layer};
pub use tar::LayerWriter;

/// Numeric owner stamped on every archived entry.
pub const DEFAULT_UID: u64 = 1000;
pub const DEFAULT_GID: u64 = 1000;

/// In-image directory the function source is unpacked to.
pub const FUNC_MOUNT: &str = "func";

/// Names never copied into the data layer.
pub const DEFAULT_IGNORED: &[&str] = &[".git", ".func", ".funcignore", ".gitignore"];

#[cfg(all(test, unix))]
mod tests;
