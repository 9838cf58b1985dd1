use std::path::Path;

use crate::blob::BlobStore;
use crate::error::{BuildError, BuildResult};
use crate::job::BuildJob;
use crate::oci::ImageLayer;

use super::LayerWriter;

/// Where Debian- and Red Hat-family images look for the CA bundle.
pub const CERT_PATHS: &[&str] = &[
    "etc/ssl/certs/ca-certificates.crt",
    "etc/pki/tls/certs/ca-certificates.crt",
];

/// Copies the host CA bundle to both conventional locations.
pub fn write_certs_layer(job: &BuildJob) -> BuildResult<ImageLayer> {
    let Some(bundle) = job.config().ca_bundle.as_deref() else {
        return Err(BuildError::io(
            "no CA bundle found; set FUNCPACK_CA_BUNDLE, looked for",
            Path::new("/etc/ssl/certs/ca-certificates.crt"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    };
    let store = BlobStore::for_job(job);
    let mut layer = LayerWriter::new(&store, "certslayer", job.verbose())?;
    for path in CERT_PATHS {
        layer.append_file(path, bundle, Some(0o644))?;
    }
    layer.finish("trusted root certificates")
}
