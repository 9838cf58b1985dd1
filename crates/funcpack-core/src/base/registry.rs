use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use funcpack_domain::Platform;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::ImageIndexEntry;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Reference, RegistryOperation};
use tokio::io::AsyncWrite;
use tokio::runtime::Runtime;
use tracing::debug;

use super::{BaseImage, RegistrySource};
use crate::config::BuilderConfig;
use crate::error::{BuildError, BuildResult};
use crate::oci::{ConfigFile, Descriptor, OciPlatform};

/// Anonymous pulls from OCI registries. Plain http is used only for the
/// configured insecure hosts.
#[derive(Clone, Debug)]
pub struct OciRegistrySource {
    insecure: Vec<String>,
}

impl OciRegistrySource {
    pub fn new(config: &BuilderConfig) -> Self {
        Self {
            insecure: config.insecure_registries.clone(),
        }
    }

    fn block_on<F: Future>(image: &str, future: F) -> BuildResult<F::Output> {
        let runtime = Runtime::new()
            .map_err(|err| registry_error(image, format!("failed to start async runtime: {err}")))?;
        Ok(runtime.block_on(future))
    }

    fn client(&self, platform: &Platform) -> Client {
        let wanted = OciPlatform::from(platform);
        let resolver = move |entries: &[ImageIndexEntry]| -> Option<String> {
            entries
                .iter()
                .find(|entry| {
                    entry.platform.as_ref().is_some_and(|candidate| {
                        candidate.os == wanted.os
                            && candidate.architecture == wanted.architecture
                            && (wanted.variant.is_none() || candidate.variant == wanted.variant)
                    })
                })
                .map(|entry| entry.digest.clone())
        };
        Client::new(ClientConfig {
            protocol: ClientProtocol::HttpsExcept(self.insecure.clone()),
            platform_resolver: Some(Box::new(resolver)),
            ..Default::default()
        })
    }
}

fn parse_reference(image: &str) -> BuildResult<Reference> {
    Reference::try_from(image).map_err(|err| BuildError::Registry {
        image: image.to_string(),
        reason: format!("invalid image reference: {err}"),
    })
}

fn registry_error(image: &str, err: impl std::fmt::Display) -> BuildError {
    BuildError::Registry {
        image: image.to_string(),
        reason: err.to_string(),
    }
}

impl RegistrySource for OciRegistrySource {
    fn resolve(&self, image: &str, platform: &Platform) -> BuildResult<BaseImage> {
        let reference = parse_reference(image)?;
        let mut client = self.client(platform);
        let (manifest, digest, raw_config) = Self::block_on(image, async {
            client
                .pull_manifest_and_config(&reference, &RegistryAuth::Anonymous)
                .await
        })?
        .map_err(|err| registry_error(image, err))?;
        debug!(image, %platform, %digest, "fetched base manifest");

        let config: ConfigFile = serde_json::from_str(&raw_config)
            .map_err(|err| registry_error(image, format!("invalid image config: {err}")))?;
        if config.os != platform.os || config.architecture != platform.architecture {
            return Err(registry_error(
                image,
                format!(
                    "no image for {platform} (registry returned {}/{})",
                    config.os, config.architecture
                ),
            ));
        }
        let layers = manifest
            .layers
            .iter()
            .map(|layer| Descriptor {
                media_type: layer.media_type.clone(),
                digest: layer.digest.clone(),
                size: u64::try_from(layer.size).unwrap_or_default(),
                platform: None,
            })
            .collect();
        Ok(BaseImage {
            reference: reference.whole(),
            layers,
            config,
        })
    }

    fn fetch_blob(&self, image: &str, layer: &Descriptor, out: &mut dyn Write) -> BuildResult<()> {
        let reference = parse_reference(image)?;
        let mut client = Client::new(ClientConfig {
            protocol: ClientProtocol::HttpsExcept(self.insecure.clone()),
            ..Default::default()
        });
        let mut sink = SyncSink(out);
        Self::block_on(image, async {
            // Blob endpoints need a token of their own.
            client
                .auth(&reference, &RegistryAuth::Anonymous, RegistryOperation::Pull)
                .await?;
            client.pull_blob(&reference, &layer.digest, &mut sink).await
        })?
        .map_err(|err| registry_error(image, format!("failed to pull {}: {err}", layer.digest)))
    }
}

/// Feeds an async download straight into a blocking writer. Only ever polled
/// from `block_on`, where a blocking write is acceptable.
struct SyncSink<'a>(&'a mut dyn Write);

impl AsyncWrite for SyncSink<'_> {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(self.get_mut().0.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().0.flush())
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
