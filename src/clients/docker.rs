//! Container image lifecycle against the local Docker daemon.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, PruneImagesOptions, PushImageOptions, RemoveImageOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use crate::clients::ContainerRuntime;
use crate::error::{Error, Result};

/// Build-context factory: source tree in, tar archive bytes out.
/// Injected so the client can be exercised with a stubbed archive.
pub type BuildContextFn = dyn Fn(&Path) -> std::io::Result<Vec<u8>> + Send + Sync;

/// Registry and build inputs for image operations.
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Registry the image is pushed to (e.g. `ghcr.io`).
    pub registry: String,
    /// Registry password; the username is the repository owner.
    pub registry_password: String,
    /// Dockerfile name inside the build context.
    pub dockerfile: String,
}

/// Docker API client wrapper.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
    options: DockerOptions,
    build_context: Arc<BuildContextFn>,
}

impl DockerClient {
    /// Connect to the local daemon. `build_context` defaults to a tar
    /// archive of the source tree when not supplied.
    pub fn new(options: DockerOptions, build_context: Option<Arc<BuildContextFn>>) -> Result<Self> {
        let docker = Docker::connect_with_socket_defaults()?;
        Ok(Self {
            docker,
            options,
            build_context: build_context.unwrap_or_else(|| Arc::new(tar_build_context)),
        })
    }

    /// Canonical image reference: `<registry>/<owner>/<image>:<tag>`.
    fn image_reference(&self, owner: &str, image_name: &str, image_tag: &str) -> String {
        format!(
            "{}/{}/{}:{}",
            self.options.registry, owner, image_name, image_tag
        )
    }

    /// Remove dangling (untagged) images and log the space reclaimed.
    async fn prune_dangling_images(&self) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("dangling", vec!["true"]);

        let report = self
            .docker
            .prune_images(Some(PruneImagesOptions { filters }))
            .await?;

        info!(
            reclaimed_bytes = report.space_reclaimed.unwrap_or(0),
            "pruned dangling images"
        );
        for image in report.images_deleted.unwrap_or_default() {
            if let Some(untagged) = image.untagged.filter(|u| !u.is_empty()) {
                info!(image = %untagged, "untagged image pruned");
            }
            if let Some(deleted) = image.deleted.filter(|d| !d.is_empty()) {
                info!(image_id = %deleted, "image deleted");
            }
        }
        Ok(())
    }
}

/// Default build-context factory: tar up the whole source tree.
fn tar_build_context(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn build_image(
        &self,
        owner: &str,
        image_name: &str,
        image_tag: &str,
        context_dir: &Path,
    ) -> Result<()> {
        let reference = self.image_reference(owner, image_name, image_tag);
        info!(image = %reference, "building image");

        let context = (self.build_context)(context_dir)?;
        let options = BuildImageOptions {
            dockerfile: self.options.dockerfile.clone(),
            t: reference.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(message) = stream.next().await {
            let message = message?;
            if let Some(error) = message.error {
                return Err(Error::Command {
                    program: "docker build".to_string(),
                    detail: error,
                });
            }
            if let Some(output) = message.stream {
                let output = output.trim_end();
                if !output.is_empty() {
                    debug!("{output}");
                }
            }
        }

        info!(image = %reference, "image built locally");
        Ok(())
    }

    async fn push_image(&self, owner: &str, image_name: &str, image_tag: &str) -> Result<()> {
        let reference = self.image_reference(owner, image_name, image_tag);
        info!(image = %reference, "pushing image");

        // The daemon encodes these as the base64 URL-safe JSON
        // X-Registry-Auth header.
        let credentials = DockerCredentials {
            username: Some(owner.to_string()),
            password: Some(self.options.registry_password.clone()),
            ..Default::default()
        };

        let mut stream = self.docker.push_image(
            &reference,
            Some(PushImageOptions {
                tag: image_tag.to_string(),
            }),
            Some(credentials),
        );
        while let Some(message) = stream.next().await {
            let message = message?;
            if let Some(error) = message.error {
                return Err(Error::Command {
                    program: "docker push".to_string(),
                    detail: error,
                });
            }
            if let Some(status) = message.status {
                debug!("{status}");
            }
        }

        info!(image = %reference, "image pushed to the container registry");
        Ok(())
    }

    async fn delete_image(&self, owner: &str, image_name: &str, image_tag: &str) -> Result<()> {
        let reference = self.image_reference(owner, image_name, image_tag);
        info!(image = %reference, "deleting image");

        let removal = self
            .docker
            .remove_image(
                &reference,
                Some(RemoveImageOptions {
                    force: true,
                    noprune: false,
                }),
                None,
            )
            .await;
        match removal {
            Ok(_) => {}
            // Deletion is idempotent: a second cleanup finds nothing.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                info!(image = %reference, "image not found locally, skipping removal");
            }
            Err(err) => return Err(err.into()),
        }

        self.prune_dangling_images().await?;

        info!(image = %reference, "image deleted locally");
        Ok(())
    }
}
