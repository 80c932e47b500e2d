//! External collaborator clients and the trait seams the pipeline
//! coordinator drives them through.
//!
//! Each seam is an object-safe async trait so the coordinator can be
//! exercised against in-memory stubs; the concrete implementations wrap
//! octocrab, kube, bollard and the kustomize binary.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::retry::Deadline;

pub mod docker;
pub mod github;
pub mod kube;
pub mod kustomize;

pub use docker::DockerClient;
pub use github::GithubClient;
pub use kube::KubeClient;
pub use kustomize::Kustomizer;

/// Head of a pull request, as much of it as the pipeline needs.
#[derive(Debug, Clone)]
pub struct PullRequestHead {
    /// Branch name (`head.ref`).
    pub branch: String,
    /// Full commit SHA (`head.sha`).
    pub sha: String,
}

/// Source-forge operations: pull requests, workflows, registry packages
/// and the local working copy.
#[async_trait]
pub trait SourceForge: Send + Sync {
    /// Fetch the pull request behind an issue number.
    async fn get_pull_request(&self, owner: &str, repo: &str, number: u64)
        -> Result<PullRequestHead>;

    /// Dispatch the named workflow on `branch` and poll it to a terminal
    /// conclusion.
    async fn trigger_workflow(
        &self,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        branch: &str,
    ) -> Result<()>;

    /// Delete the registry package version carrying `tag`.
    async fn delete_package_version(
        &self,
        owner: &str,
        package_type: &str,
        package_name: &str,
        tag: &str,
    ) -> Result<()>;

    /// Clone the repository at `branch` into `local_dir`, or update the
    /// existing working copy.
    async fn fetch_repository(
        &self,
        local_dir: &Path,
        repo_full_name: &str,
        branch: &str,
    ) -> Result<()>;

    /// Recursively remove the local working copy. Absent is a no-op.
    async fn delete_local_repository(&self, local_dir: &Path) -> Result<()>;
}

/// Cluster operations over rendered manifest texts.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Create or update the resource described by `manifest` in
    /// `namespace`. Returns the resource's top-level labels and, for
    /// workloads, the desired replica count (zero otherwise).
    async fn apply(
        &self,
        manifest: &str,
        namespace: &str,
        image_tag: &str,
    ) -> Result<(BTreeMap<String, String>, i32)>;

    /// Delete the resource described by `manifest`. Idempotent.
    async fn delete(&self, manifest: &str, namespace: &str) -> Result<()>;

    /// Poll pods by label selector until the expected replica count is
    /// running or the deadline fires.
    async fn wait_for_pods_running(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        expected: i32,
        deadline: Deadline,
    ) -> Result<()>;
}

/// Container image lifecycle on the build host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build the image from the source tree at `context_dir`.
    async fn build_image(
        &self,
        owner: &str,
        image_name: &str,
        image_tag: &str,
        context_dir: &Path,
    ) -> Result<()>;

    /// Push the image to the registry.
    async fn push_image(&self, owner: &str, image_name: &str, image_tag: &str) -> Result<()>;

    /// Remove the local image and prune dangling images.
    async fn delete_image(&self, owner: &str, image_name: &str, image_tag: &str) -> Result<()>;
}

/// Directory-to-manifest-list transformation.
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    /// Render the kustomization under `dir` into an ordered list of
    /// manifest documents.
    async fn render(&self, dir: &Path) -> Result<Vec<String>>;
}
