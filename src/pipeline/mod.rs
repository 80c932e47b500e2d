//! Pipeline coordinator.
//!
//! Turns a classified webhook event into a deployment identity, then
//! drives the deploy or cleanup flow over the collaborator seams: source
//! acquisition, manifest rendering, image build/push, cluster applies
//! under retry, the secrets workflow, readiness waiting and the
//! concurrent teardown fan-out.

pub mod retry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::clients::{Cluster, ContainerRuntime, ManifestRenderer, SourceForge};
use crate::error::{Error, Result};
use crate::events::{classify, IssueCommentEvent, PullRequestEvent, Trigger, WebhookEvent};
use crate::telemetry::Telemetry;
use retry::{Deadline, RetryPolicy};

/// Wall-clock bound on a single pipeline run, fixed at identity creation.
const RUN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Retry budget for applies during deploy.
const DEPLOY_RETRY: RetryPolicy =
    RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(30));

/// Retry budget for deletes during cleanup.
const CLEANUP_RETRY: RetryPolicy =
    RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(30));

/// Class token marking a workload manifest. Case-sensitive, matching the
/// canonical serialization.
const WORKLOAD_TOKEN: &str = "kind: Deployment";

/// Class token marking a namespace manifest.
const NAMESPACE_TOKEN: &str = "kind: Namespace";

/// Tag that rendered manifests carry and that merge deploys keep.
const LATEST_TAG: &str = "latest";

/// Normalized deployment identity extracted from a webhook event.
/// Immutable for the lifetime of the pipeline run.
#[derive(Debug, Clone)]
pub struct DeploymentIdentity {
    pub namespace: String,
    pub owner: String,
    pub repo_full_name: String,
    pub repo_name: String,
    pub branch: String,
    pub image_tag: String,
    pub image_name: String,
    pub workflow_file: String,
    pub issue_number: Option<u64>,
    pub deadline: Deadline,
}

/// Which cleanup units run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupScope {
    /// Cluster resources, local image, local sources, remote image.
    Full,
    /// Build host only: local image and local sources.
    HostOnly,
}

/// Configuration slice the coordinator needs.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Local clone directory for the repository.
    pub local_repo_dir: PathBuf,
    /// Subdirectory of the clone holding the manifests.
    pub resource_dir: String,
    /// Workflow file name is `<prefix>-<namespace>.yaml`.
    pub workflow_prefix: String,
    /// Registry package type for remote image deletes.
    pub package_type: String,
    /// Label gating deploys of merged pull requests.
    pub pr_deploy_label: String,
    /// Optional suffix appended to the image name.
    pub image_suffix: String,
    /// Namespace for comment-triggered deploys.
    pub dev_namespace: String,
    /// Namespace for merge-triggered deploys.
    pub test_namespace: String,
}

/// Orchestrates deploy and cleanup flows over the collaborator seams.
pub struct Coordinator {
    forge: Arc<dyn SourceForge>,
    cluster: Arc<dyn Cluster>,
    runtime: Arc<dyn ContainerRuntime>,
    renderer: Arc<dyn ManifestRenderer>,
    telemetry: Telemetry,
    options: PipelineOptions,
}

impl Coordinator {
    pub fn new(
        forge: Arc<dyn SourceForge>,
        cluster: Arc<dyn Cluster>,
        runtime: Arc<dyn ContainerRuntime>,
        renderer: Arc<dyn ManifestRenderer>,
        telemetry: Telemetry,
        options: PipelineOptions,
    ) -> Self {
        Self {
            forge,
            cluster,
            runtime,
            renderer,
            telemetry,
            options,
        }
    }

    /// Process one webhook event to completion. Failures are stamped as
    /// critical telemetry before being returned.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<()> {
        let result = self.dispatch(event).await;
        if let Err(err) = &result {
            error!(error = %err, "pipeline run failed");
            self.telemetry.critical(format!("pipeline run failed: {err}"));
        }
        result
    }

    async fn dispatch(&self, event: WebhookEvent) -> Result<()> {
        let trigger = classify(&event, &self.options.pr_deploy_label);
        match (trigger, event) {
            (Trigger::IssueCommentDeploy, WebhookEvent::IssueComment(event)) => {
                info!(action = %event.action, "deploy comment found");
                self.telemetry.info("PR comment 'deploy dev' found");
                let identity = self.comment_identity(&event).await?;
                let bundle = self.prepare_sources(&identity).await?;
                self.deploy(&identity, &bundle).await
            }
            (Trigger::IssueCommentCleanup, WebhookEvent::IssueComment(event)) => {
                info!("deploy comment deleted");
                self.telemetry.info("PR comment 'deploy dev' deleted");
                let identity = self.comment_identity(&event).await?;
                let bundle = self.prepare_sources(&identity).await?;
                self.cleanup(&identity, bundle, CleanupScope::Full).await
            }
            (Trigger::PullRequestMergeDeploy, WebhookEvent::PullRequest(event)) => {
                let identity = self.merge_identity(&event);
                info!(branch = %identity.branch, "pull request merged, deploying test environment");
                self.telemetry
                    .info(format!("pull request merged to {} branch", identity.branch));
                let bundle = self.prepare_sources(&identity).await?;
                self.deploy(&identity, &bundle).await?;
                // The test deploy leaves the cluster and registry alone;
                // only the build host gets cleared.
                self.cleanup(&identity, bundle, CleanupScope::HostOnly)
                    .await
            }
            (Trigger::Ignore(reason), _) => {
                info!(reason, "no action needed for webhook event");
                self.telemetry
                    .info(format!("no action needed for webhook event: {reason}"));
                Ok(())
            }
            // classify() ties triggers to their event variants; any other
            // pairing is ignorable by construction.
            (_, _) => Ok(()),
        }
    }

    /// Identity for a comment-triggered run: dev namespace, branch and
    /// abbreviated commit from the pull request behind the issue.
    async fn comment_identity(&self, event: &IssueCommentEvent) -> Result<DeploymentIdentity> {
        let repo = &event.repository;
        let pull_request = self
            .forge
            .get_pull_request(&repo.owner.login, &repo.name, event.issue.number)
            .await?;
        let image_tag: String = pull_request.sha.chars().take(7).collect();
        Ok(self.identity(
            &self.options.dev_namespace,
            &repo.owner.login,
            &repo.full_name,
            &repo.name,
            &pull_request.branch,
            &image_tag,
            Some(event.issue.number),
        ))
    }

    /// Identity for a merge-triggered run: test namespace, base branch,
    /// literal `latest` tag.
    fn merge_identity(&self, event: &PullRequestEvent) -> DeploymentIdentity {
        let repo = &event.repository;
        self.identity(
            &self.options.test_namespace,
            &repo.owner.login,
            &repo.full_name,
            &repo.name,
            &event.pull_request.base.ref_name,
            LATEST_TAG,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn identity(
        &self,
        namespace: &str,
        owner: &str,
        repo_full_name: &str,
        repo_name: &str,
        branch: &str,
        image_tag: &str,
        issue_number: Option<u64>,
    ) -> DeploymentIdentity {
        let image_name = if self.options.image_suffix.is_empty() {
            repo_full_name.to_string()
        } else {
            format!("{repo_full_name}-{}", self.options.image_suffix)
        };
        DeploymentIdentity {
            namespace: namespace.to_string(),
            owner: owner.to_string(),
            repo_full_name: repo_full_name.to_string(),
            repo_name: repo_name.to_string(),
            branch: branch.to_string(),
            image_tag: image_tag.to_string(),
            image_name,
            workflow_file: format!("{}-{namespace}.yaml", self.options.workflow_prefix),
            issue_number,
            deadline: Deadline::after(RUN_TIMEOUT),
        }
    }

    /// Acquire the source tree and render the manifest bundle for the
    /// identity's namespace.
    async fn prepare_sources(&self, identity: &DeploymentIdentity) -> Result<Vec<String>> {
        self.forge
            .fetch_repository(
                &self.options.local_repo_dir,
                &identity.repo_full_name,
                &identity.branch,
            )
            .await?;

        let manifest_dir = self
            .options
            .local_repo_dir
            .join(&self.options.resource_dir)
            .join(&identity.namespace);
        self.renderer.render(&manifest_dir).await
    }

    /// Deploy flow: image build/push, namespace apply, secrets workflow,
    /// remaining applies with tag substitution, readiness wait.
    async fn deploy(&self, identity: &DeploymentIdentity, bundle: &[String]) -> Result<()> {
        let namespace: &str = &identity.namespace;
        let image_tag: &str = &identity.image_tag;
        let cluster = &self.cluster;

        self.telemetry.info(format!(
            "build and push the container image for {namespace} environment"
        ));
        self.runtime
            .build_image(
                &identity.owner,
                &identity.image_name,
                &identity.image_tag,
                &self.options.local_repo_dir,
            )
            .await?;
        self.runtime
            .push_image(&identity.owner, &identity.image_name, &identity.image_tag)
            .await?;
        self.telemetry.info("build and push container image finished");

        // The namespace must exist before anything lands in it.
        if let Some(manifest) = bundle.iter().find(|manifest| is_namespace(manifest)) {
            let manifest: &str = manifest;
            retry::retry(
                &DEPLOY_RETRY,
                identity.deadline,
                &self.telemetry,
                "namespace apply",
                move || async move {
                    cluster
                        .apply(manifest, namespace, image_tag)
                        .await
                        .map(|_| ())
                },
            )
            .await?;
        }

        // Secrets land through the repository's own workflow.
        self.forge
            .trigger_workflow(
                &identity.owner,
                &identity.repo_name,
                &identity.workflow_file,
                &identity.branch,
            )
            .await?;

        self.telemetry.info(format!(
            "deploy the resources on Kubernetes for {namespace} environment"
        ));
        let mut workload_labels = BTreeMap::new();
        let mut expected_replicas = 0;
        for manifest in bundle {
            if is_namespace(manifest) {
                continue;
            }
            let text = substitute_workload_tag(manifest, &identity.image_tag);
            let text_ref: &str = &text;
            let (labels, replicas) = retry::retry(
                &DEPLOY_RETRY,
                identity.deadline,
                &self.telemetry,
                "resource apply",
                move || async move { cluster.apply(text_ref, namespace, image_tag).await },
            )
            .await?;
            if is_workload(manifest) {
                workload_labels = labels;
                expected_replicas = replicas;
            }
        }

        info!(labels = ?workload_labels, expected_replicas, "deployment applied");
        self.telemetry.info("deployment completed");

        self.cluster
            .wait_for_pods_running(
                namespace,
                &workload_labels,
                expected_replicas,
                identity.deadline,
            )
            .await
    }

    /// Cleanup fan-out: the units run concurrently, none fails fast, and
    /// every failure ends up in the composite error.
    async fn cleanup(
        &self,
        identity: &DeploymentIdentity,
        bundle: Vec<String>,
        scope: CleanupScope,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Error>(4);

        if scope == CleanupScope::Full {
            let cluster = Arc::clone(&self.cluster);
            let telemetry = self.telemetry.clone();
            let identity = identity.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                telemetry.info(format!(
                    "concurrently delete the deployment on Kubernetes for {} environment",
                    identity.namespace
                ));
                for manifest in &bundle {
                    let text = substitute_workload_tag(manifest, &identity.image_tag);
                    let text_ref: &str = &text;
                    let cluster_ref = &cluster;
                    let namespace: &str = &identity.namespace;
                    let result = retry::retry(
                        &CLEANUP_RETRY,
                        identity.deadline,
                        &telemetry,
                        "resource delete",
                        move || async move { cluster_ref.delete(text_ref, namespace).await },
                    )
                    .await;
                    if let Err(err) = result {
                        telemetry.error(format!("cluster cleanup failed: {err}"));
                        let _ = tx.send(err).await;
                        return;
                    }
                }
                info!("cluster cleanup completed");
            });
        }

        {
            let runtime = Arc::clone(&self.runtime);
            let telemetry = self.telemetry.clone();
            let identity = identity.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                telemetry.info(format!(
                    "concurrently delete the container image for {} environment",
                    identity.namespace
                ));
                if let Err(err) = runtime
                    .delete_image(&identity.owner, &identity.image_name, &identity.image_tag)
                    .await
                {
                    telemetry.error(format!("image cleanup failed: {err}"));
                    let _ = tx.send(err).await;
                }
            });
        }

        {
            let forge = Arc::clone(&self.forge);
            let telemetry = self.telemetry.clone();
            let local_repo_dir = self.options.local_repo_dir.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                telemetry.info("concurrently clean up the local source repository");
                if let Err(err) = forge.delete_local_repository(&local_repo_dir).await {
                    telemetry.error(format!("local repository cleanup failed: {err}"));
                    let _ = tx.send(err).await;
                }
            });
        }

        if scope == CleanupScope::Full {
            let forge = Arc::clone(&self.forge);
            let telemetry = self.telemetry.clone();
            let package_type = self.options.package_type.clone();
            let identity = identity.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                telemetry.info(format!(
                    "concurrently delete the package image {}:{} on the registry",
                    identity.image_name, identity.image_tag
                ));
                if let Err(err) = forge
                    .delete_package_version(
                        &identity.owner,
                        &package_type,
                        &identity.image_name,
                        &identity.image_tag,
                    )
                    .await
                {
                    telemetry.error(format!("registry package cleanup failed: {err}"));
                    let _ = tx.send(err).await;
                }
            });
        }

        // The channel closes once every unit has dropped its sender;
        // drain it to exhaustion before reporting.
        drop(tx);
        let mut failures = Vec::new();
        while let Some(err) = rx.recv().await {
            failures.push(err.to_string());
        }

        if failures.is_empty() {
            info!("cleanup completed");
            self.telemetry.info("cleanup completed");
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }
}

/// Whether a manifest describes a workload.
#[must_use]
pub fn is_workload(manifest: &str) -> bool {
    manifest.contains(WORKLOAD_TOKEN)
}

/// Whether a manifest describes a namespace.
#[must_use]
pub fn is_namespace(manifest: &str) -> bool {
    manifest.contains(NAMESPACE_TOKEN)
}

/// Rewrite the image tag of a workload manifest.
///
/// Rendered manifests pin `latest`; runs keyed to a commit replace it on
/// the `image:` lines only, leaving other occurrences of the word alone.
/// Non-workload manifests and `latest`-tagged runs pass through
/// unchanged.
#[must_use]
pub fn substitute_workload_tag(manifest: &str, image_tag: &str) -> String {
    if image_tag == LATEST_TAG || !is_workload(manifest) {
        return manifest.to_string();
    }
    let mut lines: Vec<String> = manifest
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("image:") {
                line.replace(LATEST_TAG, image_tag)
            } else {
                line.to_string()
            }
        })
        .collect();
    if manifest.ends_with('\n') {
        lines.push(String::new());
    }
    lines.join("\n")
}
