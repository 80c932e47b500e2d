//! GitHub client: pull requests, workflow dispatch, registry packages
//! and the local working copy of the repository.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use octocrab::Octocrab;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::clients::{PullRequestHead, SourceForge};
use crate::error::{Error, Result};

/// Initial interval between workflow-run polls.
const WORKFLOW_POLL_INITIAL: Duration = Duration::from_secs(5);
/// Poll interval ceiling.
const WORKFLOW_POLL_MAX: Duration = Duration::from_secs(30);
/// Total polling budget before the final check. Short for real
/// secret-provisioning workflows; see the deployment runbook before
/// raising it.
const WORKFLOW_POLL_CAP: Duration = Duration::from_secs(60);

/// Octocrab-backed forge client.
#[derive(Clone)]
pub struct GithubClient {
    octocrab: Octocrab,
}

/// Registry package version, as returned by the packages API.
#[derive(Debug, Deserialize)]
struct PackageVersion {
    id: u64,
    #[serde(default)]
    metadata: Option<PackageMetadata>,
}

#[derive(Debug, Deserialize)]
struct PackageMetadata {
    #[serde(default)]
    container: Option<ContainerMetadata>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    tags: Vec<String>,
}

impl GithubClient {
    pub fn new(token: &str) -> Result<Self> {
        let octocrab = Octocrab::builder()
            .personal_token(token.to_string())
            .build()?;
        Ok(Self { octocrab })
    }

    /// Status and conclusion of the most recent run of `workflow_file`
    /// on `branch`.
    async fn latest_workflow_run(
        &self,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        branch: &str,
    ) -> Result<(String, Option<String>)> {
        let runs = self
            .octocrab
            .workflows(owner, repo)
            .list_runs(workflow_file)
            .branch(branch)
            .per_page(1)
            .send()
            .await?;
        let run = runs.items.into_iter().next().ok_or_else(|| {
            Error::NoWorkflowRuns {
                workflow: workflow_file.to_string(),
            }
        })?;
        Ok((run.status, run.conclusion))
    }

    /// Poll the workflow run to completion: 5 s initial interval,
    /// doubling to 30 s, the whole loop capped at one minute with a
    /// final status check afterwards.
    async fn wait_for_workflow_completion(
        &self,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        branch: &str,
    ) -> Result<()> {
        let cap = Instant::now() + WORKFLOW_POLL_CAP;
        let mut interval = WORKFLOW_POLL_INITIAL;

        loop {
            tokio::time::sleep(interval).await;

            let (status, conclusion) = self
                .latest_workflow_run(owner, repo, workflow_file, branch)
                .await?;
            info!(workflow = workflow_file, status = %status, conclusion = ?conclusion, "workflow poll");

            if status == "completed" {
                return classify_conclusion(workflow_file, conclusion.as_deref());
            }
            if Instant::now() >= cap {
                break;
            }
            interval = (interval * 2).min(WORKFLOW_POLL_MAX);
        }

        info!(workflow = workflow_file, "polling cap reached, performing final check");
        let (status, conclusion) = self
            .latest_workflow_run(owner, repo, workflow_file, branch)
            .await?;
        if status == "completed" {
            return classify_conclusion(workflow_file, conclusion.as_deref());
        }
        Err(Error::WorkflowTimeout {
            workflow: workflow_file.to_string(),
        })
    }
}

/// Map a completed run's conclusion onto a pipeline outcome.
fn classify_conclusion(workflow_file: &str, conclusion: Option<&str>) -> Result<()> {
    match conclusion {
        Some("success") => {
            info!(workflow = workflow_file, "workflow completed successfully");
            Ok(())
        }
        Some(
            conclusion @ ("failure" | "neutral" | "cancelled" | "timed_out" | "action_required"),
        ) => Err(Error::WorkflowConclusion {
            workflow: workflow_file.to_string(),
            conclusion: conclusion.to_string(),
        }),
        other => Err(Error::UnknownWorkflowConclusion {
            conclusion: other.unwrap_or("").to_string(),
        }),
    }
}

/// Run an external command, surfacing a non-zero exit as an error.
async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    debug!(program, ?args, "running command");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Command {
            program: program.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl SourceForge for GithubClient {
    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestHead> {
        let pull_request = self.octocrab.pulls(owner, repo).get(number).await?;
        let head = pull_request.head;
        Ok(PullRequestHead {
            branch: head.ref_field,
            sha: head.sha,
        })
    }

    async fn trigger_workflow(
        &self,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        branch: &str,
    ) -> Result<()> {
        info!(
            workflow = workflow_file,
            repo, branch, "triggering workflow"
        );
        self.octocrab
            .actions()
            .create_workflow_dispatch(owner, repo, workflow_file, branch)
            .send()
            .await?;
        info!(workflow = workflow_file, "workflow dispatched");

        self.wait_for_workflow_completion(owner, repo, workflow_file, branch)
            .await
    }

    async fn delete_package_version(
        &self,
        owner: &str,
        package_type: &str,
        package_name: &str,
        tag: &str,
    ) -> Result<()> {
        // Package names contain the repository slash; the API wants it
        // percent-encoded.
        let encoded_name = package_name.replace('/', "%2F");
        let route = format!("/users/{owner}/packages/{package_type}/{encoded_name}/versions");
        let versions: Vec<PackageVersion> = self.octocrab.get(&route, None::<&()>).await?;

        for version in versions {
            let tags = version
                .metadata
                .and_then(|metadata| metadata.container)
                .map(|container| container.tags)
                .unwrap_or_default();
            if tags.iter().any(|candidate| candidate == tag) {
                let delete_route = format!(
                    "/users/{owner}/packages/{package_type}/{encoded_name}/versions/{}",
                    version.id
                );
                let response = self
                    .octocrab
                    ._delete(delete_route.as_str(), None::<&()>)
                    .await?;
                if !response.status().is_success() {
                    return Err(Error::Command {
                        program: "package version delete".to_string(),
                        detail: format!("unexpected status {}", response.status()),
                    });
                }
                info!(package = %encoded_name, tag, "package version deleted");
                return Ok(());
            }
        }

        // Already gone, or never pushed: deletion is idempotent, and a
        // concurrent delete for the same tag may have won the race.
        info!(package = %encoded_name, tag, "no package version with tag, skipping deletion");
        Ok(())
    }

    async fn fetch_repository(
        &self,
        local_dir: &Path,
        repo_full_name: &str,
        branch: &str,
    ) -> Result<()> {
        let branch = if branch.is_empty() { "main" } else { branch };
        let repo_url = format!("https://github.com/{repo_full_name}.git");
        let dir = local_dir.to_string_lossy();

        if !local_dir.exists() {
            tokio::fs::create_dir_all(local_dir).await?;
        }

        if local_dir.join(".git").exists() {
            info!(repo = %repo_url, dir = %dir, "pulling repository updates");
            run_command("git", &["-C", dir.as_ref(), "pull"]).await?;
        } else {
            info!(repo = %repo_url, dir = %dir, branch, "cloning repository");
            run_command("git", &["clone", "-b", branch, repo_url.as_str(), dir.as_ref()]).await?;
        }
        Ok(())
    }

    async fn delete_local_repository(&self, local_dir: &Path) -> Result<()> {
        if local_dir.exists() {
            tokio::fs::remove_dir_all(local_dir).await?;
        }
        info!(dir = %local_dir.display(), "local repository directory removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_conclusion_is_ok() {
        assert!(classify_conclusion("deploy.yaml", Some("success")).is_ok());
    }

    #[test]
    fn terminal_bad_conclusions_carry_the_conclusion() {
        for conclusion in ["failure", "neutral", "cancelled", "timed_out", "action_required"] {
            let err = classify_conclusion("deploy.yaml", Some(conclusion)).unwrap_err();
            match err {
                Error::WorkflowConclusion {
                    conclusion: reported,
                    ..
                } => assert_eq!(reported, conclusion),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn unrecognized_conclusion_is_an_unknown_error() {
        assert!(matches!(
            classify_conclusion("deploy.yaml", Some("stale")),
            Err(Error::UnknownWorkflowConclusion { conclusion }) if conclusion == "stale"
        ));
        assert!(matches!(
            classify_conclusion("deploy.yaml", None),
            Err(Error::UnknownWorkflowConclusion { .. })
        ));
    }

    #[test]
    fn package_versions_deserialize_with_container_tags() {
        let body = serde_json::json!([
            { "id": 101, "metadata": { "package_type": "container", "container": { "tags": ["latest"] } } },
            { "id": 102, "metadata": { "package_type": "container", "container": { "tags": ["abcdef1"] } } },
            { "id": 103 }
        ]);
        let versions: Vec<PackageVersion> = serde_json::from_value(body).unwrap();
        assert_eq!(versions.len(), 3);
        let tagged: Vec<u64> = versions
            .iter()
            .filter(|version| {
                version
                    .metadata
                    .as_ref()
                    .and_then(|metadata| metadata.container.as_ref())
                    .is_some_and(|container| container.tags.iter().any(|t| t == "abcdef1"))
            })
            .map(|version| version.id)
            .collect();
        assert_eq!(tagged, vec![102]);
    }

    #[tokio::test]
    async fn delete_local_repository_tolerates_absence() {
        let client = GithubClient::new("x-access-token").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never-cloned");
        client.delete_local_repository(&missing).await.unwrap();
    }

    #[tokio::test]
    async fn delete_local_repository_removes_the_tree() {
        let client = GithubClient::new("x-access-token").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("app");
        tokio::fs::create_dir_all(repo.join(".git")).await.unwrap();
        tokio::fs::write(repo.join("README.md"), "hello").await.unwrap();

        client.delete_local_repository(&repo).await.unwrap();
        assert!(!repo.exists());
    }

    #[tokio::test]
    async fn failing_command_surfaces_stderr() {
        let err = run_command("git", &["--no-such-flag"]).await.unwrap_err();
        match err {
            Error::Command { program, .. } => assert_eq!(program, "git"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
