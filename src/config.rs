//! Service configuration.
//!
//! Settings come from a YAML file with environment variables taking
//! precedence for the secrets (`GITHUB_TOKEN`, `WEBHOOK_SECRET`,
//! `ROLLBAR_TOKEN`, `KUBECONFIG`). The local repository directory is
//! resolved against the user's home directory at load time.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Rollbar access token. Optional; telemetry is disabled without it.
    #[serde(default)]
    pub rollbar_token: String,
    /// GitHub personal access token. Also the registry password.
    #[serde(default)]
    pub github_token: String,
    /// Webhook signing secret.
    #[serde(default)]
    pub webhook_secret: String,
    /// Path to a kubeconfig file; empty means in-cluster configuration.
    #[serde(default)]
    pub kube_config: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub container: ContainerConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

/// GitHub-specific settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubConfig {
    /// Workflow file name is `<prefix>-<namespace>.yaml`.
    #[serde(default = "default_workflow_prefix")]
    pub workflow_prefix: String,
    /// Local clone directory, relative to the user home directory.
    #[serde(default = "default_local_repo")]
    pub local_repo: String,
    /// Package type for registry version deletes.
    #[serde(default = "default_package_type")]
    pub package_type: String,
    /// Label that gates deploys on merged pull requests.
    #[serde(default = "default_pr_deploy_label")]
    pub pr_deploy_label: String,
}

/// Kubernetes-specific settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Subdirectory of the local repository holding the manifests.
    #[serde(default = "default_resource_dir")]
    pub resource: String,
    #[serde(default = "default_dev_namespace")]
    pub dev_namespace: String,
    #[serde(default = "default_test_namespace")]
    pub test_namespace: String,
}

/// Container build and registry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default = "default_registry")]
    pub registry: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// Optional suffix appended to the image name.
    #[serde(default)]
    pub image_suffix: String,
}

fn default_port() -> u16 {
    8080
}

fn default_workflow_prefix() -> String {
    "deploy-kube-secrets".to_string()
}

fn default_local_repo() -> String {
    "app".to_string()
}

fn default_package_type() -> String {
    "container".to_string()
}

fn default_pr_deploy_label() -> String {
    "deploy-test-hono".to_string()
}

fn default_resource_dir() -> String {
    "kube".to_string()
}

fn default_dev_namespace() -> String {
    "dev".to_string()
}

fn default_test_namespace() -> String {
    "test".to_string()
}

fn default_registry() -> String {
    "ghcr.io".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            workflow_prefix: default_workflow_prefix(),
            local_repo: default_local_repo(),
            package_type: default_package_type(),
            pr_deploy_label: default_pr_deploy_label(),
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            resource: default_resource_dir(),
            dev_namespace: default_dev_namespace(),
            test_namespace: default_test_namespace(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            dockerfile: default_dockerfile(),
            image_suffix: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from the given YAML file and apply environment
    /// overrides. Fails when the required secrets are missing.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file found, using defaults");
                serde_yaml::from_str("{}")
                    .map_err(|e| Error::Config(format!("failed to build default config: {e}")))?
            }
            Err(err) => return Err(err.into()),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(token) = non_empty_env("ROLLBAR_TOKEN") {
            self.rollbar_token = token;
        }
        if let Some(token) = non_empty_env("GITHUB_TOKEN") {
            self.github_token = token;
        }
        if let Some(secret) = non_empty_env("WEBHOOK_SECRET") {
            self.webhook_secret = secret;
        }
        if let Some(kube_config) = non_empty_env("KUBECONFIG") {
            self.kube_config = kube_config;
        }
        if let Some(port) = non_empty_env("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.webhook_secret.is_empty() {
            return Err(Error::Config("missing webhook secret".to_string()));
        }
        if self.github_token.is_empty() {
            return Err(Error::Config("missing GitHub token".to_string()));
        }
        Ok(())
    }

    /// Absolute path of the local clone directory: `$HOME/<localRepo>`.
    pub fn local_repo_dir(&self) -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not determine home directory".to_string()))?;
        Ok(home.join(&self.github.local_repo))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_every_section() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.github.workflow_prefix, "deploy-kube-secrets");
        assert_eq!(config.github.package_type, "container");
        assert_eq!(config.github.pr_deploy_label, "deploy-test-hono");
        assert_eq!(config.kubernetes.dev_namespace, "dev");
        assert_eq!(config.kubernetes.test_namespace, "test");
        assert_eq!(config.container.registry, "ghcr.io");
        assert_eq!(config.container.dockerfile, "Dockerfile");
        assert!(config.container.image_suffix.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let yaml = r"
github:
  workflowPrefix: deploy-secrets
  prDeployLabel: ship-it
kubernetes:
  devNamespace: sandbox
container:
  imageSuffix: api
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.github.workflow_prefix, "deploy-secrets");
        assert_eq!(config.github.pr_deploy_label, "ship-it");
        assert_eq!(config.kubernetes.dev_namespace, "sandbox");
        assert_eq!(config.container.image_suffix, "api");
        // Untouched sections keep their defaults.
        assert_eq!(config.kubernetes.test_namespace, "test");
    }

    #[test]
    fn load_rejects_missing_secrets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "webhookSecret: hunter2").unwrap();

        // No github token anywhere: validation must fail. The assertion
        // holds whether or not the environment carries GITHUB_TOKEN, so
        // clear it for the duration of the check.
        let saved = env::var("GITHUB_TOKEN").ok();
        env::remove_var("GITHUB_TOKEN");
        let result = Config::load(file.path());
        if let Some(token) = saved {
            env::set_var("GITHUB_TOKEN", token);
        }

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
