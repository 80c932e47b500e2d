//! Service binary: wire up the clients and serve webhooks.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hono_deploy::clients::docker::DockerOptions;
use hono_deploy::clients::{DockerClient, GithubClient, KubeClient, Kustomizer};
use hono_deploy::config::Config;
use hono_deploy::pipeline::{Coordinator, PipelineOptions};
use hono_deploy::server::{build_router, AppState};
use hono_deploy::telemetry::{RollbarChannel, Telemetry};

const DEFAULT_CONFIG_FILE: &str = "config/config.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("hono_deploy=info".parse()?))
        .init();

    info!("starting hono-deploy...");

    let config_file =
        std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let config = Config::load(Path::new(&config_file)).context("failed to load configuration")?;
    info!(
        workflow_prefix = %config.github.workflow_prefix,
        resource_dir = %config.kubernetes.resource,
        dev_namespace = %config.kubernetes.dev_namespace,
        test_namespace = %config.kubernetes.test_namespace,
        registry = %config.container.registry,
        "configuration loaded"
    );

    let telemetry = Telemetry::with_channels(vec![Arc::new(RollbarChannel::new(
        Some(config.rollbar_token.clone()),
        "production",
    ))]);

    let github_client =
        GithubClient::new(&config.github_token).context("failed to create GitHub client")?;

    let kube_client = build_kube_client(&config.kube_config)
        .await
        .context("failed to create Kubernetes client")?;

    let docker_client = DockerClient::new(
        DockerOptions {
            registry: config.container.registry.clone(),
            // The GitHub token doubles as the registry password.
            registry_password: config.github_token.clone(),
            dockerfile: config.container.dockerfile.clone(),
        },
        None,
    )
    .context("failed to create Docker client")?;

    let options = PipelineOptions {
        local_repo_dir: config.local_repo_dir()?,
        resource_dir: config.kubernetes.resource.clone(),
        workflow_prefix: config.github.workflow_prefix.clone(),
        package_type: config.github.package_type.clone(),
        pr_deploy_label: config.github.pr_deploy_label.clone(),
        image_suffix: config.container.image_suffix.clone(),
        dev_namespace: config.kubernetes.dev_namespace.clone(),
        test_namespace: config.kubernetes.test_namespace.clone(),
    };

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(github_client),
        Arc::new(KubeClient::new(kube_client)),
        Arc::new(docker_client),
        Arc::new(Kustomizer::new()),
        telemetry,
        options,
    ));

    let ready = Arc::new(AtomicBool::new(false));
    let state = AppState {
        webhook_secret: config.webhook_secret.clone(),
        coordinator,
        ready: ready.clone(),
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    ready.store(true, Ordering::SeqCst);
    info!(port = config.server.port, "server instance created, listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

/// Build a Kubernetes client from a kubeconfig path, or the in-cluster /
/// ambient configuration when none is given.
async fn build_kube_client(kube_config: &str) -> Result<kube::Client> {
    if kube_config.is_empty() {
        return Ok(kube::Client::try_default().await?);
    }
    let kubeconfig = kube::config::Kubeconfig::read_from(kube_config)?;
    let config = kube::Config::from_custom_kubeconfig(
        kubeconfig,
        &kube::config::KubeConfigOptions::default(),
    )
    .await?;
    Ok(kube::Client::try_from(config)?)
}
