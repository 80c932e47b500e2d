#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Webhook-driven continuous deployment controller.
//!
//! This crate turns GitHub webhook events (pull-request comments and
//! merges) into deployment pipelines: build and push a container image,
//! render kustomize manifests, apply them to a Kubernetes cluster and
//! wait for the workload to come up, or tear the whole deployment down.

pub mod clients;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Coordinator, DeploymentIdentity, PipelineOptions};
pub use telemetry::Telemetry;
