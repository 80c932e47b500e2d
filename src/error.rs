//! Error types for the deployment pipeline.

use thiserror::Error;

/// Errors produced by the pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Docker daemon error
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// GitHub API error
    #[error("github API error: {0}")]
    GitHub(#[from] octocrab::Error),

    /// Filesystem or subprocess I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Webhook payload could not be parsed
    #[error("failed to decode webhook payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Manifest text is not a recognizable Kubernetes resource
    #[error("failed to decode resource: {0}")]
    Decode(String),

    /// Resource kind outside the supported set
    #[error("unsupported Kubernetes resource kind: {0}")]
    UnsupportedKind(String),

    /// Deadline or parent cancellation fired
    #[error("context cancelled: deadline exceeded")]
    Cancelled,

    /// All retry attempts consumed
    #[error("after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Workflow run finished with a non-success conclusion
    #[error("workflow {workflow} ended with conclusion: {conclusion}")]
    WorkflowConclusion { workflow: String, conclusion: String },

    /// Workflow run finished with a conclusion we do not recognize
    #[error("unknown workflow conclusion: {conclusion}")]
    UnknownWorkflowConclusion { conclusion: String },

    /// Polling cap elapsed before the workflow run completed
    #[error("timed out waiting for workflow {workflow} to complete")]
    WorkflowTimeout { workflow: String },

    /// No runs recorded for the workflow file on the branch
    #[error("no workflow runs found for {workflow}")]
    NoWorkflowRuns { workflow: String },

    /// External tool exited unsuccessfully
    #[error("command {program} failed: {detail}")]
    Command { program: String, detail: String },

    /// Readiness waiter invoked without workload labels
    #[error("cannot build a label selector from an empty label set")]
    EmptySelector,

    /// One or more cleanup units failed
    #[error("errors occurred during cleanup: {0:?}")]
    Cleanup(Vec<String>),

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a kube error is an API-level 404.
///
/// Not-found is recoverable in two places: delete treats it as success,
/// apply switches from update to create.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_message_names_attempt_count() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            last: "connection refused".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("after 3 attempts"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn is_not_found_matches_api_404_only() {
        let not_found = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments.apps \"svc\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&not_found));

        let forbidden = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert!(!is_not_found(&forbidden));
    }
}
