//! Webhook payload parsing, signature verification and event classification.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

/// Verify a GitHub webhook signature (`X-Hub-Signature-256` header,
/// `sha256=<hex>` format) using HMAC-SHA256 over the raw body.
#[must_use]
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_signature) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison to prevent timing attacks
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Repository fragment common to all event payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: Account,
}

/// Account fragment (`owner.login`).
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
}

/// Issue fragment of an issue-comment payload. The `pull_request` key is
/// present exactly when the issue is a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub pull_request: Option<PullRequestLink>,
}

impl Issue {
    #[must_use]
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestLink {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub body: String,
}

/// `issue_comment` event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: Comment,
    pub repository: Repository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub merged: bool,
    pub base: BranchRef,
    #[serde(default)]
    pub labels: Vec<Label>,
}

/// `pull_request` event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequest,
    pub repository: Repository,
}

/// Recognized inbound events.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    IssueComment(IssueCommentEvent),
    PullRequest(PullRequestEvent),
    /// Hook registration ping. Acknowledged, never acted on.
    Ping,
}

/// Parse a webhook body keyed by the `X-GitHub-Event` header value.
/// Event names we do not handle return `None`.
pub fn parse_event(event_name: &str, body: &[u8]) -> Result<Option<WebhookEvent>> {
    match event_name {
        "issue_comment" => Ok(Some(WebhookEvent::IssueComment(serde_json::from_slice(
            body,
        )?))),
        "pull_request" => Ok(Some(WebhookEvent::PullRequest(serde_json::from_slice(
            body,
        )?))),
        "ping" => Ok(Some(WebhookEvent::Ping)),
        _ => Ok(None),
    }
}

/// Comment body token that requests a dev deployment.
pub const DEPLOY_COMMAND: &str = "deploy dev";

/// Pipeline verdict for an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Comment on a pull request asking for a dev deploy.
    IssueCommentDeploy,
    /// The deploy comment was deleted; tear the dev deployment down.
    IssueCommentCleanup,
    /// Labelled pull request merged into main; deploy to test.
    PullRequestMergeDeploy,
    /// No pipeline work. Carries the reason for the log line.
    Ignore(&'static str),
}

/// Decide whether an event triggers pipeline work.
///
/// Conservative by construction: anything that does not match an explicit
/// predicate is ignored, never an error.
#[must_use]
pub fn classify(event: &WebhookEvent, pr_deploy_label: &str) -> Trigger {
    match event {
        WebhookEvent::IssueComment(event) => {
            if event.issue.is_pull_request() && event.comment.body.contains(DEPLOY_COMMAND) {
                if event.action == "deleted" {
                    Trigger::IssueCommentCleanup
                } else {
                    Trigger::IssueCommentDeploy
                }
            } else {
                Trigger::Ignore("issue comment without a deploy command")
            }
        }
        WebhookEvent::PullRequest(event) => {
            let pr = &event.pull_request;
            let labelled = pr.labels.iter().any(|label| label.name == pr_deploy_label);
            if pr.base.ref_name == "main" && event.action == "closed" && pr.merged && labelled {
                Trigger::PullRequestMergeDeploy
            } else {
                Trigger::Ignore("pull request outside the merge-deploy predicate")
            }
        }
        WebhookEvent::Ping => Trigger::Ignore("hook registration event"),
    }
}
