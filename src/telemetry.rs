//! Fire-and-forget telemetry for pipeline observability.
//!
//! The pipeline reports phase boundaries, retry warnings and fatal errors
//! to an external sink. Channels implement [`TelemetryChannel`]; the
//! [`Telemetry`] dispatcher fans a message out to every enabled channel
//! without blocking the pipeline. Delivery failures are logged, never
//! propagated.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error};

/// Severity of a telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// Wire representation expected by the sink.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A destination for telemetry messages (Rollbar, test recorders, ...).
pub trait TelemetryChannel: Send + Sync {
    /// Name of this channel, for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether the channel is configured and should receive messages.
    fn enabled(&self) -> bool;

    /// Deliver a single message. Must not block the caller; expensive
    /// transports spawn their own tasks.
    fn send(&self, level: Level, message: &str);
}

/// Dispatcher over all configured telemetry channels.
#[derive(Clone, Default)]
pub struct Telemetry {
    channels: Vec<Arc<dyn TelemetryChannel>>,
}

impl Telemetry {
    /// Create a dispatcher with the given channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn TelemetryChannel>>) -> Self {
        Self { channels }
    }

    /// A dispatcher that drops everything. Keeps tests hermetic.
    #[must_use]
    pub fn disabled() -> Self {
        Self { channels: vec![] }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Level::Info, &message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Level::Warning, &message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Level::Error, &message.into());
    }

    pub fn critical(&self, message: impl Into<String>) {
        self.emit(Level::Critical, &message.into());
    }

    fn emit(&self, level: Level, message: &str) {
        for channel in &self.channels {
            if !channel.enabled() {
                debug!(channel = channel.name(), "telemetry channel disabled, skipping");
                continue;
            }
            channel.send(level, message);
        }
    }
}

/// Rollbar item-reporting channel.
///
/// Posts each message as a Rollbar item. The HTTP call runs on a spawned
/// task so the pipeline never waits on the sink.
pub struct RollbarChannel {
    client: reqwest::Client,
    token: Option<String>,
    environment: String,
}

const ROLLBAR_ITEM_URL: &str = "https://api.rollbar.com/api/1/item/";

impl RollbarChannel {
    #[must_use]
    pub fn new(token: Option<String>, environment: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.filter(|t| !t.is_empty()),
            environment: environment.into(),
        }
    }
}

impl TelemetryChannel for RollbarChannel {
    fn name(&self) -> &'static str {
        "rollbar"
    }

    fn enabled(&self) -> bool {
        self.token.is_some()
    }

    fn send(&self, level: Level, message: &str) {
        let Some(token) = self.token.clone() else {
            return;
        };
        let body = json!({
            "access_token": token,
            "data": {
                "environment": self.environment,
                "level": level.as_str(),
                "body": { "message": { "body": message } },
            }
        });
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(ROLLBAR_ITEM_URL).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("telemetry item delivered");
                }
                Ok(response) => {
                    error!(status = %response.status(), "telemetry sink rejected item");
                }
                Err(err) => {
                    error!(error = %err, "failed to deliver telemetry item");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        entries: Mutex<Vec<(Level, String)>>,
    }

    impl TelemetryChannel for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn enabled(&self) -> bool {
            true
        }

        fn send(&self, level: Level, message: &str) {
            self.entries.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn dispatches_to_enabled_channels() {
        let recorder = Arc::new(Recorder {
            entries: Mutex::new(vec![]),
        });
        let telemetry = Telemetry::with_channels(vec![recorder.clone()]);

        telemetry.info("starting");
        telemetry.critical("boom");

        let entries = recorder.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (Level::Info, "starting".to_string()));
        assert_eq!(entries[1], (Level::Critical, "boom".to_string()));
    }

    #[test]
    fn disabled_dispatcher_drops_messages() {
        let telemetry = Telemetry::disabled();
        telemetry.error("nobody is listening");
    }

    #[test]
    fn rollbar_without_token_is_disabled() {
        let channel = RollbarChannel::new(None, "production");
        assert!(!channel.enabled());
        let channel = RollbarChannel::new(Some(String::new()), "production");
        assert!(!channel.enabled());
    }

    #[test]
    fn level_wire_names() {
        assert_eq!(Level::Info.as_str(), "info");
        assert_eq!(Level::Warning.as_str(), "warning");
        assert_eq!(Level::Error.as_str(), "error");
        assert_eq!(Level::Critical.as_str(), "critical");
    }
}
