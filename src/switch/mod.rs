//! Narrow view of the media switch connection.
//!
//! The wire protocol lives outside this crate; everything here talks to the
//! switch through [`SwitchClient`] and consumes [`SwitchEvent`]s.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub mod event;
pub use event::SwitchEvent;

/// Reply to a blocking command or an application execution request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandReply {
    pub body: String,
    pub headers: HashMap<String, String>,
}

impl CommandReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    /// Replies for `execute` carry their status in `Reply-Text`; api replies
    /// carry it in the body.
    fn status_text(&self) -> &str {
        self.headers
            .get("Reply-Text")
            .map(|s| s.as_str())
            .unwrap_or(self.body.as_str())
    }

    pub fn is_ok(&self) -> bool {
        !self.status_text().trim_start().starts_with("-ERR")
    }

    pub fn error_cause(&self) -> Option<&str> {
        self.status_text()
            .trim()
            .strip_prefix("-ERR")
            .map(|cause| cause.trim())
    }
}

/// Command capability of one switch connection.
#[async_trait]
pub trait SwitchClient: Send + Sync {
    /// Blocking api command, e.g. `uuid_getvar <uuid> hangup_cause`.
    async fn command(&self, cmd: &str) -> Result<CommandReply>;

    /// Background api command. Returns the switch-assigned job id, or `None`
    /// when the switch did not hand one out.
    async fn bg_command(&self, cmd: &str) -> Result<Option<String>>;

    /// Execute a dialplan application on a channel. With `event_lock` the
    /// call returns once the switch has queued the application; completion
    /// arrives later as `CHANNEL_EXECUTE_COMPLETE`.
    async fn execute(
        &self,
        uuid: &str,
        app: &str,
        arg: &str,
        event_lock: bool,
    ) -> Result<CommandReply>;
}

pub type SwitchClientRef = Arc<dyn SwitchClient>;
