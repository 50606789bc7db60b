use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CHANNEL_PARK: &str = "CHANNEL_PARK";
pub const CHANNEL_ANSWER: &str = "CHANNEL_ANSWER";
pub const CHANNEL_PROGRESS: &str = "CHANNEL_PROGRESS";
pub const CHANNEL_PROGRESS_MEDIA: &str = "CHANNEL_PROGRESS_MEDIA";
pub const CHANNEL_BRIDGE: &str = "CHANNEL_BRIDGE";
pub const CHANNEL_UNBRIDGE: &str = "CHANNEL_UNBRIDGE";
pub const CHANNEL_EXECUTE_COMPLETE: &str = "CHANNEL_EXECUTE_COMPLETE";
pub const CHANNEL_HANGUP: &str = "CHANNEL_HANGUP";
pub const CHANNEL_HANGUP_COMPLETE: &str = "CHANNEL_HANGUP_COMPLETE";
pub const BACKGROUND_JOB: &str = "BACKGROUND_JOB";
pub const SESSION_HEARTBEAT: &str = "SESSION_HEARTBEAT";
pub const RECORD_STOP: &str = "RECORD_STOP";
pub const DETECTED_SPEECH: &str = "DETECTED_SPEECH";
pub const CUSTOM: &str = "CUSTOM";

pub const CONFERENCE_MAINTENANCE: &str = "conference::maintenance";
pub const DIGITS_MATCH: &str = "flowswitch::digits_match";

/// Value the switch uses for a variable that is not set.
pub const UNDEF: &str = "_undef_";

/// One asynchronous event as delivered by the switch.
///
/// Headers keep their raw names (`Unique-ID`, `variable_hangup_cause`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchEvent {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl SwitchEvent {
    pub fn new(name: &str) -> Self {
        let mut event = Self::default();
        event.set_header("Event-Name", name);
        event
    }

    pub fn custom(subclass: &str) -> Self {
        Self::new(CUSTOM).with_header("Event-Subclass", subclass)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_variable(self, name: &str, value: impl Into<String>) -> Self {
        self.with_header(format!("variable_{}", name), value)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Header value, treating empty strings and `_undef_` as absent.
    pub fn present(&self, name: &str) -> Option<&str> {
        self.header(name).filter(|v| !v.is_empty() && *v != UNDEF)
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.present(&format!("variable_{}", name))
    }

    pub fn is_true(&self, name: &str) -> bool {
        self.header(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn name(&self) -> &str {
        self.header("Event-Name").unwrap_or_default()
    }

    pub fn subclass(&self) -> Option<&str> {
        self.header("Event-Subclass")
    }

    pub fn is(&self, name: &str) -> bool {
        self.name() == name
    }

    pub fn is_custom(&self, subclass: &str) -> bool {
        self.is(CUSTOM) && self.subclass() == Some(subclass)
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.present("Unique-ID")
            .or_else(|| self.present("Caller-Unique-ID"))
    }

    pub fn job_uuid(&self) -> Option<&str> {
        self.present("Job-UUID")
    }

    pub fn application(&self) -> Option<&str> {
        self.header("Application")
    }

    /// True for the completion event of the given dialplan application.
    pub fn is_execute_complete(&self, app: &str) -> bool {
        self.is(CHANNEL_EXECUTE_COMPLETE) && self.application() == Some(app)
    }

    pub fn hangup_cause(&self) -> Option<&str> {
        self.present("Hangup-Cause")
            .or_else(|| self.variable("hangup_cause"))
    }

    pub fn other_leg(&self) -> Option<&str> {
        self.present("Other-Leg-Unique-ID")
            .or_else(|| self.present("Bridge-B-Unique-ID"))
    }

    /// `Action` header of a conference maintenance event.
    pub fn conference_action(&self) -> Option<&str> {
        if self.is_custom(CONFERENCE_MAINTENANCE) {
            self.header("Action")
        } else {
            None
        }
    }
}
