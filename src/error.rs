use thiserror::Error;

/// Failure kinds surfaced while interpreting a call flow.
///
/// Verb handlers and the parser return these wrapped in `anyhow::Error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// Malformed document or nesting.
    #[error("format error: {0}")]
    Format(String),

    /// Missing, malformed or out-of-range attribute.
    #[error("attribute error: {0}")]
    Attribute(String),

    #[error("unrecognized element: {0}")]
    UnrecognizedElement(String),

    /// Unexpected or missing response field from the switch.
    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// Webhook or document fetch failed on the network.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The owning switch instance is gone.
    #[error("session {0} is no longer attached to a switch")]
    SessionGone(String),

    /// The leg hung up while an instruction was running.
    #[error("session {0} hung up")]
    Hangup(String),
}

impl FlowError {
    pub fn format(msg: impl Into<String>) -> Self {
        FlowError::Format(msg.into())
    }

    pub fn attribute(msg: impl Into<String>) -> Self {
        FlowError::Attribute(msg.into())
    }

    /// Document-level failures: the whole plan is rejected.
    pub fn is_format(&self) -> bool {
        matches!(self, FlowError::Format(_) | FlowError::UnrecognizedElement(_))
    }
}

/// Extract the [`FlowError`] kind from an `anyhow` chain, if any.
pub fn flow_error(err: &anyhow::Error) -> Option<&FlowError> {
    err.chain().find_map(|e| e.downcast_ref::<FlowError>())
}
