//! Domain events destined for remote callbacks.
//!
//! Event handlers and verbs build a [`Signal`]; the [`SignalProducer`] turns it
//! into a [`WebhookRequest`] (merging the session's outward payload) and
//! dispatches it without blocking the caller.

use crate::registry::{Callback, Session};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub mod signature;
pub mod transport;

pub use transport::{HttpTransport, WebhookRequest, WebhookTransport};

/// Identity of a conference member for callbacks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConferenceMember {
    pub name: String,
    pub uuid: String,
    pub member_id: String,
}

impl ConferenceMember {
    fn params(&self, action: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("ConferenceAction".to_string(), action.to_string()),
            ("ConferenceName".to_string(), self.name.clone()),
            ("ConferenceUUID".to_string(), self.uuid.clone()),
            ("ConferenceMemberID".to_string(), self.member_id.clone()),
        ])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    DialBridge {
        callback: Callback,
        a_leg: String,
        b_leg: String,
    },
    DialHangup {
        callback: Callback,
        a_leg: String,
        b_leg: String,
        cause: String,
    },
    /// A bound digit pattern matched. `params` were captured when the binding
    /// was armed.
    DigitsMatch {
        callback: Callback,
        digits_param: String,
        digits: String,
        params: BTreeMap<String, String>,
    },
    Hangup {
        callback: Callback,
        cause: String,
    },
    /// Final notice for an outbound request that never produced a leg.
    RequestHangup {
        callback: Callback,
        request_uuid: String,
        to: String,
        from: String,
        cause: String,
    },
    Heartbeat {
        callback: Callback,
    },
    RecordingFinished {
        callback: Callback,
        record_file: String,
        duration_ms: i64,
    },
    ConferenceEnter {
        callback: Callback,
        member: ConferenceMember,
    },
    ConferenceExit {
        callback: Callback,
        member: ConferenceMember,
    },
    ConferenceFloor {
        callback: Callback,
        member: ConferenceMember,
    },
    /// Fire-and-forget verb callback.
    Action {
        callback: Callback,
        params: BTreeMap<String, String>,
    },
}

impl Signal {
    pub fn callback(&self) -> &Callback {
        match self {
            Signal::DialBridge { callback, .. }
            | Signal::DialHangup { callback, .. }
            | Signal::DigitsMatch { callback, .. }
            | Signal::Hangup { callback, .. }
            | Signal::RequestHangup { callback, .. }
            | Signal::Heartbeat { callback }
            | Signal::RecordingFinished { callback, .. }
            | Signal::ConferenceEnter { callback, .. }
            | Signal::ConferenceExit { callback, .. }
            | Signal::ConferenceFloor { callback, .. }
            | Signal::Action { callback, .. } => callback,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::DialBridge { .. } => "dial_bridge",
            Signal::DialHangup { .. } => "dial_hangup",
            Signal::DigitsMatch { .. } => "digits_match",
            Signal::Hangup { .. } => "hangup",
            Signal::RequestHangup { .. } => "request_hangup",
            Signal::Heartbeat { .. } => "heartbeat",
            Signal::RecordingFinished { .. } => "recording_finished",
            Signal::ConferenceEnter { .. } => "conference_enter",
            Signal::ConferenceExit { .. } => "conference_exit",
            Signal::ConferenceFloor { .. } => "conference_floor",
            Signal::Action { .. } => "action",
        }
    }

    /// Signal-specific parameters, layered over the session payload.
    pub fn params(&self) -> BTreeMap<String, String> {
        let mut p = BTreeMap::new();
        match self {
            Signal::DialBridge { a_leg, b_leg, .. } => {
                p.insert("DialAction".into(), "answer".into());
                p.insert("DialALegUUID".into(), a_leg.clone());
                p.insert("DialBLegUUID".into(), b_leg.clone());
            }
            Signal::DialHangup {
                a_leg,
                b_leg,
                cause,
                ..
            } => {
                p.insert("DialAction".into(), "hangup".into());
                p.insert("DialALegUUID".into(), a_leg.clone());
                p.insert("DialBLegUUID".into(), b_leg.clone());
                p.insert("DialBLegHangupCause".into(), cause.clone());
            }
            Signal::DigitsMatch {
                digits_param,
                digits,
                params,
                ..
            } => {
                p.extend(params.clone());
                p.insert(digits_param.clone(), digits.clone());
            }
            Signal::Hangup { cause, .. } => {
                p.insert("HangupCause".into(), cause.clone());
            }
            Signal::RequestHangup {
                request_uuid,
                to,
                from,
                cause,
                ..
            } => {
                p.insert("RequestUUID".into(), request_uuid.clone());
                p.insert("To".into(), to.clone());
                p.insert("From".into(), from.clone());
                p.insert("CallStatus".into(), "completed".into());
                p.insert("HangupCause".into(), cause.clone());
            }
            Signal::Heartbeat { .. } => {
                p.insert("Heartbeat".into(), "true".into());
            }
            Signal::RecordingFinished {
                record_file,
                duration_ms,
                ..
            } => {
                p.insert("RecordFile".into(), record_file.clone());
                p.insert("RecordingDuration".into(), duration_ms.to_string());
            }
            Signal::ConferenceEnter { member, .. } => p.extend(member.params("enter")),
            Signal::ConferenceExit { member, .. } => p.extend(member.params("exit")),
            Signal::ConferenceFloor { member, .. } => p.extend(member.params("floor")),
            Signal::Action { params, .. } => p.extend(params.clone()),
        }
        p
    }
}

/// Builds webhook requests from signals and sends them.
pub struct SignalProducer {
    transport: Arc<dyn WebhookTransport>,
}

impl SignalProducer {
    pub fn new(transport: Arc<dyn WebhookTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> Arc<dyn WebhookTransport> {
        self.transport.clone()
    }

    pub fn build(&self, signal: &Signal, session: Option<&Session>) -> WebhookRequest {
        let callback = signal.callback();
        let base = session.map(|s| s.payload()).unwrap_or_default();
        WebhookRequest::new(callback.url.clone(), callback.method.clone())
            .with_params(base)
            .with_params(signal.params())
    }

    /// Send in the background; failures are logged only.
    pub fn dispatch(&self, signal: Signal, session: Option<&Session>) {
        self.dispatch_all(vec![signal], session);
    }

    /// Send several signals from one background task, one after the other,
    /// so receivers observe them in order.
    pub fn dispatch_all(&self, signals: Vec<Signal>, session: Option<&Session>) {
        if signals.is_empty() {
            return;
        }
        let requests = signals
            .iter()
            .map(|signal| (signal.name(), self.build(signal, session)))
            .collect::<Vec<_>>();
        let transport = self.transport.clone();
        let call_uuid = session.map(|s| s.id().to_string()).unwrap_or_default();
        tokio::spawn(async move {
            for (name, request) in requests {
                if let Err(e) = transport.notify(&request).await {
                    warn!(
                        signal = name,
                        call_uuid = %call_uuid,
                        url = %request.url,
                        "failed to deliver signal: {}",
                        e
                    );
                }
            }
        });
    }
}
