//! One handler per call-flow verb.
//!
//! Each handler has a pure `fetch_context` step that turns an
//! [`Instruction`] into a typed context (failing with an attribute error on
//! bad input), and an `execute` step that drives the switch and reports an
//! [`Outcome`] to the plan loop.

use crate::config::CallConfig;
use crate::plan::{Instruction, PlanProducer, VerbKind};
use crate::registry::{Callback, DigitBinding, Session};
use crate::signal::{Signal, WebhookRequest};
use crate::switch::event::DIGITS_MATCH;
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub mod conference;
pub mod dial;
pub mod dtmf;
pub mod get_digits;
pub mod get_speech;
pub mod hangup;
pub mod media;
pub mod play;
pub mod pre_answer;
pub mod record;
pub mod redirect;
pub mod sip_transfer;
pub mod speak;
pub mod wait;

#[cfg(test)]
mod tests;

/// What the plan loop does after a verb finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Go on with the next instruction.
    Continue,
    /// Replace the rest of the flow with the document behind this request.
    Redirect(WebhookRequest),
    /// Stop interpreting for this session.
    Terminate,
}

#[async_trait]
pub trait VerbHandler: Send + Sync {
    /// Check attributes without touching the switch.
    fn validate(&self, instruction: &Instruction, config: &CallConfig) -> Result<()>;

    async fn execute(
        &self,
        producer: &PlanProducer,
        session: &Arc<Session>,
        instruction: &Instruction,
    ) -> Result<Outcome>;
}

static HANDLERS: Lazy<HashMap<VerbKind, Box<dyn VerbHandler>>> = Lazy::new(|| {
    let mut handlers: HashMap<VerbKind, Box<dyn VerbHandler>> = HashMap::new();
    handlers.insert(VerbKind::Conference, Box::new(conference::ConferenceVerb));
    handlers.insert(VerbKind::Dial, Box::new(dial::DialVerb));
    handlers.insert(VerbKind::Dtmf, Box::new(dtmf::DtmfVerb));
    handlers.insert(VerbKind::GetDigits, Box::new(get_digits::GetDigitsVerb));
    handlers.insert(VerbKind::GetSpeech, Box::new(get_speech::GetSpeechVerb));
    handlers.insert(VerbKind::Hangup, Box::new(hangup::HangupVerb));
    handlers.insert(VerbKind::Play, Box::new(play::PlayVerb));
    handlers.insert(VerbKind::PreAnswer, Box::new(pre_answer::PreAnswerVerb));
    handlers.insert(VerbKind::Record, Box::new(record::RecordVerb));
    handlers.insert(VerbKind::Redirect, Box::new(redirect::RedirectVerb));
    handlers.insert(VerbKind::SipTransfer, Box::new(sip_transfer::SipTransferVerb));
    handlers.insert(VerbKind::Speak, Box::new(speak::SpeakVerb));
    handlers.insert(VerbKind::Wait, Box::new(wait::WaitVerb));
    handlers
});

/// Handler for `kind`. `Number` has none; it only exists inside `Dial`.
pub fn handler(kind: VerbKind) -> Option<&'static dyn VerbHandler> {
    HANDLERS.get(&kind).map(|h| h.as_ref())
}

/// Optional `action`/`method` pair.
pub(crate) fn callback_attr(
    instruction: &Instruction,
    url: &str,
    method: &str,
) -> Result<Option<Callback>, crate::error::FlowError> {
    let Some(url) = instruction.url_attr(url)? else {
        return Ok(None);
    };
    let method = instruction.method_attr(method, "POST")?;
    Ok(Some(Callback::new(url, method)))
}

/// Bind `patterns` on the leg so each match raises a digits-match event for
/// `realm`, and remember where the match is reported.
pub(crate) async fn bind_digit_callbacks(
    session: &Session,
    realm: &str,
    patterns: &[String],
    binding: DigitBinding,
) -> Result<()> {
    session.execute("digit_action_set_realm", realm).await?;
    for pattern in patterns {
        let event = format!(
            "^^;Event-Subclass={};Digits-Realm={};Digits-Match={}",
            DIGITS_MATCH, realm, pattern
        );
        session
            .execute(
                "bind_digit_action",
                &format!("{},{},exec:event,{}", realm, pattern, event),
            )
            .await?;
    }
    session.arm_digit_callback(realm, binding);
    Ok(())
}

/// Drop the bindings of `realm`, if any were armed.
pub(crate) async fn clear_digit_callbacks(session: &Session, realm: &str) -> Result<()> {
    if session.disarm_digit_callback(realm).is_some() && !session.is_hung_up() {
        session.execute("clear_digit_action", realm).await?;
    }
    Ok(())
}

/// Report a verb's result to its action url: as the next document when
/// `redirect` is set and the leg is still up, otherwise as a notification.
pub(crate) fn report(
    producer: &PlanProducer,
    session: &Session,
    action: Option<&Callback>,
    redirect: bool,
    params: BTreeMap<String, String>,
) -> Outcome {
    let Some(action) = action else {
        return Outcome::Continue;
    };
    if redirect && !session.is_hung_up() {
        return Outcome::Redirect(
            WebhookRequest::new(action.url.clone(), action.method.clone()).with_params(params),
        );
    }
    producer.signals().dispatch(
        Signal::Action {
            callback: action.clone(),
            params,
        },
        Some(session),
    );
    Outcome::Continue
}
