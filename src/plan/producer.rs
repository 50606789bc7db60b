use super::instruction::{Instruction, VerbKind};
use super::parser::parse_document;
use crate::config::Config;
use crate::error::FlowError;
use crate::registry::Session;
use crate::scheduler::Scheduler;
use crate::signal::{SignalProducer, WebhookRequest, WebhookTransport};
use crate::verbs::{self, Outcome};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where the next call-flow document comes from.
#[derive(Debug, Clone)]
pub enum PlanSource {
    Literal(String),
    Remote(WebhookRequest),
}

/// Restores the session's instruction stack when a sequence ends, however it
/// ends.
struct FrameGuard<'a> {
    session: &'a Session,
    previous_verb: Option<VerbKind>,
}

impl<'a> FrameGuard<'a> {
    fn enter(session: &'a Session, instructions: Vec<Instruction>) -> Self {
        let previous_verb = session.current_verb();
        session.push_frame(Arc::new(instructions));
        Self {
            session,
            previous_verb,
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.session.pop_frame();
        self.session.set_current_verb(self.previous_verb);
    }
}

/// Fetches call-flow documents and drives their instructions on a session.
pub struct PlanProducer {
    config: Arc<Config>,
    signals: Arc<SignalProducer>,
    scheduler: Scheduler,
}

impl PlanProducer {
    pub fn new(config: Arc<Config>, signals: Arc<SignalProducer>, scheduler: Scheduler) -> Self {
        Self {
            config,
            signals,
            scheduler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn signals(&self) -> &SignalProducer {
        &self.signals
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn transport(&self) -> Arc<dyn WebhookTransport> {
        self.signals.transport()
    }

    /// Parse a document and validate every instruction in it, nested ones
    /// included, before anything runs.
    pub fn build_plan(&self, xml: &str) -> Result<Vec<Instruction>> {
        let plan = parse_document(xml)?;
        for instruction in &plan {
            self.validate(instruction)?;
        }
        Ok(plan)
    }

    pub fn validate(&self, instruction: &Instruction) -> Result<()> {
        if let Some(handler) = verbs::handler(instruction.kind) {
            handler.validate(instruction, &self.config.call)?;
        }
        if instruction.kind != VerbKind::Dial {
            for child in &instruction.children {
                self.validate(child)?;
            }
        }
        Ok(())
    }

    /// Request for a document on behalf of `session`: the session payload
    /// with `params` layered on top.
    pub fn document_request(
        &self,
        session: &Session,
        url: &str,
        method: &str,
        params: BTreeMap<String, String>,
    ) -> WebhookRequest {
        WebhookRequest::new(url, method)
            .with_params(session.payload())
            .with_params(params)
    }

    /// Fetch a document body. Transport failures are logged and read as "no
    /// document".
    pub async fn fetch(&self, session: &Session, request: &WebhookRequest) -> Option<String> {
        let started = Instant::now();
        match self.transport().fetch(request).await {
            Ok(body) => {
                debug!(
                    session_id = %session.id(),
                    url = %request.url,
                    elapsed = ?started.elapsed(),
                    "fetched call flow"
                );
                Some(body)
            }
            Err(e) => {
                warn!(
                    session_id = %session.id(),
                    url = %request.url,
                    "call flow fetch failed, no further instructions: {}",
                    e
                );
                None
            }
        }
    }

    /// Fetch a document made of prompts only (`Play`, `Speak`, `Wait`), as
    /// used for hold music and confirmation sounds. Other verbs are skipped.
    pub async fn fetch_prompts(
        &self,
        session: &Session,
        url: &str,
        method: &str,
    ) -> Result<Vec<Instruction>> {
        let request = self.document_request(session, url, method, BTreeMap::new());
        let Some(body) = self.fetch(session, &request).await else {
            return Ok(Vec::new());
        };
        let mut prompts = Vec::new();
        for instruction in parse_document(&body)? {
            match instruction.kind {
                VerbKind::Play | VerbKind::Speak | VerbKind::Wait => {
                    self.validate(&instruction)?;
                    prompts.push(instruction);
                }
                other => {
                    debug!(session_id = %session.id(), verb = %other, "ignoring non-prompt verb");
                }
            }
        }
        Ok(prompts)
    }

    /// Interpret call flows for `session` until one ends without redirecting.
    pub async fn run(&self, session: Arc<Session>, source: PlanSource) {
        let mut source = source;
        loop {
            let xml = match source {
                PlanSource::Literal(xml) => xml,
                PlanSource::Remote(request) => {
                    let request = self.document_request(
                        &session,
                        &request.url,
                        &request.method,
                        request.params,
                    );
                    match self.fetch(&session, &request).await {
                        Some(body) => body,
                        None => return,
                    }
                }
            };

            let plan = match self.build_plan(&xml) {
                Ok(plan) => plan,
                Err(e) => {
                    error!(session_id = %session.id(), "rejected call flow: {:#}", e);
                    return;
                }
            };

            match self.execute_sequence(&session, plan).await {
                Ok(Outcome::Redirect(request)) => {
                    if session.is_hung_up() {
                        debug!(session_id = %session.id(), "leg gone, dropping redirect");
                        return;
                    }
                    info!(session_id = %session.id(), url = %request.url, "redirecting");
                    source = PlanSource::Remote(request);
                }
                Ok(_) => return,
                Err(_) => return,
            }
        }
    }

    /// Run `instructions` in order on `session`.
    ///
    /// Nested sequences (PreAnswer) call this recursively; the session's
    /// previous sequence and cursor are restored when it returns, including on
    /// failure.
    pub async fn execute_sequence(
        &self,
        session: &Arc<Session>,
        instructions: Vec<Instruction>,
    ) -> Result<Outcome> {
        let _frame = FrameGuard::enter(session, instructions);
        while let Some(instruction) = session.next_instruction() {
            if session.is_hung_up() {
                debug!(session_id = %session.id(), "leg hung up, stopping sequence");
                return Ok(Outcome::Terminate);
            }
            let kind = instruction.kind;
            let handler = verbs::handler(kind)
                .ok_or_else(|| FlowError::format(format!("{} cannot run here", kind)))?;
            session.set_current_verb(Some(kind));
            debug!(session_id = %session.id(), verb = %kind, "executing");
            match handler.execute(self, session, &instruction).await {
                Ok(Outcome::Continue) => {}
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    error!(
                        session_id = %session.id(),
                        verb = %kind,
                        "instruction failed, aborting sequence: {:#}",
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CallHarness;

    #[tokio::test]
    async fn test_attribute_error_rejects_whole_plan() {
        let h = CallHarness::new();
        let err = h
            .producer
            .build_plan(r#"<Response><Wait length="2"/><Play loop="many">a.wav</Play></Response>"#)
            .unwrap_err();
        assert!(matches!(
            crate::error::flow_error(&err),
            Some(FlowError::Attribute(_))
        ));

        h.producer
            .run(
                h.session.clone(),
                PlanSource::Literal(
                    r#"<Response><Wait length="2"/><Play loop="many">a.wav</Play></Response>"#
                        .to_string(),
                ),
            )
            .await;
        assert!(h.switch.executed().is_empty());
    }

    #[tokio::test]
    async fn test_nested_children_are_validated() {
        let h = CallHarness::new();
        let err = h
            .producer
            .build_plan(
                r#"<Response><GetDigits action="http://cb/d"><Wait length="x"/></GetDigits></Response>"#,
            )
            .unwrap_err();
        assert!(matches!(
            crate::error::flow_error(&err),
            Some(FlowError::Attribute(_))
        ));
    }

    #[tokio::test]
    async fn test_redirect_fetches_next_document_with_payload() {
        let h = CallHarness::new();
        h.transport.serve(
            "http://app/next",
            r#"<Response><DTMF>12</DTMF><Hangup reason="busy"/></Response>"#,
        );
        h.producer
            .run(
                h.session.clone(),
                PlanSource::Literal(
                    r#"<Response><Redirect method="GET">http://app/next</Redirect><Play>never.wav</Play></Response>"#
                        .to_string(),
                ),
            )
            .await;

        let fetched = h.transport.requests_to("http://app/next");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].method, "GET");
        assert_eq!(fetched[0].params["CallUUID"], "leg-a");

        assert_eq!(h.switch.executed_args("send_dtmf"), vec!["12"]);
        assert_eq!(h.switch.executed_args("hangup"), vec!["USER_BUSY"]);
        assert!(h.switch.executed_args("playback").is_empty());
        assert_eq!(h.session.frame_depth(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_means_no_instructions() {
        let h = CallHarness::new();
        h.transport.fail("http://app/down");
        h.producer
            .run(
                h.session.clone(),
                PlanSource::Remote(WebhookRequest::new("http://app/down", "POST")),
            )
            .await;
        assert_eq!(h.transport.requests().len(), 1);
        assert!(h.switch.issued().is_empty());
    }

    #[tokio::test]
    async fn test_hung_up_session_runs_nothing() {
        let h = CallHarness::new();
        h.session.mark_hung_up(crate::switch::SwitchEvent::new(
            crate::switch::event::CHANNEL_HANGUP_COMPLETE,
        ));
        let outcome = h
            .producer
            .execute_sequence(
                &h.session,
                h.producer
                    .build_plan("<Response><DTMF>1</DTMF></Response>")
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Terminate);
        assert!(h.switch.executed().is_empty());
    }
}
