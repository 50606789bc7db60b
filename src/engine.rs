//! Event dispatcher tying switch connections to sessions, jobs, call
//! requests and webhooks.

use crate::config::Config;
use crate::dialer::{CallRequestSpec, Dialer};
use crate::error::FlowError;
use crate::plan::{PlanProducer, PlanSource};
use crate::registry::{
    CallRequest, CallRequestStatus, CallStatus, Callback, JobResult, Registry, ScheduledHangup, ScheduledPlay,
    Session, SwitchInstance,
};
use crate::scheduler::Scheduler;
use crate::signal::{Signal, SignalProducer, WebhookRequest, WebhookTransport};
use crate::switch::event::{
    BACKGROUND_JOB, CHANNEL_ANSWER, CHANNEL_HANGUP_COMPLETE, CHANNEL_PARK, CHANNEL_PROGRESS,
    CHANNEL_PROGRESS_MEDIA, CONFERENCE_MAINTENANCE, DIGITS_MATCH, RECORD_STOP,
    SESSION_HEARTBEAT,
};
use crate::switch::{SwitchClientRef, SwitchEvent};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type EngineRef = Arc<Engine>;

pub struct Engine {
    config: Arc<Config>,
    registry: Arc<Registry>,
    signals: Arc<SignalProducer>,
    producer: Arc<PlanProducer>,
    scheduler: Scheduler,
    token: CancellationToken,
}

impl Engine {
    pub fn new(config: Config, transport: Arc<dyn WebhookTransport>) -> EngineRef {
        let config = Arc::new(config);
        let token = CancellationToken::new();
        let signals = Arc::new(SignalProducer::new(transport));
        let scheduler = Scheduler::new(config.call.schedule_grace(), token.child_token());
        let producer = Arc::new(PlanProducer::new(
            config.clone(),
            signals.clone(),
            scheduler.clone(),
        ));
        Arc::new(Self {
            config,
            registry: Registry::new(),
            signals,
            producer,
            scheduler,
            token,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn producer(&self) -> &Arc<PlanProducer> {
        &self.producer
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn callback(&self, url: Option<&str>) -> Option<Callback> {
        url.map(|url| Callback::new(url, self.config.http.default_method.clone()))
    }

    /// Register a switch whose handshake already succeeded.
    pub fn connect(
        &self,
        id: &str,
        client: SwitchClientRef,
        globals: HashMap<String, String>,
    ) -> Arc<SwitchInstance> {
        info!(instance = id, "switch connected");
        self.registry.add_instance(id, client, globals)
    }

    /// Forget a switch and everything it owned.
    pub fn disconnect(&self, id: &str) -> bool {
        match self.registry.remove_instance(id) {
            Some(instance) => {
                info!(
                    instance = id,
                    sessions = instance.session_count(),
                    "switch disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Pump `events` from one switch until the stream ends or the engine
    /// shuts down.
    pub async fn run(
        &self,
        instance: Arc<SwitchInstance>,
        mut events: mpsc::UnboundedReceiver<SwitchEvent>,
    ) {
        loop {
            select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(&instance, event),
                    None => {
                        info!(instance = %instance.id(), "event stream closed");
                        break;
                    }
                },
                _ = self.token.cancelled() => {
                    info!(instance = %instance.id(), "engine shutting down");
                    break;
                }
            }
        }
        self.disconnect(instance.id());
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Route one asynchronous event from `instance`.
    pub fn dispatch(&self, instance: &Arc<SwitchInstance>, event: SwitchEvent) {
        match event.name() {
            BACKGROUND_JOB => self.on_background_job(instance, event),
            CHANNEL_PARK => self.on_park(instance, event),
            CHANNEL_ANSWER => {
                if let Some(session) = self.session_of(instance, &event) {
                    session.set_answered();
                    session.deliver(event);
                }
            }
            CHANNEL_PROGRESS | CHANNEL_PROGRESS_MEDIA => self.on_progress(instance, event),
            CHANNEL_HANGUP_COMPLETE => self.on_hangup_complete(instance, event),
            SESSION_HEARTBEAT => self.on_heartbeat(instance, event),
            RECORD_STOP => self.on_record_stop(instance, event),
            _ if event.is_custom(CONFERENCE_MAINTENANCE) => {
                self.on_conference_maintenance(instance, event)
            }
            _ if event.is_custom(DIGITS_MATCH) => self.on_digits_match(instance, event),
            _ => match self.session_of(instance, &event) {
                Some(session) => session.deliver(event),
                None => debug!(
                    instance = %instance.id(),
                    event = event.name(),
                    "event for unknown leg dropped"
                ),
            },
        }
    }

    fn session_of(&self, instance: &SwitchInstance, event: &SwitchEvent) -> Option<Arc<Session>> {
        instance.get_session(event.unique_id()?)
    }

    fn on_background_job(&self, instance: &SwitchInstance, event: SwitchEvent) {
        let Some(job_id) = event.job_uuid() else {
            warn!(instance = %instance.id(), "background job event without Job-UUID");
            return;
        };
        let result = JobResult::from_body(event.body().unwrap_or_default());
        let ok = result.is_ok();
        if instance.complete_job(job_id, result) {
            debug!(job_id, ok, "job finished");
        } else {
            debug!(job_id, ok, "result held for a job not registered yet");
        }
    }

    fn on_park(&self, instance: &Arc<SwitchInstance>, event: SwitchEvent) {
        let Some(id) = event.unique_id().map(str::to_string) else {
            warn!(instance = %instance.id(), "park without Unique-ID");
            return;
        };
        if let Some(session) = instance.get_session(&id) {
            session.deliver(event);
            return;
        }

        let request = event
            .variable("flowswitch_request_uuid")
            .and_then(|request_id| instance.remove_call_request(request_id));
        let answer_url = event
            .variable("flowswitch_answer_url")
            .map(str::to_string)
            .or_else(|| request.as_ref().map(|r| r.answer_url.clone()))
            .or_else(|| self.config.call.default_answer_url.clone());

        let session = Arc::new(Session::new(id.clone(), event, &self.config.call));
        instance.add_session(session.clone());
        if let Some(request) = &request {
            request.finish(CallRequestStatus::Succeeded);
        }
        let direction = if request.is_some() { "outbound" } else { "inbound" };
        info!(session_id = %id, direction, "new call");

        let Some(answer_url) = answer_url else {
            error!(session_id = %id, "no answer url for call, hanging up");
            let client = instance.client();
            tokio::spawn(async move {
                if let Err(e) = client
                    .command(&format!("uuid_kill {} UNALLOCATED_NUMBER", id))
                    .await
                {
                    warn!(session_id = %id, "could not hang up: {}", e);
                }
            });
            return;
        };
        let producer = self.producer.clone();
        let source = PlanSource::Remote(WebhookRequest::new(
            answer_url,
            self.config.http.default_method.clone(),
        ));
        tokio::spawn(async move { producer.run(session, source).await });
    }

    fn on_progress(&self, instance: &SwitchInstance, event: SwitchEvent) {
        let status = if event.is(CHANNEL_PROGRESS) {
            CallStatus::Ringing
        } else {
            CallStatus::EarlyMedia
        };
        if let Some(request) = event
            .variable("flowswitch_request_uuid")
            .and_then(|id| instance.get_call_request(id))
        {
            if let (Some(callback), true) = (&request.ring, request.mark_rung()) {
                let params = BTreeMap::from([
                    ("RequestUUID".to_string(), request.id().to_string()),
                    ("CallUUID".to_string(), event.unique_id().unwrap_or_default().to_string()),
                    ("To".to_string(), request.to.clone()),
                    ("From".to_string(), request.from.clone()),
                    ("Direction".to_string(), "outbound".to_string()),
                    ("CallStatus".to_string(), status.to_string()),
                ]);
                self.signals.dispatch(
                    Signal::Action {
                        callback: callback.clone(),
                        params,
                    },
                    None,
                );
            }
        }
        if let Some(session) = self.session_of(instance, &event) {
            session.set_status(status);
            session.deliver(event);
        }
    }

    fn on_hangup_complete(&self, instance: &SwitchInstance, event: SwitchEvent) {
        let Some(session) = self.session_of(instance, &event) else {
            debug!(instance = %instance.id(), "hangup for unknown leg");
            return;
        };
        let hangup_url = session
            .origin_var("flowswitch_hangup_url")
            .or_else(|| event.variable("flowswitch_hangup_url"))
            .map(str::to_string)
            .or_else(|| self.config.call.default_hangup_url.clone());
        session.mark_hung_up(event);
        let cause = session
            .hangup_cause()
            .unwrap_or_else(|| "NORMAL_CLEARING".to_string());
        info!(session_id = %session.id(), cause = %cause, "call ended");
        if let Some(callback) = self.callback(hangup_url.as_deref()) {
            self.signals
                .dispatch(Signal::Hangup { callback, cause }, Some(session.as_ref()));
        }
        instance.remove_session(session.id());
    }

    fn on_heartbeat(&self, instance: &SwitchInstance, event: SwitchEvent) {
        let Some(session) = self.session_of(instance, &event) else {
            return;
        };
        let url = session
            .origin_var("flowswitch_heartbeat_url")
            .or_else(|| event.variable("flowswitch_heartbeat_url"));
        if let Some(callback) = self.callback(url) {
            self.signals
                .dispatch(Signal::Heartbeat { callback }, Some(session.as_ref()));
        }
    }

    fn on_record_stop(&self, instance: &SwitchInstance, event: SwitchEvent) {
        let Some(session) = self.session_of(instance, &event) else {
            return;
        };
        if let Some(callback) = session.record_callback() {
            let record_file = event
                .present("Record-File-Path")
                .or_else(|| event.variable("record_file_path"))
                .unwrap_or_default()
                .to_string();
            let duration_ms = event
                .variable("record_ms")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(-1);
            self.signals.dispatch(
                Signal::RecordingFinished {
                    callback,
                    record_file,
                    duration_ms,
                },
                Some(session.as_ref()),
            );
        }
        session.deliver(event);
    }

    fn on_conference_maintenance(&self, instance: &Arc<SwitchInstance>, event: SwitchEvent) {
        let conference_id = event.present("Conference-Unique-ID");
        match (event.conference_action(), conference_id) {
            (Some("conference-create"), Some(id)) => {
                let room = event.present("Conference-Name").unwrap_or(id);
                instance.get_or_add_conference(id, room);
                debug!(conference_id = id, room, "conference created");
            }
            (Some("conference-destroy"), Some(id)) => {
                instance.remove_conference(id);
                debug!(conference_id = id, "conference destroyed");
            }
            _ => {}
        }
        if let Some(session) = self.session_of(instance, &event) {
            session.deliver(event);
        }
    }

    fn on_digits_match(&self, instance: &SwitchInstance, event: SwitchEvent) {
        let Some(session) = self.session_of(instance, &event) else {
            return;
        };
        let realm = event.header("Digits-Realm").unwrap_or_default();
        let Some(binding) = session.digit_callback(realm) else {
            debug!(session_id = %session.id(), realm, "digits matched without a callback");
            return;
        };
        let digits = event
            .variable("last_matching_digits")
            .or_else(|| event.present("Digits-Match"))
            .unwrap_or_default()
            .to_string();
        info!(session_id = %session.id(), realm, digits = %digits, "digits matched");
        self.signals.dispatch(
            Signal::DigitsMatch {
                callback: binding.callback,
                digits_param: binding.digits_param,
                digits,
                params: binding.params,
            },
            Some(session.as_ref()),
        );
    }

    /// Start an outbound call on `instance`.
    pub fn originate(
        &self,
        instance: &Arc<SwitchInstance>,
        spec: CallRequestSpec,
    ) -> Result<Arc<CallRequest>> {
        if spec.gateways.is_empty() {
            return Err(FlowError::attribute("outbound call needs at least one gateway").into());
        }
        let request_uuid = uuid::Uuid::new_v4().to_string();
        let request = Arc::new(spec.build(&request_uuid, &self.config.http.default_method));
        instance.add_call_request(request.clone());
        info!(request_uuid = %request_uuid, to = %spec.to, "outbound call requested");

        let dialer = Dialer::new(self.signals.clone(), self.config.call.event_timeout());
        let instance = instance.clone();
        let dialed = request.clone();
        tokio::spawn(async move { dialer.run(instance, dialed).await });
        Ok(request)
    }

    fn owner_of_call(&self, call_uuid: &str) -> Result<Arc<SwitchInstance>> {
        let session = self
            .registry
            .find_session(call_uuid)
            .ok_or_else(|| FlowError::SessionGone(call_uuid.to_string()))?;
        if session.is_hung_up() {
            return Err(FlowError::Hangup(call_uuid.to_string()).into());
        }
        session.instance()
    }

    /// Hang up `call_uuid` with `cause` in `timeout` seconds.
    pub async fn schedule_hangup(
        &self,
        call_uuid: &str,
        timeout: u64,
        cause: &str,
    ) -> Result<ScheduledHangup> {
        let instance = self.owner_of_call(call_uuid)?;
        self.scheduler
            .arm_hangup(&instance, call_uuid, timeout, cause)
            .await
    }

    /// Play `media` on `call_uuid` in `timeout` seconds. `legs` is `aleg`,
    /// `bleg` or `both`.
    pub async fn schedule_play(
        &self,
        call_uuid: &str,
        timeout: u64,
        media: &str,
        legs: &str,
    ) -> Result<ScheduledPlay> {
        let instance = self.owner_of_call(call_uuid)?;
        self.scheduler
            .arm_play(&instance, call_uuid, timeout, media, legs)
            .await
    }

    pub async fn cancel_scheduled_hangup(&self, id: &str) -> Result<bool> {
        match self.registry.scheduled_hangup_owner(id) {
            Some(instance) => self.scheduler.cancel_hangup(&instance, id).await,
            None => Ok(false),
        }
    }

    pub async fn cancel_scheduled_play(&self, id: &str) -> Result<bool> {
        match self.registry.scheduled_play_owner(id) {
            Some(instance) => self.scheduler.cancel_play(&instance, id).await,
            None => Ok(false),
        }
    }
}
