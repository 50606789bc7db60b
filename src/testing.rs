//! In-memory stand-ins for the switch connection and the webhook transport.
//!
//! [`MockSwitch`] records every command a session issues and answers with
//! scripted replies. [`RecordingTransport`] captures webhook requests and
//! serves scripted call-flow documents. [`CallHarness`] wires both to a
//! registered session so verbs and plans run end to end without a switch.

use crate::config::Config;
use crate::error::FlowError;
use crate::plan::PlanProducer;
use crate::registry::{Registry, Session, SwitchInstance};
use crate::scheduler::Scheduler;
use crate::signal::{SignalProducer, WebhookRequest, WebhookTransport};
use crate::switch::event::CHANNEL_PARK;
use crate::switch::{CommandReply, SwitchClient, SwitchClientRef, SwitchEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One thing sent to the switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Issued {
    Api(String),
    Background(String),
    Execute {
        uuid: String,
        app: String,
        arg: String,
    },
}

#[derive(Default)]
struct MockState {
    issued: Vec<Issued>,
    vars: HashMap<String, String>,
    replies: Vec<(String, String)>,
    job_ids: VecDeque<Option<String>>,
}

/// Scripted switch connection.
#[derive(Clone, Default)]
pub struct MockSwitch {
    state: Arc<Mutex<MockState>>,
    jobs: Arc<AtomicUsize>,
}

impl MockSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> SwitchClientRef {
        Arc::new(self.clone())
    }

    /// Value returned by `uuid_getvar <any uuid> name`.
    pub fn set_var(&self, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .vars
            .insert(name.to_string(), value.to_string());
    }

    /// Reply body for api commands starting with `prefix`.
    pub fn reply(&self, prefix: &str, body: &str) {
        self.state
            .lock()
            .unwrap()
            .replies
            .push((prefix.to_string(), body.to_string()));
    }

    /// Script the next background job id; `None` simulates a missing id.
    pub fn push_job_id(&self, id: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .job_ids
            .push_back(id.map(|s| s.to_string()));
    }

    pub fn issued(&self) -> Vec<Issued> {
        self.state.lock().unwrap().issued.clone()
    }

    /// Api and background commands, in order.
    pub fn api_commands(&self) -> Vec<String> {
        self.issued()
            .into_iter()
            .filter_map(|i| match i {
                Issued::Api(cmd) | Issued::Background(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn background_commands(&self) -> Vec<String> {
        self.issued()
            .into_iter()
            .filter_map(|i| match i {
                Issued::Background(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// `(app, arg)` of every execute request, in order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.issued()
            .into_iter()
            .filter_map(|i| match i {
                Issued::Execute { app, arg, .. } => Some((app, arg)),
                _ => None,
            })
            .collect()
    }

    /// Arguments of every execution of `app`.
    pub fn executed_args(&self, app: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|(a, _)| a == app)
            .map(|(_, arg)| arg)
            .collect()
    }
}

#[async_trait]
impl SwitchClient for MockSwitch {
    async fn command(&self, cmd: &str) -> Result<CommandReply> {
        let mut state = self.state.lock().unwrap();
        state.issued.push(Issued::Api(cmd.to_string()));
        if let Some(name) = cmd
            .strip_prefix("uuid_getvar ")
            .and_then(|rest| rest.split_whitespace().nth(1))
        {
            let value = state
                .vars
                .get(name)
                .cloned()
                .unwrap_or_else(|| crate::switch::event::UNDEF.to_string());
            return Ok(CommandReply::ok(value));
        }
        let body = state
            .replies
            .iter()
            .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
            .map(|(_, body)| body.clone())
            .unwrap_or_else(|| "+OK".to_string());
        Ok(CommandReply::ok(body))
    }

    async fn bg_command(&self, cmd: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.issued.push(Issued::Background(cmd.to_string()));
        match state.job_ids.pop_front() {
            Some(scripted) => Ok(scripted),
            None => {
                let n = self.jobs.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Some(format!("job-{}", n)))
            }
        }
    }

    async fn execute(
        &self,
        uuid: &str,
        app: &str,
        arg: &str,
        _event_lock: bool,
    ) -> Result<CommandReply> {
        self.state.lock().unwrap().issued.push(Issued::Execute {
            uuid: uuid.to_string(),
            app: app.to_string(),
            arg: arg.to_string(),
        });
        Ok(CommandReply::ok("+OK"))
    }
}

/// Webhook transport that records requests instead of sending them.
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<WebhookRequest>>,
    documents: Mutex<HashMap<String, String>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Body returned for `url`. Unscripted urls answer `<Response/>`.
    pub fn serve(&self, url: &str, body: &str) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }

    /// Make every request to `url` fail like a refused connection.
    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().push(url.to_string());
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<WebhookRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url == url)
            .collect()
    }

    /// Wait until at least `count` requests were seen (or two seconds pass).
    pub async fn wait_for_requests(&self, count: usize) -> Vec<WebhookRequest> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let seen = self.requests();
            if seen.len() >= count || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn fetch(&self, request: &WebhookRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing.lock().unwrap().contains(&request.url) {
            return Err(FlowError::Transport(format!("connection refused: {}", request.url)).into());
        }
        Ok(self
            .documents
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| "<Response/>".to_string()))
    }
}

/// A registered inbound leg with everything needed to run verbs on it.
pub struct CallHarness {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub instance: Arc<SwitchInstance>,
    pub switch: MockSwitch,
    pub transport: Arc<RecordingTransport>,
    pub producer: Arc<PlanProducer>,
    pub session: Arc<Session>,
}

impl CallHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let origin = SwitchEvent::new(CHANNEL_PARK)
            .with_header("Unique-ID", "leg-a")
            .with_header("Caller-Destination-Number", "1000")
            .with_header("Caller-Caller-ID-Number", "2000")
            .with_header("Caller-Caller-ID-Name", "Alice")
            .with_header("Core-UUID", "core-1")
            .with_header("Call-Direction", "inbound")
            .with_header("Answer-State", "answered");
        Self::with_origin(config, origin)
    }

    pub fn with_origin(config: Config, origin: SwitchEvent) -> Self {
        let config = Arc::new(config);
        let switch = MockSwitch::new();
        let registry = Registry::new();
        let instance = registry.add_instance("fs-1", switch.client(), HashMap::new());
        let transport = RecordingTransport::new();
        let signals = Arc::new(SignalProducer::new(transport.clone()));
        let scheduler = Scheduler::new(config.call.schedule_grace(), CancellationToken::new());
        let producer = Arc::new(PlanProducer::new(config.clone(), signals, scheduler));
        let id = origin.unique_id().unwrap_or("leg-a").to_string();
        let session = Arc::new(Session::new(id, origin, &config.call));
        instance.add_session(session.clone());
        Self {
            config,
            registry,
            instance,
            switch,
            transport,
            producer,
            session,
        }
    }

    pub fn deliver(&self, event: SwitchEvent) {
        self.session.deliver(event);
    }

    /// `CHANNEL_EXECUTE_COMPLETE` for `app` on this leg.
    pub fn complete(&self, app: &str) {
        self.deliver(
            SwitchEvent::new(crate::switch::event::CHANNEL_EXECUTE_COMPLETE)
                .with_header("Unique-ID", self.session.id())
                .with_header("Application", app),
        );
    }
}
