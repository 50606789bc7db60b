use super::SwitchInstance;
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::event::EventQueue;
use crate::plan::{Instruction, VerbKind};
use crate::switch::{event::UNDEF, CommandReply, SwitchClientRef, SwitchEvent};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Ringing,
    EarlyMedia,
    Answer,
    InProgress,
    Completed,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Ringing => write!(f, "ringing"),
            CallStatus::EarlyMedia => write!(f, "early-media"),
            CallStatus::Answer => write!(f, "answer"),
            CallStatus::InProgress => write!(f, "in-progress"),
            CallStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Where a webhook goes and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Callback {
    pub url: String,
    pub method: String,
}

impl Callback {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
        }
    }
}

/// Callback armed for a digit pattern bound on the leg.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigitBinding {
    pub callback: Callback,
    /// Parameter name carrying the matched digits.
    pub digits_param: String,
    pub params: BTreeMap<String, String>,
}

/// One level of the instruction stack. PreAnswer pushes a frame for its
/// nested sequence and pops it when done.
#[derive(Clone, Debug)]
pub struct PlanFrame {
    pub instructions: Arc<Vec<Instruction>>,
    pub cursor: usize,
}

#[derive(Debug)]
struct SessionState {
    answered: bool,
    status: CallStatus,
    hangup_cause: Option<String>,
    hung_up: bool,
    frames: Vec<PlanFrame>,
    current_verb: Option<VerbKind>,
    digit_callbacks: HashMap<String, DigitBinding>,
    record_callback: Option<Callback>,
    scheduled_hangup_id: Option<String>,
}

/// A controllable call leg.
pub struct Session {
    id: String,
    owner: OnceLock<Weak<SwitchInstance>>,
    events: EventQueue,
    origin: SwitchEvent,
    extra_vars: Vec<String>,
    state: Mutex<SessionState>,
    payload: Mutex<Option<BTreeMap<String, String>>>,
}

impl Session {
    /// Build a session from the event that announced the leg.
    pub fn new(id: impl Into<String>, origin: SwitchEvent, config: &CallConfig) -> Self {
        let answered = origin.header("Answer-State") == Some("answered");
        Self {
            id: id.into(),
            owner: OnceLock::new(),
            events: EventQueue::new(config.event_timeout()),
            origin,
            extra_vars: config.extra_channel_vars.clone(),
            state: Mutex::new(SessionState {
                answered,
                status: if answered {
                    CallStatus::InProgress
                } else {
                    CallStatus::Ringing
                },
                hangup_cause: None,
                hung_up: false,
                frames: Vec::new(),
                current_verb: None,
                digit_callbacks: HashMap::new(),
                record_callback: None,
                scheduled_hangup_id: None,
            }),
            payload: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(super) fn attach(&self, owner: &Arc<SwitchInstance>) {
        let _ = self.owner.set(Arc::downgrade(owner));
    }

    pub fn instance(&self) -> Result<Arc<SwitchInstance>> {
        self.owner
            .get()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| FlowError::SessionGone(self.id.clone()).into())
    }

    fn client(&self) -> Result<SwitchClientRef> {
        Ok(self.instance()?.client())
    }

    /// Channel variable as captured when the leg was announced.
    pub fn origin_var(&self, name: &str) -> Option<&str> {
        self.origin.variable(name)
    }

    pub fn origin(&self) -> &SwitchEvent {
        &self.origin
    }

    // ── state ───────────────────────────────────────────────────────────────

    pub fn is_answered(&self) -> bool {
        self.state.lock().unwrap().answered
    }

    pub fn set_answered(&self) {
        let mut state = self.state.lock().unwrap();
        state.answered = true;
        if !state.hung_up {
            state.status = CallStatus::InProgress;
        }
    }

    pub fn status(&self) -> CallStatus {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: CallStatus) {
        let mut state = self.state.lock().unwrap();
        if !state.hung_up {
            state.status = status;
        }
    }

    pub fn hangup_cause(&self) -> Option<String> {
        self.state.lock().unwrap().hangup_cause.clone()
    }

    pub fn set_hangup_cause(&self, cause: impl Into<String>) {
        let cause = cause.into();
        if cause.is_empty() || cause == UNDEF {
            return;
        }
        self.state.lock().unwrap().hangup_cause = Some(cause);
    }

    pub fn is_hung_up(&self) -> bool {
        self.state.lock().unwrap().hung_up
    }

    /// Mark the leg ended and deliver the terminating event to any waiter.
    pub fn mark_hung_up(&self, event: SwitchEvent) {
        {
            let mut state = self.state.lock().unwrap();
            if state.hangup_cause.is_none() {
                state.hangup_cause = event.hangup_cause().map(|c| c.to_string());
            }
            state.hung_up = true;
            state.status = CallStatus::Completed;
        }
        self.events.push(event);
    }

    pub fn current_verb(&self) -> Option<VerbKind> {
        self.state.lock().unwrap().current_verb
    }

    pub fn set_current_verb(&self, kind: Option<VerbKind>) {
        self.state.lock().unwrap().current_verb = kind;
    }

    pub fn push_frame(&self, instructions: Arc<Vec<Instruction>>) {
        self.state.lock().unwrap().frames.push(PlanFrame {
            instructions,
            cursor: 0,
        });
    }

    pub fn pop_frame(&self) -> Option<PlanFrame> {
        self.state.lock().unwrap().frames.pop()
    }

    pub fn frame_depth(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    /// Advance the cursor of the innermost frame, returning the instruction
    /// it pointed at.
    pub fn next_instruction(&self) -> Option<Instruction> {
        let mut state = self.state.lock().unwrap();
        let frame = state.frames.last_mut()?;
        let instruction = frame.instructions.get(frame.cursor).cloned()?;
        frame.cursor += 1;
        Some(instruction)
    }

    pub fn cursor(&self) -> Option<usize> {
        self.state.lock().unwrap().frames.last().map(|f| f.cursor)
    }

    pub fn arm_digit_callback(&self, realm: impl Into<String>, binding: DigitBinding) {
        self.state
            .lock()
            .unwrap()
            .digit_callbacks
            .insert(realm.into(), binding);
    }

    pub fn disarm_digit_callback(&self, realm: &str) -> Option<DigitBinding> {
        self.state.lock().unwrap().digit_callbacks.remove(realm)
    }

    pub fn digit_callback(&self, realm: &str) -> Option<DigitBinding> {
        self.state.lock().unwrap().digit_callbacks.get(realm).cloned()
    }

    pub fn set_record_callback(&self, callback: Option<Callback>) {
        self.state.lock().unwrap().record_callback = callback;
    }

    pub fn record_callback(&self) -> Option<Callback> {
        self.state.lock().unwrap().record_callback.clone()
    }

    pub fn set_scheduled_hangup_id(&self, id: Option<String>) {
        self.state.lock().unwrap().scheduled_hangup_id = id;
        // ScheduledHangupId is part of the cached payload.
        *self.payload.lock().unwrap() = None;
    }

    // ── events ──────────────────────────────────────────────────────────────

    pub fn deliver(&self, event: SwitchEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub async fn wait_for_event<F>(
        &self,
        timeout: Option<Duration>,
        requeue: bool,
        matches: F,
    ) -> Option<SwitchEvent>
    where
        F: Fn(&SwitchEvent) -> bool,
    {
        self.events.wait_for_event(timeout, requeue, matches).await
    }

    /// Wait for the completion of `app`, ignoring (and keeping) anything else.
    /// Returns `None` on timeout or when the leg hangs up first.
    pub async fn wait_for_app(&self, app: &str, timeout: Option<Duration>) -> Option<SwitchEvent> {
        let event = self
            .wait_for_event(timeout, true, |e| {
                e.is_execute_complete(app) || e.is(crate::switch::event::CHANNEL_HANGUP_COMPLETE)
            })
            .await?;
        if event.is_execute_complete(app) {
            Some(event)
        } else {
            None
        }
    }

    // ── commands ────────────────────────────────────────────────────────────

    pub async fn execute(&self, app: &str, arg: &str) -> Result<CommandReply> {
        self.client()?.execute(&self.id, app, arg, true).await
    }

    pub async fn execute_async(&self, app: &str, arg: &str) -> Result<CommandReply> {
        self.client()?.execute(&self.id, app, arg, false).await
    }

    pub async fn command(&self, cmd: &str) -> Result<CommandReply> {
        self.client()?.command(cmd).await
    }

    pub async fn bg_command(&self, cmd: &str) -> Result<Option<String>> {
        self.client()?.bg_command(cmd).await
    }

    pub async fn set_var(&self, name: &str, value: &str) -> Result<()> {
        self.execute("set", &format!("{}={}", name, value)).await?;
        Ok(())
    }

    pub async fn unset_var(&self, name: &str) -> Result<()> {
        self.execute("unset", name).await?;
        Ok(())
    }

    /// Read a channel variable through the api; `None` when unset.
    pub async fn get_var(&self, name: &str) -> Result<Option<String>> {
        let reply = self
            .command(&format!("uuid_getvar {} {}", self.id, name))
            .await?;
        if !reply.is_ok() {
            return Ok(None);
        }
        let value = reply.body.trim();
        if value.is_empty() || value == UNDEF {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    // ── outward payload ─────────────────────────────────────────────────────

    /// Parameters describing this call to remote callbacks. Everything except
    /// `CallStatus` and `ScheduledHangupId` is computed once.
    pub fn payload(&self) -> BTreeMap<String, String> {
        let mut cached = self.payload.lock().unwrap();
        if cached.is_none() {
            *cached = Some(self.build_payload());
        }
        let mut payload = cached.clone().unwrap_or_default();
        payload.insert("CallStatus".to_string(), self.status().to_string());
        if let Some(id) = self.state.lock().unwrap().scheduled_hangup_id.clone() {
            payload.insert("ScheduledHangupId".to_string(), id);
        }
        payload
    }

    fn build_payload(&self) -> BTreeMap<String, String> {
        let origin = &self.origin;
        let mut p = BTreeMap::new();
        let direction = match origin.present("Call-Direction") {
            Some("outbound") => "outbound",
            _ if self.origin_var("flowswitch_request_uuid").is_some() => "outbound",
            _ => "inbound",
        };
        let field = |name: &str| origin.present(name).unwrap_or_default().to_string();
        p.insert("To".to_string(), field("Caller-Destination-Number"));
        p.insert("Direction".to_string(), direction.to_string());
        p.insert("From".to_string(), field("Caller-Caller-ID-Number"));
        p.insert("CallerName".to_string(), field("Caller-Caller-ID-Name"));
        p.insert("CallUUID".to_string(), self.id.clone());
        p.insert("CoreUUID".to_string(), field("Core-UUID"));

        let optional = [
            ("AccountSID", "flowswitch_accountsid"),
            ("ALegUUID", "flowswitch_aleg_uuid"),
            ("ALegRequestUUID", "flowswitch_aleg_request_uuid"),
            ("RequestUUID", "flowswitch_request_uuid"),
            ("ForwardedFrom", "sip_h_Diversion"),
        ];
        for (key, var) in optional {
            if let Some(value) = self.origin_var(var) {
                let value = if key == "ForwardedFrom" {
                    diversion_number(value)
                } else {
                    value.to_string()
                };
                p.insert(key.to_string(), value);
            }
        }
        for var in &self.extra_vars {
            if let Some(value) = self.origin_var(var) {
                p.insert(var.clone(), value.to_string());
            }
        }
        p
    }
}

/// `<sip:1234@host>;reason=unconditional` → `1234`
fn diversion_number(header: &str) -> String {
    let uri = header.split(';').next().unwrap_or(header);
    let uri = uri.trim().trim_start_matches('<').trim_end_matches('>');
    let user = uri.strip_prefix("sip:").unwrap_or(uri);
    user.split('@').next().unwrap_or(user).to_string()
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
