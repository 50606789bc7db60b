use super::session::Callback;
use super::SwitchInstance;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallRequestStatus {
    Pending,
    Dialing,
    Succeeded,
    Failed(String),
}

/// One outbound call attempt spanning several dial strings.
pub struct CallRequest {
    id: String,
    pub to: String,
    pub from: String,
    pub answer_url: String,
    pub hangup: Option<Callback>,
    pub ring: Option<Callback>,
    rung: AtomicBool,
    owner: OnceLock<Weak<SwitchInstance>>,
    state: Mutex<CallRequestState>,
}

struct CallRequestState {
    remaining: VecDeque<String>,
    job_id: Option<String>,
    status: CallRequestStatus,
    last_cause: Option<String>,
}

impl CallRequest {
    pub fn new(
        id: impl Into<String>,
        to: impl Into<String>,
        from: impl Into<String>,
        answer_url: impl Into<String>,
        dial_strings: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            to: to.into(),
            from: from.into(),
            answer_url: answer_url.into(),
            hangup: None,
            ring: None,
            rung: AtomicBool::new(false),
            owner: OnceLock::new(),
            state: Mutex::new(CallRequestState {
                remaining: dial_strings.into(),
                job_id: None,
                status: CallRequestStatus::Pending,
                last_cause: None,
            }),
        }
    }

    pub fn with_callbacks(mut self, hangup: Option<Callback>, ring: Option<Callback>) -> Self {
        self.hangup = hangup;
        self.ring = ring;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(super) fn attach(&self, owner: &Arc<SwitchInstance>) {
        let _ = self.owner.set(Arc::downgrade(owner));
    }

    pub fn instance(&self) -> Option<Arc<SwitchInstance>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Take the next dial string to try.
    pub fn next_dial_string(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let next = state.remaining.pop_front();
        if next.is_some() {
            state.status = CallRequestStatus::Dialing;
        }
        next
    }

    /// True only the first time the far end is reported ringing.
    pub fn mark_rung(&self) -> bool {
        !self.rung.swap(true, Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().remaining.len()
    }

    pub fn set_job(&self, job_id: Option<String>) {
        self.state.lock().unwrap().job_id = job_id;
    }

    pub fn job_id(&self) -> Option<String> {
        self.state.lock().unwrap().job_id.clone()
    }

    pub fn record_failure(&self, cause: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        state.job_id = None;
        state.last_cause = Some(cause.into());
    }

    pub fn last_cause(&self) -> Option<String> {
        self.state.lock().unwrap().last_cause.clone()
    }

    pub fn finish(&self, status: CallRequestStatus) {
        let mut state = self.state.lock().unwrap();
        state.job_id = None;
        state.status = status;
    }

    pub fn status(&self) -> CallRequestStatus {
        self.state.lock().unwrap().status.clone()
    }
}
