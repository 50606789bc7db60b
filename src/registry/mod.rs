//! Ownership and lookup for every live telephony entity.
//!
//! Each [`SwitchInstance`] is an arena: sessions, conferences, jobs, call
//! requests and scheduled actions live in its maps and die with it. The
//! process-wide [`Registry`] keeps the instances plus secondary indexes so a
//! session or schedule can be found without knowing its switch.

use crate::switch::SwitchClientRef;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

pub mod call_request;
pub mod conference;
pub mod job;
pub mod schedule;
pub mod session;

pub use call_request::{CallRequest, CallRequestStatus};
pub use conference::Conference;
pub use job::{Job, JobResult};
pub use schedule::{Scheduled, ScheduledHangup, ScheduledPlay};
pub use session::{CallStatus, Callback, DigitBinding, Session};

/// Job results kept for ids that were not registered yet.
const EARLY_RESULT_LIMIT: usize = 64;

#[derive(Default)]
struct InstanceState {
    sessions: HashMap<String, Arc<Session>>,
    conferences: HashMap<String, Arc<Conference>>,
    jobs: HashMap<String, Arc<Job>>,
    early_results: VecDeque<(String, JobResult)>,
    call_requests: HashMap<String, Arc<CallRequest>>,
    hangups: HashMap<String, ScheduledHangup>,
    plays: HashMap<String, ScheduledPlay>,
}

/// One connection to a media switch and everything it owns.
pub struct SwitchInstance {
    id: String,
    client: SwitchClientRef,
    globals: HashMap<String, String>,
    index: Weak<Registry>,
    inner: Mutex<InstanceState>,
}

#[derive(Clone, Copy, Debug)]
enum IndexKind {
    Session,
    CallRequest,
    Hangup,
    Play,
}

impl SwitchInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> SwitchClientRef {
        self.client.clone()
    }

    /// Global variable snapshot taken at connect time.
    pub fn global(&self, name: &str) -> Option<&str> {
        self.globals.get(name).map(|s| s.as_str())
    }

    fn notify_added(&self, kind: IndexKind, id: &str) {
        if let Some(index) = self.index.upgrade() {
            index.index_insert(kind, id, &self.id);
        }
    }

    fn notify_removed(&self, kind: IndexKind, id: &str) {
        if let Some(index) = self.index.upgrade() {
            index.index_remove(kind, id);
        }
    }

    // ── sessions ────────────────────────────────────────────────────────────

    pub fn add_session(self: &Arc<Self>, session: Arc<Session>) {
        session.attach(self);
        let id = session.id().to_string();
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(id.clone(), session);
        self.notify_added(IndexKind::Session, &id);
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.inner.lock().unwrap().sessions.remove(id);
        if removed.is_some() {
            self.notify_removed(IndexKind::Session, id);
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    // ── conferences ─────────────────────────────────────────────────────────

    pub fn get_conference(&self, id: &str) -> Option<Arc<Conference>> {
        self.inner.lock().unwrap().conferences.get(id).cloned()
    }

    /// Reuse the conference known under `id` or register a new one.
    pub fn get_or_add_conference(self: &Arc<Self>, id: &str, room: &str) -> Arc<Conference> {
        self.inner
            .lock()
            .unwrap()
            .conferences
            .entry(id.to_string())
            .or_insert_with(|| {
                let conference = Arc::new(Conference::new(id, room));
                conference.attach(self);
                conference
            })
            .clone()
    }

    pub fn remove_conference(&self, id: &str) -> Option<Arc<Conference>> {
        self.inner.lock().unwrap().conferences.remove(id)
    }

    pub fn conference_count(&self) -> usize {
        self.inner.lock().unwrap().conferences.len()
    }

    // ── jobs ────────────────────────────────────────────────────────────────

    /// Register a job. A result that arrived before the job was known
    /// resolves it on the spot.
    pub fn add_job(self: &Arc<Self>, job: Arc<Job>) {
        job.attach(self);
        let early = {
            let mut inner = self.inner.lock().unwrap();
            match inner.early_results.iter().position(|(id, _)| id == job.id()) {
                Some(pos) => inner.early_results.remove(pos).map(|(_, result)| result),
                None => {
                    inner.jobs.insert(job.id().to_string(), job.clone());
                    None
                }
            }
        };
        if let Some(result) = early {
            job.resolve(result);
        }
    }

    /// Hand a `BACKGROUND_JOB` result to its job. Results for ids not yet
    /// registered are held back for [`add_job`](Self::add_job); returns
    /// whether a registered job took it.
    pub fn complete_job(&self, id: &str, result: JobResult) -> bool {
        let job = {
            let mut inner = self.inner.lock().unwrap();
            match inner.jobs.remove(id) {
                Some(job) => job,
                None => {
                    if inner.early_results.len() >= EARLY_RESULT_LIMIT {
                        inner.early_results.pop_front();
                    }
                    inner.early_results.push_back((id.to_string(), result));
                    return false;
                }
            }
        };
        job.resolve(result);
        true
    }

    pub fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.lock().unwrap().jobs.get(id).cloned()
    }

    pub fn remove_job(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.lock().unwrap().jobs.remove(id)
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    // ── call requests ───────────────────────────────────────────────────────

    pub fn add_call_request(self: &Arc<Self>, request: Arc<CallRequest>) {
        request.attach(self);
        let id = request.id().to_string();
        self.inner
            .lock()
            .unwrap()
            .call_requests
            .insert(id.clone(), request);
        self.notify_added(IndexKind::CallRequest, &id);
    }

    pub fn get_call_request(&self, id: &str) -> Option<Arc<CallRequest>> {
        self.inner.lock().unwrap().call_requests.get(id).cloned()
    }

    pub fn remove_call_request(&self, id: &str) -> Option<Arc<CallRequest>> {
        let removed = self.inner.lock().unwrap().call_requests.remove(id);
        if removed.is_some() {
            self.notify_removed(IndexKind::CallRequest, id);
        }
        removed
    }

    pub fn call_request_count(&self) -> usize {
        self.inner.lock().unwrap().call_requests.len()
    }

    // ── scheduled actions ───────────────────────────────────────────────────

    pub fn add_scheduled_hangup(&self, entry: ScheduledHangup) {
        let id = entry.id.clone();
        self.inner.lock().unwrap().hangups.insert(id.clone(), entry);
        self.notify_added(IndexKind::Hangup, &id);
    }

    pub fn get_scheduled_hangup(&self, id: &str) -> Option<ScheduledHangup> {
        self.inner.lock().unwrap().hangups.get(id).cloned()
    }

    pub fn remove_scheduled_hangup(&self, id: &str) -> Option<ScheduledHangup> {
        let removed = self.inner.lock().unwrap().hangups.remove(id);
        if removed.is_some() {
            self.notify_removed(IndexKind::Hangup, id);
        }
        removed
    }

    pub fn scheduled_hangup_count(&self) -> usize {
        self.inner.lock().unwrap().hangups.len()
    }

    pub fn add_scheduled_play(&self, entry: ScheduledPlay) {
        let id = entry.id.clone();
        self.inner.lock().unwrap().plays.insert(id.clone(), entry);
        self.notify_added(IndexKind::Play, &id);
    }

    pub fn get_scheduled_play(&self, id: &str) -> Option<ScheduledPlay> {
        self.inner.lock().unwrap().plays.get(id).cloned()
    }

    pub fn remove_scheduled_play(&self, id: &str) -> Option<ScheduledPlay> {
        let removed = self.inner.lock().unwrap().plays.remove(id);
        if removed.is_some() {
            self.notify_removed(IndexKind::Play, id);
        }
        removed
    }

    pub fn scheduled_play_count(&self) -> usize {
        self.inner.lock().unwrap().plays.len()
    }
}

impl fmt::Debug for SwitchInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchInstance")
            .field("id", &self.id)
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<String, Arc<SwitchInstance>>,
    sessions: HashMap<String, String>,
    call_requests: HashMap<String, String>,
    hangups: HashMap<String, String>,
    plays: HashMap<String, String>,
}

impl RegistryState {
    fn index(&mut self, kind: IndexKind) -> &mut HashMap<String, String> {
        match kind {
            IndexKind::Session => &mut self.sessions,
            IndexKind::CallRequest => &mut self.call_requests,
            IndexKind::Hangup => &mut self.hangups,
            IndexKind::Play => &mut self.plays,
        }
    }
}

/// Process-wide view over all connected switches.
pub struct Registry {
    inner: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryState::default()),
        })
    }

    /// Register a freshly connected switch.
    pub fn add_instance(
        self: &Arc<Self>,
        id: impl Into<String>,
        client: SwitchClientRef,
        globals: HashMap<String, String>,
    ) -> Arc<SwitchInstance> {
        let instance = Arc::new(SwitchInstance {
            id: id.into(),
            client,
            globals,
            index: Arc::downgrade(self),
            inner: Mutex::new(InstanceState::default()),
        });
        self.inner
            .lock()
            .unwrap()
            .instances
            .insert(instance.id.clone(), instance.clone());
        instance
    }

    pub fn get_instance(&self, id: &str) -> Option<Arc<SwitchInstance>> {
        self.inner.lock().unwrap().instances.get(id).cloned()
    }

    /// Drop a switch and every index entry pointing into it. Owned entities
    /// are not torn down one by one.
    pub fn remove_instance(&self, id: &str) -> Option<Arc<SwitchInstance>> {
        let mut guard = self.inner.lock().unwrap();
        let removed = guard.instances.remove(id);
        if removed.is_some() {
            for kind in [
                IndexKind::Session,
                IndexKind::CallRequest,
                IndexKind::Hangup,
                IndexKind::Play,
            ] {
                guard.index(kind).retain(|_, owner| owner != id);
            }
        }
        removed
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }

    fn index_insert(&self, kind: IndexKind, id: &str, instance_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .index(kind)
            .insert(id.to_string(), instance_id.to_string());
    }

    fn index_remove(&self, kind: IndexKind, id: &str) {
        self.inner.lock().unwrap().index(kind).remove(id);
    }

    fn owner_of(&self, kind: IndexKind, id: &str) -> Option<Arc<SwitchInstance>> {
        let mut guard = self.inner.lock().unwrap();
        let owner = guard.index(kind).get(id).cloned()?;
        guard.instances.get(&owner).cloned()
    }

    pub fn find_session(&self, id: &str) -> Option<Arc<Session>> {
        self.owner_of(IndexKind::Session, id)?.get_session(id)
    }

    pub fn find_call_request(&self, id: &str) -> Option<Arc<CallRequest>> {
        self.owner_of(IndexKind::CallRequest, id)?
            .get_call_request(id)
    }

    /// Instance holding the scheduled hangup `id`.
    pub fn scheduled_hangup_owner(&self, id: &str) -> Option<Arc<SwitchInstance>> {
        self.owner_of(IndexKind::Hangup, id)
    }

    pub fn scheduled_play_owner(&self, id: &str) -> Option<Arc<SwitchInstance>> {
        self.owner_of(IndexKind::Play, id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn scheduled_count(&self) -> usize {
        let guard = self.inner.lock().unwrap();
        guard.hangups.len() + guard.plays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::switch::event::CHANNEL_PARK;
    use crate::switch::SwitchEvent;
    use crate::testing::MockSwitch;

    fn instance(registry: &Arc<Registry>, id: &str) -> Arc<SwitchInstance> {
        registry.add_instance(id, MockSwitch::new().client(), HashMap::new())
    }

    fn session(id: &str) -> Arc<Session> {
        Arc::new(Session::new(
            id,
            SwitchEvent::new(CHANNEL_PARK).with_header("Unique-ID", id),
            &CallConfig::default(),
        ))
    }

    #[test]
    fn test_add_sets_back_reference_and_index() {
        let registry = Registry::new();
        let inst = instance(&registry, "fs-1");
        let s = session("leg-1");
        inst.add_session(s.clone());

        assert_eq!(s.instance().unwrap().id(), "fs-1");
        assert_eq!(registry.find_session("leg-1").unwrap().id(), "leg-1");
        assert_eq!(inst.session_count(), 1);
    }

    #[test]
    fn test_remove_session_is_idempotent() {
        let registry = Registry::new();
        let inst = instance(&registry, "fs-1");
        inst.add_session(session("leg-1"));
        inst.add_session(session("leg-2"));

        assert!(inst.remove_session("leg-1").is_some());
        assert!(inst.remove_session("leg-1").is_none());
        assert!(inst.remove_session("never-added").is_none());

        assert_eq!(inst.session_count(), 1);
        assert_eq!(registry.session_count(), 1);
        assert!(registry.find_session("leg-1").is_none());
        assert!(registry.find_session("leg-2").is_some());
    }

    #[test]
    fn test_removing_instance_invalidates_its_arena() {
        let registry = Registry::new();
        let a = instance(&registry, "fs-a");
        let b = instance(&registry, "fs-b");
        let s = session("leg-a");
        a.add_session(s.clone());
        b.add_session(session("leg-b"));
        a.add_scheduled_hangup(ScheduledHangup::new("sched-a", 30));

        registry.remove_instance("fs-a");
        drop(a);

        assert!(registry.find_session("leg-a").is_none());
        assert!(registry.scheduled_hangup_owner("sched-a").is_none());
        assert!(registry.find_session("leg-b").is_some());
        assert!(s.instance().is_err());
        assert_eq!(registry.instance_count(), 1);
    }

    #[test]
    fn test_conference_is_reused_by_id() {
        let registry = Registry::new();
        let inst = instance(&registry, "fs-1");
        let first = inst.get_or_add_conference("conf-uuid", "sales");
        let second = inst.get_or_add_conference("conf-uuid", "ignored");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.room(), "sales");
        assert_eq!(first.instance().unwrap().id(), "fs-1");
        assert!(inst.remove_conference("conf-uuid").is_some());
        assert!(inst.remove_conference("conf-uuid").is_none());
        assert_eq!(inst.conference_count(), 0);
    }

    #[tokio::test]
    async fn test_job_result_before_registration_is_kept() {
        let registry = Registry::new();
        let inst = instance(&registry, "fs-1");
        assert!(!inst.complete_job("job-1", JobResult::from_body("+OK leg-b")));
        assert_eq!(inst.job_count(), 0);

        let (job, receiver) = Job::new("job-1", "originate x", None);
        let job = Arc::new(job);
        inst.add_job(job.clone());
        assert_eq!(receiver.await.unwrap(), JobResult::Ok("leg-b".to_string()));
        assert_eq!(inst.job_count(), 0);
        assert_eq!(job.instance().unwrap().id(), "fs-1");

        // the held result is consumed once
        let (job, _receiver) = Job::new("job-1", "originate x", None);
        inst.add_job(Arc::new(job));
        assert_eq!(inst.job_count(), 1);
        assert!(inst.complete_job("job-1", JobResult::Err("NO_ANSWER".into())));
        assert_eq!(inst.job_count(), 0);
    }

    #[test]
    fn test_held_job_results_are_bounded() {
        let registry = Registry::new();
        let inst = instance(&registry, "fs-1");
        for i in 0..EARLY_RESULT_LIMIT + 5 {
            inst.complete_job(&format!("stray-{}", i), JobResult::Ok(String::new()));
        }
        assert_eq!(inst.inner.lock().unwrap().early_results.len(), EARLY_RESULT_LIMIT);
    }

    #[test]
    fn test_call_request_knows_its_switch() {
        let registry = Registry::new();
        let inst = instance(&registry, "fs-1");
        let request = Arc::new(CallRequest::new("req-1", "1000", "2000", "http://app/a", vec![]));
        inst.add_call_request(request.clone());
        assert_eq!(request.instance().unwrap().id(), "fs-1");
        registry.remove_instance("fs-1");
        drop(inst);
        assert!(request.instance().is_none());
    }

    #[test]
    fn test_scheduled_entries_are_indexed() {
        let registry = Registry::new();
        let inst = instance(&registry, "fs-1");
        inst.add_scheduled_play(ScheduledPlay::new("play-1", 5));
        assert_eq!(
            registry.scheduled_play_owner("play-1").unwrap().id(),
            "fs-1"
        );
        inst.remove_scheduled_play("play-1");
        assert_eq!(registry.scheduled_count(), 0);
    }
}
