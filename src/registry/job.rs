use super::SwitchInstance;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::oneshot;

/// Outcome reported by a `BACKGROUND_JOB` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Ok(String),
    Err(String),
}

impl JobResult {
    /// Classify a job body: `+OK ...` succeeds, `-ERR CAUSE` fails.
    pub fn from_body(body: &str) -> Self {
        let body = body.trim();
        match body.strip_prefix("-ERR") {
            Some(cause) => JobResult::Err(cause.trim().to_string()),
            None => JobResult::Ok(body.trim_start_matches("+OK").trim().to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, JobResult::Ok(_))
    }
}

/// A background command waiting for its correlated completion.
pub struct Job {
    id: String,
    command: String,
    call_request: Option<String>,
    owner: OnceLock<Weak<SwitchInstance>>,
    slot: Mutex<Option<oneshot::Sender<JobResult>>>,
}

impl Job {
    /// Create the job and the receiver its completion will be delivered to.
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        call_request: Option<String>,
    ) -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            id: id.into(),
            command: command.into(),
            call_request,
            owner: OnceLock::new(),
            slot: Mutex::new(Some(tx)),
        };
        (job, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(super) fn attach(&self, owner: &Arc<SwitchInstance>) {
        let _ = self.owner.set(Arc::downgrade(owner));
    }

    /// Switch the job was issued on, while it is still connected.
    pub fn instance(&self) -> Option<Arc<SwitchInstance>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Name of the api command that started the job.
    pub fn command_name(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or_default()
    }

    pub fn call_request(&self) -> Option<&str> {
        self.call_request.as_deref()
    }

    /// Fulfil the completion slot. Only the first call has an effect.
    pub fn resolve(&self, result: JobResult) -> bool {
        match self.slot.lock().unwrap().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_resolves_once() {
        let (job, rx) = Job::new("job-1", "originate sofia/gateway/gw/1000 &park()", None);
        assert_eq!(job.command_name(), "originate");
        assert!(job.resolve(JobResult::from_body("+OK 4f2c")));
        assert!(!job.resolve(JobResult::Err("late".into())));
        assert_eq!(rx.await.unwrap(), JobResult::Ok("4f2c".to_string()));
    }

    #[test]
    fn test_job_body_classification() {
        assert_eq!(
            JobResult::from_body("-ERR NO_ROUTE_DESTINATION\n"),
            JobResult::Err("NO_ROUTE_DESTINATION".to_string())
        );
        assert!(JobResult::from_body("+OK").is_ok());
    }
}
