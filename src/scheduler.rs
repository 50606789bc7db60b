use crate::error::FlowError;
use crate::registry::{Job, JobResult, Scheduled, ScheduledHangup, ScheduledPlay, SwitchInstance};
use crate::switch::SwitchClientRef;
use anyhow::Result;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deferred switch actions and the registry entries that shadow them.
///
/// The action itself runs on the switch (`sched_api`); locally only the
/// registry entry is tracked, and it expires `grace` after the action was due
/// whether or not the switch ever fired it. Hangups and plays are submitted
/// as background jobs; a rejected job drops the entry early.
#[derive(Clone)]
pub struct Scheduler {
    grace: Duration,
    cancel_token: CancellationToken,
}

impl Scheduler {
    pub fn new(grace: Duration, cancel_token: CancellationToken) -> Self {
        Self {
            grace,
            cancel_token,
        }
    }

    /// Queue `cmd` on the switch to run after `delay` seconds under `group`.
    pub async fn schedule_command(
        client: &SwitchClientRef,
        group: &str,
        delay: u64,
        cmd: &str,
    ) -> Result<()> {
        let reply = client
            .command(&format!("sched_api +{} {} {}", delay, group, cmd))
            .await?;
        if !reply.is_ok() {
            return Err(FlowError::ProtocolAnomaly(format!(
                "sched_api {} rejected: {}",
                group,
                reply.error_cause().unwrap_or_default()
            ))
            .into());
        }
        Ok(())
    }

    /// Like [`schedule_command`](Self::schedule_command) but first drops any
    /// task already queued under `group`.
    pub async fn replace_command(
        client: &SwitchClientRef,
        group: &str,
        delay: u64,
        cmd: &str,
    ) -> Result<()> {
        client.command(&format!("sched_del {}", group)).await?;
        Self::schedule_command(client, group, delay, cmd).await
    }

    /// Submit `sched_api` as a background job and wait for its result in
    /// the expiry task.
    async fn submit(
        instance: &Arc<SwitchInstance>,
        group: &str,
        delay: u64,
        cmd: &str,
    ) -> Result<(String, oneshot::Receiver<JobResult>)> {
        let command = format!("sched_api +{} {} {}", delay, group, cmd);
        let Some(job_id) = instance.client().bg_command(&command).await? else {
            return Err(FlowError::ProtocolAnomaly(format!(
                "sched_api {} returned no job id",
                group
            ))
            .into());
        };
        let (job, accepted) = Job::new(job_id.clone(), command, None);
        instance.add_job(Arc::new(job));
        Ok((job_id, accepted))
    }

    /// Kill `call_uuid` with `cause` after `timeout` seconds.
    pub async fn arm_hangup(
        &self,
        instance: &Arc<SwitchInstance>,
        call_uuid: &str,
        timeout: u64,
        cause: &str,
    ) -> Result<ScheduledHangup> {
        let entry = ScheduledHangup::new(uuid::Uuid::new_v4().to_string(), timeout);
        let cmd = format!("uuid_kill {} {}", call_uuid, cause);
        let job = Self::submit(instance, &entry.id, timeout, &cmd).await?;
        instance.add_scheduled_hangup(entry.clone());
        self.spawn_expiry(instance, &entry, job, |inst, id| {
            inst.remove_scheduled_hangup(id).is_some()
        });
        debug!(call_uuid, id = %entry.id, timeout, "scheduled hangup armed");
        Ok(entry)
    }

    /// Broadcast `media` on `call_uuid` after `timeout` seconds.
    pub async fn arm_play(
        &self,
        instance: &Arc<SwitchInstance>,
        call_uuid: &str,
        timeout: u64,
        media: &str,
        legs: &str,
    ) -> Result<ScheduledPlay> {
        let entry = ScheduledPlay::new(uuid::Uuid::new_v4().to_string(), timeout);
        let cmd = format!("uuid_broadcast {} {} {}", call_uuid, media, legs);
        let job = Self::submit(instance, &entry.id, timeout, &cmd).await?;
        instance.add_scheduled_play(entry.clone());
        self.spawn_expiry(instance, &entry, job, |inst, id| {
            inst.remove_scheduled_play(id).is_some()
        });
        debug!(call_uuid, id = %entry.id, timeout, "scheduled play armed");
        Ok(entry)
    }

    /// Cancel a scheduled hangup; `false` when it is not (or no longer) known.
    pub async fn cancel_hangup(&self, instance: &Arc<SwitchInstance>, id: &str) -> Result<bool> {
        if instance.get_scheduled_hangup(id).is_none() {
            return Ok(false);
        }
        instance.client().command(&format!("sched_del {}", id)).await?;
        Ok(instance.remove_scheduled_hangup(id).is_some())
    }

    pub async fn cancel_play(&self, instance: &Arc<SwitchInstance>, id: &str) -> Result<bool> {
        if instance.get_scheduled_play(id).is_none() {
            return Ok(false);
        }
        instance.client().command(&format!("sched_del {}", id)).await?;
        Ok(instance.remove_scheduled_play(id).is_some())
    }

    fn spawn_expiry<T, F>(
        &self,
        instance: &Arc<SwitchInstance>,
        entry: &T,
        (job_id, accepted): (String, oneshot::Receiver<JobResult>),
        remove: F,
    ) where
        T: Scheduled,
        F: Fn(&SwitchInstance, &str) -> bool + Send + 'static,
    {
        let owner: Weak<SwitchInstance> = Arc::downgrade(instance);
        let id = entry.id().to_string();
        let wait = entry.expires_after(self.grace);
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            let expiry = tokio::time::sleep(wait);
            tokio::pin!(expiry);
            let mut expired = false;
            tokio::select! {
                _ = token.cancelled() => return,
                result = accepted => {
                    if let Ok(JobResult::Err(cause)) = result {
                        warn!(id = %id, cause = %cause, "switch rejected scheduled action");
                        if let Some(instance) = owner.upgrade() {
                            remove(instance.as_ref(), id.as_str());
                        }
                        return;
                    }
                }
                _ = &mut expiry => expired = true,
            }
            if !expired {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = &mut expiry => {}
                }
            }
            match owner.upgrade() {
                Some(instance) => {
                    instance.remove_job(&job_id);
                    if remove(instance.as_ref(), id.as_str()) {
                        debug!(id = %id, "scheduled entry expired");
                    }
                }
                None => warn!(id = %id, "switch instance gone before schedule expiry"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::testing::MockSwitch;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_hangup_entry_expires_after_grace() {
        let switch = MockSwitch::new();
        let registry = Registry::new();
        let instance = registry.add_instance("fs-1", switch.client(), HashMap::new());
        let scheduler = Scheduler::new(Duration::from_millis(50), CancellationToken::new());

        let entry = scheduler
            .arm_hangup(&instance, "leg-a", 0, "ALLOTTED_TIMEOUT")
            .await
            .unwrap();
        assert!(switch
            .api_commands()
            .contains(&format!("sched_api +0 {} uuid_kill leg-a ALLOTTED_TIMEOUT", entry.id)));
        assert_eq!(registry.scheduled_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(instance.scheduled_hangup_count(), 0);
        assert!(registry.scheduled_hangup_owner(&entry.id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_with_expiry() {
        let switch = MockSwitch::new();
        let registry = Registry::new();
        let instance = registry.add_instance("fs-1", switch.client(), HashMap::new());
        let scheduler = Scheduler::new(Duration::from_millis(20), CancellationToken::new());

        let entry = scheduler
            .arm_play(&instance, "leg-a", 0, "/tmp/ding.wav", "aleg")
            .await
            .unwrap();
        assert!(scheduler.cancel_play(&instance, &entry.id).await.unwrap());
        assert!(switch
            .api_commands()
            .contains(&format!("sched_del {}", entry.id)));

        // the expiry timer still fires and finds nothing to remove
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!scheduler.cancel_play(&instance, &entry.id).await.unwrap());
        assert_eq!(instance.scheduled_play_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_job_id_is_not_registered() {
        let switch = MockSwitch::new();
        switch.push_job_id(None);
        let registry = Registry::new();
        let instance = registry.add_instance("fs-1", switch.client(), HashMap::new());
        let scheduler = Scheduler::new(Duration::from_secs(1), CancellationToken::new());

        let err = scheduler
            .arm_hangup(&instance, "leg-a", 10, "NORMAL_CLEARING")
            .await
            .unwrap_err();
        assert!(matches!(
            crate::error::flow_error(&err),
            Some(FlowError::ProtocolAnomaly(_))
        ));
        assert_eq!(instance.scheduled_hangup_count(), 0);
    }

    #[tokio::test]
    async fn test_hangup_is_submitted_as_background_job() {
        let switch = MockSwitch::new();
        switch.push_job_id(Some("job-sched"));
        let registry = Registry::new();
        let instance = registry.add_instance("fs-1", switch.client(), HashMap::new());
        let scheduler = Scheduler::new(Duration::from_secs(5), CancellationToken::new());

        let entry = scheduler
            .arm_hangup(&instance, "leg-a", 60, "ALLOTTED_TIMEOUT")
            .await
            .unwrap();
        assert_eq!(
            switch.background_commands(),
            vec![format!("sched_api +60 {} uuid_kill leg-a ALLOTTED_TIMEOUT", entry.id)]
        );
        assert_eq!(instance.job_count(), 1);

        // the switch refuses the schedule: the entry goes away before its expiry
        assert!(instance.complete_job("job-sched", JobResult::from_body("-ERR invalid time")));
        for _ in 0..200 {
            if instance.scheduled_hangup_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(instance.scheduled_hangup_count(), 0);
        assert!(registry.scheduled_hangup_owner(&entry.id).is_none());
    }
}
