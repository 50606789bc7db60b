use std::time::Duration;

/// A hangup scheduled on the switch with `sched_api`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledHangup {
    pub id: String,
    pub timeout: u64,
}

/// A playback scheduled on the switch with `sched_api`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledPlay {
    pub id: String,
    pub timeout: u64,
}

impl ScheduledHangup {
    pub fn new(id: impl Into<String>, timeout: u64) -> Self {
        Self {
            id: id.into(),
            timeout,
        }
    }
}

impl ScheduledPlay {
    pub fn new(id: impl Into<String>, timeout: u64) -> Self {
        Self {
            id: id.into(),
            timeout,
        }
    }
}

/// Common view used by the scheduler.
pub trait Scheduled {
    fn id(&self) -> &str;
    fn timeout(&self) -> u64;

    /// How long the registry entry lives: the switch-side delay plus `grace`.
    fn expires_after(&self, grace: Duration) -> Duration {
        Duration::from_secs(self.timeout()) + grace
    }
}

impl Scheduled for ScheduledHangup {
    fn id(&self) -> &str {
        &self.id
    }
    fn timeout(&self) -> u64 {
        self.timeout
    }
}

impl Scheduled for ScheduledPlay {
    fn id(&self) -> &str {
        &self.id
    }
    fn timeout(&self) -> u64 {
        self.timeout
    }
}
