use crate::switch::SwitchEvent;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-session event buffer with a single waiting consumer.
///
/// Events pushed while nobody waits stay queued until the next
/// [`wait_for_event`](EventQueue::wait_for_event). Events a waiter rejects with
/// `requeue` set are put back at the head, in arrival order, once the wait
/// finishes.
pub struct EventQueue {
    events: Mutex<VecDeque<SwitchEvent>>,
    notify: Notify,
    default_timeout: Duration,
}

impl EventQueue {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            default_timeout,
        }
    }

    pub fn push(&self, event: SwitchEvent) {
        self.events.lock().unwrap().push_back(event);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every buffered event accepted by `matches`, returning how many
    /// were removed. Used to clear completions left over from a previous
    /// command before issuing the same command again.
    pub fn discard<F>(&self, matches: F) -> usize
    where
        F: Fn(&SwitchEvent) -> bool,
    {
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        events.retain(|e| !matches(e));
        before - events.len()
    }

    fn pop(&self) -> Option<SwitchEvent> {
        self.events.lock().unwrap().pop_front()
    }

    fn restore(&self, skipped: Vec<SwitchEvent>) {
        if skipped.is_empty() {
            return;
        }
        let mut events = self.events.lock().unwrap();
        for event in skipped.into_iter().rev() {
            events.push_front(event);
        }
        drop(events);
        self.notify.notify_one();
    }

    /// Next buffered or arriving event, or `None` once `timeout` elapses.
    pub async fn next_event(&self, timeout: Option<Duration>) -> Option<SwitchEvent> {
        self.wait_for_event(timeout, false, |_| true).await
    }

    /// Wait for the next event accepted by `matches`.
    ///
    /// A rejected event ends the wait with `None` unless `requeue` is set, in
    /// which case waiting goes on until a match or the deadline and the
    /// rejected events are returned to the head of the queue afterwards.
    pub async fn wait_for_event<F>(
        &self,
        timeout: Option<Duration>,
        requeue: bool,
        matches: F,
    ) -> Option<SwitchEvent>
    where
        F: Fn(&SwitchEvent) -> bool,
    {
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let mut skipped = Vec::new();
        let result = loop {
            let event = match self.pop() {
                Some(event) => event,
                None => {
                    match tokio::time::timeout_at(deadline, self.notify.notified()).await {
                        Ok(()) => continue,
                        Err(_) => break None,
                    }
                }
            };
            if matches(&event) {
                break Some(event);
            }
            if !requeue {
                break None;
            }
            skipped.push(event);
        };
        self.restore(skipped);
        result
    }
}
