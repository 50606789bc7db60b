use super::SwitchInstance;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// A conference room as reported by the switch.
pub struct Conference {
    id: String,
    room: String,
    owner: OnceLock<Weak<SwitchInstance>>,
    members: Mutex<HashSet<String>>,
}

impl Conference {
    pub fn new(id: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            room: room.into(),
            owner: OnceLock::new(),
            members: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub(super) fn attach(&self, owner: &Arc<SwitchInstance>) {
        let _ = self.owner.set(Arc::downgrade(owner));
    }

    pub fn instance(&self) -> Option<Arc<SwitchInstance>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    pub fn add_member(&self, member_id: impl Into<String>) {
        self.members.lock().unwrap().insert(member_id.into());
    }

    pub fn remove_member(&self, member_id: &str) {
        self.members.lock().unwrap().remove(member_id);
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }
}
