use std::collections::HashMap;

use shared::domain::PresenceEntry;
use tokio::task::JoinHandle;

/// Live presence set plus transient typing indicators. The tracker owns
/// every pending clear timer; arming a new one for a peer always aborts the
/// previous handle, so at most one timer is outstanding per peer.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: Vec<PresenceEntry>,
    typing: HashMap<String, JoinHandle<()>>,
}

impl PresenceTracker {
    /// Replaces the presence set wholesale, deduplicated by user id.
    pub fn replace_online(&mut self, users: Vec<PresenceEntry>) {
        self.online.clear();
        for user in users {
            if !self.online.iter().any(|u| u.user_id == user.user_id) {
                self.online.push(user);
            }
        }
    }

    pub fn online(&self) -> &[PresenceEntry] {
        &self.online
    }

    pub fn set_typing(&mut self, username: &str, clear_timer: JoinHandle<()>) {
        if let Some(previous) = self.typing.insert(username.to_string(), clear_timer) {
            previous.abort();
        }
    }

    /// Clears one peer's indicator. Returns false when it was not set.
    pub fn clear_typing(&mut self, username: &str) -> bool {
        match self.typing.remove(username) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Clears every indicator. Returns false when none were set.
    pub fn clear_all_typing(&mut self) -> bool {
        let had_any = !self.typing.is_empty();
        for (_, timer) in self.typing.drain() {
            timer.abort();
        }
        had_any
    }

    pub fn typing_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.typing.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn reset(&mut self) {
        self.online.clear();
        self.clear_all_typing();
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.clear_all_typing();
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
