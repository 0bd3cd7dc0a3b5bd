//! Presence policy: advertise only while the app is in the foreground,
//! paired with a desktop server, and has something to offer.

use std::sync::{Arc, Mutex};

use super::Discovery;

#[derive(Debug, Default)]
struct PresenceState {
    foreground: bool,
    paired: bool,
    /// (port, item count) of the running transfer server.
    offer: Option<(u16, u32)>,
    /// What is currently on the air.
    published: Option<(u16, u32)>,
}

impl PresenceState {
    fn wanted(&self) -> Option<(u16, u32)> {
        if self.foreground && self.paired {
            self.offer
        } else {
            None
        }
    }
}

pub struct PresencePublisher {
    discovery: Arc<Discovery>,
    state: Mutex<PresenceState>,
}

impl PresencePublisher {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self {
            discovery,
            state: Mutex::new(PresenceState::default()),
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.update(|s| s.foreground = foreground);
    }

    pub fn set_paired(&self, paired: bool) {
        self.update(|s| s.paired = paired);
    }

    pub fn set_offer(&self, port: u16, item_count: u32) {
        self.update(|s| s.offer = Some((port, item_count)));
    }

    pub fn clear_offer(&self) {
        self.update(|s| s.offer = None);
    }

    pub fn is_published(&self) -> bool {
        self.lock().published.is_some()
    }

    fn update(&self, f: impl FnOnce(&mut PresenceState)) {
        let mut state = self.lock();
        f(&mut state);

        let wanted = state.wanted();
        if wanted == state.published {
            return;
        }
        match wanted {
            Some((port, item_count)) => {
                let mut failed = false;
                self.discovery.publish(port, item_count, |e| {
                    tracing::warn!(error = %e, "failed to publish presence");
                    failed = true;
                });
                state.published = (!failed).then_some((port, item_count));
            }
            None => {
                self.discovery.unpublish();
                state.published = None;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
