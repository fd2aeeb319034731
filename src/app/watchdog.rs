use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::types::{AbortTaskOnDrop, AttemptId};

/// Single-shot load timer. At most one attempt is armed at a time; the armed slot is
/// checked under a lock by both the timer task and `disarm`, so a matching disarm
/// always wins over an expiry that has not fired yet.
#[derive(Default)]
pub struct LoadWatchdog {
    armed: Arc<Mutex<Option<AttemptId>>>,
    timer: Option<AbortTaskOnDrop>,
}

fn lock_slot(slot: &Mutex<Option<AttemptId>>) -> MutexGuard<'_, Option<AttemptId>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LoadWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<F>(&mut self, attempt: AttemptId, timeout: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.clear();
        *lock_slot(&self.armed) = Some(attempt);

        let armed = Arc::clone(&self.armed);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let fired = {
                let mut slot = lock_slot(&armed);
                if *slot == Some(attempt) {
                    *slot = None;
                    true
                } else {
                    false
                }
            };
            if fired {
                on_expire();
            }
        });
        self.timer = Some(AbortTaskOnDrop(handle.abort_handle()));
    }

    /// Returns `true` when `attempt` was the armed one. Stale ids are ignored.
    pub fn disarm(&mut self, attempt: AttemptId) -> bool {
        let matched = {
            let mut slot = lock_slot(&self.armed);
            if *slot == Some(attempt) {
                *slot = None;
                true
            } else {
                false
            }
        };
        if matched {
            self.timer = None;
        }
        matched
    }

    pub fn clear(&mut self) {
        *lock_slot(&self.armed) = None;
        self.timer = None;
    }

    #[cfg(test)]
    pub fn armed_attempt(&self) -> Option<AttemptId> {
        *lock_slot(&self.armed)
    }
}
