//! Multi-condition trigger
//!
//! Waits for a set of named completions and then invokes the callback
//! exactly once. The callback runs on a fresh thread: completion is often
//! marked while engine locks are held, and the callback must never run
//! under them.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

struct TriggerState {
    remaining: HashSet<String>,
    completed: bool,
}

/// Fires `trigger` once every named condition has been marked complete
pub struct MultiConditionTrigger {
    state: Mutex<TriggerState>,
    trigger: Arc<dyn Fn() + Send + Sync>,
}

impl MultiConditionTrigger {
    pub fn new(
        condition_names: impl IntoIterator<Item = String>,
        trigger: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let remaining: HashSet<String> = condition_names.into_iter().collect();
        let completed = remaining.is_empty();
        let this = Arc::new(Self {
            state: Mutex::new(TriggerState {
                remaining,
                completed,
            }),
            trigger: Arc::new(trigger),
        });
        if completed {
            this.spawn_trigger();
        }
        this
    }

    /// Mark one condition complete; unknown and repeated names are no-ops
    pub fn mark_complete(&self, condition_name: &str) {
        let fire = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.remaining.remove(condition_name);
            state.completed = state.remaining.is_empty();
            state.completed
        };
        if fire {
            self.spawn_trigger();
        }
    }

    fn spawn_trigger(&self) {
        let trigger = Arc::clone(&self.trigger);
        thread::spawn(move || trigger());
    }
}
