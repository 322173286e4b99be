//! Metric activation windows
//!
//! A metric with activations aggregates only while at least one window is
//! open. Windows open on an activation matcher (immediately, or armed
//! until boot completes), close on TTL expiry or a deactivation matcher,
//! and survive restarts as remaining-TTL records rebased on load.

use tally_config::{ActivationConfig, ActivationType};
use tally_storage::{ActiveActivation, ActiveActivationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Inactive,
    Active,
    /// Armed; becomes Active when boot completes
    ActiveOnBoot,
}

#[derive(Debug)]
struct ActivationEntry {
    matcher: usize,
    deactivation_matcher: Option<usize>,
    ttl_ns: i64,
    activation_type: ActivationType,
    state: ActivationState,
    start_ns: i64,
}

impl ActivationEntry {
    fn is_active(&self, now_ns: i64) -> bool {
        self.state == ActivationState::Active && now_ns < self.start_ns + self.ttl_ns
    }
}

/// Every activation window of one metric
#[derive(Debug, Default)]
pub struct ActivationSet {
    entries: Vec<ActivationEntry>,
}

impl ActivationSet {
    /// Compile from config; matcher ids have been resolved to registry
    /// slots by the caller
    pub fn new(configs: &[ActivationConfig], resolve: impl Fn(i64) -> Option<usize>) -> Self {
        let entries = configs
            .iter()
            .filter_map(|config| {
                let matcher = resolve(config.activation_matcher)?;
                Some(ActivationEntry {
                    matcher,
                    deactivation_matcher: config.deactivation_matcher.and_then(&resolve),
                    ttl_ns: config.ttl_ns,
                    activation_type: config.activation_type,
                    state: ActivationState::Inactive,
                    start_ns: 0,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A metric with no windows is always active
    pub fn is_active(&self, now_ns: i64) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|e| e.is_active(now_ns))
    }

    /// Feed a matched-matcher slot; opens or closes windows
    pub fn on_matched(&mut self, matcher_slot: usize, now_ns: i64) {
        for entry in &mut self.entries {
            if entry.deactivation_matcher == Some(matcher_slot) {
                entry.state = ActivationState::Inactive;
            }
            if entry.matcher == matcher_slot {
                match entry.activation_type {
                    ActivationType::ActivateImmediately => {
                        entry.state = ActivationState::Active;
                        entry.start_ns = now_ns;
                    }
                    ActivationType::ActivateOnBoot => {
                        if entry.state != ActivationState::Active {
                            entry.state = ActivationState::ActiveOnBoot;
                        }
                    }
                }
            }
        }
    }

    /// Boot completed: armed windows open now
    pub fn on_boot_completed(&mut self, now_ns: i64) {
        for entry in &mut self.entries {
            if entry.state == ActivationState::ActiveOnBoot {
                entry.state = ActivationState::Active;
                entry.start_ns = now_ns;
            }
        }
    }

    /// Remaining-TTL records for persistence. Entries are positional:
    /// record i belongs to activation i; closed windows persist with a
    /// zero TTL so positions line up on load.
    pub fn to_records(&self, now_ns: i64) -> Vec<ActiveActivation> {
        self.entries
            .iter()
            .map(|entry| match entry.state {
                ActivationState::Active if entry.is_active(now_ns) => ActiveActivation {
                    state: ActiveActivationState::Active,
                    remaining_ttl_ns: entry.start_ns + entry.ttl_ns - now_ns,
                },
                ActivationState::ActiveOnBoot => ActiveActivation {
                    state: ActiveActivationState::ActiveOnBoot,
                    remaining_ttl_ns: entry.ttl_ns,
                },
                _ => ActiveActivation {
                    state: ActiveActivationState::Active,
                    remaining_ttl_ns: 0,
                },
            })
            .collect()
    }

    /// Restore from records, rebasing TTLs against `now_ns`
    pub fn load_records(&mut self, records: &[ActiveActivation], now_ns: i64) {
        for (entry, record) in self.entries.iter_mut().zip(records) {
            if record.remaining_ttl_ns <= 0 {
                entry.state = ActivationState::Inactive;
                continue;
            }
            match record.state {
                ActiveActivationState::Active => {
                    entry.state = ActivationState::Active;
                    // Rebase: the window has remaining_ttl_ns left from now.
                    entry.start_ns = now_ns + record.remaining_ttl_ns - entry.ttl_ns;
                }
                ActiveActivationState::ActiveOnBoot => {
                    entry.state = ActivationState::ActiveOnBoot;
                }
            }
        }
    }
}
