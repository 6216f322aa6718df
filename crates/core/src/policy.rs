//! Session-duration policy.

use crate::{config::CallConfig, state::EntitlementTier};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Continue,
    Terminate,
}

/// Maximum call length per tier. A tier without an entry is unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTable {
    limits: HashMap<EntitlementTier, u64>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, tier: EntitlementTier, max_seconds: u64) -> Self {
        self.limits.insert(tier, max_seconds);
        self
    }

    pub fn from_config(config: &CallConfig) -> Self {
        let mut table = Self::new();
        if let Some(secs) = config.trial_limit_secs {
            table = table.with_limit(EntitlementTier::Trial, secs);
        }
        if let Some(secs) = config.authenticated_limit_secs {
            table = table.with_limit(EntitlementTier::Authenticated, secs);
        }
        table
    }

    pub fn limit_for(&self, tier: EntitlementTier) -> Option<u64> {
        self.limits.get(&tier).copied()
    }
}

/// Decides, once per elapsed-second tick, whether a call may continue.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    table: PolicyTable,
}

impl SessionPolicy {
    pub fn new(table: PolicyTable) -> Self {
        Self { table }
    }

    pub fn evaluate(&self, tier: EntitlementTier, elapsed_seconds: u64) -> PolicyDecision {
        match self.table.limit_for(tier) {
            Some(limit) if elapsed_seconds >= limit => PolicyDecision::Terminate,
            _ => PolicyDecision::Continue,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(PolicyTable::from_config(&CallConfig::default()))
    }
}
