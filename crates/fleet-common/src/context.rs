use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Import,
    Manual,
    Scheduled,
}

/// Request-scoped state for one reconciliation invocation. Passed down the
/// call chain explicitly so concurrent passes never share mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SyncContext {
    pub correlation_id: String,
    pub trigger: SyncTrigger,
    pub full_sync: bool,
    pub deadline_ms: Option<u64>,
}

impl SyncContext {
    pub fn new(trigger: SyncTrigger) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            full_sync: matches!(trigger, SyncTrigger::Import),
            deadline_ms: None,
        }
    }

    pub fn with_full_sync(mut self, full_sync: bool) -> Self {
        self.full_sync = full_sync;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }
}
