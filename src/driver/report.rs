use serde::Serialize;

use crate::contracts::RecordPolicy;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_CONFIG: u8 = 1;
pub const EXIT_CONNECTION: u8 = 2;
pub const EXIT_DECLARATION: u8 = 3;
pub const EXIT_PARTIAL: u8 = 4;
pub const EXIT_SOURCE: u8 = 5;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Init,
    Connected,
    QueueReady,
    Publishing,
    Done,
    Aborted,
}

impl DriverState {
    pub fn can_transition_to(&self, next: DriverState) -> bool {
        use DriverState::*;

        match (self, next) {
            (Init, Connected) => true,
            (Connected, QueueReady) => true,
            (QueueReady, Publishing) => true,
            (Publishing, Publishing) => true,
            (Publishing, Done) => true,
            (Connected | QueueReady | Publishing, Aborted) => true,
            _ => false,
        }
    }
}

/// Summary of one run, printed for the operator when the run ends.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunReport {
    pub queue: String,
    pub policy: RecordPolicy,
    pub records_read: u64,
    pub published: u64,
    pub failed: u64,
    pub failed_records: Vec<u64>,
    pub state: DriverState,
}

impl RunReport {
    pub fn new(queue: &str, policy: RecordPolicy) -> Self {
        Self {
            queue: queue.to_string(),
            policy,
            records_read: 0,
            published: 0,
            failed: 0,
            failed_records: Vec::new(),
            state: DriverState::Init,
        }
    }

    pub fn record_failure(&mut self, index: Option<u64>) {
        self.failed += 1;
        if let Some(index) = index {
            self.failed_records.push(index);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_clean() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        }
    }
}
