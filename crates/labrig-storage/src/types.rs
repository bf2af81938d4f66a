//! Registry result types.

use serde::Serialize;

use labrig_core::MachineRecord;

/// What a `register` call did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterOutcome {
    Created,
    Updated,
    /// Attributes matched the stored record; nothing was written.
    Unchanged,
}

/// A registered record and how it got there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub record: MachineRecord,
    pub outcome: RegisterOutcome,
}
