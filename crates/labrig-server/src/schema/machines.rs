//! Schema types for machine registration.

use serde::{Deserialize, Serialize};

use labrig_core::{MachineAttrs, MachineRecord};
use labrig_storage::RegisterOutcome;

/// `POST /add` body: a machine name plus its registration attributes.
#[derive(Debug, Clone, Deserialize)]
pub struct AddMachineRequest {
    pub name: String,
    #[serde(flatten)]
    pub attrs: MachineAttrs,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddMachineResponse {
    pub outcome: RegisterOutcome,
    pub machine: MachineRecord,
}
