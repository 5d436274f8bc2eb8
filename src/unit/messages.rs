//! Wire protocol between the host and a computation unit.
//!
//! Every message is an owned value that serializes to a JSON object tagged
//! by `type`, so the unit can live on a thread, in another process, or on a
//! remote worker without changing the contract.

use serde::{Deserialize, Serialize};

use crate::core::{SimulationConfig, SimulationProgress, SimulationResult};

/// Host → unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostMessage {
    /// Readiness probe; answered with `UnitMessage::Test`.
    Test,
    Simulate { run_id: u64, config: SimulationConfig },
    Cancel { run_id: u64 },
}

/// Unit → host. `Complete`, `Error` and `Cancelled` are terminal: exactly
/// one of them is sent per accepted `Simulate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UnitMessage {
    Test,
    Progress {
        run_id: u64,
        progress: SimulationProgress,
    },
    Complete {
        run_id: u64,
        result: SimulationResult,
    },
    Error {
        run_id: u64,
        message: String,
    },
    Cancelled {
        run_id: u64,
    },
}

impl UnitMessage {
    pub fn run_id(&self) -> Option<u64> {
        match self {
            UnitMessage::Test => None,
            UnitMessage::Progress { run_id, .. }
            | UnitMessage::Complete { run_id, .. }
            | UnitMessage::Error { run_id, .. }
            | UnitMessage::Cancelled { run_id } => Some(*run_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitMessage::Complete { .. } | UnitMessage::Error { .. } | UnitMessage::Cancelled { .. }
        )
    }
}
