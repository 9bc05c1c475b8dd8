//! Session Gateway trait - the remote operations the driver relies on.
//!
//! The driver never talks HTTP itself. It looks VMs up, reads their power
//! state and submits power and reconfiguration calls through this trait:
//!
//! ```text
//! find_vm(name) → power_state(vm) → power_off(vm) → reconfigure(vm, ..)
//!                                                 → reconfigure(vm, ..) → power_on(vm)
//! ```
//!
//! Every mutating call blocks until the remote task has completed or failed.
//!
//! # Implementations
//!
//! - [`crate::vsphere::VsphereClient`]: vCenter through the vim25 JSON API

use crate::error::Result;
use crate::planner::ConfigEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// VM State
// =============================================================================

/// Power state of a VM, as reported by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "poweredOn"),
            Self::PoweredOff => write!(f, "poweredOff"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Snapshot of a VM taken at lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    /// Managed object id (e.g. `vm-42`).
    pub id: String,
    /// Inventory name.
    pub name: String,
    /// Power state at lookup. Use [`Gateway::power_state`] for a live read.
    pub power_state: PowerState,
    /// Configured vCPU count.
    pub vcpu_count: u32,
    /// Extra configuration, in endpoint order.
    pub extra_config: Vec<ConfigEntry>,
}

// =============================================================================
// Gateway Trait
// =============================================================================

/// Remote operations against the management endpoint.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Looks a VM up by inventory name.
    ///
    /// Returns `Ok(None)` when no VM has that name. With duplicates, the first
    /// match in inventory order is returned.
    async fn find_vm(&self, name: &str) -> Result<Option<VmHandle>>;

    /// Reads the current power state.
    async fn power_state(&self, vm: &VmHandle) -> Result<PowerState>;

    /// Powers the VM on and waits for the task.
    async fn power_on(&self, vm: &VmHandle) -> Result<()>;

    /// Powers the VM off and waits for the task.
    async fn power_off(&self, vm: &VmHandle) -> Result<()>;

    /// Submits `entries` as the VM's extra configuration and waits for the task.
    async fn reconfigure(&self, vm: &VmHandle, entries: &[ConfigEntry]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_wire_names() {
        let state: PowerState = serde_json::from_str("\"poweredOn\"").unwrap();
        assert_eq!(state, PowerState::PoweredOn);
        assert_eq!(
            serde_json::to_string(&PowerState::PoweredOff).unwrap(),
            "\"poweredOff\""
        );
        assert_eq!(PowerState::Suspended.to_string(), "suspended");
    }
}
