//! # Pinning Planner
//!
//! Turns a VM's current extra-config entries and the pinning geometry into the
//! entry lists submitted to the endpoint.
//!
//! Planning happens in two stages, each producing a new list:
//!
//! ```text
//!   current entries ──clear_pinning──► cleared ──plan_pinning──► cleared + generated
//!                                        │                              │
//!                                  1st reconfigure               2nd reconfigure
//!                                                             (skipped when stride = 0)
//! ```
//!
//! The cleared list is applied first so stale pins never coexist with new ones.
//!
//! ## Geometry
//!
//! vCPU numbering is contiguous from 0 regardless of NUMA boundaries, while the
//! physical core follows the offset, stride and NUMA layout:
//!
//! ```text
//! vcpu=8 start=0 stride=1 numas=2 numa_size=4
//!
//!   NUMA 0: vcpu0..3 → cores 0 1 2 3
//!   NUMA 1: vcpu4..7 → cores 4 5 6 7
//! ```
//!
//! Nothing is checked against the real core count: a core beyond the
//! hardware is passed through and rejected by the endpoint.

use crate::constants::{
    CLEARED_VALUE, DEFAULT_NUMA_SIZE, DEFAULT_NUM_NUMAS, EXCLUSIVE_AFFINITY_ENABLED,
    EXCLUSIVE_AFFINITY_KEY, VCPU_AFFINITY_PREFIX, vcpu_affinity_key,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

// =============================================================================
// Entries
// =============================================================================

/// One key/value setting of a VM's extra configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Setting key, e.g. `sched.vcpu0.affinity`.
    pub key: String,
    /// Setting value. Empty means "unset" to the endpoint.
    pub value: String,
}

impl ConfigEntry {
    /// Creates an entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns true if this entry holds pinning state.
    pub fn is_pinning(&self) -> bool {
        is_pinning_key(&self.key)
    }

    /// Returns true if the value is the clear sentinel.
    pub fn is_cleared(&self) -> bool {
        self.value == CLEARED_VALUE
    }
}

/// Returns true for per-vCPU scheduler keys and the exclusive-affinity key.
pub fn is_pinning_key(key: &str) -> bool {
    key.contains(VCPU_AFFINITY_PREFIX) || key == EXCLUSIVE_AFFINITY_KEY
}

// =============================================================================
// Parameters
// =============================================================================

/// NUMA layout shared by every request of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaLayout {
    /// Number of NUMA nodes to spread the vCPUs over (at least 1).
    pub num_numas: u32,
    /// Cores per NUMA node, used to offset each node's first core.
    pub numa_size: u32,
}

impl Default for NumaLayout {
    fn default() -> Self {
        Self {
            num_numas: DEFAULT_NUM_NUMAS,
            numa_size: DEFAULT_NUMA_SIZE,
        }
    }
}

/// Inputs of the generate stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinningParams {
    /// First physical core of NUMA node 0.
    pub start: u32,
    /// Configured vCPU count of the VM.
    pub vcpu_count: u32,
    /// Distance between the cores of consecutive vCPUs. 0 means unpin.
    pub stride: u32,
    /// NUMA layout.
    pub layout: NumaLayout,
}

impl PinningParams {
    /// vCPUs pinned on each NUMA node. The remainder is dropped.
    pub fn cores_per_numa(&self) -> u32 {
        self.vcpu_count / self.layout.num_numas.max(1)
    }

    /// Total number of vCPUs the generate stage pins.
    pub fn pinned_vcpus(&self) -> u64 {
        if self.stride == 0 {
            return 0;
        }
        u64::from(self.cores_per_numa()) * u64::from(self.layout.num_numas.max(1))
    }
}

// =============================================================================
// Stages
// =============================================================================

/// Clear stage: every pinning entry gets the empty value, others are kept.
///
/// The entries stay present so the endpoint unsets them. Applying this to an
/// already-cleared list yields the same list.
pub fn clear_pinning(entries: &[ConfigEntry]) -> Vec<ConfigEntry> {
    entries
        .iter()
        .map(|entry| {
            if entry.is_pinning() {
                ConfigEntry::new(entry.key.clone(), CLEARED_VALUE)
            } else {
                entry.clone()
            }
        })
        .collect()
}

/// Generate stage: the new affinity entries followed by exclusive affinity.
///
/// Returns an empty list when `stride` is 0.
pub fn generate_pinning(params: &PinningParams) -> Vec<ConfigEntry> {
    if params.stride == 0 {
        return Vec::new();
    }

    let stride = u64::from(params.stride);
    let per_numa = u64::from(params.cores_per_numa());
    let mut entries = Vec::with_capacity(params.pinned_vcpus() as usize + 1);
    let mut vcpu: u64 = 0;

    for node in 0..u64::from(params.layout.num_numas.max(1)) {
        let node_start = u64::from(params.start) + node * u64::from(params.layout.numa_size);
        let node_end = node_start + per_numa * stride;
        let mut core = node_start;
        while core < node_end {
            entries.push(ConfigEntry::new(vcpu_affinity_key(vcpu), core.to_string()));
            vcpu += 1;
            core += stride;
        }
    }

    entries.push(ConfigEntry::new(
        EXCLUSIVE_AFFINITY_KEY,
        EXCLUSIVE_AFFINITY_ENABLED,
    ));
    entries
}

/// Entry list for the second reconfiguration.
///
/// The cleared list followed by the generated entries. A cleared entry whose
/// key is assigned again by the generate stage is dropped, so each affinity key
/// and the exclusive key appear once, with exclusive affinity last.
pub fn plan_pinning(cleared: &[ConfigEntry], params: &PinningParams) -> Vec<ConfigEntry> {
    let generated = generate_pinning(params);
    if generated.is_empty() {
        return cleared.to_vec();
    }

    let assigned: HashSet<String> = generated.iter().map(|e| e.key.clone()).collect();
    let mut planned: Vec<ConfigEntry> = cleared
        .iter()
        .filter(|entry| !assigned.contains(&entry.key))
        .cloned()
        .collect();
    planned.extend(generated);
    planned
}

// =============================================================================
// Rendering
// =============================================================================

/// Renders pinning entries as `key:value; ` pairs, in entry order.
pub fn render_pinning(entries: &[ConfigEntry]) -> String {
    let mut out = String::new();
    for entry in entries.iter().filter(|e| e.is_pinning()) {
        let _ = write!(out, "{}:{}; ", entry.key, entry.value);
    }
    out
}

/// Renders non-empty pinning entries as `.vmx` lines (`key = "value"`).
pub fn render_vmx(entries: &[ConfigEntry]) -> String {
    let mut out = String::new();
    for entry in entries.iter().filter(|e| e.is_pinning() && !e.is_cleared()) {
        let _ = writeln!(out, "{} = \"{}\"", entry.key, entry.value);
    }
    out
}
