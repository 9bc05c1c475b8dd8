//! # Pinning Constants
//!
//! Configuration keys, CLI defaults and protocol bounds shared by the
//! planner, the configuration builder and the vSphere session.
//!
//! ## Cross-References
//!
//! - [`crate::planner`]: uses the extra-config keys and sentinel values
//! - [`crate::config`]: uses the CLI defaults and truthy spellings
//! - [`crate::vsphere`]: uses the API release, header and task bounds

use std::time::Duration;

// =============================================================================
// Extra-Config Keys
// =============================================================================

/// Per-vCPU key prefix. Any key containing it is scheduler state for a vCPU.
pub const VCPU_AFFINITY_PREFIX: &str = "sched.vcpu";

/// Per-vCPU affinity key suffix.
pub const VCPU_AFFINITY_SUFFIX: &str = ".affinity";

/// VM-wide exclusive affinity key.
pub const EXCLUSIVE_AFFINITY_KEY: &str = "sched.cpu.affinity.exclusive";

/// Value enabling exclusive affinity.
pub const EXCLUSIVE_AFFINITY_ENABLED: &str = "TRUE";

/// Value the endpoint treats as "unset this key".
pub const CLEARED_VALUE: &str = "";

/// Builds the affinity key for vCPU `index`.
pub fn vcpu_affinity_key(index: u64) -> String {
    format!("{VCPU_AFFINITY_PREFIX}{index}{VCPU_AFFINITY_SUFFIX}")
}

// =============================================================================
// CLI Defaults
// =============================================================================

/// First physical core to pin from.
pub const DEFAULT_START: u32 = 0;

/// Default stride: skip hyperthread siblings.
pub const DEFAULT_STRIDE: u32 = 2;

/// Stride forced by `--no-ht`: every logical core.
pub const NO_HT_STRIDE: u32 = 1;

/// Stride forced by `--no-pin`: remove pinning altogether.
pub const UNPIN_STRIDE: u32 = 0;

/// Number of NUMA nodes to spread vCPUs over.
pub const DEFAULT_NUM_NUMAS: u32 = 1;

/// Cores per NUMA node used for per-node offsets.
pub const DEFAULT_NUMA_SIZE: u32 = 0;

/// Spellings of a truthy `force` column (compared lowercase).
pub const TRUTHY_VALUES: &[&str] = &["true", "1", "y", "yes", "t"];

/// Answers accepted by the power-off confirmation prompt (compared lowercase).
pub const AFFIRMATIVE_ANSWERS: &[&str] = &["y", "yes"];

/// Number of columns in a tabular input row.
pub const INPUT_COLUMNS: usize = 4;

// =============================================================================
// Management Endpoint
// =============================================================================

/// vim25 JSON API release used in request paths.
pub const DEFAULT_API_RELEASE: &str = "8.0.1.0";

/// Header carrying the session token after login.
pub const SESSION_HEADER: &str = "vmware-api-session-id";

/// Timeout for a single HTTP request.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between two polls of a running task.
pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for a single remote task.
pub const TASK_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
