//! # vmpin
//!
//! **vCPU-to-physical-CPU pinning for vCenter virtual machines**
//!
//! This crate reconfigures a VM's scheduler affinity (`sched.vcpu<N>.affinity`
//! and `sched.cpu.affinity.exclusive`) through a vCenter endpoint, spreading
//! the vCPUs over one or more NUMA nodes with a configurable start core and
//! stride.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              vmpin                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────┐        ┌─────────────────────────────┐   │
//! │  │ Configuration Builder │        │       Pinning Planner       │   │
//! │  │  CLI flags │ CSV rows │        │  clear stage │ generate     │   │
//! │  └───────────┬───────────┘        └──────────────┬──────────────┘   │
//! │              │ PinningRequest                    │ ConfigEntry      │
//! │  ┌───────────▼───────────────────────────────────▼──────────────┐   │
//! │  │                    VM Lifecycle Driver                       │   │
//! │  │   lookup → power-off → clear → generate → power-on           │   │
//! │  └───────────────────────────────┬──────────────────────────────┘   │
//! │                                  │ Gateway trait                    │
//! │  ┌───────────────────────────────▼──────────────────────────────┐   │
//! │  │          VsphereClient (vim25 JSON API over HTTPS)           │   │
//! │  │   session login │ container view lookup │ task polling       │   │
//! │  └──────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Pinning Geometry
//!
//! | Parameter   | Meaning                                             |
//! |-------------|-----------------------------------------------------|
//! | `start`     | first physical core of NUMA node 0                  |
//! | `stride`    | core distance between consecutive vCPUs (0 = unpin) |
//! | `num_numas` | NUMA nodes to spread the vCPUs over                 |
//! | `numa_size` | cores per NUMA node, offsets each node's first core |
//!
//! A stride of 2 skips hyperthread siblings, a stride of 1 uses every logical
//! core. See [`planner`] for the exact mapping.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmpin::{Driver, NumaLayout, RunMode, SessionConfig, StdinConfirm, VsphereClient};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> vmpin::Result<()> {
//!     let session = VsphereClient::connect(SessionConfig::new("vc.lab", "admin", "secret")).await?;
//!     let requests = vmpin::build_requests(vmpin::RequestSource::Table("vms.csv".into()))?;
//!     let mut driver = Driver::new(&session, StdinConfirm, RunMode::Apply, NumaLayout::default());
//!     driver.run(&requests, |req, outcome| println!("{}: {:?}", req.vm_name, outcome)).await?;
//!     session.logout().await
//! }
//! ```

pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod planner;
pub mod vsphere;

// Re-exports
pub use config::{PinningRequest, RequestSource, SingleVmOptions, build_requests, parse_truthy};
pub use driver::{Confirm, Driver, Outcome, RunMode, RunSummary, StdinConfirm, is_affirmative};
pub use error::{Error, Result};
pub use gateway::{Gateway, PowerState, VmHandle};
pub use planner::{
    ConfigEntry, NumaLayout, PinningParams, clear_pinning, generate_pinning, plan_pinning,
    render_pinning, render_vmx,
};
pub use vsphere::{SessionConfig, VsphereClient};
