//! # VM Lifecycle Driver
//!
//! Applies [`PinningRequest`]s one VM at a time through a [`Gateway`].
//!
//! ## Per-VM Flow
//!
//! ```text
//!   LOOKUP ──not found──► NotFound
//!     │
//!     ├── print mode ───► Printed   (no mutating call)
//!     ├── dry run ──────► Planned   (no mutating call)
//!     ▼
//!   POWER-OFF ──declined──► Declined   (VM untouched)
//!     │
//!   CLEAR-PIN ──stride 0──► POWER-ON ──► Unpinned
//!     │
//!   GENERATE-PIN ─────────► POWER-ON ──► Pinned
//! ```
//!
//! Every step waits for the remote task before the next one starts. A failed
//! task aborts the VM and the run; nothing is retried.

use crate::config::PinningRequest;
use crate::constants::AFFIRMATIVE_ANSWERS;
use crate::error::Result;
use crate::gateway::{Gateway, PowerState, VmHandle};
use crate::planner::{
    ConfigEntry, NumaLayout, PinningParams, clear_pinning, plan_pinning, render_pinning,
};
use std::io::{BufRead, Write};
use tracing::{info, warn};

// =============================================================================
// Confirmation
// =============================================================================

/// Asks the operator before a running VM is powered off.
pub trait Confirm {
    /// Returns true if the operator agreed.
    fn confirm(&mut self, question: &str) -> Result<bool>;
}

impl<C: Confirm + ?Sized> Confirm for &mut C {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        (**self).confirm(question)
    }
}

/// Asks on stdout and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        let mut stdout = std::io::stdout().lock();
        write!(stdout, "{question} [y/N] ")?;
        stdout.flush()?;

        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(is_affirmative(&answer))
    }
}

/// Returns true for `y` or `yes`, ignoring case and surrounding whitespace.
pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer.trim().to_lowercase();
    AFFIRMATIVE_ANSWERS.contains(&answer.as_str())
}

// =============================================================================
// Outcomes
// =============================================================================

/// What a run does with each VM it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Power off, reconfigure, power on.
    #[default]
    Apply,
    /// Show the current pinning entries.
    PrintOnly,
    /// Compute the entries an apply would submit.
    DryRun,
}

/// Result of processing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Print mode: current pinning as `key:value; ` pairs.
    Printed(String),
    /// Dry run: the list the generate-stage reconfiguration would submit.
    Planned(Vec<ConfigEntry>),
    /// No VM with that name.
    NotFound,
    /// Operator declined the power-off. Nothing was changed.
    Declined,
    /// Pinning removed, VM powered back on.
    Unpinned,
    /// New pinning applied, VM powered back on.
    Pinned { vcpus: u64 },
}

/// Per-outcome counters of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub printed: usize,
    pub planned: usize,
    pub not_found: usize,
    pub declined: usize,
    pub unpinned: usize,
    pub pinned: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Printed(_) => self.printed += 1,
            Outcome::Planned(_) => self.planned += 1,
            Outcome::NotFound => self.not_found += 1,
            Outcome::Declined => self.declined += 1,
            Outcome::Unpinned => self.unpinned += 1,
            Outcome::Pinned { .. } => self.pinned += 1,
        }
    }

    /// Requests that were skipped (not found or declined).
    pub fn skipped(&self) -> usize {
        self.not_found + self.declined
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Drives the power-off / reconfigure / power-on sequence.
pub struct Driver<'a, G: Gateway + ?Sized, C: Confirm> {
    gateway: &'a G,
    confirm: C,
    mode: RunMode,
    layout: NumaLayout,
}

impl<'a, G: Gateway + ?Sized, C: Confirm> Driver<'a, G, C> {
    /// Creates a driver for one run.
    pub fn new(gateway: &'a G, confirm: C, mode: RunMode, layout: NumaLayout) -> Self {
        if layout.num_numas > 1 && layout.numa_size == 0 {
            warn!(
                num_numas = layout.num_numas,
                "numa size is 0, every NUMA node starts at the same core"
            );
        }
        Self {
            gateway,
            confirm,
            mode,
            layout,
        }
    }

    /// Applies `requests` in order, reporting each outcome as it happens.
    ///
    /// Stops at the first error.
    pub async fn run<F>(
        &mut self,
        requests: &[PinningRequest],
        mut report: F,
    ) -> Result<RunSummary>
    where
        F: FnMut(&PinningRequest, &Outcome),
    {
        let mut summary = RunSummary::default();
        for request in requests {
            let outcome = self.apply(request).await?;
            summary.record(&outcome);
            report(request, &outcome);
        }
        Ok(summary)
    }

    /// Processes a single request.
    pub async fn apply(&mut self, request: &PinningRequest) -> Result<Outcome> {
        let Some(vm) = self.gateway.find_vm(&request.vm_name).await? else {
            warn!(vm = %request.vm_name, "virtual machine not found");
            return Ok(Outcome::NotFound);
        };

        match self.mode {
            RunMode::PrintOnly => return Ok(Outcome::Printed(render_pinning(&vm.extra_config))),
            RunMode::DryRun => {
                let cleared = clear_pinning(&vm.extra_config);
                let planned = plan_pinning(&cleared, &self.params(request, &vm));
                return Ok(Outcome::Planned(planned));
            }
            RunMode::Apply => {}
        }

        info!(vm = %vm.name, vcpus = vm.vcpu_count, stride = request.stride, "performing pinning");

        if !self.ensure_powered_off(&vm, request.force).await? {
            warn!(vm = %vm.name, "denied permission to power off VM, skipping pinning");
            return Ok(Outcome::Declined);
        }

        let cleared = clear_pinning(&vm.extra_config);
        self.gateway.reconfigure(&vm, &cleared).await?;

        if request.stride == 0 {
            info!(vm = %vm.name, "pinning removed, new pinning not needed");
            self.ensure_powered_on(&vm).await?;
            return Ok(Outcome::Unpinned);
        }

        let params = self.params(request, &vm);
        let planned = plan_pinning(&cleared, &params);
        self.gateway.reconfigure(&vm, &planned).await?;
        self.ensure_powered_on(&vm).await?;

        Ok(Outcome::Pinned {
            vcpus: params.pinned_vcpus(),
        })
    }

    fn params(&self, request: &PinningRequest, vm: &VmHandle) -> PinningParams {
        PinningParams {
            start: request.start,
            vcpu_count: vm.vcpu_count,
            stride: request.stride,
            layout: self.layout,
        }
    }

    /// Returns false if the operator declined the power-off.
    async fn ensure_powered_off(&mut self, vm: &VmHandle, force: bool) -> Result<bool> {
        let state = self.gateway.power_state(vm).await?;
        if state == PowerState::PoweredOff {
            return Ok(true);
        }

        if !force {
            let question = format!(
                "VM {} is {}. It must be shut down to proceed. Continue?",
                vm.name, state
            );
            if !self.confirm.confirm(&question)? {
                return Ok(false);
            }
        }

        info!(vm = %vm.name, from = %state, "shutting down VM");
        self.gateway.power_off(vm).await?;
        Ok(true)
    }

    async fn ensure_powered_on(&self, vm: &VmHandle) -> Result<()> {
        let state = self.gateway.power_state(vm).await?;
        if state == PowerState::PoweredOn {
            return Ok(());
        }
        info!(vm = %vm.name, from = %state, "starting VM");
        self.gateway.power_on(vm).await
    }
}
