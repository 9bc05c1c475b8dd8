//! Tests for the VM lifecycle driver.
//!
//! Runs the driver against an in-memory gateway that records every call,
//! and checks the power-off / reconfigure / power-on sequence per mode.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use vmpin::config::PinningRequest;
use vmpin::driver::{Confirm, Driver, Outcome, RunMode};
use vmpin::error::{Error, Result};
use vmpin::gateway::{Gateway, PowerState, VmHandle};
use vmpin::planner::{ConfigEntry, NumaLayout};

// =============================================================================
// Test Helpers
// =============================================================================

/// A call recorded by [`FakeGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Find(String),
    PowerState(String),
    PowerOn(String),
    PowerOff(String),
    Reconfigure(String, Vec<ConfigEntry>),
}

impl Call {
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Call::PowerOn(_) | Call::PowerOff(_) | Call::Reconfigure(..)
        )
    }
}

/// In-memory inventory that tracks power state and records calls.
struct FakeGateway {
    vms: Vec<VmHandle>,
    power: Mutex<Vec<(String, PowerState)>>,
    calls: Mutex<Vec<Call>>,
    fail_reconfigure: bool,
}

impl FakeGateway {
    fn new(vms: Vec<VmHandle>) -> Self {
        let power = vms.iter().map(|vm| (vm.id.clone(), vm.power_state)).collect();
        Self {
            vms,
            power: Mutex::new(power),
            calls: Mutex::new(Vec::new()),
            fail_reconfigure: false,
        }
    }

    fn failing_reconfigure(mut self) -> Self {
        self.fail_reconfigure = true;
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn mutating_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutating).collect()
    }

    fn reconfigurations(&self) -> Vec<Vec<ConfigEntry>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Reconfigure(_, entries) => Some(entries),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn set_power(&self, id: &str, state: PowerState) {
        let mut power = self.power.lock().unwrap();
        if let Some(entry) = power.iter_mut().find(|(vm, _)| vm == id) {
            entry.1 = state;
        }
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn find_vm(&self, name: &str) -> Result<Option<VmHandle>> {
        self.record(Call::Find(name.to_string()));
        Ok(self.vms.iter().find(|vm| vm.name == name).cloned())
    }

    async fn power_state(&self, vm: &VmHandle) -> Result<PowerState> {
        self.record(Call::PowerState(vm.name.clone()));
        let power = self.power.lock().unwrap();
        Ok(power
            .iter()
            .find(|(id, _)| *id == vm.id)
            .map(|(_, state)| *state)
            .unwrap_or(vm.power_state))
    }

    async fn power_on(&self, vm: &VmHandle) -> Result<()> {
        self.record(Call::PowerOn(vm.name.clone()));
        self.set_power(&vm.id, PowerState::PoweredOn);
        Ok(())
    }

    async fn power_off(&self, vm: &VmHandle) -> Result<()> {
        self.record(Call::PowerOff(vm.name.clone()));
        self.set_power(&vm.id, PowerState::PoweredOff);
        Ok(())
    }

    async fn reconfigure(&self, vm: &VmHandle, entries: &[ConfigEntry]) -> Result<()> {
        self.record(Call::Reconfigure(vm.name.clone(), entries.to_vec()));
        if self.fail_reconfigure {
            return Err(Error::TaskFailed {
                operation: format!("ReconfigVM_Task {}", vm.name),
                reason: "A specified parameter was not correct: sched.vcpu0.affinity".to_string(),
            });
        }
        Ok(())
    }
}

/// Scripted operator answers; panics if asked more often than scripted.
struct ScriptedConfirm {
    answers: VecDeque<bool>,
    asked: Vec<String>,
}

impl ScriptedConfirm {
    fn new(answers: &[bool]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            asked: Vec::new(),
        }
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        self.asked.push(question.to_string());
        Ok(self.answers.pop_front().expect("unexpected confirmation prompt"))
    }
}

fn vm(name: &str, id: &str, power_state: PowerState, vcpu_count: u32) -> VmHandle {
    VmHandle {
        id: id.to_string(),
        name: name.to_string(),
        power_state,
        vcpu_count,
        extra_config: vec![
            ConfigEntry::new("svga.present", "TRUE"),
            ConfigEntry::new("sched.vcpu0.affinity", "30"),
            ConfigEntry::new("sched.cpu.affinity.exclusive", "TRUE"),
        ],
    }
}

fn request(name: &str, start: u32, stride: u32, force: bool) -> PinningRequest {
    PinningRequest {
        vm_name: name.to_string(),
        start,
        stride,
        force,
    }
}

// =============================================================================
// Apply Mode Tests
// =============================================================================

#[tokio::test]
async fn test_pin_powered_off_vm() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOff, 4)]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let outcome = driver.apply(&request("db-01", 0, 2, false)).await.unwrap();
    assert_eq!(outcome, Outcome::Pinned { vcpus: 4 });

    let mutating = gateway.mutating_calls();
    assert_eq!(mutating.len(), 3, "clear, generate, power on: {mutating:?}");
    assert!(matches!(&mutating[0], Call::Reconfigure(..)));
    assert!(matches!(&mutating[1], Call::Reconfigure(..)));
    assert_eq!(mutating[2], Call::PowerOn("db-01".to_string()));

    let reconfigurations = gateway.reconfigurations();
    assert_eq!(
        reconfigurations[0],
        vec![
            ConfigEntry::new("svga.present", "TRUE"),
            ConfigEntry::new("sched.vcpu0.affinity", ""),
            ConfigEntry::new("sched.cpu.affinity.exclusive", ""),
        ]
    );
    assert_eq!(
        reconfigurations[1],
        vec![
            ConfigEntry::new("svga.present", "TRUE"),
            ConfigEntry::new("sched.vcpu0.affinity", "0"),
            ConfigEntry::new("sched.vcpu1.affinity", "2"),
            ConfigEntry::new("sched.vcpu2.affinity", "4"),
            ConfigEntry::new("sched.vcpu3.affinity", "6"),
            ConfigEntry::new("sched.cpu.affinity.exclusive", "TRUE"),
        ]
    );
}

#[tokio::test]
async fn test_forced_power_off_skips_prompt() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOn, 2)]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let outcome = driver.apply(&request("db-01", 0, 2, true)).await.unwrap();
    assert_eq!(outcome, Outcome::Pinned { vcpus: 2 });

    let mutating = gateway.mutating_calls();
    assert_eq!(mutating[0], Call::PowerOff("db-01".to_string()));
    assert_eq!(mutating.last(), Some(&Call::PowerOn("db-01".to_string())));
}

#[tokio::test]
async fn test_confirmed_power_off_proceeds() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOn, 2)]);
    let mut confirm = ScriptedConfirm::new(&[true]);
    let mut driver = Driver::new(&gateway, &mut confirm, RunMode::Apply, NumaLayout::default());

    let outcome = driver.apply(&request("db-01", 0, 2, false)).await.unwrap();
    drop(driver);

    assert_eq!(outcome, Outcome::Pinned { vcpus: 2 });
    assert_eq!(confirm.asked.len(), 1);
    assert!(confirm.asked[0].contains("db-01"));
    assert_eq!(gateway.mutating_calls()[0], Call::PowerOff("db-01".to_string()));
}

#[tokio::test]
async fn test_declined_power_off_leaves_vm_untouched() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOn, 2)]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[false]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let outcome = driver.apply(&request("db-01", 0, 2, false)).await.unwrap();

    assert_eq!(outcome, Outcome::Declined);
    assert!(gateway.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_unpin_clears_and_powers_on_without_generate() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOn, 4)]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let outcome = driver.apply(&request("db-01", 0, 0, true)).await.unwrap();
    assert_eq!(outcome, Outcome::Unpinned);

    let mutating = gateway.mutating_calls();
    assert_eq!(mutating.len(), 3, "power off, clear, power on: {mutating:?}");
    assert_eq!(mutating[0], Call::PowerOff("db-01".to_string()));
    assert_eq!(mutating[2], Call::PowerOn("db-01".to_string()));

    let reconfigurations = gateway.reconfigurations();
    assert_eq!(reconfigurations.len(), 1);
    assert!(
        reconfigurations[0]
            .iter()
            .filter(|e| e.is_pinning())
            .all(|e| e.value.is_empty())
    );
}

#[tokio::test]
async fn test_numa_layout_applies_to_every_request() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOff, 8)]);
    let layout = NumaLayout {
        num_numas: 2,
        numa_size: 4,
    };
    let mut driver = Driver::new(&gateway, ScriptedConfirm::new(&[]), RunMode::Apply, layout);

    let outcome = driver.apply(&request("db-01", 0, 1, false)).await.unwrap();
    assert_eq!(outcome, Outcome::Pinned { vcpus: 8 });

    let generated = gateway.reconfigurations().pop().unwrap();
    for i in 0..8 {
        assert!(generated.contains(&ConfigEntry::new(
            format!("sched.vcpu{i}.affinity"),
            i.to_string()
        )));
    }
}

#[tokio::test]
async fn test_task_failure_aborts_vm() {
    let gateway =
        FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOn, 2)]).failing_reconfigure();
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let result = driver.apply(&request("db-01", 0, 2, true)).await;
    assert!(matches!(result, Err(Error::TaskFailed { .. })));

    // powered off, first reconfiguration failed, nothing after it
    let mutating = gateway.mutating_calls();
    assert_eq!(mutating.len(), 2);
    assert!(!mutating.contains(&Call::PowerOn("db-01".to_string())));
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[tokio::test]
async fn test_missing_vm_is_skipped() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOff, 2)]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let requests = vec![request("ghost", 0, 2, true), request("db-01", 0, 2, true)];
    let mut seen = Vec::new();
    let summary = driver
        .run(&requests, |req, outcome| seen.push((req.vm_name.clone(), outcome.clone())))
        .await
        .unwrap();

    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.pinned, 1);
    assert_eq!(seen[0], ("ghost".to_string(), Outcome::NotFound));
    assert_eq!(seen[1].0, "db-01");
}

#[tokio::test]
async fn test_run_processes_requests_in_order() {
    let gateway = FakeGateway::new(vec![
        vm("a", "vm-1", PowerState::PoweredOff, 2),
        vm("b", "vm-2", PowerState::PoweredOff, 2),
    ]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let requests = vec![request("b", 0, 2, false), request("a", 0, 0, false)];
    let summary = driver.run(&requests, |_, _| {}).await.unwrap();
    assert_eq!(summary.pinned, 1);
    assert_eq!(summary.unpinned, 1);

    let finds: Vec<Call> = gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Find(_)))
        .collect();
    assert_eq!(finds, vec![Call::Find("b".to_string()), Call::Find("a".to_string())]);

    // all of b's calls happen before a's lookup
    let calls = gateway.calls();
    let a_lookup = calls.iter().position(|c| *c == Call::Find("a".to_string())).unwrap();
    let b_power_on = calls.iter().position(|c| *c == Call::PowerOn("b".to_string())).unwrap();
    assert!(b_power_on < a_lookup);
}

#[tokio::test]
async fn test_run_stops_at_first_failure() {
    let gateway = FakeGateway::new(vec![
        vm("a", "vm-1", PowerState::PoweredOff, 2),
        vm("b", "vm-2", PowerState::PoweredOff, 2),
    ])
    .failing_reconfigure();
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::Apply,
        NumaLayout::default(),
    );

    let requests = vec![request("a", 0, 2, true), request("b", 0, 2, true)];
    assert!(driver.run(&requests, |_, _| {}).await.is_err());
    assert!(!gateway.calls().contains(&Call::Find("b".to_string())));
}

// =============================================================================
// Read-Only Mode Tests
// =============================================================================

#[tokio::test]
async fn test_print_mode_never_mutates() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOn, 4)]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::PrintOnly,
        NumaLayout::default(),
    );

    let outcome = driver.apply(&request("db-01", 0, 2, true)).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Printed(
            "sched.vcpu0.affinity:30; sched.cpu.affinity.exclusive:TRUE; ".to_string()
        )
    );
    assert!(gateway.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_dry_run_never_mutates() {
    let gateway = FakeGateway::new(vec![vm("db-01", "vm-1", PowerState::PoweredOn, 2)]);
    let mut driver = Driver::new(
        &gateway,
        ScriptedConfirm::new(&[]),
        RunMode::DryRun,
        NumaLayout::default(),
    );

    let outcome = driver.apply(&request("db-01", 16, 2, false)).await.unwrap();

    let Outcome::Planned(entries) = outcome else {
        panic!("expected a planned outcome");
    };
    assert!(entries.contains(&ConfigEntry::new("sched.vcpu0.affinity", "16")));
    assert!(entries.contains(&ConfigEntry::new("sched.vcpu1.affinity", "18")));
    assert!(gateway.mutating_calls().is_empty());
}
