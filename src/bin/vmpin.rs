//! vmpin - pin VM vCPUs to physical CPUs through vCenter
//!
//! ## Usage
//!
//! ```sh
//! vmpin --host vc.lab --user administrator@vsphere.local --vm-name db-01 -s 0 -t 2
//! vmpin --host vc.lab --user admin --vm-name db-01 --no-pin --force
//! vmpin --host vc.lab --user admin --input vms.csv -n 2 -z 32
//! vmpin --host vc.lab --user admin --vm-name db-01 --print
//! ```
//!
//! The password is read from `--password`, `VMPIN_PASSWORD`, or a hidden
//! prompt, in that order.

use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vmpin::constants::{
    DEFAULT_API_RELEASE, DEFAULT_NUM_NUMAS, DEFAULT_NUMA_SIZE, DEFAULT_START, DEFAULT_STRIDE,
};
use vmpin::{
    Driver, NumaLayout, Outcome, PinningRequest, RequestSource, RunMode, SessionConfig,
    SingleVmOptions, StdinConfirm, VsphereClient, build_requests, render_vmx,
};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "vmpin", version, about = "Pin a VM's vCPUs to physical CPUs")]
#[command(group(ArgGroup::new("target").required(true).args(["vm_name", "input"])))]
struct Cli {
    /// vCenter host, e.g. abc.vcsa.com
    #[arg(long, env = "VMPIN_HOST")]
    host: String,

    /// Privileged user to reconfigure VMs, e.g. administrator@vsphere.local
    #[arg(long, env = "VMPIN_USER")]
    user: String,

    /// Password of the account. Prompted for when omitted
    #[arg(long, env = "VMPIN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Print the current pinning instead of updating
    #[arg(long, conflicts_with = "dry_run")]
    print: bool,

    /// Print the pinning that would be applied, without touching the VM
    #[arg(long)]
    dry_run: bool,

    /// Name of the virtual machine to pin
    #[arg(long)]
    vm_name: Option<String>,

    /// Ignore TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Remove pinning from the VM. Equivalent to stride 0
    #[arg(long)]
    no_pin: bool,

    /// Pin every logical core. Equivalent to stride 1
    #[arg(long)]
    no_ht: bool,

    /// Starting CPU/thread to pin from
    #[arg(short, long, default_value_t = DEFAULT_START)]
    start: u32,

    /// Distance between pinned cores. 2 skips hyperthread siblings
    #[arg(short = 't', long, default_value_t = DEFAULT_STRIDE)]
    stride: u32,

    /// Shut the VM down without prompting if it is powered on
    #[arg(short, long)]
    force: bool,

    /// CSV file for batch operations (vm_name,start,stride,force per row)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of NUMA nodes to spread the vCPUs over
    #[arg(
        short,
        long,
        default_value_t = DEFAULT_NUM_NUMAS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    num_numas: u32,

    /// Cores per NUMA node. Needed when --num-numas is above 1
    #[arg(short = 'z', long, default_value_t = DEFAULT_NUMA_SIZE)]
    numa_size: u32,

    /// vim25 JSON API release used in request paths
    #[arg(long, env = "VMPIN_API_RELEASE", default_value = DEFAULT_API_RELEASE)]
    api_release: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn request_source(&self) -> RequestSource {
        match (&self.input, &self.vm_name) {
            (Some(path), _) => RequestSource::Table(path.clone()),
            (None, vm_name) => RequestSource::Single(SingleVmOptions {
                vm_name: vm_name.clone().unwrap_or_default(),
                start: self.start,
                stride: self.stride,
                force: self.force,
                unpin: self.no_pin,
                no_ht: self.no_ht,
            }),
        }
    }

    fn mode(&self) -> RunMode {
        if self.print {
            RunMode::PrintOnly
        } else if self.dry_run {
            RunMode::DryRun
        } else {
            RunMode::Apply
        }
    }

    fn layout(&self) -> NumaLayout {
        NumaLayout {
            num_numas: self.num_numas,
            numa_size: self.numa_size,
        }
    }
}

fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

// =============================================================================
// Run
// =============================================================================

/// Stdout text for an outcome. Skips are already logged by the driver.
fn report_text(request: &PinningRequest, outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::Printed(pinning) => Some(format!("{}: {}\n", request.vm_name, pinning)),
        Outcome::Planned(entries) => {
            let vmx = render_vmx(entries);
            if vmx.is_empty() {
                Some(format!("# {}: no pinning\n", request.vm_name))
            } else {
                Some(format!("# {}\n{}", request.vm_name, vmx))
            }
        }
        Outcome::NotFound | Outcome::Declined => None,
        Outcome::Unpinned => Some(format!("{}: pinning removed\n", request.vm_name)),
        Outcome::Pinned { vcpus } => Some(format!("{}: pinned {} vCPUs\n", request.vm_name, vcpus)),
    }
}

fn report(request: &PinningRequest, outcome: &Outcome) {
    if let Some(text) = report_text(request, outcome) {
        print!("{text}");
    }
}

async fn run(cli: Cli) -> vmpin::Result<()> {
    let requests = build_requests(cli.request_source())?;

    let password = match &cli.password {
        Some(password) => password.clone(),
        None => rpassword::prompt_password(format!(
            "Password for the provided user account {}: ",
            cli.user
        ))?,
    };

    let config = SessionConfig::new(&cli.host, &cli.user, password)
        .with_insecure(cli.insecure)
        .with_api_release(&cli.api_release);
    let session = VsphereClient::connect(config).await?;
    info!(
        host = %session.host(),
        product = session.product().unwrap_or("unknown"),
        "established session with vCenter"
    );

    let mut driver = Driver::new(&session, StdinConfirm, cli.mode(), cli.layout());
    let result = driver.run(&requests, report).await;

    if let Err(e) = session.logout().await {
        warn!(error = %e, "failed to close session");
    }

    let summary = result?;
    info!(
        requests = requests.len(),
        pinned = summary.pinned,
        unpinned = summary.unpinned,
        skipped = summary.skipped(),
        "run complete"
    );
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut argv = vec!["vmpin", "--host", "vc.lab", "--user", "admin", "--password", "pw"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--vm-name", "db-01"]).unwrap();
        assert_eq!(cli.start, 0);
        assert_eq!(cli.stride, 2);
        assert_eq!(cli.num_numas, 1);
        assert_eq!(cli.numa_size, 0);
        assert_eq!(cli.mode(), RunMode::Apply);
    }

    #[test]
    fn test_target_is_required() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--vm-name", "a", "--input", "vms.csv"]).is_err());
    }

    #[test]
    fn test_no_pin_wins_in_request_source() {
        let cli = parse(&["--vm-name", "db-01", "--no-pin", "--no-ht", "-t", "4"]).unwrap();
        let RequestSource::Single(options) = cli.request_source() else {
            panic!("expected single-VM source");
        };
        assert_eq!(options.effective_stride(), 0);
    }

    #[test]
    fn test_num_numas_must_be_positive() {
        assert!(parse(&["--vm-name", "db-01", "-n", "0"]).is_err());
    }

    #[test]
    fn test_skipped_outcomes_print_nothing() {
        let request = PinningRequest {
            vm_name: "db-01".to_string(),
            start: 0,
            stride: 2,
            force: false,
        };
        assert_eq!(report_text(&request, &Outcome::NotFound), None);
        assert_eq!(report_text(&request, &Outcome::Declined), None);
        assert_eq!(
            report_text(&request, &Outcome::Pinned { vcpus: 4 }).as_deref(),
            Some("db-01: pinned 4 vCPUs\n")
        );
    }

    #[test]
    fn test_print_and_dry_run_conflict() {
        assert!(parse(&["--vm-name", "db-01", "--print", "--dry-run"]).is_err());
    }
}
