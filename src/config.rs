//! # Configuration Builder
//!
//! Produces the ordered list of [`PinningRequest`]s for a run, either from a
//! single set of CLI options or from a tabular input file.
//!
//! ## Tabular Input
//!
//! Comma-separated rows in a fixed column order, without a header row:
//!
//! ```text
//! vm_name,start,stride,force
//! db-01,0,2,yes
//! db-02,32,2,no
//! ```
//!
//! The first row is data. Fields are trimmed, blank lines are skipped and
//! extra trailing columns are ignored. A row with missing columns or a
//! non-integer `start`/`stride` fails the whole build, so no VM is touched
//! when the file is malformed.

use crate::constants::{INPUT_COLUMNS, NO_HT_STRIDE, TRUTHY_VALUES, UNPIN_STRIDE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One VM to (re)pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinningRequest {
    /// Inventory name of the VM.
    pub vm_name: String,
    /// First physical core.
    pub start: u32,
    /// Core stride. 0 removes pinning.
    pub stride: u32,
    /// Power the VM off without asking.
    pub force: bool,
}

/// Pinning options for a single VM, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleVmOptions {
    pub vm_name: String,
    pub start: u32,
    pub stride: u32,
    pub force: bool,
    /// Remove pinning (stride 0). Wins over `no_ht`.
    pub unpin: bool,
    /// Pin every logical core (stride 1).
    pub no_ht: bool,
}

impl SingleVmOptions {
    /// Stride after applying the `unpin` and `no_ht` overrides.
    pub fn effective_stride(&self) -> u32 {
        if self.unpin {
            UNPIN_STRIDE
        } else if self.no_ht {
            NO_HT_STRIDE
        } else {
            self.stride
        }
    }

    /// Converts the options into a request.
    pub fn into_request(self) -> PinningRequest {
        let stride = self.effective_stride();
        PinningRequest {
            vm_name: self.vm_name,
            start: self.start,
            stride,
            force: self.force,
        }
    }
}

/// Where the requests of a run come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSource {
    /// One VM from CLI options.
    Single(SingleVmOptions),
    /// One VM per row of a CSV file.
    Table(PathBuf),
}

/// Builds the ordered requests of a run.
pub fn build_requests(source: RequestSource) -> Result<Vec<PinningRequest>> {
    match source {
        RequestSource::Single(options) => {
            if options.vm_name.trim().is_empty() {
                return Err(Error::InvalidConfig("VM name must not be empty".to_string()));
            }
            Ok(vec![options.into_request()])
        }
        RequestSource::Table(path) => requests_from_csv(&path),
    }
}

/// Reads requests from a CSV file.
pub fn requests_from_csv(path: &Path) -> Result<Vec<PinningRequest>> {
    let file = std::fs::File::open(path)?;
    let requests = requests_from_reader(file)?;
    debug!(path = %path.display(), count = requests.len(), "loaded pinning requests");
    Ok(requests)
}

/// Reads requests from CSV text, one per row, in row order.
pub fn requests_from_reader<R: Read>(reader: R) -> Result<Vec<PinningRequest>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut requests = Vec::new();
    for record in csv_reader.records() {
        let record = record.map_err(|e| Error::MalformedRow {
            line: e.position().map(|p| p.line()).unwrap_or_default(),
            reason: e.to_string(),
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        if record.len() < INPUT_COLUMNS {
            return Err(Error::MalformedRow {
                line,
                reason: format!(
                    "expected {} columns (vm_name, start, stride, force), found {}",
                    INPUT_COLUMNS,
                    record.len()
                ),
            });
        }

        if record[0].is_empty() {
            return Err(Error::MalformedRow {
                line,
                reason: "vm_name is empty".to_string(),
            });
        }

        requests.push(PinningRequest {
            vm_name: record[0].to_string(),
            start: parse_column(&record[1], "start", line)?,
            stride: parse_column(&record[2], "stride", line)?,
            force: parse_truthy(&record[3]),
        });
    }

    Ok(requests)
}

fn parse_column(value: &str, column: &str, line: u64) -> Result<u32> {
    value.parse().map_err(|e| Error::MalformedRow {
        line,
        reason: format!("{column} '{value}' is not a non-negative integer: {e}"),
    })
}

/// Returns true for `true`, `1`, `y`, `yes` and `t`, in any case.
pub fn parse_truthy(value: &str) -> bool {
    let value = value.to_lowercase();
    TRUTHY_VALUES.contains(&value.as_str())
}
