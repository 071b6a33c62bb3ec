//! Benchmarks that run across a booted fleet.

pub mod graph;
pub mod kv;
pub mod manual;

use std::time::Duration;

use crate::config::HostConfig;
use crate::error::BenchmarkClientError;
use crate::fleet::Fleet;
use crate::host::{Host, ProcessOutput};
use crate::poll::CancelToken;
use crate::remote::RemoteExec;
use crate::timings_str;

/// Everything a benchmark needs besides the fleet itself.
pub struct BenchContext<'a> {
    pub host: &'a dyn Host,
    pub remote: &'a dyn RemoteExec,
    pub cfg: &'a HostConfig,
    pub cancel: &'a CancelToken,
}

/// One benchmark protocol. `run` blocks until the benchmark is done in every VM.
pub trait Benchmark {
    /// A short name for logs and file names, e.g. `redis-ycsb-A`.
    fn name(&self) -> String;

    fn run(
        &mut self,
        ctx: &BenchContext<'_>,
        fleet: &mut Fleet<'_>,
    ) -> Result<BenchmarkRun, failure::Error>;
}

/// Progress of a client/server benchmark run. Only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    NotStarted,
    ServerStarting,
    WaitingPreload,
    ClientsRunning,
    Collected,
}

/// What one client process targeting one VM produced.
#[derive(Debug, Clone)]
pub struct ClientResult {
    pub vm: usize,
    pub output: ProcessOutput,
    /// Set if the client exited unsuccessfully. Sibling clients are unaffected.
    pub error: Option<BenchmarkClientError>,
}

impl ClientResult {
    pub fn new(vm: usize, output: ProcessOutput) -> Self {
        let error = if output.success() {
            None
        } else {
            Some(BenchmarkClientError {
                vm,
                code: output.code,
            })
        };
        ClientResult { vm, output, error }
    }
}

/// The outcome of one benchmark across the fleet.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkRun {
    pub workload: String,
    /// One endpoint per VM, in VM order.
    pub targets: Vec<String>,
    pub record_count: Option<usize>,
    pub operation_count: Option<usize>,
    /// Client results, in VM order.
    pub results: Vec<ClientResult>,
    /// Per-VM text collected from the guests after the run (e.g. `dmesg`), in VM order per label.
    pub sections: Vec<(String, Vec<String>)>,
    pub timings: Vec<(&'static str, Duration)>,
}

impl BenchmarkRun {
    pub fn new(workload: impl Into<String>) -> Self {
        BenchmarkRun {
            workload: workload.into(),
            ..BenchmarkRun::default()
        }
    }

    pub fn failed_clients(&self) -> Vec<&BenchmarkClientError> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_ref())
            .collect()
    }

    /// The results as the log parser expects them: `vm<i> stdout:`/`vm<i> stderr:` blocks in VM
    /// order, then one `vm<i> <label>:` block per VM for every section, then the timings.
    pub fn report(&self) -> String {
        let mut s = String::new();

        for r in &self.results {
            s.push_str(&format!(
                "vm{} stdout:\n{}\nvm{} stderr:\n{}\n",
                r.vm, r.output.stdout, r.vm, r.output.stderr
            ));
        }

        for (label, outputs) in &self.sections {
            for (i, out) in outputs.iter().enumerate() {
                s.push_str(&format!("vm{} {}:\n{}\n", i, label, out));
            }
        }

        s.push_str(&timings_str(&self.timings));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32, stdout: &str) -> ProcessOutput {
        ProcessOutput {
            code: Some(code),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[test]
    fn failed_client_is_recorded_not_raised() {
        let mut run = BenchmarkRun::new("A");
        run.results.push(ClientResult::new(0, output(0, "ok")));
        run.results.push(ClientResult::new(1, output(2, "partial")));

        let failed = run.failed_clients();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].vm, 1);
        assert_eq!(failed[0].code, Some(2));
        assert_eq!(run.results[1].output.stdout, "partial");
    }

    #[test]
    fn report_blocks_are_tagged_by_vm() {
        let mut run = BenchmarkRun::new("A");
        run.results.push(ClientResult::new(0, output(0, "zero")));
        run.results.push(ClientResult::new(1, output(0, "one")));
        run.sections
            .push(("dmesg".into(), vec!["d0".into(), "d1".into()]));
        run.timings.push(("clients", Duration::from_secs(3)));

        let report = run.report();
        let zero = report.find("vm0 stdout:\nzero").unwrap();
        let one = report.find("vm1 stdout:\none").unwrap();
        assert!(zero < one);
        assert!(report.contains("vm1 dmesg:\nd1"));
        assert!(report.contains("clients: 3s"));
    }

    #[test]
    fn states_only_move_forward() {
        assert!(RunState::NotStarted < RunState::ServerStarting);
        assert!(RunState::WaitingPreload < RunState::ClientsRunning);
        assert!(RunState::ClientsRunning < RunState::Collected);
    }
}
