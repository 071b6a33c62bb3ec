//! Failure kinds that callers may want to tell apart.
//!
//! Everything is ultimately funneled through `failure::Error`, but these types let `main` (and
//! the tests) `downcast_ref` to find out what actually went wrong.

use failure_derive::Fail;

/// A mandatory setup step failed: a process could not be spawned, or a remote command that must
/// succeed did not. Aborts the fleet launch, which unwinds everything acquired so far.
#[derive(Debug, Fail)]
#[fail(display = "setup of vm{} failed while {}: {}", vm, step, cause)]
pub struct SetupError {
    pub vm: usize,
    pub step: String,
    pub cause: String,
}

/// The virtual network could not be reached or one of the host networking commands exited
/// non-zero.
#[derive(Debug, Fail)]
pub enum NetworkError {
    #[fail(display = "virtual network `{}` is unreachable: {}", network, cause)]
    Unreachable { network: String, cause: String },

    #[fail(display = "network provisioning for vm{} failed: {}", vm, causes)]
    Provision { vm: usize, causes: String },
}

/// A command run in a guest over SSH failed (only raised in `check` mode).
#[derive(Debug, Fail)]
#[fail(display = "`{}` failed in vm{}: {}", cmd, vm, cause)]
pub struct RemoteCommandError {
    pub vm: usize,
    pub cmd: String,
    pub cause: String,
}

/// A command run on the local host failed.
#[derive(Debug, Fail)]
pub enum CommandError {
    #[fail(display = "unable to start `{}`: {}", cmd, cause)]
    Spawn { cmd: String, cause: String },

    #[fail(display = "`{}` exited with {:?}: {}", cmd, code, stderr)]
    Status {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// A bounded wait gave up.
#[derive(Debug, Fail)]
pub enum TimeoutError {
    #[fail(display = "timed out after {:?} waiting for {}", waited, what)]
    Deadline {
        what: String,
        waited: std::time::Duration,
    },

    #[fail(display = "cancelled while waiting for {}", what)]
    Cancelled { what: String },
}

/// A benchmark client exited unsuccessfully. Recorded next to the client's output; never raised.
#[derive(Debug, Clone, Fail)]
#[fail(display = "client for vm{} exited with {:?}", vm, code)]
pub struct BenchmarkClientError {
    pub vm: usize,
    pub code: Option<i32>,
}

/// One failed step of a teardown. Teardown never raises these; it collects and logs them.
#[derive(Debug, Fail)]
#[fail(display = "teardown of {}: {}", what, cause)]
pub struct TeardownError {
    pub what: String,
    pub cause: String,
}

impl TeardownError {
    pub fn new(what: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        TeardownError {
            what: what.into(),
            cause: cause.to_string(),
        }
    }
}
