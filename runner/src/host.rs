//! Running things on the local host: one-shot commands and long-lived child processes.
//!
//! The fleet code only talks to the host through the `Host` trait so that the lifecycle logic can
//! be exercised without root, a hypervisor, or a bridge.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use log::debug;

use crate::error::CommandError;

/// A command line plus an optional working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        HostCommand {
            program: program.into(),
            args: vec![],
            cwd: None,
        }
    }

    /// Build from an argv vector. Panics on an empty vector.
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Self {
        let mut cmd = HostCommand::new(argv[0].as_ref());
        cmd.args = argv[1..].iter().map(|a| a.as_ref().to_owned()).collect();
        cmd
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args.extend(args.iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_owned());
        self
    }

    /// The full command line, for logs and error messages.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A child process we own.
pub trait Process {
    fn id(&self) -> u32;

    /// Ask the process to exit (SIGTERM). Terminating a process that already exited is not an
    /// error.
    fn terminate(&mut self) -> Result<(), failure::Error>;

    /// Block until the process exits and return its output. Calling this again returns the same
    /// output.
    fn wait(&mut self) -> Result<ProcessOutput, failure::Error>;
}

pub trait Host {
    /// Run `cmd` to completion. Fails with `CommandError` on a non-zero exit.
    fn run(&self, cmd: &HostCommand) -> Result<String, failure::Error>;

    /// Start `cmd` in the background with its stdout/stderr captured.
    fn spawn(&self, cmd: &HostCommand) -> Result<Box<dyn Process>, failure::Error>;
}

/// The machine we are running on.
#[derive(Debug, Default)]
pub struct LocalHost;

impl LocalHost {
    fn command(cmd: &HostCommand) -> Command {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl Host for LocalHost {
    fn run(&self, cmd: &HostCommand) -> Result<String, failure::Error> {
        debug!("host: {}", cmd);

        let output = LocalHost::command(cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CommandError::Spawn {
                cmd: cmd.to_string(),
                cause: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(CommandError::Status {
                cmd: cmd.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, cmd: &HostCommand) -> Result<Box<dyn Process>, failure::Error> {
        let mut child = LocalHost::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CommandError::Spawn {
                cmd: cmd.to_string(),
                cause: e.to_string(),
            })?;

        debug!("host: spawned pid {}: {}", child.id(), cmd);

        // Both pipes are drained from the start, so a chatty child never blocks on a full pipe
        // while we are busy waiting for one of its siblings.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        Ok(Box::new(LocalProcess {
            pid: child.id(),
            child: Some(child),
            stdout,
            stderr,
            output: None,
        }))
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = vec![];
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let buf = reader
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    String::from_utf8_lossy(&buf).into_owned()
}

/// A `std::process::Child` that remembers its output once reaped.
#[derive(Debug)]
pub struct LocalProcess {
    pid: u32,
    child: Option<Child>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    output: Option<ProcessOutput>,
}

impl Process for LocalProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> Result<(), failure::Error> {
        // Already reaped: the pid may have been reused, so don't signal it.
        if self.child.is_none() {
            return Ok(());
        }

        let ret = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                failure::bail!("unable to signal pid {}: {}", self.pid, err);
            }
        }

        Ok(())
    }

    fn wait(&mut self) -> Result<ProcessOutput, failure::Error> {
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            self.output = Some(ProcessOutput {
                code: status.code(),
                stdout: collect(self.stdout.take()),
                stderr: collect(self.stderr.take()),
            });
        }

        Ok(self.output.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let out = LocalHost
            .run(&HostCommand::new("sh").args(&["-c", "echo hello"]))
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn run_reports_failures() {
        let err = LocalHost
            .run(&HostCommand::new("sh").args(&["-c", "echo oops >&2; exit 3"]))
            .unwrap_err();
        match err.downcast_ref::<CommandError>() {
            Some(CommandError::Status { code, stderr, .. }) => {
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = LocalHost
            .spawn(&HostCommand::new("/definitely/not/a/binary"))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<CommandError>(),
            Some(CommandError::Spawn { .. })
        ));
    }

    #[test]
    fn terminate_then_wait_is_idempotent() {
        let mut p = LocalHost
            .spawn(&HostCommand::new("sleep").arg("30"))
            .unwrap();
        p.terminate().unwrap();
        let out = p.wait().unwrap();
        assert!(!out.success());

        // Second round is a no-op.
        p.terminate().unwrap();
        assert_eq!(p.wait().unwrap(), out);
    }

    #[test]
    fn wait_collects_both_streams() {
        let mut p = LocalHost
            .spawn(&HostCommand::new("sh").args(&["-c", "echo out; echo err >&2"]))
            .unwrap();
        let out = p.wait().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[test]
    fn output_is_drained_before_wait() {
        let marker = std::env::temp_dir().join(format!("fleet-runner-drain-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);

        // More than a pipe buffer's worth, then leave a mark. Without a reader the child would
        // block in `head` and never get to `touch`.
        let script = format!("head -c 300000 /dev/zero; touch '{}'", marker.display());
        let mut p = LocalHost
            .spawn(&HostCommand::new("sh").args(&["-c", &script]))
            .unwrap();

        let start = std::time::Instant::now();
        while !marker.exists() {
            assert!(
                start.elapsed() < std::time::Duration::from_secs(10),
                "child blocked on a full pipe"
            );
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let out = p.wait().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.len(), 300000);
        std::fs::remove_file(&marker).unwrap();
    }

    #[test]
    fn command_display() {
        let cmd = HostCommand::from_argv(&["sudo", "ip", "tuntap", "add", "ich0"]).cwd("/tmp");
        assert_eq!(cmd.to_string(), "sudo ip tuntap add ich0");
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
    }
}
