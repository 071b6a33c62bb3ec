//! Running commands inside the guests.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use log::{debug, info};

use spurs::{cmd, Execute, SshShell};
use spurs_util::escape_for_bash;

use crate::error::RemoteCommandError;
use crate::poll::{poll_until, CancelToken, PollPolicy};

/// Enough of a VM's identity to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub id: usize,
    pub ip: Ipv4Addr,
}

/// Join an argv into a single shell command line, quoting where needed.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| {
            let a = a.as_ref();
            if !a.is_empty()
                && a.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_=./:,@+%".contains(c))
            {
                a.to_owned()
            } else {
                format!("'{}'", a.replace('\'', r#"'"'"'"#))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub trait RemoteExec {
    /// Run `argv` in `guest` and return its stdout. With `check`, a non-zero exit is a
    /// `RemoteCommandError`; without it, output is returned regardless of exit status.
    fn run(&self, guest: &Guest, argv: &[String], check: bool)
        -> Result<String, RemoteCommandError>;

    /// Start `argv` in a detached terminal session named `session` that outlives the SSH
    /// connection. When `pipe_to` is given, everything the session prints is written to that
    /// guest file, replacing its previous contents.
    fn run_detached(
        &self,
        guest: &Guest,
        session: &str,
        argv: &[String],
        pipe_to: Option<&str>,
    ) -> Result<(), RemoteCommandError>;

    /// Returns true if the guest accepts a connection and runs a trivial command.
    fn probe(&self, guest: &Guest) -> bool;
}

/// Block until `guest` answers over SSH.
pub fn wait_for_boot(
    remote: &dyn RemoteExec,
    guest: &Guest,
    policy: &PollPolicy,
    cancel: &CancelToken,
) -> Result<(), failure::Error> {
    poll_until(policy, cancel, &format!("vm{} to boot", guest.id), || {
        Ok(remote.probe(guest))
    })?;
    info!("vm{} is up at {}", guest.id, guest.ip);
    Ok(())
}

/// Returns true while the detached session `session` exists in `guest`. A guest that cannot be
/// reached counts as still running; the caller's deadline bounds how long that can go on.
pub fn session_running(remote: &dyn RemoteExec, guest: &Guest, session: &str) -> bool {
    match remote.run(guest, &argv!["tmux", "ls", "-F", "#S"], false) {
        Ok(out) => out.lines().any(|l| l.trim() == session),
        Err(e) => {
            debug!("{}", e);
            true
        }
    }
}

/// Run the same command in every guest, in order. Fails on the first error in `check` mode.
pub fn run_all(
    remote: &dyn RemoteExec,
    guests: &[Guest],
    argv: &[String],
    check: bool,
) -> Result<Vec<String>, RemoteCommandError> {
    guests
        .iter()
        .map(|guest| remote.run(guest, argv, check))
        .collect()
}

/// Fails unless something accepts a TCP connection at `addr` within `timeout`.
pub fn check_reachable(addr: SocketAddr, timeout: Duration) -> std::io::Result<()> {
    TcpStream::connect_timeout(&addr, timeout).map(|_| ())
}

/// Talks to guests over SSH with the user's default key. Host keys are not verified; the guests
/// are ephemeral and only reachable over the local bridge.
#[derive(Debug, Clone)]
pub struct SshRemote {
    username: String,
    port: u16,
    /// Bound on reaching the SSH port before a session is opened.
    connect_timeout: Duration,
}

impl SshRemote {
    pub fn new(username: &str, connect_timeout: Duration) -> Self {
        SshRemote {
            username: username.into(),
            port: 22,
            connect_timeout,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn connect(&self, guest: &Guest) -> Result<SshShell, failure::Error> {
        // spurs has no connect timeout, so find out quickly whether anyone is listening.
        let addr = SocketAddr::from((guest.ip, self.port));
        check_reachable(addr, self.connect_timeout).map_err(|e| {
            failure::format_err!(
                "vm{}: {} not reachable within {:?}: {}",
                guest.id,
                addr,
                self.connect_timeout,
                e
            )
        })?;

        Ok(SshShell::with_default_key(
            &self.username,
            (guest.ip, self.port),
        )?)
    }
}

impl RemoteExec for SshRemote {
    fn run(
        &self,
        guest: &Guest,
        argv: &[String],
        check: bool,
    ) -> Result<String, RemoteCommandError> {
        let line = shell_join(argv);
        let fail = |cause: String| RemoteCommandError {
            vm: guest.id,
            cmd: line.clone(),
            cause,
        };

        let shell = self.connect(guest).map_err(|e| fail(e.to_string()))?;

        let cmd = if check {
            cmd!("{}", line)
        } else {
            cmd!("{}", line).allow_error()
        };

        match shell.run(cmd) {
            Ok(out) => Ok(out.stdout),
            Err(e) => Err(fail(e.to_string())),
        }
    }

    fn run_detached(
        &self,
        guest: &Guest,
        session: &str,
        argv: &[String],
        pipe_to: Option<&str>,
    ) -> Result<(), RemoteCommandError> {
        let inner = escape_for_bash(&shell_join(argv));
        let tmux = match pipe_to {
            Some(file) => format!(
                "tmux new -d -s {} '{}' \\; pipe-pane 'cat > {}'",
                session, inner, file
            ),
            None => format!("tmux new -d -s {} '{}'", session, inner),
        };

        debug!("vm{}: detached `{}`", guest.id, tmux);

        let shell = self.connect(guest).map_err(|e| RemoteCommandError {
            vm: guest.id,
            cmd: tmux.clone(),
            cause: e.to_string(),
        })?;
        shell
            .run(cmd!("{}", tmux))
            .map(|_| ())
            .map_err(|e| RemoteCommandError {
                vm: guest.id,
                cmd: tmux.clone(),
                cause: e.to_string(),
            })
    }

    fn probe(&self, guest: &Guest) -> bool {
        match self.connect(guest) {
            Ok(shell) => shell.run(cmd!("uname -a")).is_ok(),
            Err(_) => false,
        }
    }
}
