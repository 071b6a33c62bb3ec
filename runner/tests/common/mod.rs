//! In-memory stand-ins for the host and the guests.
//!
//! `FakeHost` tracks live processes, DHCP leases, and tap devices, so tests can check that
//! nothing is left behind. `FakeRemote` answers the handful of guest commands the benchmarks use.
//! Both append to one shared event log so tests can check the order of things across the two.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use fleet_runner::config::HostConfig;
use fleet_runner::error::RemoteCommandError;
use fleet_runner::host::{Host, HostCommand, Process, ProcessOutput};
use fleet_runner::poll::PollPolicy;
use fleet_runner::remote::{Guest, RemoteExec};

pub type Events = Rc<RefCell<Vec<String>>>;

#[derive(Default)]
pub struct HostState {
    next_pid: u32,
    /// pid -> command line of every process spawned and not yet reaped.
    pub running: BTreeMap<u32, String>,
    /// MACs with a DHCP lease.
    pub leases: BTreeSet<String>,
    pub taps: BTreeSet<String>,
    /// Exit code of the client targeting this address; 0 if absent.
    pub client_codes: BTreeMap<String, i32>,
}

pub struct FakeHost {
    pub state: Rc<RefCell<HostState>>,
    pub events: Events,
    /// Spawning a command for which this returns true fails.
    pub fail_spawn: Box<dyn Fn(&HostCommand) -> bool>,
    /// Running a command for which this returns true fails without any effect.
    pub fail_run: Box<dyn Fn(&HostCommand) -> bool>,
}

impl FakeHost {
    pub fn new(events: &Events) -> Self {
        FakeHost {
            state: Rc::new(RefCell::new(HostState::default())),
            events: events.clone(),
            fail_spawn: Box::new(|_| false),
            fail_run: Box::new(|_| false),
        }
    }

    pub fn running(&self) -> usize {
        self.state.borrow().running.len()
    }

    pub fn leases(&self) -> usize {
        self.state.borrow().leases.len()
    }

    pub fn taps(&self) -> usize {
        self.state.borrow().taps.len()
    }
}

fn attr<'a>(xml: &'a str, name: &str) -> &'a str {
    let start = xml.find(&format!("{}='", name)).unwrap() + name.len() + 2;
    let len = xml[start..].find('\'').unwrap();
    &xml[start..start + len]
}

impl Host for FakeHost {
    fn run(&self, cmd: &HostCommand) -> Result<String, failure::Error> {
        let argv = cmd.argv();
        if (self.fail_run)(cmd) {
            self.events
                .borrow_mut()
                .push(format!("host: failed {}", cmd));
            failure::bail!("`{}` exited with 1", cmd);
        }

        let mut state = self.state.borrow_mut();
        self.events.borrow_mut().push(format!("host: {}", cmd));

        match argv.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["virsh", _, _, "net-update", _, "add-last", _, xml, ..] => {
                state.leases.insert(attr(xml, "mac").to_owned());
            }
            ["virsh", _, _, "net-update", _, "delete", _, xml, ..] => {
                if !state.leases.remove(attr(xml, "mac")) {
                    failure::bail!("no lease for {}", attr(xml, "mac"));
                }
            }
            ["sudo", "ip", "tuntap", "add", tap, ..] => {
                state.taps.insert(tap.to_string());
            }
            ["sudo", "ip", "tuntap", "del", tap, ..] => {
                if !state.taps.remove(*tap) {
                    failure::bail!("no tap {}", tap);
                }
            }
            _ => {}
        }

        Ok(String::new())
    }

    fn spawn(&self, cmd: &HostCommand) -> Result<Box<dyn Process>, failure::Error> {
        if (self.fail_spawn)(cmd) {
            self.events
                .borrow_mut()
                .push(format!("host: failed to spawn {}", cmd));
            failure::bail!("unable to start {}", cmd);
        }

        let line = cmd.to_string();
        let mut state = self.state.borrow_mut();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.running.insert(pid, line.clone());

        // Clients print their target and exit with whatever the test configured for it.
        let target = cmd
            .args
            .iter()
            .find_map(|a| a.strip_prefix("redis.addr="))
            .map(str::to_owned);
        let output = match &target {
            Some(addr) => {
                self.events
                    .borrow_mut()
                    .push(format!("host: spawn client {}", addr));
                ProcessOutput {
                    code: Some(*state.client_codes.get(addr).unwrap_or(&0)),
                    stdout: format!("READ - Takes(s): 1.0, Count: 10 ({})", addr),
                    stderr: String::new(),
                }
            }
            None => {
                self.events
                    .borrow_mut()
                    .push(format!("host: spawn {}", cmd.program));
                ProcessOutput {
                    code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        };

        Ok(Box::new(FakeProcess {
            pid,
            state: self.state.clone(),
            events: self.events.clone(),
            output,
        }))
    }
}

pub struct FakeProcess {
    pid: u32,
    state: Rc<RefCell<HostState>>,
    events: Events,
    output: ProcessOutput,
}

impl Process for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> Result<(), failure::Error> {
        if self.state.borrow_mut().running.remove(&self.pid).is_some() {
            self.events
                .borrow_mut()
                .push(format!("host: terminate {}", self.pid));
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<ProcessOutput, failure::Error> {
        self.state.borrow_mut().running.remove(&self.pid);
        Ok(self.output.clone())
    }
}

pub struct FakeRemote {
    pub events: Events,
    /// Whether guests answer at all.
    pub reachable: bool,
    /// Number of `dbsize` queries a guest answers with a partial count before reporting
    /// `records`. `None` means never.
    pub ready_after: BTreeMap<usize, Option<usize>>,
    pub records: usize,
    /// Number of `tmux ls` queries per guest that still list its detached sessions.
    /// `usize::MAX` means they never finish.
    pub session_polls: usize,
    queries: RefCell<BTreeMap<usize, usize>>,
    /// Per guest: detached sessions started, and `tmux ls` queries answered so far.
    sessions: RefCell<BTreeMap<usize, (Vec<String>, usize)>>,
}

impl FakeRemote {
    pub fn new(events: &Events) -> Self {
        FakeRemote {
            events: events.clone(),
            reachable: true,
            ready_after: BTreeMap::new(),
            records: 0,
            session_polls: 0,
            queries: RefCell::new(BTreeMap::new()),
            sessions: RefCell::new(BTreeMap::new()),
        }
    }
}

impl RemoteExec for FakeRemote {
    fn run(
        &self,
        guest: &Guest,
        argv: &[String],
        _check: bool,
    ) -> Result<String, RemoteCommandError> {
        if !self.reachable {
            return Err(RemoteCommandError {
                vm: guest.id,
                cmd: argv.join(" "),
                cause: "connection refused".into(),
            });
        }

        if argv == ["redis-cli", "dbsize"] {
            let mut queries = self.queries.borrow_mut();
            let n = queries.entry(guest.id).or_insert(0);
            *n += 1;
            let ready = match self.ready_after.get(&guest.id) {
                Some(Some(after)) => *n > *after,
                Some(None) => false,
                None => true,
            };
            let count = if ready { self.records } else { self.records / 2 };
            self.events
                .borrow_mut()
                .push(format!("vm{}: dbsize {}", guest.id, count));
            return Ok(format!("{}\n", count));
        }

        if argv == ["tmux", "ls", "-F", "#S"] {
            let mut sessions = self.sessions.borrow_mut();
            let (names, polls) = sessions.entry(guest.id).or_default();
            *polls += 1;
            self.events
                .borrow_mut()
                .push(format!("vm{}: tmux ls", guest.id));
            return Ok(if *polls <= self.session_polls {
                names.join("\n")
            } else {
                String::new()
            });
        }

        // Everything else succeeds and says where it ran.
        let line = format!("vm{}: {}", guest.id, argv.join(" "));
        self.events.borrow_mut().push(line.clone());
        Ok(line + "\n")
    }

    fn run_detached(
        &self,
        guest: &Guest,
        session: &str,
        argv: &[String],
        _pipe_to: Option<&str>,
    ) -> Result<(), RemoteCommandError> {
        self.events
            .borrow_mut()
            .push(format!("vm{}: detached {} {}", guest.id, session, argv.join(" ")));
        self.sessions
            .borrow_mut()
            .entry(guest.id)
            .or_default()
            .0
            .push(session.to_owned());
        Ok(())
    }

    fn probe(&self, _guest: &Guest) -> bool {
        self.reachable
    }
}

/// A configuration rooted in a scratch directory unique to `name`, with all delays zeroed and
/// every wait bounded.
pub fn test_config(name: &str) -> HostConfig {
    let root: PathBuf = std::env::temp_dir().join(format!(
        "fleet-runner-test-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&root);

    let quick = PollPolicy::new(Duration::from_millis(1), Some(Duration::from_millis(200)));

    HostConfig {
        project_dir: root.join("project"),
        shared_dir: root.clone(),
        output_root: root.join("out"),
        vm_cpus: Some((0..32).collect()),
        ycsb_record_count: 1000,
        settle: Duration::from_millis(0),
        preload_settle: Duration::from_millis(0),
        boot_poll: quick,
        preload_poll: quick,
        graph_poll: quick,
        ..HostConfig::default()
    }
}
