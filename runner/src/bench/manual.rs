//! Run an arbitrary shell command in every guest.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{info, warn};

use rand::{distributions::Alphanumeric, rngs::SmallRng, Rng, SeedableRng};

use crate::bench::{BenchContext, Benchmark, BenchmarkRun};
use crate::fleet::Fleet;

/// A script in the shared project dir, visible to every guest at the same path. Removed on drop.
struct SharedScript {
    path: PathBuf,
}

impl SharedScript {
    fn create(dir: &Path, contents: &str) -> Result<Self, failure::Error> {
        let name: String = SmallRng::from_entropy()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let path = dir.join(format!(".manual-{}.sh", name));

        std::fs::write(&path, contents)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;

        Ok(SharedScript { path })
    }
}

impl Drop for SharedScript {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("unable to remove {}: {}", self.path.display(), e);
        }
    }
}

pub struct ManualBenchmark {
    cmd: String,
    /// After the command, block until every VM is shut down by hand.
    wait: bool,
}

impl ManualBenchmark {
    pub fn new(cmd: &str, wait: bool) -> Self {
        ManualBenchmark {
            cmd: cmd.into(),
            wait,
        }
    }
}

impl Benchmark for ManualBenchmark {
    fn name(&self) -> String {
        "manual".into()
    }

    fn run(
        &mut self,
        ctx: &BenchContext<'_>,
        fleet: &mut Fleet<'_>,
    ) -> Result<BenchmarkRun, failure::Error> {
        let guests = fleet.guests();
        let mut run = BenchmarkRun::new(self.name());
        run.targets = guests.iter().map(|g| g.ip.to_string()).collect();

        if !self.cmd.trim().is_empty() {
            let script = SharedScript::create(&ctx.cfg.project_dir, &self.cmd)?;
            let argv = argv!["bash", script.path.display()];

            // The command's exit status is the user's business; report whatever it printed.
            let outputs = guests
                .iter()
                .map(|guest| {
                    ctx.remote.run(guest, &argv, false).unwrap_or_else(|e| {
                        warn!("{}", e);
                        String::new()
                    })
                })
                .collect();
            run.sections.push(("cmd".into(), outputs));
        }

        if self.wait {
            info!("wait for manual termination via pkill cloud-hypervisor");
            let mut timings = vec![];
            time!(timings, "manual", fleet.wait_all()?);
            run.timings = timings;
        }

        Ok(run)
    }
}
