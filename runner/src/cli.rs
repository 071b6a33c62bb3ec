//! Command line options.

use std::path::PathBuf;

use clap::clap_app;

use crate::config::MAX_VMS;
use crate::cpu::AffinityMode;
use crate::fleet::FleetOptions;
use crate::hostprep::HostPrep;
use crate::workloads::YcsbWorkload;

/// Which benchmark to run, with its own options.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchOptions {
    Manual { cmd: String, wait: bool },
    Redis { workload: YcsbWorkload },
    Gap { ntrials: usize, niters: usize },
    /// The redis benchmark for every combination of VM count and DRAM ratio.
    Sweep {
        workload: YcsbWorkload,
        nums: Vec<usize>,
        ratios: Vec<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct Options {
    pub fleet: FleetOptions,
    pub perf_event: Option<String>,
    pub log_level: log::LevelFilter,
    pub config: Option<PathBuf>,
    /// Directory receiving the result logs.
    pub output: PathBuf,
    pub prep: HostPrep,
    pub bench: BenchOptions,
}

pub fn cli_options() -> clap::App<'static, 'static> {
    fn is_usize(s: String) -> Result<(), String> {
        s.as_str()
            .parse::<usize>()
            .map(|_| ())
            .map_err(|e| format!("{:?}", e))
    }

    fn is_vm_count(s: String) -> Result<(), String> {
        match s.parse::<usize>() {
            Ok(n) if n <= MAX_VMS => Ok(()),
            Ok(n) => Err(format!("at most {} VMs are supported, not {}", MAX_VMS, n)),
            Err(e) => Err(format!("{:?}", e)),
        }
    }

    fn is_ratio(s: String) -> Result<(), String> {
        match s.parse::<f64>() {
            Ok(r) if (0.0..=1.0).contains(&r) => Ok(()),
            Ok(r) => Err(format!("{} is not within [0, 1]", r)),
            Err(e) => Err(format!("{:?}", e)),
        }
    }

    fn is_affinity(s: String) -> Result<(), String> {
        s.parse::<AffinityMode>()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn is_workload(s: String) -> Result<(), String> {
        s.parse::<YcsbWorkload>()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn is_level(s: String) -> Result<(), String> {
        s.parse::<log::LevelFilter>()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn is_prep(s: String) -> Result<(), String> {
        if s == "all" {
            return Ok(());
        }
        HostPrep::from_names(&s)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    clap_app! { fleet_runner =>
        (about: "Launch a fleet of VMs with tiered memory on this host and run a benchmark \
                 across it. Requires `sudo`.")
        (@setting SubcommandRequiredElseHelp)
        (@setting DisableVersion)
        (@arg NUM: --num +takes_value {is_vm_count}
         "How many VMs to launch. Required except for `sweep`.")
        (@arg NCPUS: --ncpus +takes_value {is_usize}
         "vCPUs per VM (default: 4)")
        (@arg BIND: --bind +takes_value {is_affinity}
         "Pin each vCPU to its own host CPU (`core`) or let it float over the whole VM node \
          (`node`) (default: core)")
        (@arg MEMORY: --memory +takes_value {is_usize}
         "Memory per VM in bytes (default: 8GiB)")
        (@arg DRAM_RATIO: --dram_ratio +takes_value {is_ratio}
         "Initial fraction of the memory on the fast node (default: 0.2)")
        (@arg MEMORY_MODE: --memory_mode
         "Back the slow zone by the fast node too")
        (@arg PERF_EVENT: --perf_event +takes_value
         "Sample this perf event in the key-value servers (e.g. r80D1:P)")
        (@arg LOG_LEVEL: --log_level +takes_value {is_level}
         "error, warn, info, debug, or trace (default: info)")
        (@arg CONFIG: --config +takes_value
         "JSON file overriding the host configuration")
        (@arg OUTPUT: --output +takes_value
         "Directory for result logs (default: the current directory)")
        (@arg PREP: --prep +takes_value {is_prep}
         "Prepare the host first: `all` or a comma-separated list of \
          pmem,network,freq,numa,swap,clean")
        (@arg SKIP_PREP: --skip_prep +takes_value {is_prep}
         "Host preparation steps to leave out")
        (@subcommand manual =>
            (about: "Run a command in every VM.")
            (@arg CMD: --cmd +takes_value "Shell command to run in every VM")
            (@arg WAIT: --wait "Afterwards, wait until every VM is shut down by hand")
        )
        (@subcommand redis =>
            (about: "Run redis with a YCSB client per VM.")
            (@arg WORKLOAD: --workload +takes_value {is_workload}
             "YCSB core workload A-F (default: A)")
        )
        (@subcommand gap =>
            (about: "Run GAP betweenness centrality in every VM.")
            (@arg NTRIALS: --ntrials +takes_value {is_usize} "Trials (default: 5)")
            (@arg NITERS: --niters +takes_value {is_usize} "Iterations per trial (default: 1)")
        )
        (@subcommand sweep =>
            (about: "Run the redis benchmark for every combination of VM count and DRAM ratio, \
                     one log per combination.")
            (@arg WORKLOAD: --workload +takes_value {is_workload}
             "YCSB core workload A-F (default: A)")
            (@arg NUMS: --nums +required +takes_value +use_delimiter {is_vm_count}
             "Comma-separated VM counts (e.g. 1,2,8)")
            (@arg RATIOS: --ratios +required +takes_value +use_delimiter {is_ratio}
             "Comma-separated DRAM ratios (e.g. 0.2,0.625)")
        )
    }
}

/// Parse an option that clap has already validated, or fall back to `default`.
fn parsed<T: std::str::FromStr>(
    m: &clap::ArgMatches<'_>,
    name: &str,
    default: T,
) -> Result<T, failure::Error>
where
    T::Err: std::fmt::Display,
{
    match m.value_of(name) {
        Some(v) => v
            .parse()
            .map_err(|e| failure::format_err!("--{}: {}", name.to_lowercase(), e)),
        None => Ok(default),
    }
}

fn workload(m: &clap::ArgMatches<'_>) -> Result<YcsbWorkload, failure::Error> {
    parsed(m, "WORKLOAD", YcsbWorkload::A)
}

impl Options {
    pub fn from_matches(matches: &clap::ArgMatches<'_>) -> Result<Self, failure::Error> {
        let bench = match matches.subcommand() {
            ("manual", Some(sub_m)) => BenchOptions::Manual {
                cmd: sub_m.value_of("CMD").unwrap_or("").into(),
                wait: sub_m.is_present("WAIT"),
            },
            ("redis", Some(sub_m)) => BenchOptions::Redis {
                workload: workload(sub_m)?,
            },
            ("gap", Some(sub_m)) => BenchOptions::Gap {
                ntrials: parsed(sub_m, "NTRIALS", 5)?,
                niters: parsed(sub_m, "NITERS", 1)?,
            },
            ("sweep", Some(sub_m)) => BenchOptions::Sweep {
                workload: workload(sub_m)?,
                nums: sub_m
                    .values_of("NUMS")
                    .into_iter()
                    .flatten()
                    .map(|n| n.parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()?,
                ratios: sub_m
                    .values_of("RATIOS")
                    .into_iter()
                    .flatten()
                    .map(|n| n.parse::<f64>())
                    .collect::<Result<Vec<_>, _>>()?,
            },
            _ => unreachable!(),
        };

        let num = match (&bench, matches.value_of("NUM")) {
            (_, Some(num)) => num.parse::<usize>()?,
            // Each sweep run sets its own count.
            (BenchOptions::Sweep { .. }, None) => 0,
            (_, None) => failure::bail!("--num is required"),
        };

        let fleet = FleetOptions {
            num,
            ncpus: parsed(matches, "NCPUS", 4)?,
            memory: parsed(matches, "MEMORY", 8 << 30)?,
            dram_ratio: parsed(matches, "DRAM_RATIO", 0.2)?,
            memory_mode: matches.is_present("MEMORY_MODE"),
            affinity_mode: parsed(matches, "BIND", AffinityMode::PerCore)?,
        };

        let prep_steps = |name: &str| -> Result<HostPrep, failure::Error> {
            match matches.value_of(name) {
                Some("all") => Ok(HostPrep::all()),
                Some(steps) => HostPrep::from_names(steps),
                None => Ok(HostPrep::empty()),
            }
        };
        let prep = prep_steps("PREP")? - prep_steps("SKIP_PREP")?;

        Ok(Options {
            fleet,
            perf_event: matches
                .value_of("PERF_EVENT")
                .filter(|e| !e.is_empty())
                .map(Into::into),
            log_level: parsed(matches, "LOG_LEVEL", log::LevelFilter::Info)?,
            config: matches.value_of("CONFIG").map(PathBuf::from),
            output: matches.value_of("OUTPUT").unwrap_or(".").into(),
            prep,
            bench,
        })
    }
}
