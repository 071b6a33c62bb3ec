//! Launch a fleet of VMs on this host and run one benchmark across it (or a sweep of them).

use log::{info, warn};

use fleet_runner::{
    bench::{
        graph::GraphBenchmark, kv::KvBenchmark, manual::ManualBenchmark, BenchContext, Benchmark,
    },
    cli::{cli_options, BenchOptions, Options},
    config::HostConfig,
    cpu::node_to_cpus,
    driver::{run_benchmark, sweep},
    error::TimeoutError,
    host::LocalHost,
    hostprep::prepare_host,
    poll::CancelToken,
    remote::SshRemote,
    workloads::YcsbWorkload,
};

fn kv_benchmark(
    opts: &Options,
    cfg: &HostConfig,
    workload: YcsbWorkload,
) -> Result<KvBenchmark, failure::Error> {
    Ok(KvBenchmark::new(
        workload,
        opts.fleet.ncpus,
        opts.fleet.memory_mode,
        opts.perf_event.clone(),
        node_to_cpus(cfg.client_cpu_node)?,
    ))
}

fn run() -> Result<(), failure::Error> {
    let matches = cli_options().get_matches();
    let opts = Options::from_matches(&matches)?;

    env_logger::Builder::from_default_env()
        .filter_level(opts.log_level)
        .init();

    info!("{:?}", opts);

    let cfg = match &opts.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };

    // ^C unblocks whatever we are waiting for; the fleet is then torn down on the way out.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("interrupted, tearing down");
            cancel.cancel();
        })?;
    }

    let host = LocalHost;
    let remote = SshRemote::new(&cfg.guest_user, cfg.ssh_connect_timeout);
    let ctx = BenchContext {
        host: &host,
        remote: &remote,
        cfg: &cfg,
        cancel: &cancel,
    };

    if !opts.prep.is_empty() {
        prepare_host(&host, &cfg, opts.prep)?;
    }

    let mut bench: Box<dyn Benchmark> = match &opts.bench {
        BenchOptions::Manual { cmd, wait } => Box::new(ManualBenchmark::new(cmd, *wait)),
        BenchOptions::Redis { workload } => Box::new(kv_benchmark(&opts, &cfg, *workload)?),
        BenchOptions::Gap { ntrials, niters } => Box::new(GraphBenchmark::new(*ntrials, *niters)),
        BenchOptions::Sweep {
            workload,
            nums,
            ratios,
        } => {
            let template = kv_benchmark(&opts, &cfg, *workload)?;
            let failed = sweep(
                &ctx,
                &opts.fleet,
                nums,
                ratios,
                || Box::new(template.fresh()),
                &opts.output,
            );

            if !failed.is_empty() {
                failure::bail!("{} sweep configurations failed: {:?}", failed.len(), failed);
            }
            return Ok(());
        }
    };

    let log = run_benchmark(&ctx, &opts.fleet, bench.as_mut(), &opts.output)?;
    println!("{}", log.display());

    Ok(())
}

/// Printed when `run` fails. Teardown is best effort, so this must not promise a clean host.
const ERROR_BANNER: &str = r#"== ERROR ==================================================================================
`fleet-runner` encountered an error. It attempted to shut down every VM it started and remove its
network leases; any process, lease, or tap device it could not clean up is logged above as a
warning. For SSH problems, rerun with RUST_LOG=debug or --log_level debug.
"#;

fn main() {
    use console::style;

    // Set the RUST_BACKTRACE environment variable so that we always get backtraces. Normally, one
    // doesn't want this because of the performance penalty, but in this case, we don't care too
    // much, whereas the debugging improve is massive.
    std::env::set_var("RUST_BACKTRACE", "1");

    // If an error occurred, try to print something helpful.
    if let Err(err) = run() {
        println!("{}", style(ERROR_BANNER).red().bold());

        // Errors from SSH commands
        if err.downcast_ref::<spurs::SshError>().is_some() {
            println!("An error occurred while attempting to run a command over SSH");
        }

        match err.downcast_ref::<TimeoutError>() {
            Some(TimeoutError::Deadline { .. }) => println!(
                "A wait timed out. Deadlines can be raised (or set to null) in the --config file."
            ),
            Some(TimeoutError::Cancelled { .. }) => println!("Interrupted."),
            None => {}
        }

        // Print error and backtrace
        println!(
            "`fleet-runner` encountered the following error:\n{}\n{}",
            err.as_fail(),
            err.backtrace(),
        );

        std::process::exit(101);
    }
}
