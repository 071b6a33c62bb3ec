//! The key-value benchmark against fake host and guests.

mod common;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use fleet_runner::bench::{kv::KvBenchmark, BenchContext, Benchmark, RunState};
use fleet_runner::config::HostConfig;
use fleet_runner::cpu::{AffinityMode, CpuAffinityCycler};
use fleet_runner::error::TimeoutError;
use fleet_runner::fleet::{Fleet, FleetOptions};
use fleet_runner::poll::CancelToken;
use fleet_runner::workloads::YcsbWorkload;

use common::{test_config, Events, FakeHost, FakeRemote};

fn launch<'h>(host: &'h FakeHost, remote: &FakeRemote, cfg: &HostConfig, num: usize) -> Fleet<'h> {
    let opts = FleetOptions {
        num,
        ncpus: 2,
        memory: 1 << 30,
        dram_ratio: 0.5,
        memory_mode: false,
        affinity_mode: AffinityMode::PerCore,
    };
    Fleet::launch(
        host,
        remote,
        cfg,
        &opts.specs(),
        &CpuAffinityCycler::new(1, (0..16).collect()),
        &CancelToken::new(),
    )
    .unwrap()
}

fn bench() -> KvBenchmark {
    KvBenchmark::new(YcsbWorkload::A, 2, false, None, vec![0, 1])
}

fn fakes(cfg: &HostConfig) -> (Events, FakeHost, FakeRemote) {
    let events = Rc::new(RefCell::new(vec![]));
    let host = FakeHost::new(&events);
    let mut remote = FakeRemote::new(&events);
    remote.records = cfg.ycsb_record_count;
    (events, host, remote)
}

#[test]
fn no_client_starts_before_every_server_is_loaded() {
    let cfg = test_config("kv-barrier");
    let (events, host, mut remote) = fakes(&cfg);
    remote.ready_after = vec![(0, Some(1)), (1, Some(5)), (2, Some(3))]
        .into_iter()
        .collect::<BTreeMap<_, _>>();

    let mut fleet = launch(&host, &remote, &cfg, 3);
    let cancel = CancelToken::new();
    let ctx = BenchContext {
        host: &host,
        remote: &remote,
        cfg: &cfg,
        cancel: &cancel,
    };

    let mut kv = bench();
    assert_eq!(kv.state(), RunState::NotStarted);
    let run = kv.run(&ctx, &mut fleet).unwrap();
    assert_eq!(kv.state(), RunState::Collected);

    let events = events.borrow();
    let last_partial = events
        .iter()
        .rposition(|e| e.contains(&format!("dbsize {}", cfg.ycsb_record_count / 2)))
        .unwrap();
    let first_client = events
        .iter()
        .position(|e| e.contains("spawn client"))
        .unwrap();
    assert!(last_partial < first_client);

    // Every server was started before anyone was asked for its size.
    let last_server = events.iter().rposition(|e| e.contains("detached kv-server")).unwrap();
    let first_query = events.iter().position(|e| e.contains("dbsize")).unwrap();
    assert!(last_server < first_query);

    assert_eq!(run.results.len(), 3);
    assert!(run.failed_clients().is_empty());
}

#[test]
fn results_are_ordered_by_vm() {
    let cfg = test_config("kv-order");
    let (_events, host, remote) = fakes(&cfg);
    let mut fleet = launch(&host, &remote, &cfg, 4);
    let cancel = CancelToken::new();
    let ctx = BenchContext {
        host: &host,
        remote: &remote,
        cfg: &cfg,
        cancel: &cancel,
    };

    let run = bench().run(&ctx, &mut fleet).unwrap();

    assert_eq!(run.targets.len(), 4);
    for (i, result) in run.results.iter().enumerate() {
        assert_eq!(result.vm, i);
        assert!(result.output.stdout.contains(&run.targets[i]));
    }
    assert_eq!(run.targets[3], "192.168.122.169:6379");
    assert_eq!(run.record_count, Some(cfg.ycsb_record_count));

    let report = run.report();
    let blocks: Vec<_> = (0..4)
        .map(|i| report.find(&format!("vm{} stdout:", i)).unwrap())
        .collect();
    assert!(blocks.windows(2).all(|w| w[0] < w[1]));

    // Clients are reaped; only the VMs are left.
    assert_eq!(host.running(), 3 * 4);
    fleet.teardown();
    assert_eq!(host.running(), 0);
}

#[test]
fn failing_client_does_not_abort_the_others() {
    let cfg = test_config("kv-client-fail");
    let (_events, host, remote) = fakes(&cfg);
    host.state
        .borrow_mut()
        .client_codes
        .insert("192.168.122.167:6379".into(), 1);

    let mut fleet = launch(&host, &remote, &cfg, 3);
    let cancel = CancelToken::new();
    let ctx = BenchContext {
        host: &host,
        remote: &remote,
        cfg: &cfg,
        cancel: &cancel,
    };

    let run = bench().run(&ctx, &mut fleet).unwrap();

    let failed = run.failed_clients();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].vm, 1);
    assert!(run.results[0].error.is_none());
    assert!(run.results[2].error.is_none());
    assert!(!run.results[1].output.stdout.is_empty());
}

#[test]
fn server_that_never_loads_times_out_without_clients() {
    let cfg = test_config("kv-timeout");
    let (events, host, mut remote) = fakes(&cfg);
    remote.ready_after.insert(1, None);

    let mut fleet = launch(&host, &remote, &cfg, 2);
    let cancel = CancelToken::new();
    let ctx = BenchContext {
        host: &host,
        remote: &remote,
        cfg: &cfg,
        cancel: &cancel,
    };

    let mut kv = bench();
    let err = kv.run(&ctx, &mut fleet).err().unwrap();

    assert!(matches!(
        err.downcast_ref::<TimeoutError>(),
        Some(TimeoutError::Deadline { .. })
    ));
    assert_eq!(kv.state(), RunState::WaitingPreload);
    assert!(!events.borrow().iter().any(|e| e.contains("spawn client")));

    drop(fleet);
    assert_eq!(host.running(), 0);
    assert_eq!(host.leases(), 0);
}

#[test]
fn perf_samples_are_collected_after_clients() {
    let cfg = test_config("kv-perf");
    let (events, host, remote) = fakes(&cfg);
    let mut fleet = launch(&host, &remote, &cfg, 2);
    let cancel = CancelToken::new();
    let ctx = BenchContext {
        host: &host,
        remote: &remote,
        cfg: &cfg,
        cancel: &cancel,
    };

    let mut kv = KvBenchmark::new(YcsbWorkload::B, 2, false, Some("r80D1:P".into()), vec![0]);
    let run = kv.run(&ctx, &mut fleet).unwrap();

    let (label, outputs) = &run.sections[0];
    assert_eq!(label, "perf script");
    assert_eq!(outputs.len(), 2);

    let events = events.borrow();
    let last_client = events.iter().rposition(|e| e.contains("spawn client")).unwrap();
    let pkill = events.iter().position(|e| e.contains("pkill redis-server")).unwrap();
    assert!(last_client < pkill);
    assert!(events
        .iter()
        .any(|e| e.contains("detached kv-server sudo perf record")));
}
