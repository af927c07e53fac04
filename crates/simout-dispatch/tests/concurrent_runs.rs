mod common;

use std::sync::Arc;

use common::{coord, debug_line, inventory, CountingSink, INVENTORY};
use rayon::prelude::*;
use simout_dispatch::{CaptureSink, DispatchRouter, ExperimentPhase, MemoryLedger, StatSink};
use simout_stat::SampleAccumulator;

fn stock_sample(scenario: u32, replication: u32, step: u32) -> f64 {
    (scenario * 100 + replication * 10 + step % 7) as f64 * 0.25
}

#[test]
fn parallel_runs_do_not_interfere() {
    let counting = Arc::new(CountingSink::new("counting", &[INVENTORY]));
    let capture = Arc::new(CaptureSink::new("capture", [INVENTORY]));
    let stats = Arc::new(StatSink::new("stock", INVENTORY, "stock"));
    let mut router = DispatchRouter::default();
    router.register(counting.clone()).expect("register counting");
    router.register(capture.clone()).expect("register capture");
    router.register(stats.clone()).expect("register stats");
    router.open_experiment(&MemoryLedger::new()).expect("open");

    let grid: Vec<(u32, u32)> = (1..=6)
        .flat_map(|scenario| (1..=8).map(move |replication| (scenario, replication)))
        .collect();
    const STEPS: u32 = 50;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(8)
        .build()
        .expect("thread pool");
    let receipts = pool.install(|| {
        grid.par_iter()
            .map(|&(scenario, replication)| {
                let run = coord(scenario, replication);
                router.open_run(run)?;
                for step in 0..STEPS {
                    router.route(inventory(run, stock_sample(scenario, replication, step)))?;
                    router.route(debug_line(run))?;
                }
                router.close_run(run)
            })
            .collect::<Result<Vec<_>, _>>()
    });
    let receipts = receipts.expect("parallel runs");
    router.close_experiment().expect("close");

    assert!(counting.violations().is_empty());
    assert_eq!(counting.total_handled(), grid.len() * STEPS as usize);
    assert!(receipts
        .iter()
        .all(|receipt| receipt.records_routed == 2 * STEPS as u64));

    for &(scenario, replication) in &grid {
        let run = coord(scenario, replication);
        let stocks: Vec<f64> = capture
            .records(run)
            .iter()
            .map(|record| {
                assert_eq!(record.coordinate(), run);
                record.value("stock").expect("stock")
            })
            .collect();
        let expected: Vec<f64> = (0..STEPS)
            .map(|step| stock_sample(scenario, replication, step))
            .collect();
        assert_eq!(stocks, expected, "emission order for {run}");
    }

    let mut direct = SampleAccumulator::new();
    for &(scenario, replication) in &grid {
        for step in 0..STEPS {
            direct.push(stock_sample(scenario, replication, step));
        }
    }
    let summary = stats.summary().expect("summary");
    let expected = direct.summarize().expect("direct summary");
    assert_eq!(summary.size(), expected.size());
    assert_eq!(summary.min(), expected.min());
    assert_eq!(summary.max(), expected.max());
    let mean_gap = (summary.mean().unwrap() - expected.mean().unwrap()).abs();
    assert!(mean_gap < 1e-9);
    let variance_gap = (summary.variance().unwrap() - expected.variance().unwrap()).abs();
    assert!(variance_gap < 1e-9 * expected.variance().unwrap().max(1.0));
    assert_eq!(stats.published_runs().len(), grid.len());
}

#[test]
fn concurrent_routes_within_one_run_all_land_before_close() {
    let counting = Arc::new(CountingSink::new("counting", &[INVENTORY]));
    let mut router = DispatchRouter::default();
    router.register(counting.clone()).expect("register");
    router.open_experiment(&MemoryLedger::new()).expect("open");
    let run = coord(9, 9);
    router.open_run(run).expect("open run");

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let router = &router;
            scope.spawn(move || {
                for step in 0..100 {
                    router
                        .route(inventory(run, (worker * 100 + step) as f64))
                        .expect("route");
                }
            });
        }
    });

    let receipt = router.close_run(run).expect("close run");
    router.close_experiment().expect("close");
    assert_eq!(receipt.records_routed, 400);
    assert_eq!(counting.handled(run), 400);
    assert!(counting.violations().is_empty());
}

#[test]
fn runs_opening_during_experiment_close_never_reach_closed_sinks() {
    for _ in 0..20 {
        let counting = Arc::new(CountingSink::new("counting", &[INVENTORY]));
        let mut router = DispatchRouter::default();
        router.register(counting.clone()).expect("register");
        router.open_experiment(&MemoryLedger::new()).expect("open");
        let router = &router;

        std::thread::scope(|scope| {
            for scenario in 1..=4 {
                scope.spawn(move || {
                    for replication in 1..=50 {
                        let run = coord(scenario, replication);
                        if router.open_run(run).is_err() {
                            return;
                        }
                        // A close attempt in progress briefly leaves the
                        // experiment phase; retry until it reverts.
                        loop {
                            match router.close_run(run) {
                                Ok(_) => break,
                                Err(err) if err.code() == "lifecycle.experiment_not_open" => {
                                    std::thread::yield_now()
                                }
                                Err(err) => panic!("close_run {run}: {err}"),
                            }
                        }
                    }
                });
            }
            scope.spawn(move || loop {
                match router.close_experiment() {
                    Ok(()) => break,
                    Err(err) if err.code() == "lifecycle.runs_still_open" => {
                        std::thread::yield_now()
                    }
                    Err(err) => panic!("close_experiment: {err}"),
                }
            });
        });

        assert_eq!(router.phase(), ExperimentPhase::Closed);
        assert!(router.open_runs().is_empty());
        assert!(counting.violations().is_empty(), "{:?}", counting.violations());
        for scenario in 1..=4 {
            for replication in 1..=50 {
                let run = coord(scenario, replication);
                assert_eq!(counting.opened(run), counting.closed(run), "{run}");
            }
        }
    }
}
