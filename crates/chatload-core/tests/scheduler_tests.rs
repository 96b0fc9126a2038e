use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatload_common::config::Stage;
use chatload_core::metrics::Registry;
use chatload_core::scheduler::{RampingVus, Scenario, VuContext};
use parking_lot::Mutex;

fn secs(s: u64) -> Duration { Duration::from_secs(s) }

#[test]
fn target_interpolates_the_reference_ramp() {
    let ramp = RampingVus::new(
        1,
        vec![
            Stage::new(secs(10), 2),
            Stage::new(secs(30), 2),
            Stage::new(secs(20), 5),
            Stage::new(secs(30), 5),
            Stage::new(secs(10), 0),
        ],
        Duration::from_millis(100),
        secs(30),
    );
    assert_eq!(ramp.total_duration(), secs(100));
    assert_eq!(ramp.target_at(secs(0)), 1);
    assert_eq!(ramp.target_at(secs(9)), 1);
    assert_eq!(ramp.target_at(secs(10)), 2);
    assert_eq!(ramp.target_at(secs(39)), 2);
    assert_eq!(ramp.target_at(secs(40)), 2);
    assert_eq!(ramp.target_at(secs(50)), 3);
    assert_eq!(ramp.target_at(secs(60)), 5);
    assert_eq!(ramp.target_at(secs(89)), 5);
    assert_eq!(ramp.target_at(secs(95)), 3);
    assert_eq!(ramp.target_at(Duration::from_millis(99_900)), 1);
    assert_eq!(ramp.target_at(secs(100)), 0);
    assert_eq!(ramp.target_at(secs(500)), 0);
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<VuContext>>,
    work: Duration,
}

#[async_trait]
impl Scenario for Recorder {
    async fn iteration(&self, vu: &VuContext) {
        self.seen.lock().push(*vu);
        tokio::time::sleep(self.work).await;
    }
}

#[tokio::test(start_paused = true)]
async fn vus_iterate_with_unique_indices() {
    let ramp = RampingVus::new(2, vec![Stage::new(secs(5), 2)], Duration::from_millis(100), secs(5));
    let recorder = Arc::new(Recorder { work: secs(1), ..Default::default() });
    let registry = Registry::new();

    let stats = ramp.run(recorder.clone(), &registry).await.unwrap();

    let seen = recorder.seen.lock().clone();
    assert_eq!(stats.vus_max, 2);
    assert_eq!(stats.interrupted, 0);
    assert_eq!(stats.iterations, seen.len() as u64);
    assert_eq!(registry.counter("iterations").unwrap().get(), stats.iterations);
    assert_eq!(registry.trend("iteration_duration").unwrap().snapshot(&[]).count() as u64, stats.iterations);

    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len());
    for v in [1, 2] {
        let iters: Vec<u64> = seen.iter().filter(|c| c.vu == v).map(|c| c.iteration).collect();
        assert!(iters.len() >= 4, "vu {v} ran {} iterations", iters.len());
        assert_eq!(iters, (0..iters.len() as u64).collect::<Vec<_>>());
    }
}

#[tokio::test(start_paused = true)]
async fn ramp_down_parks_vus_and_ramp_up_resumes_their_counters() {
    let ramp = RampingVus::new(
        2,
        vec![Stage::new(secs(3), 2), Stage::new(Duration::ZERO, 1), Stage::new(secs(3), 1), Stage::new(Duration::ZERO, 2), Stage::new(secs(3), 2)],
        Duration::from_millis(100),
        secs(5),
    );
    let recorder = Arc::new(Recorder { work: secs(1), ..Default::default() });
    let registry = Registry::new();
    ramp.run(recorder.clone(), &registry).await.unwrap();

    let seen = recorder.seen.lock().clone();
    let vu2: Vec<u64> = seen.iter().filter(|c| c.vu == 2).map(|c| c.iteration).collect();
    assert_eq!(vu2, (0..vu2.len() as u64).collect::<Vec<_>>());
    // vu 2 sat out the middle stage, so it ran fewer iterations than vu 1
    let vu1 = seen.iter().filter(|c| c.vu == 1).count();
    assert!(vu2.len() < vu1);
}

#[tokio::test(start_paused = true)]
async fn long_iterations_are_cut_after_graceful_stop() {
    let ramp = RampingVus::new(1, vec![Stage::new(secs(1), 1)], Duration::from_millis(100), secs(2));
    let recorder = Arc::new(Recorder { work: secs(60), ..Default::default() });
    let registry = Registry::new();

    let stats = ramp.run(recorder.clone(), &registry).await.unwrap();
    assert_eq!(stats.interrupted, 1);
    assert_eq!(stats.iterations, 0);
    assert!(stats.duration < secs(10));
}

#[tokio::test(start_paused = true)]
async fn zero_target_ramp_spawns_nothing() {
    let ramp = RampingVus::new(0, vec![Stage::new(secs(1), 0)], Duration::from_millis(100), secs(1));
    let recorder = Arc::new(Recorder::default());
    let stats = ramp.run(recorder.clone(), &Registry::new()).await.unwrap();
    assert_eq!(stats.vus_max, 0);
    assert!(recorder.seen.lock().is_empty());
}
