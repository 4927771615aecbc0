//! End-to-end runs of the tick loop against real rings, pools and router.
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use super::{Controller, ControllerSettings};
use crate::enums::{Color, Pipeline, Pipelines, PulseKind};
use crate::jobs::testing::ScriptedTask;
use crate::monitor::{MonitorId, MonitorRecord, PulseSettings};
use crate::pool::{PoolConfig, StopMode};
use crate::systems::testing::{code_route, intervention};
use crate::systems::{SystemsConfig, World};

const COOLDOWN: Duration = Duration::from_secs(60);

fn settings() -> ControllerSettings {
    let mut settings = ControllerSettings::default();
    settings.rings.capacity = Pipelines::from_fn(|_| 64);
    settings.pools = Pipelines::from_fn(|_| PoolConfig {
        min_workers: 2,
        max_workers: 2,
        ..PoolConfig::default()
    });
    settings
}

fn monitor(probe: &Arc<ScriptedTask>, unhealthy: u32, healthy: u32) -> MonitorRecord {
    let mut pulse = PulseSettings::new(PulseKind::Http, Duration::from_secs(1));
    pulse.unhealthy_threshold = unhealthy;
    pulse.healthy_threshold = healthy;
    MonitorRecord::new("svc", pulse, probe.clone())
}

fn start(record: MonitorRecord) -> Controller {
    let mut world = World::new(SystemsConfig::default());
    world.insert(record, Instant::now()).unwrap();
    Controller::start(world, settings())
}

/// Ticks every 10ms of virtual time until `offset` past `origin`.
async fn run_until(controller: &mut Controller, origin: Instant, offset: Duration) {
    while Instant::now() < origin + offset {
        controller.tick(Instant::now());
        sleep(Duration::from_millis(10)).await;
    }
}

fn record(controller: &Controller) -> &MonitorRecord {
    controller.world().store().get(MonitorId(0)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn failure_runs_intervention_then_recovery_sends_green() {
    let probe = ScriptedTask::always(false);
    let fix = ScriptedTask::always(true);
    let yellow = ScriptedTask::always(true);
    let green = ScriptedTask::always(true);
    let rec = monitor(&probe, 1, 1)
        .with_intervention(intervention(1, fix.clone()))
        .with_code(Color::Yellow, code_route(COOLDOWN, yellow.clone()))
        .with_code(Color::Green, code_route(COOLDOWN, green.clone()));
    let mut controller = start(rec);
    let t0 = Instant::now();

    run_until(&mut controller, t0, Duration::from_millis(500)).await;
    assert_eq!(probe.calls(), 1);
    assert_eq!(fix.calls(), 1);
    assert_eq!(yellow.calls(), 1);
    assert!(record(&controller).is_incident_open());
    assert_eq!(record(&controller).verify_remaining, 1);

    probe.set_fallback(true);
    run_until(&mut controller, t0, Duration::from_millis(1500)).await;
    let rec = record(&controller);
    assert_eq!(rec.consecutive_failures, 0);
    assert!(!rec.is_incident_open());
    assert_eq!(green.calls(), 1);
    assert_eq!(fix.calls(), 1);

    let report = controller.shutdown(StopMode::Fast).await;
    assert!(report.clean);
}

#[tokio::test(start_paused = true)]
async fn outage_without_intervention_sends_one_red_and_one_green() {
    let probe = ScriptedTask::new([false, false, false, true], true);
    let red = ScriptedTask::always(true);
    let green = ScriptedTask::always(true);
    let rec = monitor(&probe, 3, 1)
        .with_code(Color::Red, code_route(Duration::ZERO, red.clone()))
        .with_code(Color::Green, code_route(Duration::ZERO, green.clone()));
    let mut controller = start(rec);
    let t0 = Instant::now();

    run_until(&mut controller, t0, Duration::from_millis(1500)).await;
    assert_eq!(red.calls(), 0);
    run_until(&mut controller, t0, Duration::from_millis(2500)).await;
    assert_eq!(red.calls(), 1);
    assert!(record(&controller).is_incident_open());

    run_until(&mut controller, t0, Duration::from_millis(5500)).await;
    assert_eq!(red.calls(), 1);
    assert_eq!(green.calls(), 1);
    assert!(!record(&controller).is_incident_open());
    assert_eq!(controller.world().stats().codes.sent, 2);
}

#[tokio::test(start_paused = true)]
async fn second_outage_inside_cooldown_is_suppressed() {
    let probe = ScriptedTask::new([false, true, false, true], true);
    let red = ScriptedTask::always(true);
    let green = ScriptedTask::always(true);
    let rec = monitor(&probe, 1, 1)
        .with_code(Color::Red, code_route(COOLDOWN, red.clone()))
        .with_code(Color::Green, code_route(COOLDOWN, green.clone()));
    let mut controller = start(rec);
    let t0 = Instant::now();

    run_until(&mut controller, t0, Duration::from_millis(3500)).await;
    let codes = &controller.world().stats().codes;
    assert_eq!(red.calls(), 1);
    assert_eq!(codes.suppressed, 1);
    assert_eq!(green.calls(), 2);
    assert!(!record(&controller).is_incident_open());
}

#[tokio::test(start_paused = true)]
async fn run_stops_on_cancel_and_publishes_snapshot() {
    let probe = ScriptedTask::always(true);
    let mut settings = settings();
    settings.controller.sizing_interval = Duration::from_secs(1);
    let mut world = World::new(SystemsConfig::default());
    world.insert(monitor(&probe, 1, 1), Instant::now()).unwrap();
    let controller = Controller::start(world, settings);
    let snapshots = controller.snapshots();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
    });
    let report = controller.run(token).await;

    assert!(report.clean);
    assert!(report.ticks >= 200);
    assert!(probe.calls() >= 2);
    let snapshot = snapshots.load();
    assert_eq!(snapshot.monitors, 1);
    assert!(snapshot.systems.dispatched[Pipeline::Pulse] >= 2);
    assert_eq!(snapshot.incidents_open, 0);
}
