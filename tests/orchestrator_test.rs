//! End-to-end tests through the application facade
//!
//! Both devices are simulated: the controller over loopback TCP, the oiler behind the
//! wireless adapter seam. Settings live in a temporary directory.

mod common;

use common::{
    empty_cache_settings, fast_instrument_options, fast_peripheral_options, OILER_ADDRESS,
    OILER_ID,
};
use scope_oiler::config::Settings;
use scope_oiler::error::OilerError;
use scope_oiler::hardware::oiler::PeripheralOptions;
use scope_oiler::hardware::simulated::{OilerBehaviour, SimulatedController, SimulatedOiler};
use scope_oiler::messages::RunEvent;
use scope_oiler::procedures::{ProcedureKind, RunOutcome, StepStatus};
use scope_oiler::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

struct Bench {
    controller: SimulatedController,
    oiler: SimulatedOiler,
    orchestrator: Orchestrator,
    settings_path: PathBuf,
    _dir: TempDir,
}

async fn bench_with(settings: Settings, objective: u32) -> Bench {
    bench_with_options(settings, objective, fast_peripheral_options()).await
}

async fn bench_with_options(
    settings: Settings,
    objective: u32,
    peripheral_options: PeripheralOptions,
) -> Bench {
    let dir = TempDir::new().unwrap();
    let settings_path = dir.path().join("oilboy_config.json");

    let controller = SimulatedController::start(objective).await.unwrap();
    let oiler = SimulatedOiler::new();
    oiler.advertise(OILER_ID, OILER_ADDRESS).await;

    let mut settings = settings;
    settings.instrument = controller.endpoint();

    let orchestrator = Orchestrator::with_options(
        settings_path.clone(),
        settings,
        Arc::new(oiler.clone()),
        fast_instrument_options(),
        peripheral_options,
    )
    .unwrap();

    Bench {
        controller,
        oiler,
        orchestrator,
        settings_path,
        _dir: dir,
    }
}

async fn bench(objective: u32) -> Bench {
    bench_with(empty_cache_settings(), objective).await
}

// =============================================================================
// Connecting and the device cache
// =============================================================================

#[tokio::test]
async fn test_discovered_address_is_persisted() {
    let bench = bench(1).await;
    assert!(!bench.settings_path.exists());

    let resolved = bench.orchestrator.connect_peripheral(None).await.unwrap();
    assert_eq!(resolved.identity, OILER_ID);
    assert_eq!(resolved.address, OILER_ADDRESS);
    assert!(resolved.discovered);
    assert!(bench.orchestrator.peripheral().is_connected());

    assert_eq!(
        bench.orchestrator.settings().known_address(OILER_ID),
        Some(OILER_ADDRESS)
    );
    let on_disk = Settings::load(&bench.settings_path).unwrap();
    assert_eq!(on_disk.known_address(OILER_ID), Some(OILER_ADDRESS));
    assert_eq!(on_disk.peripheral.identity, OILER_ID);

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cached_address_connects_without_scanning() {
    let settings = empty_cache_settings().remember_peripheral(OILER_ID, OILER_ADDRESS);
    let bench = bench_with(settings, 1).await;

    let resolved = bench.orchestrator.connect_peripheral(None).await.unwrap();
    assert!(!resolved.discovered);
    assert_eq!(bench.oiler.scans().await, 0);
    // Nothing changed, so nothing was written
    assert!(!bench.settings_path.exists());

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_stale_cached_address_falls_back_to_scan() {
    let settings = empty_cache_settings().remember_peripheral(OILER_ID, "STALE:00");
    let bench = bench_with(settings, 1).await;

    let resolved = bench.orchestrator.connect_peripheral(None).await.unwrap();
    assert!(resolved.discovered);
    assert_eq!(resolved.address, OILER_ADDRESS);
    assert_eq!(bench.oiler.scans().await, 1);

    let on_disk = Settings::load(&bench.settings_path).unwrap();
    assert_eq!(on_disk.known_address(OILER_ID), Some(OILER_ADDRESS));

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_missing_service_does_not_trigger_scan() {
    let settings = empty_cache_settings().remember_peripheral(OILER_ID, OILER_ADDRESS);
    let bench = bench_with(settings, 1).await;
    bench
        .oiler
        .set_behaviour(OilerBehaviour {
            missing_service: true,
            ..OilerBehaviour::default()
        })
        .await;

    let result = bench.orchestrator.connect_peripheral(None).await;
    assert!(matches!(result, Err(OilerError::Protocol(_))));
    assert_eq!(bench.oiler.scans().await, 0);

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_selecting_another_oiler_is_saved() {
    let settings = Settings::default().remember_peripheral("B200", OILER_ADDRESS);
    let bench = bench_with(settings, 1).await;
    bench.oiler.advertise("B200", OILER_ADDRESS).await;

    let resolved = bench.orchestrator.connect_peripheral(Some("b200")).await.unwrap();
    assert_eq!(resolved.identity, "B200");
    assert_eq!(bench.orchestrator.settings().peripheral.identity, "B200");
    assert_eq!(
        Settings::load(&bench.settings_path).unwrap().peripheral.identity,
        "B200"
    );

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_save_during_slow_connect_is_kept() {
    let options = PeripheralOptions {
        connect_retry_delay: Duration::from_millis(300),
        ..fast_peripheral_options()
    };
    let bench = bench_with_options(empty_cache_settings(), 1, options).await;
    bench.oiler.refuse_opens(1).await;

    let operator_edit = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut edited = (*bench.orchestrator.settings()).clone();
        edited.operation.default_dispense_amount = 77;
        bench.orchestrator.save_settings(edited).await
    };
    let (connected, saved) = tokio::join!(bench.orchestrator.connect_peripheral(None), operator_edit);
    assert_ok!(saved);
    assert!(assert_ok!(connected).discovered);

    let current = bench.orchestrator.settings();
    assert_eq!(current.operation.default_dispense_amount, 77);
    assert_eq!(current.known_address(OILER_ID), Some(OILER_ADDRESS));

    let on_disk = Settings::load(&bench.settings_path).unwrap();
    assert_eq!(on_disk.operation.default_dispense_amount, 77);
    assert_eq!(on_disk.known_address(OILER_ID), Some(OILER_ADDRESS));

    bench.orchestrator.shutdown().await;
}

// =============================================================================
// Procedures
// =============================================================================

#[tokio::test]
async fn test_low_to_high_end_to_end() {
    let bench = bench(1).await;
    assert_ok!(bench.orchestrator.connect_instrument().await);
    assert_ok!(bench.orchestrator.connect_peripheral(None).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = bench
        .orchestrator
        .run_procedure(ProcedureKind::LowToHigh { target_objective: 4 }, Some(tx))
        .await
        .unwrap();

    assert_eq!(run.outcome, RunOutcome::Succeeded);
    assert_eq!(run.steps_with(StepStatus::Done).count(), 6);
    assert_eq!(bench.controller.objective().await, 4);
    assert_eq!(bench.controller.z().await, 0.0);
    assert_eq!(bench.oiler.dispensed().await, vec![50]);

    let requests = bench.controller.requests().await;
    let motion: Vec<&str> = requests
        .iter()
        .map(String::as_str)
        .filter(|r| r.starts_with("SET") || r.starts_with("MOVE"))
        .collect();
    assert_eq!(
        motion,
        vec![
            "SET OBJECTIVE 0",
            "MOVE Z REL 50.000",
            "MOVE Z REL -50.000",
            "SET OBJECTIVE 4",
        ]
    );

    let mut finished = false;
    while let Ok(event) = rx.try_recv() {
        finished |= matches!(event, RunEvent::Finished { .. });
    }
    assert!(finished);

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_re_oil_end_to_end_uses_saved_amount() {
    let mut settings = empty_cache_settings();
    settings.operation.default_dispense_amount = 80;
    settings.operation.service_raise_microns = 25.0;
    let bench = bench_with(settings, 3).await;
    bench.orchestrator.connect_instrument().await.unwrap();
    bench.orchestrator.connect_peripheral(None).await.unwrap();

    let run = bench
        .orchestrator
        .run_procedure(ProcedureKind::ReOil, None)
        .await
        .unwrap();

    assert!(run.outcome.is_success());
    assert_eq!(run.return_objective, Some(3));
    assert_eq!(bench.controller.objective().await, 3);
    assert_eq!(bench.oiler.dispensed().await, vec![80]);
    assert!(bench
        .controller
        .requests()
        .await
        .contains(&"MOVE Z REL 25.000".to_string()));

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_run_refused_until_both_devices_connected() {
    let bench = bench(1).await;

    let result = bench
        .orchestrator
        .run_procedure(ProcedureKind::ReOil, None)
        .await;
    assert!(matches!(result, Err(OilerError::Connection(reason)) if reason.contains("controller")));

    bench.orchestrator.connect_instrument().await.unwrap();
    let result = bench.orchestrator.start_procedure(ProcedureKind::ReOil, None);
    assert!(matches!(result, Err(OilerError::Connection(reason)) if reason.contains("oiler")));

    // Nothing moved
    assert_eq!(bench.controller.requests().await, vec!["HELLO".to_string()]);
    assert!(bench.oiler.dispensed().await.is_empty());

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_device_failure_mid_run_is_reported() {
    let bench = bench(1).await;
    bench.orchestrator.connect_instrument().await.unwrap();
    bench.orchestrator.connect_peripheral(None).await.unwrap();
    bench
        .controller
        .script(
            "MOVE Z REL -",
            scope_oiler::hardware::simulated::ScriptedReply::Line("ERR 5 limit switch".to_string()),
        )
        .await;

    let run = bench
        .orchestrator
        .run_procedure(ProcedureKind::LowToHigh { target_objective: 4 }, None)
        .await
        .unwrap();

    assert!(matches!(
        run.outcome,
        RunOutcome::FailedAtStep { step: 5, .. }
    ));
    // No restore after a failure
    assert_eq!(bench.controller.objective().await, 0);

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_run_and_manual_move_are_busy() {
    let bench = bench(1).await;
    bench.orchestrator.connect_instrument().await.unwrap();
    bench.orchestrator.connect_peripheral(None).await.unwrap();
    bench
        .controller
        .set_move_latency(Duration::from_millis(50))
        .await;

    let handle = bench
        .orchestrator
        .start_procedure(ProcedureKind::LowToHigh { target_objective: 2 }, None)
        .unwrap();
    assert!(bench.orchestrator.is_running());

    assert!(matches!(
        bench.orchestrator.lower_stage().await,
        Err(OilerError::Busy)
    ));
    assert_err!(bench
        .orchestrator
        .run_procedure(ProcedureKind::ReOil, None)
        .await);

    let run = handle.await.unwrap();
    assert!(run.outcome.is_success());
    assert_eq!(bench.oiler.dispensed().await, vec![50]);
    assert!(!bench.orchestrator.is_running());

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_busy_wins_over_dropped_device() {
    let bench = bench(1).await;
    bench.orchestrator.connect_instrument().await.unwrap();
    bench.orchestrator.connect_peripheral(None).await.unwrap();
    bench
        .controller
        .set_move_latency(Duration::from_millis(200))
        .await;

    let handle = bench
        .orchestrator
        .start_procedure(ProcedureKind::ReOil, None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    bench.orchestrator.peripheral().disconnect().await;

    let result = bench
        .orchestrator
        .run_procedure(ProcedureKind::ReOil, None)
        .await;
    assert!(matches!(result, Err(OilerError::Busy)));

    let run = handle.await.unwrap();
    assert!(matches!(run.outcome, RunOutcome::FailedAtStep { step: 3, .. }));

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_run_cannot_start_during_manual_move() {
    let bench = bench(1).await;
    bench.orchestrator.connect_instrument().await.unwrap();
    bench.orchestrator.connect_peripheral(None).await.unwrap();
    bench
        .controller
        .set_move_latency(Duration::from_millis(150))
        .await;

    let attempt = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bench.orchestrator.is_running());
        bench
            .orchestrator
            .run_procedure(ProcedureKind::ReOil, None)
            .await
    };
    let (lowered, run) = tokio::join!(bench.orchestrator.lower_stage(), attempt);
    assert_ok!(lowered);
    assert!(matches!(run, Err(OilerError::Busy)));

    // Only the manual move reached the controller
    let requests = bench.controller.requests().await;
    assert_eq!(
        requests.iter().filter(|r| r.starts_with("MOVE") || r.starts_with("SET")).count(),
        1
    );
    assert!(!bench.orchestrator.is_running());

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_stops_at_step_boundary() {
    let bench = bench(1).await;
    bench.orchestrator.connect_instrument().await.unwrap();
    bench.orchestrator.connect_peripheral(None).await.unwrap();
    bench
        .controller
        .set_move_latency(Duration::from_millis(100))
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = bench
        .orchestrator
        .start_procedure(ProcedureKind::ReOil, Some(tx))
        .unwrap();

    // Cancel while the service objective is swinging in
    loop {
        match rx.recv().await {
            Some(RunEvent::StepStarted { step: 2, .. }) => break,
            Some(_) => continue,
            None => panic!("run ended early"),
        }
    }
    assert!(bench.orchestrator.cancel());

    let run = handle.await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Aborted { before_step: 3 });
    assert!(bench.oiler.dispensed().await.is_empty());
    assert_eq!(bench.controller.objective().await, 0);
    assert!(!bench.orchestrator.cancel());

    bench.orchestrator.shutdown().await;
}

// =============================================================================
// Manual operations and settings
// =============================================================================

#[tokio::test]
async fn test_lower_stage_uses_configured_drop() {
    let mut settings = empty_cache_settings();
    settings.operation.default_z_drop_microns = 30.0;
    let bench = bench_with(settings, 1).await;
    bench.orchestrator.connect_instrument().await.unwrap();

    assert_ok!(bench.orchestrator.lower_stage().await);
    assert_eq!(bench.controller.z().await, -30.0);
    assert!(bench
        .controller
        .requests()
        .await
        .contains(&"MOVE Z REL -30.000".to_string()));

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_battery_and_ping_through_facade() {
    let bench = bench(1).await;
    bench.orchestrator.connect_peripheral(None).await.unwrap();

    let reading = bench.orchestrator.query_battery().await.unwrap();
    assert!((reading.voltage - 3.9).abs() < 1e-6);
    assert_ok!(bench.orchestrator.ping_peripheral().await);

    bench.orchestrator.disconnect_all().await;
    assert!(!bench.orchestrator.peripheral().is_connected());
    assert!(!bench.orchestrator.instrument().is_connected());

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_invalid_save_keeps_snapshot() {
    let bench = bench(1).await;
    let mut watcher = bench.orchestrator.watch_settings();
    let before = bench.orchestrator.settings();

    let mut bad = (*before).clone();
    bad.operation.default_dispense_amount = 0;
    let result = bench.orchestrator.save_settings(bad).await;
    assert!(matches!(result, Err(OilerError::Config { .. })));
    assert_eq!(*bench.orchestrator.settings(), *before);
    assert!(!watcher.has_changed().unwrap());

    let mut good = (*before).clone();
    good.operation.default_dispense_amount = 64;
    bench.orchestrator.save_settings(good).await.unwrap();
    assert!(watcher.has_changed().unwrap());
    assert_eq!(
        bench.orchestrator.load_settings().await.unwrap().operation.default_dispense_amount,
        64
    );

    bench.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_open_reads_settings_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("oilboy_config.json");
    let mut settings = empty_cache_settings();
    settings.operation.service_objective_index = 2;
    settings.save(&path).unwrap();

    let orchestrator = Orchestrator::open(&path, Arc::new(SimulatedOiler::new())).unwrap();
    assert_eq!(orchestrator.settings().operation.service_objective_index, 2);
    assert_eq!(orchestrator.settings_path(), path.as_path());
    orchestrator.shutdown().await;
}
