//! Amplitude ramp worker behavior against the simulated channel service.

use srf_setup::channel::{ChannelAccess, ChannelValue, SimChannelService};
use srf_setup::config::{LinacLayout, MachineLayout, Settings};
use srf_setup::hierarchy::Machine;
use srf_setup::persist::PositionStore;
use srf_setup::ramp::{AmplitudeRampWorker, RampParams};
use srf_setup::status::{CaptureStatusSink, ProcedureStatus, StatusSink};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    cavity: Arc<srf_setup::cavity::Cavity>,
    service: Arc<SimChannelService>,
    sink: Arc<CaptureStatusSink>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let service = Arc::new(SimChannelService::new());
    let sink = Arc::new(CaptureStatusSink::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        PositionStore::open(dir.path().join("positions.json")).expect("store"),
    );

    let mut settings = Settings::default();
    settings.machine = MachineLayout {
        linacs: vec![LinacLayout {
            name: "L0B".into(),
            cryomodules: vec!["01".into()],
        }],
    };

    let machine = Machine::build(
        &settings,
        Arc::clone(&service) as Arc<dyn ChannelAccess>,
        Arc::clone(&sink) as Arc<dyn StatusSink>,
        store,
    )
    .expect("machine builds");
    let cavity = machine
        .resolve("CM01:1", &HashSet::new())
        .expect("cavity resolves")
        .remove(0);

    Fixture {
        cavity,
        service,
        sink,
        _dir: dir,
    }
}

fn params(start: f64, end: f64) -> RampParams {
    RampParams {
        start_amp: start,
        end_amp: end,
        step_size: 0.1,
        step_time: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn test_ramp_reaches_end_amplitude_in_expected_holds() {
    let fx = fixture();
    let outcome = AmplitudeRampWorker::new(&fx.cavity, params(0.5, 2.0))
        .run()
        .await;

    assert_eq!(outcome.status, ProcedureStatus::Complete);
    assert_eq!(outcome.run.steps().len(), 15);
    // The last level is exactly the end amplitude, never an overshoot.
    let last = outcome.run.steps().last().expect("steps recorded");
    assert!((last.amplitude() - 2.0).abs() < 1e-9);
    assert!(!last.samples().is_empty());

    let ades = fx.service.puts_matching("0110:ADES");
    assert_eq!(
        ades.last().map(|(_, v)| v.clone()),
        Some(ChannelValue::Float(2.0))
    );

    let last_report = fx.sink.last_for("CM01 cavity 1").expect("status emitted");
    assert_eq!(last_report.status, ProcedureStatus::Complete);
}

#[tokio::test]
async fn test_invalid_params_reported_before_any_write() {
    let fx = fixture();
    fx.service.clear_puts();

    let bad = RampParams {
        step_size: 0.0,
        ..params(0.5, 2.0)
    };
    let outcome = AmplitudeRampWorker::new(&fx.cavity, bad).run().await;

    assert_eq!(outcome.status, ProcedureStatus::Error);
    assert!(outcome.run.steps().is_empty());
    assert!(fx.service.puts().is_empty());
}

#[tokio::test]
async fn test_quench_latch_confirmed_by_loaded_q_stops_ramp() {
    let fx = fixture();
    // Healthy loaded Q near its reference before the ramp starts.
    fx.service
        .set("ACCL:L0B:0110:QLOADED_REF", ChannelValue::Float(4.1e7));
    fx.service
        .set("ACCL:L0B:0110:QLOADED", ChannelValue::Float(4.0e7));

    // Once the setpoint crosses 1.4 MV the cavity quenches: the latch trips
    // and the loaded Q collapses well below the real-quench threshold.
    let quench_service = Arc::clone(&fx.service);
    fx.service
        .subscribe(
            "ACCL:L0B:0110:ADES",
            Box::new(move |value| {
                if value.as_f64().is_some_and(|v| v >= 1.39) {
                    quench_service.set("ACCL:L0B:0110:QUENCH_LTCH", ChannelValue::Int(1));
                    quench_service.set("ACCL:L0B:0110:QLOADED", ChannelValue::Float(1.0e7));
                }
            }),
        )
        .expect("subscribe");

    let outcome = AmplitudeRampWorker::new(&fx.cavity, params(0.5, 2.0))
        .run()
        .await;

    assert_eq!(outcome.status, ProcedureStatus::Error);
    assert!(outcome.message.contains("1.4 MV"));
    // Levels 0.6 through 1.3 were held and recorded; 1.4 died in the check.
    assert_eq!(outcome.run.steps().len(), 8);

    // The safety path turned RF off.
    let rf = fx.service.puts_matching("0110:RF:CTRL");
    assert_eq!(rf.last().map(|(_, v)| v.clone()), Some(ChannelValue::Int(0)));

    let last_report = fx.sink.last_for("CM01 cavity 1").expect("status emitted");
    assert_eq!(last_report.status, ProcedureStatus::Error);
    assert!(last_report.message.contains("1.4 MV"));
}

#[tokio::test]
async fn test_unconfirmed_quench_latch_is_reset_and_ramp_continues() {
    let fx = fixture();
    // Loaded Q stays healthy for the whole run: the latch is an artifact.
    fx.service
        .set("ACCL:L0B:0110:QLOADED_REF", ChannelValue::Float(4.1e7));
    fx.service
        .set("ACCL:L0B:0110:QLOADED", ChannelValue::Float(4.0e7));

    // Trip the latch once at 1.4 MV; an interlock reset clears it again.
    let tripped = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let trip = Arc::clone(&tripped);
    let trip_service = Arc::clone(&fx.service);
    fx.service
        .subscribe(
            "ACCL:L0B:0110:ADES",
            Box::new(move |value| {
                if value.as_f64().is_some_and(|v| v >= 1.39)
                    && !trip.swap(true, std::sync::atomic::Ordering::SeqCst)
                {
                    trip_service.set("ACCL:L0B:0110:QUENCH_LTCH", ChannelValue::Int(1));
                }
            }),
        )
        .expect("subscribe");
    let reset_service = Arc::clone(&fx.service);
    fx.service
        .subscribe(
            "ACCL:L0B:0110:INTLK_RESET_ALL",
            Box::new(move |_| {
                reset_service.set("ACCL:L0B:0110:QUENCH_LTCH", ChannelValue::Int(0));
            }),
        )
        .expect("subscribe");

    let outcome = AmplitudeRampWorker::new(&fx.cavity, params(0.5, 2.0))
        .with_confirm_window(Duration::from_millis(50))
        .run()
        .await;

    // The latch never confirmed, so it was reset and the ramp finished.
    assert_eq!(outcome.status, ProcedureStatus::Complete);
    assert_eq!(outcome.run.steps().len(), 15);
    assert!(!fx.service.puts_matching("INTLK_RESET_ALL").is_empty());
    // No safety turn-off happened.
    assert!(fx.service.puts_matching("0110:RF:CTRL").is_empty());
}

#[tokio::test]
async fn test_abort_during_hold_reports_aborted() {
    let fx = fixture();
    let abort = Arc::clone(fx.cavity.abort_state());
    // Trip the abort once the ramp reaches its second level.
    fx.service
        .subscribe(
            "ACCL:L0B:0110:ADES",
            Box::new(move |value| {
                if value.as_f64().is_some_and(|v| v >= 0.69) {
                    abort.request_abort();
                }
            }),
        )
        .expect("subscribe");

    let outcome = AmplitudeRampWorker::new(&fx.cavity, params(0.5, 2.0))
        .run()
        .await;

    assert_eq!(outcome.status, ProcedureStatus::Aborted);
    // At most one full level was recorded before the abort was observed.
    assert!(outcome.run.steps().len() <= 1);
    assert!(!fx.service.puts_matching("SSA:PowerOff").is_empty());
}
