//! End-to-end cavity setup and shutdown against the simulated channel
//! service.

use srf_setup::cavity::StageRequests;
use srf_setup::channel::{ChannelAccess, ChannelValue, SimChannelService};
use srf_setup::config::{LinacLayout, MachineLayout, Settings};
use srf_setup::hierarchy::Machine;
use srf_setup::persist::PositionStore;
use srf_setup::status::{CaptureStatusSink, ProcedureStatus, StatusSink};
use std::collections::HashSet;
use std::sync::Arc;

struct Fixture {
    machine: Machine,
    service: Arc<SimChannelService>,
    sink: Arc<CaptureStatusSink>,
    _dir: tempfile::TempDir,
}

/// One cryomodule in L0B, with a ramp fast enough for tests.
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
    settings.ramp.step_size = 5.0;
    settings.ramp.step_time_secs = 0.01;

    let machine = Machine::build(
        &settings,
        Arc::clone(&service) as Arc<dyn ChannelAccess>,
        Arc::clone(&sink) as Arc<dyn StatusSink>,
        store,
    )
    .expect("machine builds");

    Fixture {
        machine,
        service,
        sink,
        _dir: dir,
    }
}

fn cavity(fx: &Fixture, target: &str) -> Arc<srf_setup::cavity::Cavity> {
    fx.machine
        .resolve(target, &HashSet::new())
        .expect("target resolves")
        .remove(0)
}

#[tokio::test]
async fn test_full_setup_completes_and_releases_guard() {
    let fx = fixture();
    let cavity = cavity(&fx, "CM01:1");
    // Design amplitude captured as the ramp target at the start of the run.
    fx.service.set("ACCL:L0B:0110:ADES", ChannelValue::Float(16.6));

    let status = cavity.setup().await;
    assert_eq!(status, ProcedureStatus::Complete);
    assert!(!cavity.abort_state().is_running());

    let last = fx.sink.last_for("CM01 cavity 1").expect("status emitted");
    assert_eq!(last.status, ProcedureStatus::Complete);
    assert_eq!(last.progress, 100);

    // The ramp walked ADES up to the captured target.
    let ades = fx.service.puts_matching("0110:ADES");
    assert_eq!(ades.last(), Some(&("ACCL:L0B:0110:ADES".to_string(), ChannelValue::Float(16.6))));

    // The guard was released, so a second run is accepted.
    assert_eq!(cavity.setup().await, ProcedureStatus::Complete);
}

#[tokio::test]
async fn test_second_start_rejected_while_running() {
    let fx = fixture();
    let cavity = cavity(&fx, "CM01:1");
    let _guard = cavity.abort_state().try_start().expect("claim guard");
    fx.service.clear_puts();

    let status = cavity.setup().await;
    assert_eq!(status, ProcedureStatus::Running);
    // The rejected run touched no hardware.
    assert!(fx.service.puts().is_empty());
    let last = fx.sink.last_for("CM01 cavity 1").expect("status emitted");
    assert!(last.message.contains("already running"));
}

#[tokio::test]
async fn test_offline_cavity_refuses_setup() {
    let fx = fixture();
    let cavity = cavity(&fx, "CM01:1");
    fx.service.set("ACCL:L0B:0110:HWMODE", ChannelValue::Int(3));
    fx.service.clear_puts();

    let status = cavity.setup().await;
    assert_eq!(status, ProcedureStatus::Error);
    assert!(fx.service.puts().is_empty());
    let last = fx.sink.last_for("CM01 cavity 1").expect("status emitted");
    assert!(last.message.contains("not online"));
}

#[tokio::test]
async fn test_skipped_stages_are_not_run() {
    let fx = fixture();
    let cavity = cavity(&fx, "CM01:1");
    fx.service.set("ACCL:L0B:0110:ADES", ChannelValue::Float(16.6));
    cavity.set_requests(StageRequests {
        ssa_cal: false,
        tune: true,
        characterize: false,
        ramp: true,
    });
    fx.service.clear_puts();

    let status = cavity.setup().await;
    assert_eq!(status, ProcedureStatus::Complete);

    // Skipped stages issued none of their writes.
    assert!(fx.service.puts_matching("SSA:CALSTRT").is_empty());
    assert!(fx.service.puts_matching("PROBECALSTRT").is_empty());
    // The ramp stage still ran: mode control was exercised.
    assert!(!fx.service.puts_matching("RFMODECTRL").is_empty());
}

#[tokio::test]
async fn test_abort_mid_run_turns_rf_off_and_reports_aborted() {
    let fx = fixture();
    let cavity = cavity(&fx, "CM01:1");
    fx.service.set("ACCL:L0B:0110:ADES", ChannelValue::Float(16.6));

    // Trip the abort flag as soon as the SSA calibration strobe is written,
    // so the run dies at its next poll point.
    let abort = Arc::clone(cavity.abort_state());
    fx.service
        .subscribe(
            "ACCL:L0B:0110:SSA:CALSTRT",
            Box::new(move |_| abort.request_abort()),
        )
        .expect("subscribe");

    let status = cavity.setup().await;
    assert_eq!(status, ProcedureStatus::Aborted);
    assert!(!cavity.abort_state().is_running());

    let last = fx.sink.last_for("CM01 cavity 1").expect("status emitted");
    assert_eq!(last.status, ProcedureStatus::Aborted);

    // The safety path turned RF and the SSA off.
    let rf = fx.service.puts_matching("RF:CTRL");
    assert_eq!(rf.last().map(|(_, v)| v.clone()), Some(ChannelValue::Int(0)));
    assert!(!fx.service.puts_matching("SSA:PowerOff").is_empty());

    // No stage beyond the abort point ran.
    assert!(fx.service.puts_matching("PROBECALSTRT").is_empty());
}

#[tokio::test]
async fn test_shutdown_turns_rf_and_ssa_off() {
    let fx = fixture();
    let cavity = cavity(&fx, "CM01:3");
    fx.service.clear_puts();

    let status = cavity.shut_down().await;
    assert_eq!(status, ProcedureStatus::Complete);

    let rf = fx.service.puts_matching("0130:RF:CTRL");
    assert_eq!(rf.last().map(|(_, v)| v.clone()), Some(ChannelValue::Int(0)));
    assert!(!fx.service.puts_matching("0130:SSA:PowerOff").is_empty());

    let last = fx.sink.last_for("CM01 cavity 3").expect("status emitted");
    assert_eq!(last.status, ProcedureStatus::Complete);
    assert_eq!(last.progress, 100);
}
