//! End-to-end board and cycle scenarios against the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use progbot_core::fakes::{
    FakeCamera, FakeLineDevice, FakeOutcome, FakeProgrammer, HeadCall, MotionCall,
    RecordingMotion, RecordingObserver, RecordingTarget, ScriptedHead, TargetCall,
};
use progbot_core::{
    Config, ExportFormat, FileExportHandler, Hardware, OperationMode, Outcome, ProbeStatus,
    ProgBot, ProgBotError, ProgramStatus, ProvisionScript, ProvisionStatus, TestStatus,
    VisionController, VisionStatus,
};

struct Rig {
    motion: RecordingMotion,
    head: ScriptedHead,
    target: RecordingTarget,
    programmer: FakeProgrammer,
}

impl Rig {
    fn new(head: ScriptedHead) -> Self {
        Self {
            motion: RecordingMotion::new(),
            head,
            target: RecordingTarget::silent(),
            programmer: FakeProgrammer::new(),
        }
    }

    fn landing() -> Self {
        Self::new(ScriptedHead::landing())
    }

    fn hardware(&self) -> Hardware {
        Hardware {
            motion: Arc::new(self.motion.clone()),
            head: Arc::new(self.head.clone()),
            target: Arc::new(self.target.clone()),
            programmer: Arc::new(self.programmer.clone()),
            vision: None,
        }
    }

    fn bot(&self, config: Config) -> ProgBot {
        ProgBot::new(config, self.hardware())
    }
}

fn panel(cols: u32, rows: u32) -> Config {
    Config {
        board_num_cols: cols,
        board_num_rows: rows,
        ..Config::default()
    }
}

fn rel_moves(calls: &[MotionCall]) -> Vec<(f64, f64)> {
    calls
        .iter()
        .filter_map(|c| match c {
            MotionCall::RapidXyRel(dx, dy) => Some((*dx, *dy)),
            _ => None,
        })
        .collect()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ── skipping ──

#[tokio::test(start_paused = true)]
async fn skipped_board_never_moves_the_stage() {
    let rig = Rig::landing();
    let mut bot = rig.bot(Config {
        skip_board_pos: vec![(0, 1)],
        ..panel(1, 2)
    });

    bot.run_board(0, 1).await.unwrap();

    let status = bot.board_status(0, 1).unwrap();
    assert_eq!(status.probe(), ProbeStatus::Skipped);
    assert_eq!(status.program(), ProgramStatus::Skipped);
    assert!(rig.motion.calls().is_empty());
    assert!(rig.head.calls().is_empty());
    assert_eq!(bot.current_board(), None);
}

#[tokio::test(start_paused = true)]
async fn position_outside_panel_is_rejected() {
    let rig = Rig::landing();
    let mut bot = rig.bot(panel(1, 1));

    let err = bot.run_board(3, 0).await.unwrap_err();
    assert!(matches!(err, ProgBotError::OutOfPanel { col: 3, .. }));
    assert!(rig.motion.calls().is_empty());
}

// ── probing and contact ──

#[tokio::test(start_paused = true)]
async fn probe_failure_fails_board_and_retracts() {
    let rig = Rig::landing();
    rig.motion.push_probe_failure();
    let mut bot = rig.bot(panel(1, 1));

    let err = bot.run_board(0, 0).await.unwrap_err();
    assert!(matches!(err, ProgBotError::ProbeFailed { col: 0, row: 0, .. }));

    let calls = rig.motion.calls();
    let probe_at = calls.iter().position(|c| *c == MotionCall::Probe).unwrap();
    assert_eq!(calls[probe_at + 1..], [MotionCall::RapidZAbs(0.0)]);

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.probe(), ProbeStatus::Failed);
    assert_eq!(status.failure_reason.as_deref(), Some("Probe failed"));
    assert_eq!(rig.programmer.program_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn descent_uses_probe_distance_plus_board_offset() {
    let rig = Rig::landing();
    rig.motion.push_probe_distance(12.5);
    let mut bot = rig.bot(Config {
        probe_plane_to_board: 4.0,
        descend_feed_rate: 150.0,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    let calls = rig.motion.calls();
    assert!(calls.contains(&MotionCall::RapidZAbs(-12.5)));
    assert!(calls.contains(&MotionCall::MoveZAbs(-16.5, 150.0)));
}

#[tokio::test(start_paused = true)]
async fn contact_at_safe_height_is_unexpected() {
    let rig = Rig::new(ScriptedHead::new([true]));
    let mut bot = rig.bot(panel(1, 1));

    let err = bot.run_board(0, 0).await.unwrap_err();
    assert!(matches!(err, ProgBotError::UnexpectedContact { col: 0, row: 0 }));

    let calls = rig.motion.calls();
    assert!(!calls.iter().any(|c| matches!(c, MotionCall::MoveZAbs(..))));
    assert_eq!(calls.last(), Some(&MotionCall::RapidZAbs(0.0)));
    assert_eq!(bot.board_status(0, 0).unwrap().probe(), ProbeStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn missing_contact_is_found_by_nudging_y() {
    // safe height: none; after descent: none, +0.1: none, -0.1: contact
    let rig = Rig::new(ScriptedHead::new([false, false, false, true]));
    let mut bot = rig.bot(panel(1, 1));

    bot.run_board(0, 0).await.unwrap();

    let moves = rel_moves(&rig.motion.calls());
    assert_eq!(moves.len(), 2);
    assert!(close(moves[0].1, 0.1));
    assert!(close(moves[1].1, -0.2));
    assert!(moves.iter().all(|(dx, _)| *dx == 0.0));
    assert_eq!(bot.board_status(0, 0).unwrap().probe(), ProbeStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn no_contact_restores_nominal_position_and_fails() {
    let rig = Rig::new(ScriptedHead::new([]));
    let mut bot = rig.bot(panel(1, 1));

    let err = bot.run_board(0, 0).await.unwrap_err();
    assert!(matches!(err, ProgBotError::NoContact { attempts: 4, .. }));

    let moves = rel_moves(&rig.motion.calls());
    assert_eq!(moves.len(), 5);
    let net: f64 = moves.iter().map(|(_, dy)| dy).sum();
    assert!(close(net, 0.0));

    let (x, y) = bot.config().board_position(0, 0);
    let position = rig.motion.position();
    assert!(close(position.x, x) && close(position.y, y));
    assert!(!rig.head.calls().contains(&HeadCall::SetPower(true)));
}

// ── operation modes ──

#[tokio::test(start_paused = true)]
async fn program_mode_powers_programs_and_powers_down() {
    let rig = Rig::landing();
    let mut bot = rig.bot(panel(1, 1));

    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.probe(), ProbeStatus::Completed);
    assert_eq!(status.program(), ProgramStatus::Completed);
    assert_eq!(status.test(), TestStatus::Idle);
    assert_eq!(status.outcome().map(|o| o.0), Some(Outcome::Passed));

    let head = rig.head.calls();
    let power_on = head.iter().position(|c| *c == HeadCall::SetPower(true)).unwrap();
    let logic_on = head.iter().position(|c| *c == HeadCall::SetLogic(true)).unwrap();
    assert!(power_on < logic_on);
    assert_eq!(head.last(), Some(&HeadCall::SetAll(false)));
    assert_eq!(rig.motion.calls().last(), Some(&MotionCall::RapidZAbs(0.0)));
    assert!(rig.target.calls().contains(&TargetCall::Monitor));
    assert!(!rig.target.calls().contains(&TargetCall::Test));
}

#[tokio::test(start_paused = true)]
async fn failed_program_skips_the_rest_but_continues() {
    let rig = Rig::landing();
    rig.programmer.set_program(FakeOutcome::Fail);
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::ProgramAndTest,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.program(), ProgramStatus::Failed);
    assert_eq!(status.test(), TestStatus::Idle);
    assert_eq!(status.failure_reason.as_deref(), Some("Program failed"));
    assert!(rig.target.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn program_and_test_runs_the_target_test() {
    let rig = Rig::landing();
    rig.target.set_test_result(false);
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::ProgramAndTest,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.program(), ProgramStatus::Completed);
    assert_eq!(status.test(), TestStatus::Failed);
    assert_eq!(status.outcome(), Some((Outcome::Failed, Some("Test"))));
}

#[tokio::test(start_paused = true)]
async fn identify_only_never_flashes() {
    let rig = Rig::landing();
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::IdentifyOnly,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    assert_eq!(rig.programmer.identify_calls(), 1);
    assert_eq!(rig.programmer.program_calls(), 0);
    assert_eq!(
        bot.board_status(0, 0).unwrap().program(),
        ProgramStatus::Identified
    );
}

#[tokio::test(start_paused = true)]
async fn test_only_skips_programming() {
    let rig = Rig::landing();
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::TestOnly,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.program(), ProgramStatus::Skipped);
    assert_eq!(status.test(), TestStatus::Completed);
    assert_eq!(status.outcome().map(|o| o.0), Some(Outcome::Passed));
    assert_eq!(rig.programmer.program_calls(), 0);
    assert!(!rig.target.calls().contains(&TargetCall::Monitor));
}

#[tokio::test(start_paused = true)]
async fn disabled_programming_is_skipped_but_test_still_runs() {
    let rig = Rig::landing();
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::ProgramAndTest,
        programming_enabled: false,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.program(), ProgramStatus::Skipped);
    assert_eq!(status.test(), TestStatus::Completed);
    assert_eq!(rig.programmer.program_calls(), 0);
    assert!(rig.target.calls().contains(&TargetCall::Test));
}

#[tokio::test(start_paused = true)]
async fn disabled_programming_skips_identify() {
    let rig = Rig::landing();
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::IdentifyOnly,
        programming_enabled: false,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    assert_eq!(rig.programmer.identify_calls(), 0);
    assert_eq!(
        bot.board_status(0, 0).unwrap().program(),
        ProgramStatus::Skipped
    );
    assert_eq!(rig.head.calls().last(), Some(&HeadCall::SetAll(false)));
}

#[tokio::test(start_paused = true)]
async fn disabled_test_is_skipped_after_programming() {
    let rig = Rig::landing();
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::ProgramAndTest,
        test_enabled: false,
        ..panel(1, 1)
    });

    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.program(), ProgramStatus::Completed);
    assert_eq!(status.test(), TestStatus::Skipped);
    assert_eq!(status.outcome().map(|o| o.0), Some(Outcome::Passed));
    assert!(!rig.target.calls().contains(&TargetCall::Test));
}

#[tokio::test(start_paused = true)]
async fn programmer_error_interrupts_and_propagates() {
    let rig = Rig::landing();
    rig.programmer
        .set_program(FakeOutcome::Error("nrfutil not found".into()));
    let mut bot = rig.bot(panel(1, 1));

    let err = bot.run_board(0, 0).await.unwrap_err();
    assert!(matches!(err, ProgBotError::Controller(_)));

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.program(), ProgramStatus::Failed);
    assert_eq!(rig.head.calls().last(), Some(&HeadCall::SetAll(false)));
    assert_eq!(bot.current_board(), Some((0, 0)));
}

// ── provisioning ──

fn capture_script() -> ProvisionScript {
    ProvisionScript::from_json(
        r#"{
            "name": "read-id",
            "steps": [
                {"send": "read-serial", "expect": "SERIAL=(?P<device_id>\\w+)"},
                {"send": "label {cell_id} {serial_number}", "expect": "OK"}
            ]
        }"#,
    )
    .unwrap()
}

fn console() -> FakeLineDevice {
    FakeLineDevice::with_responder("ttyTARGET", |cmd| match cmd {
        "read-serial" => vec!["SERIAL=NRF42".into()],
        _ => vec!["OK".into()],
    })
}

#[tokio::test(start_paused = true)]
async fn provisioning_captures_land_in_board_record() {
    let mut rig = Rig::landing();
    rig.target = RecordingTarget::new(console());
    let mut bot = rig.bot(Config {
        provision_enabled: true,
        provision_script: Some(capture_script()),
        ..panel(1, 1)
    });

    // no QR pass, so the serial variable is missing and step two fails
    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.provision(), ProvisionStatus::Failed);
    let info = status.board_info.as_ref().unwrap();
    assert_eq!(info.test_data["device_id"], "NRF42");
    assert_eq!(info.provision_result, Some(false));
    assert!(status.failure_reason.as_deref().unwrap().starts_with("Step 2"));
    assert_eq!(rig.target.device().sent(), vec!["read-serial"]);
}

#[tokio::test(start_paused = true)]
async fn qr_serial_reaches_provisioning_variables() {
    let mut rig = Rig::landing();
    rig.target = RecordingTarget::new(console());
    let camera = FakeCamera::new(vec![Some("SN-0001"); 8]);
    let config = Config {
        vision_enabled: true,
        provision_enabled: true,
        provision_script: Some(capture_script()),
        ..panel(1, 1)
    };
    let mut hardware = rig.hardware();
    hardware.vision = Some(Arc::new(VisionController::new(
        Arc::new(camera.clone()),
        config.scan_settings(),
    )));
    let mut bot = ProgBot::new(config, hardware);

    let summary = bot.full_cycle().await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.vision(), VisionStatus::Passed);
    assert_eq!(status.provision(), ProvisionStatus::Completed);
    assert_eq!(
        rig.target.device().sent(),
        vec!["read-serial", "label R0C0 SN-0001"]
    );
    assert_eq!(summary.boards[0].serial, "SN-0001");
    assert!(camera.preview_stops() >= 1);
}

#[tokio::test(start_paused = true)]
async fn failed_provisioning_skips_the_target_test() {
    let mut rig = Rig::landing();
    rig.target = RecordingTarget::new(console());
    let mut bot = rig.bot(Config {
        operation_mode: OperationMode::TestOnly,
        provision_enabled: true,
        provision_script: Some(capture_script()),
        ..panel(1, 1)
    });

    // step two needs the QR serial, which no scan provided
    bot.run_board(0, 0).await.unwrap();

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.provision(), ProvisionStatus::Failed);
    assert_eq!(status.test(), TestStatus::Skipped);
    assert_eq!(status.outcome(), Some((Outcome::Failed, Some("Provisioning"))));
    assert!(!rig.target.calls().contains(&TargetCall::Test));
}

// ── vision ──

#[tokio::test(start_paused = true)]
async fn unreadable_qr_skips_the_board() {
    let rig = Rig::landing();
    let camera = FakeCamera::new(vec![]);
    let config = Config {
        vision_enabled: true,
        ..panel(1, 2)
    };
    let mut hardware = rig.hardware();
    hardware.vision = Some(Arc::new(VisionController::new(
        Arc::new(camera.clone()),
        config.scan_settings(),
    )));
    let mut bot = ProgBot::new(config, hardware);

    let summary = bot.full_cycle().await.unwrap();

    for row in 0..2 {
        let status = bot.board_status(0, row).unwrap();
        assert_eq!(status.vision(), VisionStatus::Failed);
        assert_eq!(status.probe(), ProbeStatus::Skipped);
        assert_eq!(status.failure_reason.as_deref(), Some("No QR code"));
    }
    assert!(!rig.motion.calls().contains(&MotionCall::Probe));
    assert_eq!(summary.failed_count, 2);
    assert!(camera.captures() > 0);
}

// ── full cycles ──

#[tokio::test(start_paused = true)]
async fn full_cycle_passes_every_board_and_parks() {
    let rig = Rig::landing();
    let mut bot = rig.bot(Config {
        skip_board_pos: vec![(1, 0)],
        ..panel(2, 2)
    });
    let observer = Arc::new(RecordingObserver::new());
    bot.subscribe(observer.clone());

    let summary = bot.full_cycle().await.unwrap();

    assert_eq!(summary.passed_count, 3);
    assert_eq!(summary.failed_count, 0);
    assert!(summary.skipped_count >= 1);
    assert_eq!(rig.programmer.program_calls(), 3);

    let calls = rig.motion.calls();
    assert_eq!(calls[0], MotionCall::Connect);
    assert_eq!(calls[1], MotionCall::Init { homing: true });
    let tail = &calls[calls.len() - 2..];
    assert_eq!(
        tail,
        [MotionCall::RapidXyAbs(0.0, 300.0), MotionCall::MotorsOff]
    );

    let visited: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            MotionCall::RapidXyAbs(x, y) if *y != 300.0 => Some((*x, *y)),
            _ => None,
        })
        .collect();
    let config = bot.config();
    assert_eq!(
        visited,
        vec![
            config.board_position(0, 0),
            config.board_position(0, 1),
            config.board_position(1, 1),
        ]
    );

    assert!(observer.phases().iter().any(|p| p == "Done with full cycle"));
    assert!(observer.errors().is_empty());
    assert!(bot.last_summary().is_some());
    assert_eq!(bot.current_board(), None);
}

#[tokio::test(start_paused = true)]
async fn devices_are_opened_once() {
    let rig = Rig::landing();
    let mut bot = rig.bot(panel(1, 1));

    bot.full_cycle().await.unwrap();
    bot.full_cycle().await.unwrap();

    let connects = rig
        .motion
        .calls()
        .iter()
        .filter(|c| **c == MotionCall::Connect)
        .count();
    assert_eq!(connects, 1);
    assert!(rig.target.calls().contains(&TargetCall::Connect));
}

#[tokio::test(start_paused = true)]
async fn mechanical_fault_stops_cycle_and_reports_position() {
    let rig = Rig::landing();
    rig.motion.push_probe_distance(10.0);
    rig.motion.push_probe_failure();
    let mut bot = rig.bot(panel(1, 3));
    let observer = Arc::new(RecordingObserver::new());
    bot.subscribe(observer.clone());

    let err = bot.full_cycle().await.unwrap_err();
    assert!(matches!(err, ProgBotError::ProbeFailed { row: 1, .. }));

    let errors = observer.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!((errors[0].col, errors[0].row), (Some(0), Some(1)));
    assert!(errors[0].traceback.contains("caused by"));

    assert_eq!(
        bot.board_status(0, 0).unwrap().outcome().map(|o| o.0),
        Some(Outcome::Passed)
    );
    assert_eq!(bot.board_status(0, 2).unwrap().probe(), ProbeStatus::Idle);
    assert_eq!(rig.motion.calls().last(), Some(&MotionCall::MotorsOff));

    let summary = bot.last_summary().unwrap();
    assert_eq!(summary.passed_count, 1);
    assert_eq!(summary.failed_count, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_continues_the_sweep_from_that_board() {
    let rig = Rig::landing();
    rig.motion.push_probe_distance(10.0);
    rig.motion.push_probe_failure();
    let mut bot = rig.bot(panel(1, 3));
    bot.full_cycle().await.unwrap_err();

    let summary = bot.retry_board(0, 1).await.unwrap();

    for row in 0..3 {
        assert_eq!(
            bot.board_status(0, row).unwrap().outcome().map(|o| o.0),
            Some(Outcome::Passed),
            "row {row}"
        );
    }
    assert_eq!(summary.passed_count, 3);
}

#[tokio::test(start_paused = true)]
async fn operator_skip_continues_with_next_board() {
    let rig = Rig::landing();
    rig.motion.push_probe_distance(10.0);
    rig.motion.push_probe_failure();
    let mut bot = rig.bot(panel(1, 3));
    bot.full_cycle().await.unwrap_err();

    let summary = bot.skip_board(0, 1).await.unwrap();

    let skipped = bot.board_status(0, 1).unwrap();
    assert_eq!(skipped.probe(), ProbeStatus::Skipped);
    assert_eq!(
        skipped.board_info.as_ref().map(|i| i.notes.as_str()),
        Some("Skipped by operator")
    );
    assert_eq!(
        bot.board_status(0, 2).unwrap().outcome().map(|o| o.0),
        Some(Outcome::Passed)
    );
    assert_eq!(summary.skipped_count, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_reruns_later_boards_from_scratch() {
    let rig = Rig::landing();
    let mut bot = rig.bot(panel(1, 3));
    let first = bot.full_cycle().await.unwrap();
    assert_eq!(first.passed_count, 3);

    rig.programmer.set_program(FakeOutcome::Fail);
    let summary = bot.retry_board(0, 0).await.unwrap();

    assert_eq!(rig.programmer.program_calls(), 6);
    for row in 0..3 {
        let status = bot.board_status(0, row).unwrap();
        assert_eq!(status.program(), ProgramStatus::Failed, "row {row}");
        assert_eq!(
            status.outcome(),
            Some((Outcome::Failed, Some("Program"))),
            "row {row}"
        );
    }
    assert_eq!(summary.passed_count, 0);
    assert_eq!(summary.failed_count, 3);
}

#[tokio::test(start_paused = true)]
async fn operator_skip_reruns_boards_after_it() {
    let rig = Rig::landing();
    let mut bot = rig.bot(panel(1, 3));
    bot.full_cycle().await.unwrap();

    rig.programmer.set_program(FakeOutcome::Fail);
    let summary = bot.skip_board(0, 0).await.unwrap();

    assert_eq!(bot.board_status(0, 0).unwrap().probe(), ProbeStatus::Skipped);
    assert_eq!(
        bot.board_status(0, 2).unwrap().program(),
        ProgramStatus::Failed
    );
    assert_eq!(summary.failed_count, 2);
    assert_eq!(summary.skipped_count, 1);
}

// ── cancellation ──

#[tokio::test(start_paused = true)]
async fn cancel_mid_program_makes_the_fixture_safe() {
    let rig = Rig::landing();
    rig.programmer.set_duration(Duration::from_secs(60));
    let mut bot = rig.bot(panel(1, 2));
    let cancel = bot.cancel_signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    });

    let err = bot.full_cycle().await.unwrap_err();
    assert!(matches!(err, ProgBotError::Cancelled));

    let status = bot.board_status(0, 0).unwrap();
    assert_eq!(status.probe(), ProbeStatus::Completed);
    assert_eq!(status.program(), ProgramStatus::Interrupted);
    assert_eq!(
        status.outcome(),
        Some((Outcome::Failed, Some("Interrupted")))
    );
    assert_eq!(bot.board_status(0, 1).unwrap().probe(), ProbeStatus::Idle);

    let calls = rig.motion.calls();
    let tail = &calls[calls.len() - 3..];
    assert_eq!(
        tail,
        [
            MotionCall::RapidZAbs(0.0),
            MotionCall::RapidXyAbs(0.0, 300.0),
            MotionCall::MotorsOff,
        ]
    );
    assert!(rig.head.calls().contains(&HeadCall::SetAll(false)));
    assert_eq!(bot.current_board(), None);
}

#[tokio::test(start_paused = true)]
async fn next_cycle_runs_after_cancel() {
    let rig = Rig::landing();
    rig.programmer.set_duration(Duration::from_secs(60));
    let mut bot = rig.bot(panel(1, 1));
    let cancel = bot.cancel_signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    });
    bot.full_cycle().await.unwrap_err();

    rig.programmer.set_duration(Duration::ZERO);
    let summary = bot.full_cycle().await.unwrap();
    assert_eq!(summary.passed_count, 1);
}

// ── results ──

#[tokio::test(start_paused = true)]
async fn cycle_summary_is_exported() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::landing();
    let mut bot = rig.bot(panel(1, 2));
    bot.add_result_handler(Arc::new(FileExportHandler::new(
        dir.path(),
        ExportFormat::Both,
    )));

    bot.full_cycle().await.unwrap();

    let mut names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with(".csv"));
    assert!(names[1].ends_with(".json"));
}
