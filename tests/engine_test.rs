mod common;

use common::*;
use glitch_harness::command::CommandOutput;
use glitch_harness::config::{TaskKind, ERR_INSMOD_FAIL};
use glitch_harness::engine::{GlitchParams, GlitchRequest, SessionState};
use glitch_harness::result_log::ResultLog;
use std::sync::Arc;
use std::time::Duration;

const PARAMS: GlitchParams = GlitchParams {
    gval: 0xa0,
    gdur: 5,
    pdelay: 83000,
};
const REAL_ROUND: &str = "PARAM_gval=0xa0 ";
const WARM_UP_ROUND: &str = "PARAM_gval=0x65 ";

fn setup() -> (Arc<FakeTransport>, Arc<FakeClock>) {
    (Arc::new(FakeTransport::healthy()), Arc::new(FakeClock::default()))
}

#[test]
fn reboot_until_ready_configures_device() {
    let (transport, clock) = setup();
    let mut engine = engine(&transport, &clock);

    engine.reboot_until_ready().unwrap();

    assert_eq!(engine.state(), SessionState::Ready);
    assert_eq!(transport.count("host reboot"), 1);
    assert_eq!(transport.count("ps | wc -l"), 1);
    // init_time_before_polling of the Nexus 6P
    assert_eq!(clock.count(Duration::from_secs(32)), 1);
    // environment already verified, nothing replayed
    assert_eq!(transport.count(SETUP_CMDS[0]), 0);
}

#[test]
fn liveness_polling_gives_up() {
    let (transport, clock) = setup();
    transport.respond("ps | wc -l", &["12"]);
    let mut engine = engine(&transport, &clock);

    assert!(!engine.reboot_device().unwrap());
    // first poll plus 20 retries
    assert_eq!(transport.count("ps | wc -l"), 21);
    assert_eq!(engine.state(), SessionState::Rebooting);
}

#[test]
fn failing_reboot_command_aborts() {
    let (transport, clock) = setup();
    transport.respond_with("host reboot", vec![CommandOutput::new(Some(1), "error: device offline")]);
    let mut engine = engine(&transport, &clock);

    assert!(engine.reboot_device().is_err());
    assert_eq!(transport.count("host reboot"), 16);
    assert_eq!(clock.count(Duration::from_secs(30)), 16);
    assert_eq!(transport.count("ps | wc -l"), 0);
}

#[test]
fn env_mismatch_replays_setup() {
    let (transport, clock) = setup();
    transport.respond(ENV_CHECK, &["1", "1", "0"]);
    let mut engine = engine(&transport, &clock);

    engine.setup_environment().unwrap();

    assert_eq!(engine.state(), SessionState::Ready);
    assert_eq!(transport.count(SETUP_CMDS[0]), 1);
    assert_eq!(transport.count(SETUP_CMDS[1]), 1);
    assert_eq!(transport.count(ENV_CHECK), 3);
    assert_eq!(transport.count("host reboot"), 0);
}

#[test]
fn repeated_setup_failures_cool_down_then_abort() {
    let (transport, clock) = setup();
    transport.respond(ENV_CHECK, &["1"]);
    let mut engine = engine(&transport, &clock);

    assert!(engine.setup_environment().is_err());

    assert_eq!(clock.count(Duration::from_secs(600)), 1);
    assert_eq!(transport.count("host reboot"), 1);
    assert_eq!(transport.count(SETUP_CMDS[0]), 6);
}

#[test]
fn adbd_not_pinned_fails_verification() {
    let (transport, clock) = setup();
    transport.respond("taskset -ap", &["pid 123's current affinity mask: f0"]);
    let mut engine = engine(&transport, &clock);

    assert!(!engine.is_env_initialized().unwrap());
    assert_eq!(transport.count(ENV_CHECK), 0);
    assert_eq!(transport.count("taskset -ap 1 123"), 1);
    assert_eq!(transport.count("adb devices"), 2);
    assert_eq!(transport.count("host devices"), 0);
}

#[test]
fn temperature_is_ramped_up() {
    let (transport, clock) = setup();
    transport.respond(TEMP_SENSOR, &["30000", "35000", "36500"]);
    let mut engine = engine(&transport, &clock);
    let fever_tool = engine.config().fever_tool.clone();

    assert!(engine.regulate_temperature(36000, 38000).unwrap());

    let heat_runs = transport
        .commands()
        .iter()
        .filter(|command| **command == fever_tool)
        .count();
    assert_eq!(heat_runs, 2);
    assert_eq!(transport.count("pkill -9 -f"), 2);
}

#[test]
fn dead_sensor_stops_heating() {
    let (transport, clock) = setup();
    transport.respond(TEMP_SENSOR, &["30000", "0"]);
    let mut engine = engine(&transport, &clock);

    assert!(!engine.regulate_temperature(36000, 38000).unwrap());
}

#[test]
fn hot_device_cools_down_below_band_middle() {
    let (transport, clock) = setup();
    transport.respond(TEMP_SENSOR, &["40000", "38500", "37500", "36900"]);
    let mut engine = engine(&transport, &clock);

    assert!(engine.regulate_temperature(36000, 38000).unwrap());
    assert_eq!(transport.count(TEMP_SENSOR), 4);
    assert_eq!(clock.count(Duration::from_secs(5)), 3);
}

#[test]
fn glitch_round_logs_results() {
    let (transport, clock) = setup();
    transport.emit_on(
        REAL_ROUND,
        &kmsg_lines(&[
            "ITER,1,a0,5,83000,37000",
            "glitch,1500,420,77|ab",
            "slave,PASS,2100,600,0,ef",
            "ITER,2,a0,5,83000,37000",
            "slave,FAIL,2100,600,ff,ef",
        ]),
    );
    let mut engine = engine(&transport, &clock);
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(&dir.path().join("glitch_prof_FAKE01_clkscrew.txt"));

    let outcome = engine
        .do_glitch_one(&GlitchRequest::glitch(TaskKind::GlitchProfiling, "clkscrew", PARAMS), &log)
        .unwrap();

    assert!(outcome.success);
    assert!(!outcome.tz_failed);
    assert_eq!(outcome.valid, 2);
    assert_eq!(transport.count(WARM_UP_ROUND), 1);
    assert_eq!(transport.count(REAL_ROUND), 1);
    assert_eq!(transport.streams_opened(), 1);

    let content = std::fs::read_to_string(log.path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("0xa0,5,83000,PASS"));
    assert!(lines[1].starts_with("0xa0,5,83000,FAIL"));
}

#[test]
fn glitch_timeout_fails_the_round() {
    let (transport, clock) = setup();
    transport.respond_with(REAL_ROUND, vec![CommandOutput::timed_out()]);
    let mut engine = engine(&transport, &clock);
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(&dir.path().join("log.txt"));

    let outcome = engine
        .do_glitch_one(&GlitchRequest::glitch(TaskKind::GlitchProfiling, "clkscrew", PARAMS), &log)
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.valid, 0);
}

#[test]
fn warm_up_timeout_skips_the_real_round() {
    let (transport, clock) = setup();
    transport.respond_with(WARM_UP_ROUND, vec![CommandOutput::timed_out()]);
    let mut engine = engine(&transport, &clock);
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(&dir.path().join("log.txt"));

    let outcome = engine
        .do_glitch_one(&GlitchRequest::glitch(TaskKind::GlitchProfiling, "clkscrew", PARAMS), &log)
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(transport.count(REAL_ROUND), 0);
}

#[test]
fn module_load_failure_fails_the_round() {
    let (transport, clock) = setup();
    let insmod_error = format!("insmod: init_module failed: {}", ERR_INSMOD_FAIL);
    transport.respond(REAL_ROUND, &[insmod_error.as_str()]);
    transport.emit_on(
        REAL_ROUND,
        &kmsg_lines(&["ITER,1,a0,5,83000", "slave,PASS,1,2,0,"]),
    );
    let mut engine = engine(&transport, &clock);
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(&dir.path().join("log.txt"));

    let outcome = engine
        .do_glitch_one(&GlitchRequest::glitch(TaskKind::GlitchProfiling, "clkscrew", PARAMS), &log)
        .unwrap();

    assert!(!outcome.success);
    // results are still logged
    assert_eq!(outcome.valid, 1);
}

#[test]
fn tz_failure_is_reported() {
    let (transport, clock) = setup();
    transport.emit_on(
        REAL_ROUND,
        &kmsg_lines(&["ITER,1,a0,5,83000", "slave,TZFAIL"]),
    );
    let mut engine = engine(&transport, &clock);
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(&dir.path().join("log.txt"));

    let outcome = engine
        .do_glitch_one(&GlitchRequest::glitch(TaskKind::GlitchProfiling, "clkscrew", PARAMS), &log)
        .unwrap();

    assert!(outcome.tz_failed);
    assert!(!outcome.success);
    assert_eq!(outcome.valid, 0);
}

#[test]
fn protocol_violation_fails_the_round() {
    let (transport, clock) = setup();
    transport.emit_on(
        REAL_ROUND,
        &kmsg_lines(&["ITER,1,a0,5,83000", "slave,PASS,1,2,0,", "slave,BOGUS,1"]),
    );
    let mut engine = engine(&transport, &clock);
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(&dir.path().join("log.txt"));

    let outcome = engine
        .do_glitch_one(&GlitchRequest::glitch(TaskKind::GlitchProfiling, "clkscrew", PARAMS), &log)
        .unwrap();

    assert!(!outcome.success);
    // the iteration pending at the violation is still finalized
    assert_eq!(outcome.valid, 1);
}

#[test]
fn unverified_environment_skips_the_glitch() {
    let (transport, clock) = setup();
    transport.respond(ENV_CHECK, &["1"]);
    let mut engine = engine(&transport, &clock);
    let dir = tempfile::tempdir().unwrap();
    let log = ResultLog::new(&dir.path().join("log.txt"));

    let outcome = engine
        .do_glitch_one(&GlitchRequest::glitch(TaskKind::GlitchProfiling, "clkscrew", PARAMS), &log)
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(transport.count("insmod"), 0);
}
