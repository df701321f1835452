use std::io::Cursor;
use std::sync::mpsc;

use tossmeter::sensor::{spawn_json_reader, spawn_synthetic, Stamping, SyntheticThrow};
use tossmeter::{
    DetectorConfig, DetectorError, Input, JsonLines, Outcome, Phase, Sample, SessionDriver,
    SessionEvent, SessionOptions, SessionReport, ThrowDetector,
};

const G: f64 = 9.81;

fn line(t: f64, mag: f64) -> String {
    format!(r#"{{"timestamp": {t}, "ax": {mag}, "ay": 0.0, "az": {G}}}"#)
}

type Replayed = (Result<SessionReport, DetectorError>, Vec<SessionEvent>);

fn collecting_driver() -> SessionDriver<Vec<SessionEvent>> {
    SessionDriver::new(
        DetectorConfig::default(),
        SessionOptions::default(),
        Vec::<SessionEvent>::new(),
    )
    .unwrap()
}

fn replay_lines(lines: &[String]) -> Replayed {
    let (tx, rx) = mpsc::channel();
    spawn_json_reader(Cursor::new(lines.join("\n")), tx, Stamping::Source);
    let mut driver = collecting_driver();
    let result = driver.run_replay(&rx);
    (result, driver.into_sink())
}

#[test]
fn recorded_throw_from_json_lines() {
    let mut lines: Vec<String> = (0..=10).map(|i| line(i as f64 * 100.0, 2.0)).collect();
    lines.push(line(1100.0, 2.0));
    lines.push(line(1200.0, 2.0));
    lines.push(r#"{"timestamp": 1250, "ax": null, "ay": 0, "az": 9.81}"#.to_string());
    lines.push(line(1300.0, 16.0));
    lines.push(line(1400.0, 2.0));
    lines.push(line(1500.0, 2.0));
    lines.push(line(1600.0, 9.0));

    let (result, events) = replay_lines(&lines);
    let report = result.unwrap();
    assert_eq!(report.malformed, 1);
    match report.outcome {
        Outcome::Success(throw) => {
            assert!((throw.free_fall_s - 0.2).abs() < 1e-9);
            assert!((throw.height_m - 0.04905).abs() < 1e-9);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Result { status: "success", .. })
    ));
}

#[test]
fn recorded_stream_without_catch_is_closed() {
    let lines: Vec<String> = (0..30).map(|i| line(i as f64 * 100.0, 1.0)).collect();
    let (result, _) = replay_lines(&lines);
    assert!(matches!(result, Err(DetectorError::StreamClosed { samples: 30 })));
}

#[test]
fn empty_recording_is_sensor_unavailable() {
    let (result, _) = replay_lines(&[]);
    assert!(matches!(result, Err(DetectorError::SensorUnavailable)));
}

#[test]
fn simulated_throws_recover_height() {
    for height in [0.5, 1.0, 2.0, 4.0] {
        let throw = SyntheticThrow {
            height_m: height,
            rate_hz: 100.0,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel();
        spawn_synthetic(throw.samples(), tx, false);
        let mut driver = collecting_driver();
        let report = driver.run_replay(&rx).unwrap();
        match report.outcome {
            Outcome::Success(result) => {
                assert!(
                    (result.height_m - height).abs() / height < 0.1,
                    "target {height}, measured {}",
                    result.height_m
                );
            }
            other => panic!("expected success for {height} m, got {other:?}"),
        }
    }
}

#[test]
fn simulated_skyscraper_is_clamped() {
    let throw = SyntheticThrow {
        height_m: 45.0,
        ..Default::default()
    };
    let (tx, rx) = mpsc::channel();
    spawn_synthetic(throw.samples(), tx, false);
    let mut driver = SessionDriver::new(
        DetectorConfig::default(),
        SessionOptions::default(),
        JsonLines::new(Vec::<u8>::new()),
    )
    .unwrap();
    let report = driver.run_replay(&rx).unwrap();
    match report.outcome {
        Outcome::Success(result) => {
            assert_eq!(result.height_m, 20.0);
            assert!(result.clamped);
        }
        other => panic!("expected clamped success, got {other:?}"),
    }
    let output = String::from_utf8(driver.into_sink().into_inner()).unwrap();
    let last: serde_json::Value = serde_json::from_str(output.lines().last().unwrap()).unwrap();
    assert_eq!(last["event"], "result");
    assert_eq!(last["clamped"], true);
}

#[test]
fn sessions_are_independent() {
    let mut detector = ThrowDetector::new(DetectorConfig::default());
    let first = detector.arm(0.0);
    for i in 0..=20 {
        detector.process_sample(&Sample::new(i as f64 * 50.0, 2.0, 0.0, G));
    }
    detector.process_sample(&Sample::new(1100.0, 30.0, 0.0, G));
    assert_eq!(detector.phase(), Phase::Throwing);

    // a second attempt starts from scratch
    detector.arm(5000.0);
    assert_eq!(detector.phase(), Phase::Idle);
    assert!(detector.history().is_empty());

    // the first attempt's timeout fires late and must be ignored
    assert_eq!(detector.fire_timer(first.timeout.token, 20_000.0), None);
    assert_eq!(detector.phase(), Phase::Idle);

    // an unfinished replay leaves nothing armed behind
    let (tx, rx) = mpsc::channel();
    for i in 0..5 {
        tx.send(Input::Sample(Sample::new(i as f64 * 10.0, 1.0, 0.0, G)))
            .unwrap();
    }
    tx.send(Input::Closed).unwrap();
    drop(tx);
    let mut driver = collecting_driver();
    assert!(driver.run_replay(&rx).is_err());
    assert_eq!(driver.detector().phase(), Phase::Disarmed);
}
