//! End-to-end runs of the thermostat pipeline.

use dm_demo::app::{self, AppError};
use dm_demo::cli::Opts;
use dm_demo::model::{self, HvacMode, sensor_sample};
use serde_json::Value;

fn point<'a>(points: &'a [Value], name: &str) -> &'a Value {
    points
        .iter()
        .find(|p| p["name"] == name)
        .unwrap_or_else(|| panic!("no point {name}"))
}

#[test]
fn run_counts_every_sample_and_ends_on_last() {
    let opts = Opts {
        samples: 60,
        interval_ms: 0,
        ..Opts::default()
    };
    let summary = app::run(&opts).unwrap();
    assert!(summary.settled);
    assert_eq!(summary.samples_written, 60);
    assert_eq!(summary.journal_lines, 0);

    let metrics = point(&summary.points, model::METRICS);
    assert_eq!(metrics["valid"], true);
    assert_eq!(metrics["val"]["numSamples"], 60);

    let last = sensor_sample(59);
    let temp = point(&summary.points, model::INDOOR_TEMP);
    assert_eq!(temp["val"].as_f64().unwrap() as f32, last);

    let expected = HvacMode::decide(last, opts.setpoint, opts.deadband);
    let mode = point(&summary.points, model::MODE);
    assert_eq!(mode["val"], serde_json::to_value(expected).unwrap());
}

#[test]
fn locked_mode_is_left_alone() {
    let opts = Opts {
        samples: 20,
        interval_ms: 0,
        set: vec![r#"{"name":"thermostat.mode","locked":true,"val":"cool"}"#.into()],
        ..Opts::default()
    };
    let summary = app::run(&opts).unwrap();
    let mode = point(&summary.points, model::MODE);
    assert_eq!(mode["locked"], true);
    assert_eq!(mode["val"], "cool");
    // Control still runs; status is not locked.
    let status = point(&summary.points, model::STATUS);
    assert_ne!(status["val"], "idle");
}

#[test]
fn dump_only_applies_updates_without_running() {
    let opts = Opts {
        dump_only: true,
        set: vec![
            r#"{"name":"thermostat.setpoint","val":18.5}"#.into(),
            r#"{"name":"thermostat.status","valid":false}"#.into(),
        ],
        ..Opts::default()
    };
    let summary = app::run(&opts).unwrap();
    assert_eq!(summary.samples_written, 0);
    assert_eq!(summary.points.len(), 5);
    assert_eq!(point(&summary.points, model::SETPOINT)["val"], 18.5);
    assert_eq!(point(&summary.points, model::STATUS)["valid"], false);
    assert_eq!(point(&summary.points, model::INDOOR_TEMP)["valid"], false);
}

#[test]
fn rejected_update_stops_the_run() {
    let opts = Opts {
        set: vec![r#"{"name":"thermostat.mode","val":"sideways"}"#.into()],
        ..Opts::default()
    };
    let err = app::run(&opts).unwrap_err();
    assert!(matches!(err, AppError::Update(_)));
}

#[test]
fn journal_file_records_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("thermostat.jsonl");
    let opts = Opts {
        samples: 25,
        interval_ms: 1,
        journal: Some(path.to_string_lossy().into_owned()),
        ..Opts::default()
    };
    let summary = app::run(&opts).unwrap();
    assert!(summary.settled);

    let lines: Vec<Value> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len() as u64, summary.journal_lines);
    // One initial line per point, then at least the final state of each.
    assert!(lines.len() >= 5);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line["seq"], i as u64 + 1);
    }

    // The last line for each point matches the final dump.
    for final_point in &summary.points {
        let name = final_point["name"].as_str().unwrap();
        let last = lines
            .iter()
            .rev()
            .find(|l| l["point"]["name"] == name)
            .unwrap();
        assert_eq!(&last["point"], final_point, "journal lags for {name}");
    }
}
