//! Integration tests for the run lifecycle of the experiment engine.

mod common;

use common::{read_lines, scripted, test_settings, wait_terminal, wait_until, Witness, Script};
use labrun::engine::{ExperimentEngine, RunStatus};
use labrun::experiment::Row;
use labrun::params::{ParamSchema, ParamSpec, ParamValues};
use labrun::storage::{RunMetadata, RunPaths};
use labrun::{ExperimentInfo, ExperimentType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn f64_of(row: &Row, column: &str) -> f64 {
    row.get(column).and_then(|v| v.as_f64()).unwrap()
}

#[test]
fn start_then_stop_reaches_finished_with_header() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let experiment = scripted("slow", &["V"], Script::counting(1000, 0.05), &witness);

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    engine.stop();

    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
    assert!(engine.last_error().is_none());
    assert!(wait_until(Duration::from_secs(2), || witness.teardown_seen()));

    let row_file = engine.current_run().unwrap().row_file.unwrap();
    let lines = read_lines(&row_file);
    assert_eq!(lines[0], "t,sync_t,time,V");
}

#[test]
fn two_rows_produce_header_and_increasing_t() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let rows = vec![Row::new().with("V", 1.0), Row::new().with("V", 2.0)];
    let experiment = scripted("volts", &["V"], Script::rows(rows, 0.02), &witness);

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);

    let row_file = engine.current_run().unwrap().row_file.unwrap();
    let lines = read_lines(&row_file);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "t,sync_t,time,V");

    let t: Vec<f64> = lines[1..]
        .iter()
        .map(|line| line.split(',').next().unwrap().parse().unwrap())
        .collect();
    assert!(t[1] > t[0]);
    assert!(lines[1].ends_with(",1.0"));
    assert!(lines[2].ends_with(",2.0"));

    let received = engine.drain_rows();
    assert_eq!(received.len(), 2);
    assert_eq!(f64_of(&received[0], "V"), 1.0);
    assert_eq!(f64_of(&received[1], "V"), 2.0);
}

#[test]
fn declared_columns_keep_order_and_absent_keys_are_empty() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let rows = vec![Row::new().with("c", 3).with("a", 1)];
    let experiment = scripted("cols", &["a", "b", "c"], Script::rows(rows, 0.0), &witness);

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);

    let lines = read_lines(&engine.current_run().unwrap().row_file.unwrap());
    assert_eq!(lines[0], "t,sync_t,time,a,b,c");
    let fields: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(fields.len(), 6);
    assert!(!fields[0].is_empty());
    assert_eq!(fields[1], "-1.0");
    assert!(!fields[2].is_empty());
    assert_eq!(&fields[3..], &["1", "", "3"]);

    // Every delivered row carries the derived columns first
    let row = engine.try_recv_row().unwrap();
    let keys: Vec<&str> = row.keys().collect();
    assert_eq!(keys, vec!["t", "sync_t", "time", "c", "a"]);
}

#[test]
fn start_while_running_leaves_the_run_alone() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let first = scripted("first", &["n"], Script::counting(1000, 0.05), &witness);
    let second = scripted("second", &["n"], Script::counting(1, 0.0), &Witness::default());

    engine.start(&first, &ParamValues::new(), true).unwrap();
    let run = engine.current_run().unwrap();

    engine.start(&second, &ParamValues::new(), true).unwrap();
    assert_eq!(engine.status(), RunStatus::Running);
    assert_eq!(engine.current_run().unwrap().run_id, run.run_id);
    assert_eq!(engine.current_run().unwrap().experiment_name, "first");

    engine.stop();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
}

#[test]
fn rows_arrive_in_production_order() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let experiment = scripted("order", &["n"], Script::counting(50, 0.0), &Witness::default());

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);

    let received: Vec<u64> = engine
        .drain_rows()
        .iter()
        .map(|row| row.get("n").and_then(|v| v.as_u64()).unwrap())
        .collect();
    assert_eq!(received, (0..50).collect::<Vec<u64>>());

    let lines = read_lines(&engine.current_run().unwrap().row_file.unwrap());
    let persisted: Vec<u64> = lines[1..]
        .iter()
        .map(|line| line.rsplit(',').next().unwrap().parse().unwrap())
        .collect();
    assert_eq!(persisted, received);
}

#[test]
fn sync_t_is_minus_one_without_sync() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let experiment = scripted("nosync", &["n"], Script::counting(5, 0.01), &Witness::default());

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);

    let rows = engine.drain_rows();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|row| f64_of(row, "sync_t") == -1.0));
}

#[test]
fn sync_resets_the_reference() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let experiment = scripted("sync", &["n"], Script::counting(1000, 0.02), &Witness::default());

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.try_recv_row().is_some()));

    engine.sync();
    // A row stamped just before the marker may still be in flight
    let mut after = None;
    assert!(wait_until(Duration::from_secs(2), || {
        while let Some(row) = engine.try_recv_row() {
            if f64_of(&row, "sync_t") >= 0.0 {
                after = Some(row);
                return true;
            }
        }
        false
    }));
    let row = after.unwrap();
    let sync_t = f64_of(&row, "sync_t");
    assert!(sync_t < 0.5, "sync_t = {sync_t}");
    assert!(f64_of(&row, "t") > sync_t);

    engine.stop();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
}

#[test]
fn stop_after_some_rows_keeps_only_those() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let experiment = scripted("stopper", &["n"], Script::counting(1000, 0.1), &witness);

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    let mut seen = Vec::new();
    assert!(wait_until(Duration::from_secs(3), || {
        seen.extend(engine.drain_rows());
        seen.len() >= 3
    }));
    engine.stop();

    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
    seen.extend(engine.drain_rows());
    assert!(witness.teardown_seen());

    let lines = read_lines(&engine.current_run().unwrap().row_file.unwrap());
    let persisted = lines.len() - 1;
    assert_eq!(persisted, seen.len());
    assert!(persisted <= 4, "persisted {persisted} rows after stopping at 3");
}

#[test]
fn step_failure_reports_error_and_still_tears_down() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let mut script = Script::counting(10, 0.01);
    script.fail_at = Some(3);
    let experiment = scripted("failing", &["n"], script, &witness);

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Error);
    let error = engine.last_error().unwrap();
    assert!(error.contains("step 3 failed"), "{error}");
    assert!(wait_until(Duration::from_secs(2), || witness.teardown_seen()));

    let lines = read_lines(&engine.current_run().unwrap().row_file.unwrap());
    assert_eq!(lines.len(), 1 + 3);
    assert_eq!(engine.drain_rows().len(), 3);
}

#[test]
fn setup_failure_skips_steps() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let mut script = Script::counting(10, 0.0);
    script.setup_fails = true;
    let experiment = scripted("nosetup", &["n"], script, &witness);

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Error);
    assert!(engine.last_error().unwrap().contains("instrument not found"));
    assert!(wait_until(Duration::from_secs(2), || witness.teardown_seen()));
    assert!(engine.drain_rows().is_empty());
}

#[test]
fn panicking_step_is_contained() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let mut script = Script::counting(10, 0.0);
    script.panic_at = Some(2);
    let experiment = scripted("panics", &["n"], script, &witness);

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Error);
    let error = engine.last_error().unwrap();
    assert!(error.contains("panicked"), "{error}");
    assert!(error.contains("step 2 exploded"), "{error}");
    assert!(wait_until(Duration::from_secs(2), || witness.teardown_seen()));
    assert_eq!(engine.drain_rows().len(), 2);
}

#[test]
fn teardown_failure_after_clean_stop_is_still_finished() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let mut script = Script::counting(1000, 0.05);
    script.teardown_fails = true;
    let experiment = scripted("badpark", &["n"], script, &witness);

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    engine.stop();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
    assert!(engine.last_error().is_none());

    assert!(wait_until(Duration::from_secs(2), || engine
        .log_buffer()
        .snapshot()
        .iter()
        .any(|e| e.message.contains("Teardown failed"))));
}

#[test]
fn status_listener_sees_each_transition_once() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        engine.on_status_change(move |status| seen.lock().push(status));
    }
    let experiment = scripted("listen", &["n"], Script::counting(1000, 0.05), &Witness::default());

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    engine.stop();
    engine.stop();
    wait_terminal(&engine);
    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() >= 3));

    assert_eq!(
        *seen.lock(),
        vec![RunStatus::Running, RunStatus::Stopping, RunStatus::Finished]
    );
}

#[test]
fn missing_parameter_fails_before_anything_starts() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let inner = scripted("needs", &["n"], Script::counting(1, 0.0), &witness);
    let experiment = ExperimentType::new(
        ExperimentInfo::new("needs", "needs")
            .params(ParamSchema::new().with(ParamSpec::text("sample_id"))),
        move |params| inner.instantiate(params),
    );

    let err = engine
        .start(&experiment, &ParamValues::new(), false)
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("sample_id"));
    assert_eq!(engine.status(), RunStatus::Idle);
    assert!(engine.current_run().is_none());
    assert!(!dir.path().join("needs").exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert!(!witness.setup.load(std::sync::atomic::Ordering::SeqCst));

    let bad = ParamValues::new().with("sample_id", "   ");
    assert!(engine.start(&experiment, &bad, false).is_err());
    assert_eq!(engine.status(), RunStatus::Idle);
}

#[test]
fn debug_mode_writes_no_files() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("data");
    let engine = ExperimentEngine::new(test_settings(&base));
    let experiment = scripted("dbg", &["n"], Script::counting(5, 0.0), &Witness::default());

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);

    assert_eq!(engine.drain_rows().len(), 5);
    let run = engine.current_run().unwrap();
    assert!(run.debug);
    assert!(run.row_file.is_none());
    assert!(!base.exists());
}

#[test]
fn metadata_and_log_files_accompany_the_row_file() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let experiment = scripted("meta", &["n"], Script::counting(2, 0.0), &Witness::default());

    engine
        .start(&experiment, &ParamValues::new().with("gain", 3), false)
        .unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
    let run = engine.current_run().unwrap();
    let row_file = run.row_file.unwrap();

    let paths = RunPaths::from_row_file(&row_file).unwrap();

    let metadata: RunMetadata =
        serde_json::from_str(&std::fs::read_to_string(paths.metadata_file()).unwrap()).unwrap();
    assert_eq!(metadata.run_id, run.run_id);
    assert_eq!(metadata.experiment_name, "meta");
    assert_eq!(metadata.columns, vec!["n".to_string()]);
    assert_eq!(metadata.plotters, vec!["transient".to_string()]);
    assert_eq!(metadata.parameters.f64("gain").unwrap(), 3.0);
    assert_eq!(
        metadata.row_file,
        row_file.file_name().unwrap().to_string_lossy()
    );

    // The closing line is written right after the status changes
    assert!(wait_until(Duration::from_secs(2), || {
        std::fs::read_to_string(paths.log_file())
            .map(|log| log.contains("Finished meta"))
            .unwrap_or(false)
    }));
    let log = std::fs::read_to_string(paths.log_file()).unwrap();
    assert!(log.contains("Started meta"));
    assert!(log.contains("teardown ran"));
    assert!(paths.debug_log_file().is_file());
}

#[test]
fn consecutive_runs_get_distinct_files() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let experiment = scripted("again", &["n"], Script::counting(1, 0.0), &Witness::default());

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    wait_terminal(&engine);
    let first = engine.current_run().unwrap();

    engine.start(&experiment, &ParamValues::new(), false).unwrap();
    wait_terminal(&engine);
    let second = engine.current_run().unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first.row_file, second.row_file);
    assert!(first.row_file.unwrap().is_file());
    assert!(second.row_file.unwrap().is_file());
}

#[test]
fn new_run_clears_previous_error() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let mut failing = Script::counting(3, 0.0);
    failing.fail_at = Some(0);
    let bad = scripted("bad", &["n"], failing, &Witness::default());
    let good = scripted("good", &["n"], Script::counting(1, 0.0), &Witness::default());

    engine.start(&bad, &ParamValues::new(), true).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Error);
    assert!(engine.last_error().is_some());

    engine.start(&good, &ParamValues::new(), true).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
    assert!(engine.last_error().is_none());
}

#[test]
fn shutdown_during_run_runs_teardown_and_returns() {
    let dir = tempdir().unwrap();
    let engine = ExperimentEngine::new(test_settings(dir.path()));
    let witness = Witness::default();
    let experiment = scripted("long", &["n"], Script::counting(100_000, 0.5), &witness);

    engine.start(&experiment, &ParamValues::new(), true).unwrap();
    assert!(wait_until(Duration::from_secs(2), || witness
        .setup
        .load(std::sync::atomic::Ordering::SeqCst)));

    let started = Instant::now();
    engine.shutdown();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(witness.teardown_seen());
    assert_eq!(engine.status(), RunStatus::Finished);

    engine.shutdown();
    assert_eq!(witness.teardowns.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn late_teardown_of_previous_run_leaves_new_run_in_control() {
    let dir = tempdir().unwrap();
    let mut settings = (*test_settings(dir.path())).clone();
    settings.engine.join_timeout_ms = 100;
    let engine = ExperimentEngine::new(Arc::new(settings));

    let slow_witness = Witness::default();
    let mut slow = Script::counting(1, 0.0);
    slow.setup_fails = true;
    slow.teardown_delay = 0.8;
    let failing = scripted("slowpark", &["n"], slow, &slow_witness);
    let next = scripted("next", &["n"], Script::counting(1000, 0.05), &Witness::default());

    engine.start(&failing, &ParamValues::new(), true).unwrap();
    assert_eq!(wait_terminal(&engine), RunStatus::Error);

    // The old thread outlives the join timeout and is detached
    engine.start(&next, &ParamValues::new(), true).unwrap();
    assert_eq!(engine.status(), RunStatus::Running);
    assert!(!slow_witness.teardown_seen());

    assert!(wait_until(Duration::from_secs(3), || slow_witness.teardown_seen()));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(engine.status(), RunStatus::Running);
    assert!(engine.last_error().is_none());

    engine.stop();
    assert_eq!(wait_terminal(&engine), RunStatus::Finished);
    assert_eq!(engine.current_run().unwrap().experiment_name, "next");
    assert!(!engine.drain_rows().is_empty());
}
