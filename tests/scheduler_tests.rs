//! Task records and the manual trigger, driven through a real composition
//! root with an empty configuration (the backend is unreachable, so tasks
//! finish in the error state instead of hanging on the network).

use animarr::Config;
use animarr::scheduler::{TaskId, TaskScheduler, TaskStatus};
use animarr::state::SharedState;
use std::time::Duration;

async fn test_state(dir: &std::path::Path) -> std::sync::Arc<SharedState> {
    let mut config = Config::default();
    config.general.database_path =
        format!("sqlite:{}", dir.join("animarr.db").to_string_lossy());
    config.paths.tmp_path = dir.join("tmp").to_string_lossy().to_string();
    config.paths.posters_path = dir.join("posters").to_string_lossy().to_string();

    SharedState::new(config).await.expect("shared state")
}

#[tokio::test]
async fn records_start_idle_with_next_run_planned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path()).await;
    let scheduler = TaskScheduler::new(state).await.expect("scheduler");

    let records = scheduler.records();
    assert_eq!(records.len(), 2);

    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["fetch_wanted", "update_metadata"]);

    for record in &records {
        assert_eq!(record.status, TaskStatus::Idle);
        assert!(record.last_run_at.is_none());
        assert!(record.next_run_at.is_some(), "next run must be planned");
        assert!(record.last_error.is_none());
    }

    // default intervals from the settings store
    let by_name = |n: &str| records.iter().find(|r| r.name == n).unwrap().clone();
    assert_eq!(by_name("fetch_wanted").interval_minutes, 30);
    assert_eq!(by_name("update_metadata").interval_minutes, 120);
}

#[tokio::test]
async fn manual_trigger_runs_in_background_and_records_outcome() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(dir.path()).await;
    let scheduler = TaskScheduler::new(state).await.expect("scheduler");

    // returns immediately; the task itself runs on its own
    assert!(scheduler.execute_now(TaskId::FetchWanted));

    let record = loop {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let record = scheduler
            .records()
            .into_iter()
            .find(|r| r.name == "fetch_wanted")
            .unwrap();
        if record.status != TaskStatus::Idle && record.status != TaskStatus::Running {
            break record;
        }
    };

    // no Sonarr configured: the run fails, is recorded, and nothing escapes
    assert_eq!(record.status, TaskStatus::Error);
    assert!(record.last_run_at.is_some());
    assert!(record.next_run_at.is_some());
    assert!(record.last_error.is_some());

    // the untouched task is still idle
    let other = scheduler
        .records()
        .into_iter()
        .find(|r| r.name == "update_metadata")
        .unwrap();
    assert_eq!(other.status, TaskStatus::Idle);
}

#[test]
fn task_ids_round_trip_through_names() {
    for task in TaskId::ALL {
        assert_eq!(TaskId::parse(task.name()), Some(task));
    }
    assert_eq!(TaskId::parse("nope"), None);
}
