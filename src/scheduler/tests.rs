use crate::scheduler::{
    SchedulerError, TaskRecord, TaskScheduler, TaskStore, action_fn,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::tempdir;
use tokio::sync::mpsc;

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
}

fn scheduler() -> TaskScheduler {
    TaskScheduler::new(std::time::Duration::from_secs(60))
}

fn counting_action(counter: &Arc<AtomicUsize>) -> Arc<dyn crate::scheduler::TaskAction> {
    let counter = counter.clone();
    action_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Some("counted".to_string()))
    })
}

#[tokio::test]
async fn disabled_task_never_fires() {
    let s = scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    s.register_task("every", "Every minute", "* * * * *", "", false, counting_action(&counter))
        .unwrap();
    assert!(s.disable_task("every"));

    let start = at(2024, 5, 8, 0, 0);
    for minute in 0..(3 * 60) {
        assert_eq!(s.tick_at(start + Duration::minutes(minute)).await, 0);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(s.get_task("every").unwrap().run_count, 0);
}

#[tokio::test]
async fn builtin_task_cannot_be_removed() {
    let s = scheduler();
    s.register_task(
        "memory_trim",
        "Memory trim",
        "0 * * * *",
        "Trim conversation memory",
        true,
        action_fn(|| Ok(None)),
    )
    .unwrap();

    assert!(!s.remove_task("memory_trim"));
    assert!(s.get_task("memory_trim").is_some());
    assert!(!s.remove_task("does_not_exist"));

    let err = s
        .add_message_task("memory_trim", "x", "* * * * *", "hi", "", true)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Builtin(_)));
}

#[tokio::test]
async fn persisted_task_survives_restart_and_respects_weekdays() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scheduled_tasks.json");
    std::fs::write(
        &path,
        r#"[{"task_id":"task_abc123","cron_expression":"0 9 * * 1-5","message":"Good morning"}]"#,
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let s = scheduler()
        .with_store(TaskStore::new(&path))
        .with_message_sink(Arc::new(tx));
    assert_eq!(s.load_tasks().unwrap(), 1);
    let task = s.get_task("task_abc123").unwrap();
    assert_eq!(task.name, "task_abc123");
    assert!(task.enabled);

    // Wednesday
    assert_eq!(s.tick_at(at(2024, 5, 8, 9, 0)).await, 1);
    let (id, msg) = rx.try_recv().unwrap();
    assert_eq!(id, "task_abc123");
    assert_eq!(msg, "Good morning");
    let history = s.task_history("task_abc123", 10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result.as_deref(), Some("Message sent: Good morning"));

    // Saturday
    assert_eq!(s.tick_at(at(2024, 5, 11, 9, 0)).await, 0);
    assert!(rx.try_recv().is_err());

    // run count made it to disk
    let records: Vec<TaskRecord> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(records[0].run_count, 1);
}

#[tokio::test]
async fn message_tasks_round_trip_through_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("amira/scheduled_tasks.json");

    let first = scheduler().with_store(TaskStore::new(&path));
    first
        .register_task("cache_sweep", "Cache sweep", "0 * * * *", "", true, action_fn(|| Ok(None)))
        .unwrap();
    first
        .add_message_task("task_1", "Lights", "30 22 * * *", "Turn off the lights", "", true)
        .unwrap();
    first
        .add_message_task("task_2", "Paused", "0 7 * * *", "Wake up", "", false)
        .unwrap();

    let second = scheduler().with_store(TaskStore::new(&path));
    assert_eq!(second.load_tasks().unwrap(), 2);
    assert!(second.get_task("cache_sweep").is_none(), "builtins are not persisted");
    assert!(!second.get_task("task_2").unwrap().enabled);
    assert_eq!(
        second.get_task("task_1").unwrap().message.as_deref(),
        Some("Turn off the lights")
    );

    assert!(second.remove_task("task_1"));
    assert!(second.enable_task("task_2"));
    let third = scheduler().with_store(TaskStore::new(&path));
    assert_eq!(third.load_tasks().unwrap(), 1);
    assert!(third.get_task("task_2").unwrap().enabled);
}

#[tokio::test]
async fn load_keeps_in_memory_tasks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    std::fs::write(
        &path,
        r#"[{"task_id":"task_1","name":"stale","cron_expression":"0 9 * * *","message":"old"},
            {"task_id":"task_bad","cron_expression":"nope","message":"x"}]"#,
    )
    .unwrap();

    let s = scheduler().with_store(TaskStore::new(&path));
    s.register_task("task_1", "fresh", "* * * * *", "", false, action_fn(|| Ok(None)))
        .unwrap();
    assert_eq!(s.load_tasks().unwrap(), 0);
    assert_eq!(s.get_task("task_1").unwrap().name, "fresh");
    assert!(s.get_task("task_bad").is_none());
}

#[tokio::test]
async fn does_not_fire_twice_within_a_minute() {
    let s = scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    s.register_task("every", "Every minute", "* * * * *", "", false, counting_action(&counter))
        .unwrap();

    let t = at(2024, 5, 8, 9, 0);
    assert_eq!(s.tick_at(t).await, 1);
    assert_eq!(s.tick_at(t + Duration::seconds(30)).await, 0);
    assert_eq!(s.tick_at(t + Duration::seconds(60)).await, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let task = s.get_task("every").unwrap();
    assert_eq!(task.last_run, Some(t + Duration::seconds(60)));
    assert_eq!(task.next_run, Some(at(2024, 5, 8, 9, 2)));
}

#[tokio::test]
async fn failures_are_contained_and_recorded() {
    let s = scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    s.register_task(
        "a_broken",
        "Broken",
        "* * * * *",
        "",
        false,
        action_fn(|| Err(anyhow::anyhow!("boom"))),
    )
    .unwrap();
    s.register_task("b_ok", "Ok", "* * * * *", "", false, counting_action(&counter))
        .unwrap();

    assert_eq!(s.tick_at(at(2024, 5, 8, 9, 0)).await, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let broken = s.get_task("a_broken").unwrap();
    assert_eq!(broken.error_count, 1);
    assert_eq!(broken.run_count, 0);
    let history = s.task_history("a_broken", 10);
    assert!(!history[0].success);
    assert_eq!(history[0].error.as_deref(), Some("boom"));

    let stats = s.stats();
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.total_errors, 1);
    assert!((stats.success_rate - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn message_task_without_sink_is_a_no_op() {
    let s = scheduler();
    s.add_message_task("task_x", "x", "* * * * *", "hello", "", true)
        .unwrap();
    assert_eq!(s.tick_at(at(2024, 5, 8, 9, 0)).await, 1);
    let history = s.task_history("task_x", 1);
    assert_eq!(
        history[0].result.as_deref(),
        Some("no-op (no callback or message)")
    );
}

#[tokio::test]
async fn history_is_bounded() {
    let s = scheduler();
    s.register_task("every", "Every minute", "* * * * *", "", false, action_fn(|| Ok(None)))
        .unwrap();
    let start = at(2024, 5, 8, 0, 0);
    for minute in 0..105 {
        s.tick_at(start + Duration::minutes(minute)).await;
    }
    assert_eq!(s.task_history("every", 1000).len(), 100);
    let last = s.task_history("every", 3);
    assert_eq!(last.len(), 3);
    assert_eq!(last[2].executed_at, start + Duration::minutes(104));
    assert_eq!(s.get_task("every").unwrap().run_count, 105);
}

#[tokio::test]
async fn invalid_cron_is_rejected() {
    let s = scheduler();
    let err = s
        .add_message_task("t", "t", "61 * * * *", "m", "", true)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidCron(_)));
    assert!(s.tasks().is_empty());
}

#[tokio::test]
async fn start_and_stop() {
    let s = Arc::new(TaskScheduler::new(std::time::Duration::from_secs(3600)));
    let counter = Arc::new(AtomicUsize::new(0));
    s.register_task("every", "Every minute", "* * * * *", "", false, counting_action(&counter))
        .unwrap();

    assert!(s.start());
    assert!(!s.start());
    for _ in 0..200 {
        if counter.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(s.stats().running);

    s.stop().await;
    assert!(!s.is_running());
}
