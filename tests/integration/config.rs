//! Seeding jobs from YAML and running them.

use cadence::config::{YamlLoader, load_jobs_from_directory, seed_jobs};
use cadence::{
    InMemoryJobStore, JobFilter, JobService, JobStatus, JobStore, JobType, Scheduler,
    SchedulerSettings, Trigger,
};
use std::sync::Arc;

use crate::common::{WAIT, wait_for_status};

const CONFIG: &str = r#"
engine:
  job_workers: 2
  retry_workers: 1
  stuck_timeout_secs: 600
storage:
  type: memory
jobs:
  - name: touch
    command:
      command: sh
      args: ["-c", "exit 0"]
  - name: digest
    command:
      command: sh
      args: ["-c", "exit 0"]
    schedule:
      every: 1h
"#;

#[tokio::test]
async fn test_seeded_jobs_run_on_the_engine() {
    let config = YamlLoader::parse_config(CONFIG).unwrap();
    let settings = config.engine.to_settings();
    assert_eq!(settings.job_workers, 2);
    assert_eq!(settings.stuck_timeout.as_secs(), 600);

    let store = Arc::new(InMemoryJobStore::new());
    let service = JobService::new(store.clone());
    let created = seed_jobs(&service, &config.jobs).await.unwrap();
    assert_eq!(created.len(), 2);

    let touch = created.iter().find(|job| job.name == "touch").unwrap();
    let digest = created.iter().find(|job| job.name == "digest").unwrap();
    assert_eq!(touch.job_type, JobType::OneTime);
    assert_eq!(digest.job_type, JobType::Recurring);

    let scheduler = Scheduler::with_store(store.clone()).with_settings(SchedulerSettings {
        job_workers: settings.job_workers,
        retry_workers: settings.retry_workers,
        ..SchedulerSettings::for_tests()
    });
    let (handle, _task) = scheduler.start().await;

    assert_eq!(handle.tick(Trigger::OneTime).await.unwrap(), 1);
    wait_for_status(store.as_ref(), &touch.id, JobStatus::Completed, WAIT).await;
    let pending = store.get_job(&digest.id).await.unwrap();
    assert_eq!(pending.status, JobStatus::Scheduled);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_seeding_twice_does_not_duplicate() {
    let config = YamlLoader::parse_config(CONFIG).unwrap();
    let store = Arc::new(InMemoryJobStore::new());
    let service = JobService::new(store.clone());

    seed_jobs(&service, &config.jobs).await.unwrap();
    let again = seed_jobs(&service, &config.jobs).await.unwrap();

    assert!(again.is_empty());
    assert_eq!(store.list_jobs(&JobFilter::new()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_jobs_directory_is_seeded() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("10-cleanup.yaml"),
        "name: cleanup\nschedule:\n  cron: \"@daily\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("20-report.yml"),
        "name: report\nschedule:\n  after: 5m\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a job").unwrap();

    let jobs = load_jobs_from_directory(dir.path()).unwrap();
    assert_eq!(
        jobs.iter().map(|job| job.name.as_str()).collect::<Vec<_>>(),
        vec!["cleanup", "report"]
    );

    let store = Arc::new(InMemoryJobStore::new());
    let created = seed_jobs(&JobService::new(store.clone()), &jobs).await.unwrap();
    assert_eq!(created.len(), 2);
    let report = store.get_job(&created[1].id).await.unwrap();
    assert!(report.scheduled_at.unwrap() > chrono::Utc::now());
}
