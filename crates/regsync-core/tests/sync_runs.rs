//! End-to-end runs against the in-memory registry.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regsync_core::{
    run_job, AuditStatusJob, BackupJob, CreateUsersJob, JobContext, RunOptions,
    RunOutcome, UpdateJob, DEFAULT_PROTECTED_DOMAIN, EXIT_FAILURES, EXIT_OK,
};
use regsync_http::fakes::{ListShape, MemoryRegistry};
use regsync_http::{endpoints, ApplyMode, RunConfig};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn config(mode: ApplyMode, concurrency: usize) -> RunConfig {
    RunConfig::builder("https://registry.test", "token")
        .mode(mode)
        .concurrency(concurrency)
        .build()
        .unwrap()
}

fn options(dir: &Path) -> RunOptions {
    RunOptions {
        out_dir: dir.to_path_buf(),
        ..RunOptions::default()
    }
}

async fn run<J: regsync_core::Job>(
    job: J,
    registry: &Arc<MemoryRegistry>,
    mode: ApplyMode,
    dir: &Path,
) -> RunOutcome {
    run_job(
        Arc::new(job),
        JobContext::new(registry.clone(), config(mode, 4)),
        options(dir),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn rows(outcome: &RunOutcome) -> Vec<Value> {
    let doc: Value =
        serde_json::from_str(&fs::read_to_string(&outcome.summary.json_path).unwrap()).unwrap();
    doc["rows"].as_array().unwrap().clone()
}

fn seed_users(registry: &MemoryRegistry, n: usize) {
    for i in 0..n {
        registry.insert_user(json!({
            "id": format!("u{}", i),
            "email": format!("user{}@clinic.org", i),
            "permissions": ["View"],
            "firstName": "Test",
        }));
    }
}

fn add_checklist() -> UpdateJob {
    UpdateJob::permissions(
        vec!["Summary_Checklist".to_string()],
        Vec::new(),
        vec![DEFAULT_PROTECTED_DOMAIN.to_string()],
    )
    .unwrap()
}

#[tokio::test]
async fn second_apply_is_all_skipped() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 6);
    let dir = tempfile::tempdir().unwrap();

    let first = run(add_checklist(), &registry, ApplyMode::Apply, dir.path()).await;
    assert_eq!(first.summary.counts.applied, 6);
    assert_eq!(registry.writes().len(), 6);

    let second = run(add_checklist(), &registry, ApplyMode::Apply, dir.path()).await;
    assert_eq!(second.summary.counts.skipped, 6);
    assert_eq!(second.summary.counts.applied, 0);
    assert_eq!(registry.writes().len(), 6);
    assert_eq!(second.exit_code(), EXIT_OK);
}

#[tokio::test]
async fn protected_users_are_never_written() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 3);
    registry.insert_user(json!({"id": "staff", "email": "Ops@XCures.com", "permissions": []}));
    let dir = tempfile::tempdir().unwrap();

    let outcome = run(add_checklist(), &registry, ApplyMode::Apply, dir.path()).await;

    assert_eq!(outcome.summary.counts.excluded, 1);
    assert_eq!(outcome.summary.counts.applied, 3);
    assert!(registry
        .writes()
        .iter()
        .all(|w| w.path != endpoints::user("staff")));
    assert_eq!(registry.user("staff").unwrap()["permissions"], json!([]));
}

#[tokio::test]
async fn one_failure_does_not_stop_the_others() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 10);
    registry.fail_write("u4", 500);
    let dir = tempfile::tempdir().unwrap();

    let outcome = run(add_checklist(), &registry, ApplyMode::Apply, dir.path()).await;

    assert_eq!(outcome.summary.counts.applied, 9);
    assert_eq!(outcome.summary.counts.failed, 1);
    assert_eq!(outcome.exit_code(), EXIT_FAILURES);

    let rows = rows(&outcome);
    assert_eq!(rows.len(), 10);
    let failed: Vec<&Value> = rows.iter().filter(|r| r["status"] == "failed").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["entityId"], "u4");
    assert_eq!(failed[0]["fields"]["http_status"], "500");
}

#[tokio::test]
async fn detail_fetch_failure_is_isolated() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 10);
    registry.fail_detail("u4", 403);
    let dir = tempfile::tempdir().unwrap();

    let outcome = run(add_checklist(), &registry, ApplyMode::Apply, dir.path()).await;

    assert_eq!(outcome.summary.counts.applied, 9);
    assert_eq!(outcome.summary.counts.failed, 1);
    assert_eq!(outcome.exit_code(), EXIT_FAILURES);

    let rows = rows(&outcome);
    assert_eq!(rows.len(), 10);
    let failed: Vec<&Value> = rows.iter().filter(|r| r["status"] == "failed").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["entityId"], "u4");
    assert_eq!(failed[0]["fields"]["http_status"], "403");
    assert!(registry.writes().iter().all(|w| w.path != endpoints::user("u4")));
    assert_eq!(registry.writes().len(), 9);
}

#[tokio::test]
async fn dry_run_writes_nothing_and_records_payloads() {
    let registry = Arc::new(MemoryRegistry::with_shape(ListShape::PagedWithoutTotal));
    seed_users(&registry, 5);
    let dir = tempfile::tempdir().unwrap();

    let outcome = run(add_checklist(), &registry, ApplyMode::DryRun, dir.path()).await;

    assert!(registry.writes().is_empty());
    assert_eq!(outcome.summary.counts.dry_run, 5);
    for row in rows(&outcome) {
        assert_eq!(row["status"], "dry_run");
        assert_eq!(
            row["payload"]["permissions"],
            json!(["View", "Summary_Checklist"])
        );
        assert_eq!(row["payload"]["firstName"], "Test");
    }
}

#[tokio::test]
async fn result_files_share_a_stamp_and_match() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 3);
    let dir = tempfile::tempdir().unwrap();

    let outcome = run(add_checklist(), &registry, ApplyMode::DryRun, dir.path()).await;

    let csv_path = &outcome.summary.csv_path;
    let json_path = &outcome.summary.json_path;
    assert_eq!(csv_path.file_stem(), json_path.file_stem());
    assert!(csv_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("permissions_"));

    let mut reader = csv::Reader::from_path(csv_path).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(
        headers.iter().collect::<Vec<_>>(),
        vec!["id", "status", "detail", "email", "before", "after", "http_status"]
    );
    assert_eq!(reader.records().count(), 3);

    let doc: Value = serde_json::from_str(&fs::read_to_string(json_path).unwrap()).unwrap();
    assert_eq!(doc["metadata"]["mode"], "dry_run");
    assert_eq!(doc["metadata"]["job"], "permissions");
    assert_eq!(doc["summary"]["total"], 3);
}

#[tokio::test]
async fn back_to_back_runs_keep_their_own_files() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 2);
    let dir = tempfile::tempdir().unwrap();

    let first = run(BackupJob::new(false), &registry, ApplyMode::DryRun, dir.path()).await;
    let second = run(BackupJob::new(false), &registry, ApplyMode::DryRun, dir.path()).await;

    assert_ne!(first.summary.csv_path, second.summary.csv_path);
    assert_ne!(first.summary.json_path, second.summary.json_path);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 4);
    assert_eq!(rows(&first).len(), 2);
    assert_eq!(rows(&second).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_holds_end_to_end() {
    let registry = Arc::new(MemoryRegistry::new().with_latency(Duration::from_millis(20)));
    seed_users(&registry, 24);
    let dir = tempfile::tempdir().unwrap();

    let outcome = run_job(
        Arc::new(BackupJob::new(false)),
        JobContext::new(registry.clone(), config(ApplyMode::DryRun, 3)),
        options(dir.path()),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.summary.counts.applied, 24);
    assert!(registry.max_in_flight() <= 3);
}

#[tokio::test]
async fn listing_failure_creates_no_files() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 2);
    registry.reject_page_size_over(10);
    let dir = tempfile::tempdir().unwrap();

    let err = run_job(
        Arc::new(BackupJob::new(false)),
        JobContext::new(registry.clone(), config(ApplyMode::DryRun, 2)),
        options(dir.path()),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(!err.is_precondition());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn zero_entities_is_a_clean_run() {
    let registry = Arc::new(MemoryRegistry::new());
    let dir = tempfile::tempdir().unwrap();
    let outcome = run(add_checklist(), &registry, ApplyMode::Apply, dir.path()).await;
    assert_eq!(outcome.summary.counts.total(), 0);
    assert_eq!(outcome.exit_code(), EXIT_OK);
    assert!(rows(&outcome).is_empty());
}

#[tokio::test]
async fn email_domain_rewrite_applies() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.insert_user(json!({"id": "a", "email": "ann@old.com", "npi": "1"}));
    registry.insert_user(json!({"id": "b", "email": "bob@other.com"}));
    registry.insert_user(json!({"id": "c", "email": "cy@xcures.com"}));
    let dir = tempfile::tempdir().unwrap();

    let job = UpdateJob::email_domain(
        "old.com",
        "new.com",
        vec![DEFAULT_PROTECTED_DOMAIN.to_string()],
    )
    .unwrap();
    let outcome = run(job, &registry, ApplyMode::Apply, dir.path()).await;

    assert_eq!(outcome.summary.counts.applied, 1);
    assert_eq!(outcome.summary.counts.skipped, 1);
    assert_eq!(outcome.summary.counts.excluded, 1);
    let ann = registry.user("a").unwrap();
    assert_eq!(ann["email"], "ann@new.com");
    assert_eq!(ann["npi"], "1");
}

fn write_csv(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("users.csv");
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[tokio::test]
async fn create_users_from_csv() {
    let registry = Arc::new(MemoryRegistry::new());
    let input = tempfile::tempdir().unwrap();
    let csv = write_csv(
        input.path(),
        "email,firstName,lastName,roleCode\n\
         ada@clinic.org,Ada,Lovelace,MD\n\
         ADA@clinic.org,Ada,Again,\n\
         bob@clinic.org,Bob,,\n\
         not-an-email,Cy,Young,\n\
         dee@clinic.org,Dee,Jones,\n",
    );
    let job = CreateUsersJob::from_csv(&csv, vec!["User_Read".to_string()], vec!["p1".to_string()])
        .unwrap();
    let out = tempfile::tempdir().unwrap();

    let outcome = run(job, &registry, ApplyMode::Apply, out.path()).await;

    assert_eq!(outcome.duplicates, 1);
    assert_eq!(outcome.summary.counts.applied, 2);
    assert_eq!(outcome.summary.counts.skipped, 2);
    assert_eq!(registry.user_count(), 2);

    let created: Vec<Value> = registry.writes().into_iter().filter_map(|w| w.body).collect();
    let ada = created.iter().find(|b| b["email"] == "ada@clinic.org").unwrap();
    assert_eq!(ada["roleCode"], "MD");
    let id = ada["id"].as_str().unwrap();
    assert_eq!(ada["identityProviderId"], format!("auth0|{}", id));
}

#[tokio::test]
async fn create_users_dry_run_posts_nothing() {
    let registry = Arc::new(MemoryRegistry::new());
    let input = tempfile::tempdir().unwrap();
    let csv = write_csv(input.path(), "email,firstName,lastName\nada@clinic.org,Ada,Lovelace\n");
    let job = CreateUsersJob::from_csv(&csv, vec!["User_Read".to_string()], Vec::new()).unwrap();
    let out = tempfile::tempdir().unwrap();

    let outcome = run(job, &registry, ApplyMode::DryRun, out.path()).await;

    assert!(registry.writes().is_empty());
    let rows = rows(&outcome);
    assert_eq!(rows[0]["status"], "dry_run");
    assert_eq!(rows[0]["payload"]["email"], "ada@clinic.org");
}

#[tokio::test]
async fn audit_status_reads_every_subject() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.insert_subject(json!({"id": "s1"}), Some(true), 4);
    registry.insert_subject(json!({"id": "s2"}), Some(false), 0);
    let dir = tempfile::tempdir().unwrap();

    let outcome = run(AuditStatusJob::new(), &registry, ApplyMode::DryRun, dir.path()).await;

    assert_eq!(outcome.summary.counts.applied, 2);
    let mut reader = csv::Reader::from_path(&outcome.summary.csv_path).unwrap();
    let mut records: Vec<Vec<String>> = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    records.sort();
    assert_eq!(records[0][0], "s1");
    assert_eq!(records[0][3], "true");
    assert_eq!(records[0][4], "4");
    assert_eq!(records[1][3], "false");
}

#[tokio::test]
async fn backup_never_writes() {
    let registry = Arc::new(MemoryRegistry::new());
    seed_users(&registry, 4);
    let dir = tempfile::tempdir().unwrap();

    let outcome = run(BackupJob::new(true), &registry, ApplyMode::Apply, dir.path()).await;

    assert!(registry.writes().is_empty());
    assert_eq!(outcome.summary.counts.applied, 4);
    for row in rows(&outcome) {
        assert_eq!(row["fields"]["permissions"], "View");
        assert!(row["payload"]["id"].is_string());
    }
}
