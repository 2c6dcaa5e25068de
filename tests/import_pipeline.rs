use async_trait::async_trait;
use casebridge::analyzer::AnalyzeProgress;
use casebridge::config::{self, Config};
use casebridge::error::ImportError;
use casebridge::jobs::CancelCheck;
use casebridge::sqlite_staging::SqliteStaging;
use casebridge::{db, importer, jobs, migrate, worker};
use casebridge_core::mapping::{Action, MappingConfiguration};
use casebridge_core::models::{ActivityLevel, EntityKind, JobStatus};
use serde_json::{json, Value};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config: Config,
    pool: SqlitePool,
}

async fn setup(extra_config: &str) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let content = format!(
        r#"[db]
path = "{}/data/casebridge.sqlite"

[import]
reindex_on_complete = true
{}

[import.chunks.repository_case]
size = 7
"#,
        root.display(),
        extra_config
    );
    let config: Config = toml::from_str(&content).unwrap();
    config::validate(&config).unwrap();
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    TestEnv {
        _tmp: tmp,
        root,
        config,
        pool,
    }
}

fn write_bundle(root: &Path, bundle: &Value) -> PathBuf {
    let path = root.join("bundle.json");
    std::fs::write(&path, serde_json::to_vec_pretty(bundle).unwrap()).unwrap();
    path
}

/// One project, two repositories of that project, a folder tree and 100
/// cases of which every tenth references a project that isn't exported.
fn sample_bundle() -> Value {
    let cases: Vec<Value> = (1..=100)
        .map(|i| {
            json!({
                "id": i,
                "project_id": if i % 10 == 0 { 99 } else { 1 },
                "repo_id": if i % 2 == 0 { 10 } else { 11 },
                "folder_id": if i % 3 == 0 { json!(101) } else { json!(null) },
                "name": format!("Case {}", i),
                "estimate": 90,
                "description": "<p>Steps to reproduce</p>",
            })
        })
        .collect();
    json!({
        "exported_at": "2024-05-01T10:00:00Z",
        "projects": [ {"id": 1, "name": "Web"} ],
        "repositories": [
            {"id": 10, "project_id": 1, "is_master": true},
            {"id": 11, "project_id": 1}
        ],
        "repository_folders": [
            {"id": 101, "project_id": 1, "repo_id": 10, "parent_id": 100, "name": "Login"},
            {"id": 100, "project_id": 1, "repo_id": 11, "name": "Smoke"}
        ],
        "repository_cases": cases,
    })
}

async fn create_and_analyze(env: &TestEnv, bundle: &Value) -> String {
    let path = write_bundle(&env.root, bundle);
    let id = jobs::create_job(&env.pool, &path, None).await.unwrap();
    let status = worker::run_analyze_job(&env.pool, &env.config, &id, &mut |_: AnalyzeProgress| {})
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Ready);
    id
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn bad_rows_are_skipped_and_the_job_completes() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;

    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    assert_eq!(count(&env.pool, "repository_cases").await, 90);
    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.skipped_count, 10);
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());

    let cases = job.entity_progress[&EntityKind::RepositoryCase];
    assert_eq!(cases.created, 90);
    assert_eq!(cases.skipped, 10);
    assert_eq!(cases.total, 90);
    assert!(cases.created + cases.mapped <= cases.total);

    // A completed import asks for a full reindex.
    assert_eq!(count(&env.pool, "search_reindex_requests").await, 1);
}

#[tokio::test]
async fn repositories_fold_into_one_per_project() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;
    worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();

    assert_eq!(count(&env.pool, "repositories").await, 1);
    let distinct: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT repository_id) FROM repository_cases")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(distinct, 1);
    let folder_repos: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT repository_id) FROM repository_folders")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(folder_repos, 1);
    // The child folder was listed before its parent and still got nested.
    let nested: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM repository_folders WHERE name = 'Login' AND parent_id IS NOT NULL",
    )
    .fetch_one(&env.pool)
    .await
    .unwrap();
    assert_eq!(nested, 1);
}

#[tokio::test]
async fn retried_import_maps_instead_of_duplicating() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;
    worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    let cases_before = count(&env.pool, "repository_cases").await;
    let folders_before = count(&env.pool, "repository_folders").await;

    // Simulate a worker that died after committing everything.
    jobs::set_status(&env.pool, &id, JobStatus::Running, "importing", None)
        .await
        .unwrap();
    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    assert_eq!(count(&env.pool, "repository_cases").await, cases_before);
    assert_eq!(count(&env.pool, "repository_folders").await, folders_before);
    assert_eq!(count(&env.pool, "projects").await, 1);
    assert_eq!(count(&env.pool, "repository_case_versions").await, cases_before);

    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    let cases = job.entity_progress[&EntityKind::RepositoryCase];
    assert_eq!(cases.created, 0);
    assert_eq!(cases.mapped, 90);
    assert_eq!(cases.skipped, 10);
}

#[tokio::test]
async fn cancellation_before_import_cancels_the_job() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;

    assert!(jobs::request_cancel(&env.pool, &id).await.unwrap());
    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Canceled);

    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.error.is_none());
    assert_eq!(count(&env.pool, "projects").await, 0);

    // Terminal: nothing left to cancel.
    assert!(!jobs::request_cancel(&env.pool, &id).await.unwrap());
}

#[tokio::test]
async fn mapping_onto_a_missing_target_fails_the_job() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;

    let operator: MappingConfiguration = serde_json::from_value(json!({
        "roles": { "5": { "action": "map", "mappedTo": 999 } }
    }))
    .unwrap();
    jobs::apply_operator_mapping(&env.pool, &id, operator).await.unwrap();

    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Failed);

    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.is_some());
    assert!(job
        .activity_log
        .iter()
        .any(|e| e.level == ActivityLevel::Error));
    assert_eq!(count(&env.pool, "projects").await, 0);
    assert_eq!(count(&env.pool, "search_reindex_requests").await, 0);
}

#[tokio::test]
async fn finished_jobs_are_left_alone() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;
    worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    let before = jobs::require_job(&env.pool, &id).await.unwrap();

    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);
    let status = worker::run_analyze_job(&env.pool, &env.config, &id, &mut |_: AnalyzeProgress| {})
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Completed);

    let after = jobs::require_job(&env.pool, &id).await.unwrap();
    assert_eq!(after.completed_at, before.completed_at);
    assert_eq!(after.activity_log.len(), before.activity_log.len());
    assert_eq!(count(&env.pool, "search_reindex_requests").await, 1);
}

#[tokio::test]
async fn import_requires_an_analyzed_job() {
    let env = setup("").await;
    let path = write_bundle(&env.root, &sample_bundle());
    let id = jobs::create_job(&env.pool, &path, None).await.unwrap();
    assert!(worker::run_import_job(&env.pool, &env.config, &id).await.is_err());
}

#[tokio::test]
async fn missing_bundle_fails_analysis() {
    let env = setup("").await;
    let id = jobs::create_job(&env.pool, &env.root.join("nope.json"), None)
        .await
        .unwrap();
    let status = worker::run_analyze_job(&env.pool, &env.config, &id, &mut |_: AnalyzeProgress| {})
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Failed);
    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert!(job.error.unwrap().contains("nope.json"));
}

fn bundle_with_field_values() -> Value {
    json!({
        "projects": [ {"id": 1, "name": "Web"} ],
        "repositories": [ {"id": 10, "project_id": 1} ],
        "fields": [ {"id": 7, "name": "Priority", "type": "dropdown"} ],
        "field_options": [
            {"id": 70, "field_id": 7, "name": "High"},
            {"id": 71, "field_id": 7, "name": "Low"}
        ],
        "repository_cases": [
            {"id": 1, "project_id": 1, "repo_id": 10, "name": "Login works"},
            {"id": 2, "project_id": 1, "repo_id": 10, "name": "Logout works"}
        ],
        "repository_case_values": [
            {"case_id": 1, "field_id": 7, "value": "high"},
            {"case_id": 2, "field_id": 7, "value": "Urgent"}
        ]
    })
}

#[tokio::test]
async fn unknown_options_are_dropped_and_flagged() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &bundle_with_field_values()).await;
    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    assert_eq!(count(&env.pool, "case_field_values").await, 2);
    let high: i64 = sqlx::query_scalar("SELECT id FROM field_options WHERE name = 'High'")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    let values: Vec<Option<String>> =
        sqlx::query_scalar("SELECT value FROM case_field_values ORDER BY id")
            .fetch_all(&env.pool)
            .await
            .unwrap();
    assert_eq!(values, vec![Some(high.to_string()), None]);

    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert_eq!(job.error_count, 1);
    assert_eq!(job.skipped_count, 0);
    assert!(job
        .activity_log
        .iter()
        .any(|e| e.level == ActivityLevel::Warning && e.message.contains("unknown option")));
}

#[tokio::test]
async fn unknown_options_can_skip_the_row() {
    let env = setup("skip_rows_with_unknown_options = true\n").await;
    let id = create_and_analyze(&env, &bundle_with_field_values()).await;
    worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();

    assert_eq!(count(&env.pool, "case_field_values").await, 1);
    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert_eq!(job.skipped_count, 1);
    assert_eq!(job.error_count, 0);
}

#[tokio::test]
async fn purge_removes_staged_rows_of_finished_jobs() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;

    assert!(worker::purge_staging(&env.pool, &id, false).await.is_err());
    worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    let removed = worker::purge_staging(&env.pool, &id, false).await.unwrap();
    assert_eq!(removed, 1 + 2 + 2 + 100);
    assert_eq!(count(&env.pool, "import_staged_rows").await, 0);
    assert_eq!(count(&env.pool, "import_datasets").await, 0);
}

#[tokio::test]
async fn invalid_reference_decision_leaves_no_partial_mapping() {
    let env = setup("").await;
    let bundle = json!({
        "roles": [ {"id": 1, "name": "Lead"} ],
        "users": [ {"id": 9, "name": "Nobody", "email": "nope", "role_id": 1} ],
        "projects": [ {"id": 1, "name": "Web"} ]
    });
    let id = create_and_analyze(&env, &bundle).await;

    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Failed);

    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert!(job.error.unwrap().contains("nope"));
    assert_eq!(count(&env.pool, "roles").await, 0);
    assert_eq!(count(&env.pool, "users").await, 0);
    assert_eq!(count(&env.pool, "projects").await, 0);

    let mapping = jobs::load_mapping(&env.pool, &id).await.unwrap();
    assert_eq!(mapping.roles["1"].action, Action::Create);
    assert_eq!(mapping.users["9"].action, Action::Create);
}

/// Records the job's `total_count` every time the importer checks for
/// cancellation, which happens before every chunk.
struct TotalsSeen {
    pool: SqlitePool,
    job: String,
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl CancelCheck for TotalsSeen {
    async fn should_abort(&self) -> bool {
        let job = jobs::require_job(&self.pool, &self.job).await.unwrap();
        self.seen.lock().unwrap().push(job.total_count);
        false
    }
}

#[tokio::test]
async fn job_total_is_planned_before_the_first_entity() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &bundle_with_field_values()).await;
    let store = SqliteStaging::new(env.pool.clone());
    let totals = TotalsSeen {
        pool: env.pool.clone(),
        job: id.clone(),
        seen: Mutex::new(Vec::new()),
    };

    importer::import_job(&env.pool, &store, &totals, &env.config, &id)
        .await
        .unwrap();

    // projects, repositories, fields, options, cases and values
    let planned = 1 + 1 + 1 + 2 + 2 + 2;
    let seen = totals.seen.into_inner().unwrap();
    assert!(seen.len() > 5, "expected one check per chunk, got {:?}", seen);
    assert!(seen[1..].iter().all(|&t| t == planned), "totals moved: {:?}", seen);
    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    assert_eq!(job.total_count, planned);
    assert_eq!(job.processed_count, planned);
}

/// Requests cancellation once enough cases have been committed.
struct CancelAfterCases {
    pool: SqlitePool,
    at_least: i64,
}

#[async_trait]
impl CancelCheck for CancelAfterCases {
    async fn should_abort(&self) -> bool {
        count(&self.pool, "repository_cases").await >= self.at_least
    }
}

#[tokio::test]
async fn cancellation_stops_between_chunks_and_resumes() {
    let env = setup("").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;
    let store = SqliteStaging::new(env.pool.clone());
    let cancel = CancelAfterCases {
        pool: env.pool.clone(),
        at_least: 14,
    };

    let err = importer::import_job(&env.pool, &store, &cancel, &env.config, &id)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Canceled));
    // Chunks of 7 cases, every tenth bad: 7, 13, then 19 after the third
    // chunk, the first check that sees at least 14.
    assert_eq!(count(&env.pool, "repository_cases").await, 19);

    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(count(&env.pool, "repository_cases").await, 90);
    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    let cases = job.entity_progress[&EntityKind::RepositoryCase];
    assert_eq!(cases.mapped, 19);
    assert_eq!(cases.created, 71);
}

/// Takes the only connection of the import pool on the second check, the
/// one right before the first project chunk, and keeps it.
struct StarvePool {
    pool: SqlitePool,
    held: tokio::sync::Mutex<Option<PoolConnection<Sqlite>>>,
    calls: Mutex<u32>,
}

#[async_trait]
impl CancelCheck for StarvePool {
    async fn should_abort(&self) -> bool {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if call == 2 {
            *self.held.lock().await = Some(self.pool.acquire().await.unwrap());
        }
        false
    }
}

#[tokio::test]
async fn chunk_exceeding_its_timeout_fails_without_committing() {
    let env = setup("\n[import.chunks.project]\ntimeout_secs = 1\n").await;
    let id = create_and_analyze(&env, &sample_bundle()).await;
    // Staging reads go through the shared pool; chunk transactions through a
    // one-connection pool the cancel check starves.
    let store = SqliteStaging::new(env.pool.clone());
    let narrow = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(&env.config.db.path))
        .await
        .unwrap();
    let cancel = StarvePool {
        pool: narrow.clone(),
        held: tokio::sync::Mutex::new(None),
        calls: Mutex::new(0),
    };

    let err = importer::import_job(&narrow, &store, &cancel, &env.config, &id)
        .await
        .unwrap_err();
    assert!(
        matches!(err, ImportError::Timeout { entity: EntityKind::Project, secs: 1 }),
        "unexpected error: {}",
        err
    );
    let message = err.to_string();
    assert!(message.contains("project"));
    assert!(message.contains("1s"));

    drop(cancel);
    narrow.close().await;
    assert_eq!(count(&env.pool, "projects").await, 0);
}

#[tokio::test]
async fn child_milestones_wait_for_their_parents() {
    let env = setup("").await;
    let bundle = json!({
        "projects": [ {"id": 1, "name": "Web"} ],
        "milestones": [
            {"id": 3, "project_id": 1, "parent_id": 2, "name": "Sprint 1.1"},
            {"id": 2, "project_id": 1, "parent_id": 1, "name": "Sprint 1"},
            {"id": 1, "project_id": 1, "name": "Release 1"},
            {"id": 4, "project_id": 1, "parent_id": 40, "name": "Orphan"}
        ]
    });
    let id = create_and_analyze(&env, &bundle).await;
    let status = worker::run_import_job(&env.pool, &env.config, &id).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    assert_eq!(count(&env.pool, "milestones").await, 3);
    let nested: Option<String> = sqlx::query_scalar(
        "SELECT p.name FROM milestones c JOIN milestones p ON c.parent_id = p.id WHERE c.name = 'Sprint 1.1'",
    )
    .fetch_optional(&env.pool)
    .await
    .unwrap();
    assert_eq!(nested.as_deref(), Some("Sprint 1"));

    let job = jobs::require_job(&env.pool, &id).await.unwrap();
    let milestones = job.entity_progress[&EntityKind::Milestone];
    assert_eq!(milestones.created, 3);
    assert_eq!(milestones.skipped, 1);
    assert_eq!(milestones.total, 3);
}
