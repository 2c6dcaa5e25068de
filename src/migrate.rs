//! Idempotent schema migrations.
//!
//! Two groups of tables: the job bookkeeping (jobs, datasets, staged rows,
//! reindex requests) and the target data model the importer writes into.
//! Every statement is `CREATE ... IF NOT EXISTS`, so `casebridge init` can be
//! run any number of times.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const JOB_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS import_jobs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        phase TEXT,
        status_message TEXT,
        bundle_path TEXT NOT NULL,
        bundle_sha256 TEXT,
        bundle_size INTEGER,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        processed_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        skipped_count INTEGER NOT NULL DEFAULT 0,
        total_count INTEGER NOT NULL DEFAULT 0,
        current_entity TEXT,
        estimated_time_remaining INTEGER,
        processing_rate REAL,
        activity_log TEXT NOT NULL DEFAULT '[]',
        entity_progress TEXT NOT NULL DEFAULT '{}',
        mapping_configuration TEXT NOT NULL DEFAULT '{}',
        error TEXT,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS import_datasets (
        job_id TEXT NOT NULL,
        name TEXT NOT NULL,
        row_count INTEGER NOT NULL,
        schema_json TEXT NOT NULL,
        sample_json TEXT NOT NULL,
        PRIMARY KEY (job_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS import_staged_rows (
        job_id TEXT NOT NULL,
        dataset TEXT NOT NULL,
        row_index INTEGER NOT NULL,
        source_id INTEGER,
        project_id INTEGER,
        name TEXT,
        payload TEXT NOT NULL,
        PRIMARY KEY (job_id, dataset, row_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_reindex_requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        requested_at INTEGER NOT NULL,
        processed_at INTEGER
    )
    "#,
];

const TARGET_TABLES: &[&str] = &[
    // Reference entities
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        is_default INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        role_id INTEGER REFERENCES roles(id),
        is_active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS statuses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        system_name TEXT NOT NULL,
        color TEXT NOT NULL DEFAULT '#9e9e9e',
        is_success INTEGER NOT NULL DEFAULT 0,
        is_failure INTEGER NOT NULL DEFAULT 0,
        is_completed INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL COLLATE NOCASE,
        scope TEXT NOT NULL DEFAULT 'CASES',
        UNIQUE (name, scope)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS milestone_types (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        icon TEXT NOT NULL DEFAULT 'milestone',
        is_default INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS configurations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE
    )
    "#,
    // Containers
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        note TEXT,
        is_completed INTEGER NOT NULL DEFAULT 0,
        created_by INTEGER REFERENCES users(id),
        created_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS project_members (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        role_id INTEGER REFERENCES roles(id),
        UNIQUE (project_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS milestones (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        parent_id INTEGER REFERENCES milestones(id),
        type_id INTEGER REFERENCES milestone_types(id),
        name TEXT NOT NULL,
        note TEXT,
        is_completed INTEGER NOT NULL DEFAULT 0,
        started_at INTEGER,
        due_at INTEGER,
        completed_at INTEGER,
        created_by INTEGER REFERENCES users(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL UNIQUE REFERENCES projects(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repository_folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES repositories(id),
        parent_id INTEGER REFERENCES repository_folders(id),
        name TEXT NOT NULL,
        docs TEXT,
        display_order INTEGER NOT NULL DEFAULT 0
    )
    "#,
    // Content
    r#"
    CREATE TABLE IF NOT EXISTS custom_fields (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        system_name TEXT NOT NULL UNIQUE,
        field_type TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS field_options (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        field_id INTEGER NOT NULL REFERENCES custom_fields(id),
        name TEXT NOT NULL COLLATE NOCASE,
        is_default INTEGER NOT NULL DEFAULT 0,
        UNIQUE (field_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repository_cases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        repository_id INTEGER NOT NULL REFERENCES repositories(id),
        folder_id INTEGER REFERENCES repository_folders(id),
        name TEXT NOT NULL,
        state_id INTEGER REFERENCES workflows(id),
        estimate INTEGER,
        is_automated INTEGER NOT NULL DEFAULT 0,
        description TEXT,
        created_by INTEGER REFERENCES users(id),
        created_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repository_case_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id INTEGER NOT NULL REFERENCES repository_cases(id),
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        snapshot TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (case_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS case_steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id INTEGER NOT NULL REFERENCES repository_cases(id),
        step_order INTEGER NOT NULL,
        step TEXT,
        expected TEXT,
        UNIQUE (case_id, step_order)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS case_field_values (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id INTEGER NOT NULL REFERENCES repository_cases(id),
        field_id INTEGER NOT NULL REFERENCES custom_fields(id),
        value TEXT,
        UNIQUE (case_id, field_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        milestone_id INTEGER REFERENCES milestones(id),
        configuration_id INTEGER REFERENCES configurations(id),
        state_id INTEGER REFERENCES workflows(id),
        name TEXT NOT NULL,
        note TEXT,
        assignee_id INTEGER REFERENCES users(id),
        estimate INTEGER,
        elapsed INTEGER,
        is_completed INTEGER NOT NULL DEFAULT 0,
        created_by INTEGER REFERENCES users(id),
        created_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id),
        status_id INTEGER REFERENCES statuses(id),
        note TEXT,
        elapsed INTEGER,
        created_by INTEGER REFERENCES users(id),
        created_at INTEGER,
        external_ref INTEGER NOT NULL,
        UNIQUE (session_id, external_ref)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS automation_cases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        name TEXT NOT NULL,
        folder TEXT,
        class_name TEXT
    )
    "#,
    // Execution
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        milestone_id INTEGER REFERENCES milestones(id),
        configuration_id INTEGER REFERENCES configurations(id),
        state_id INTEGER REFERENCES workflows(id),
        name TEXT NOT NULL,
        note TEXT,
        is_completed INTEGER NOT NULL DEFAULT 0,
        created_by INTEGER REFERENCES users(id),
        created_at INTEGER,
        completed_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_cases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES runs(id),
        case_id INTEGER NOT NULL REFERENCES repository_cases(id),
        status_id INTEGER REFERENCES statuses(id),
        assignee_id INTEGER REFERENCES users(id),
        display_order INTEGER NOT NULL DEFAULT 0,
        is_completed INTEGER NOT NULL DEFAULT 0,
        UNIQUE (run_id, case_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_case_id INTEGER NOT NULL REFERENCES run_cases(id),
        status_id INTEGER REFERENCES statuses(id),
        note TEXT,
        elapsed INTEGER,
        created_by INTEGER REFERENCES users(id),
        created_at INTEGER,
        external_ref INTEGER NOT NULL,
        UNIQUE (run_case_id, external_ref)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_result_steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        result_id INTEGER NOT NULL REFERENCES run_results(id),
        step_id INTEGER NOT NULL REFERENCES case_steps(id),
        status_id INTEGER REFERENCES statuses(id),
        note TEXT,
        UNIQUE (result_id, step_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS automation_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        milestone_id INTEGER REFERENCES milestones(id),
        configuration_id INTEGER REFERENCES configurations(id),
        name TEXT NOT NULL,
        source TEXT,
        status_id INTEGER REFERENCES statuses(id),
        elapsed INTEGER,
        is_completed INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS automation_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES automation_runs(id),
        case_id INTEGER NOT NULL REFERENCES automation_cases(id),
        status_id INTEGER REFERENCES statuses(id),
        elapsed INTEGER,
        created_at INTEGER,
        UNIQUE (run_id, case_id)
    )
    "#,
    // Cross-links
    r#"
    CREATE TABLE IF NOT EXISTS entity_tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        entity_type TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        UNIQUE (tag_id, entity_type, entity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS issues (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_key TEXT NOT NULL UNIQUE,
        title TEXT,
        url TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS issue_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id INTEGER NOT NULL REFERENCES issues(id),
        entity_type TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        UNIQUE (issue_id, entity_type, entity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entity_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        name TEXT,
        url TEXT NOT NULL,
        note TEXT,
        UNIQUE (entity_type, entity_id, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS case_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id INTEGER NOT NULL REFERENCES repository_cases(id),
        linked_case_id INTEGER NOT NULL REFERENCES repository_cases(id),
        link_type TEXT NOT NULL DEFAULT 'related',
        UNIQUE (case_id, linked_case_id, link_type)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_milestones_natural ON milestones(project_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_folders_natural ON repository_folders(repository_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_cases_natural ON repository_cases(repository_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_natural ON sessions(project_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_runs_natural ON runs(project_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_automation_runs_natural ON automation_runs(project_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_automation_cases_natural ON automation_cases(project_id, name)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Run every migration statement against an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in JOB_TABLES.iter().chain(TARGET_TABLES).chain(INDEXES) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
