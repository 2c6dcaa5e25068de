use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn casebridge_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("casebridge");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/casebridge.sqlite"

[import]
reindex_on_complete = false
"#,
        root.display()
    );
    let config_path = config_dir.join("casebridge.toml");
    fs::write(&config_path, config_content).unwrap();

    let bundle = r#"{
  "roles": [ {"id": 1, "name": "Tester"} ],
  "users": [ {"id": 5, "name": "Ada", "email": "Ada@Example.com", "role_id": 1} ],
  "tags": [ {"id": 3, "name": "smoke"} ],
  "projects": [ {"id": 1, "name": "Web", "created_by": 5} ],
  "project_users": [ {"project_id": 1, "user_id": 5} ],
  "repositories": [ {"id": 10, "project_id": 1} ],
  "repository_cases": [
    {"id": 1, "project_id": 1, "repo_id": 10, "name": "Login", "created_by": 5},
    {"id": 2, "project_id": 1, "repo_id": 10, "name": "Logout"}
  ],
  "repository_case_tags": [ {"case_id": 1, "tag_id": 3} ],
  "repository_case_links": [ {"case_id": 1, "linked_case_id": 2} ]
}"#;
    fs::write(root.join("bundle.json"), bundle).unwrap();

    (tmp, config_path)
}

fn run_casebridge(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = casebridge_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run casebridge binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn bundle_path(config_path: &Path) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("bundle.json")
        .display()
        .to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_casebridge(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));
    let (_, stderr, ok) = run_casebridge(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_job_lifecycle_step_by_step() {
    let (_tmp, config) = setup_test_env();
    run_casebridge(&config, &["init"]);
    let bundle = bundle_path(&config);

    let (stdout, stderr, ok) = run_casebridge(&config, &["job", "create", &bundle]);
    assert!(ok, "job create failed: {}", stderr);
    let job = stdout.trim().to_string();
    assert_eq!(job.len(), 36, "expected a uuid, got {:?}", job);

    let (stdout, stderr, ok) = run_casebridge(&config, &["analyze", &job]);
    assert!(ok, "analyze failed: {}", stderr);
    assert!(stdout.contains("READY"));

    let (stdout, _, ok) = run_casebridge(&config, &["datasets", &job]);
    assert!(ok);
    assert!(stdout.contains("repository_cases"));
    assert!(stdout.contains("users"));

    // Analysis seeded one create decision per reference row.
    let (stdout, _, ok) = run_casebridge(&config, &["mapping", "show", &job]);
    assert!(ok);
    let mapping: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(mapping["users"]["5"]["action"], "create");
    assert_eq!(mapping["roles"]["1"]["action"], "create");

    let (stdout, stderr, ok) = run_casebridge(&config, &["import", &job]);
    assert!(ok, "import failed: {}", stderr);
    assert!(stdout.contains("COMPLETED"));

    let (stdout, _, ok) = run_casebridge(&config, &["status", &job, "--json"]);
    assert!(ok);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["status"], "COMPLETED");
    assert_eq!(status["skippedCount"], 0);
    assert_eq!(status["entityProgress"]["repository_case"]["created"], 2);
    assert_eq!(status["entityProgress"]["case_link"]["created"], 1);

    // Resolved decisions are rewritten to `map`.
    let (stdout, _, _) = run_casebridge(&config, &["mapping", "show", &job]);
    let mapping: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(mapping["users"]["5"]["action"], "map");

    let (stdout, _, ok) = run_casebridge(&config, &["status", &job]);
    assert!(ok);
    assert!(stdout.contains("Status:      COMPLETED"));
    assert!(stdout.contains("repository_case"));

    let (stdout, stderr, ok) = run_casebridge(&config, &["purge", &job]);
    assert!(ok, "purge failed: {}", stderr);
    assert!(stdout.contains("Purged"));
}

#[test]
fn test_run_creates_analyzes_and_imports() {
    let (_tmp, config) = setup_test_env();
    run_casebridge(&config, &["init"]);
    let bundle = bundle_path(&config);

    let (stdout, stderr, ok) = run_casebridge(&config, &["run", &bundle]);
    assert!(ok, "run failed: {}", stderr);
    let mut lines = stdout.lines();
    let job = lines.next().unwrap().trim().to_string();
    assert!(stdout.contains("COMPLETED"));

    let (stdout, _, ok) = run_casebridge(&config, &["jobs"]);
    assert!(ok);
    assert!(stdout.contains(&job));

    // A finished job has nothing to cancel, and importing it again is a no-op.
    let (stdout, _, ok) = run_casebridge(&config, &["cancel", &job]);
    assert!(ok);
    assert!(stdout.contains("nothing to cancel"));
    let (stdout, _, ok) = run_casebridge(&config, &["import", &job]);
    assert!(ok);
    assert!(stdout.contains("COMPLETED"));
}

#[test]
fn test_operator_mapping_onto_missing_target_fails() {
    let (tmp, config) = setup_test_env();
    run_casebridge(&config, &["init"]);
    let bundle = bundle_path(&config);
    let mapping = tmp.path().join("mapping.json");
    fs::write(
        &mapping,
        r#"{ "roles": { "1": { "action": "map", "mappedTo": 4242 } } }"#,
    )
    .unwrap();

    let (stdout, _, _) = run_casebridge(&config, &["job", "create", &bundle]);
    let job = stdout.trim().to_string();
    run_casebridge(&config, &["analyze", &job]);
    let (_, stderr, ok) = run_casebridge(
        &config,
        &["mapping", "set", &job, mapping.to_str().unwrap()],
    );
    assert!(ok, "mapping set failed: {}", stderr);

    let (stdout, _, ok) = run_casebridge(&config, &["import", &job]);
    assert!(!ok);
    assert!(stdout.contains("FAILED"));

    let (stdout, _, _) = run_casebridge(&config, &["status", &job, "--json"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["status"], "FAILED");
    assert!(status["error"].as_str().unwrap().contains("4242"));
}

#[test]
fn test_unknown_job_and_missing_bundle() {
    let (_tmp, config) = setup_test_env();
    run_casebridge(&config, &["init"]);

    let (_, stderr, ok) = run_casebridge(&config, &["status", "does-not-exist"]);
    assert!(!ok);
    assert!(stderr.contains("No import job found"));

    let (_, stderr, ok) = run_casebridge(&config, &["job", "create", "/nonexistent/bundle.json"]);
    assert!(!ok);
    assert!(stderr.contains("Bundle not found"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("bad.toml");
    fs::write(
        &config,
        format!(
            "[db]\npath = \"{}/x.sqlite\"\n\n[import.chunks.widgets]\nsize = 5\n",
            tmp.path().display()
        ),
    )
    .unwrap();
    let (_, stderr, ok) = run_casebridge(&config, &["init"]);
    assert!(!ok);
    assert!(stderr.contains("widgets"));
}
