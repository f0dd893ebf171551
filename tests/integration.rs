use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use knowledge_space::config::load_config;
use knowledge_space::embedding::DisabledProvider;
use knowledge_space::worker::Worker;
use knowledge_space::{db, knowledge, spaces, users};
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kb"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/kb.sqlite"

[auth]
jwt_secret = "cli-test-secret-0123456789"

[upload]
dir = "{root}/data/uploads"

[chunking]
max_tokens = 700
overlap_tokens = 80

[retrieval]
final_limit = 12
"#,
        root = root.display()
    );

    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("KB_DB_PATH")
        .env_remove("JWT_SECRET")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// Seed one text source through the library and process its job.
/// Returns (knowledge base id, job id).
async fn seed_runbook(config_path: &Path, drain: bool) -> (String, String) {
    let config = Arc::new(load_config(config_path).unwrap());
    let pool = db::connect(&config).await.unwrap();

    let owner = users::register(&pool, "ops@example.com", "correct horse battery", "Ops")
        .await
        .unwrap()
        .id;
    let space = spaces::create_space(&pool, &owner, "Operations", None)
        .await
        .unwrap()
        .space
        .id;
    let kb = knowledge::create_knowledge_base(&pool, &owner, &space, "Runbooks", None)
        .await
        .unwrap()
        .id;
    knowledge::create_text_source(
        &pool,
        &config,
        &owner,
        &kb,
        "Deploy runbook",
        "To roll back a release, run the rollback pipeline and page the on-call engineer.",
    )
    .await
    .unwrap();

    let job_id: String = sqlx::query_scalar("SELECT id FROM jobs LIMIT 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    if drain {
        Worker::with_default_handlers(pool.clone(), config.clone(), Arc::new(DisabledProvider))
            .unwrap()
            .drain()
            .await
            .unwrap();
    }
    pool.close().await;
    (kb, job_id)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/kb.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_kb(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_kb(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_kb(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_user_create_and_list() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (stdout, _, _) = run_kb(&config_path, &["user", "list"]);
    assert!(stdout.contains("No users."));

    let (stdout, stderr, success) = run_kb(
        &config_path,
        &[
            "user",
            "create",
            "--email",
            "Grace@Example.com",
            "--password",
            "correct horse battery",
            "--name",
            "Grace",
        ],
    );
    assert!(success, "user create failed: {}", stderr);
    assert!(stdout.contains("Created user grace@example.com"));

    let (stdout, _, success) = run_kb(&config_path, &["user", "list"]);
    assert!(success);
    assert!(stdout.contains("grace@example.com"));
    assert!(stdout.contains("Grace"));

    let (_, stderr, success) = run_kb(
        &config_path,
        &[
            "user",
            "create",
            "--email",
            "grace@example.com",
            "--password",
            "another password",
        ],
    );
    assert!(!success, "duplicate email should fail");
    assert!(stderr.contains("already exists"), "stderr: {}", stderr);
}

#[test]
fn test_short_password_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (_, _, success) = run_kb(
        &config_path,
        &["user", "create", "--email", "a@example.com", "--password", "short"],
    );
    assert!(!success);
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (stdout, stderr, success) = run_kb(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Database Stats"));
    assert!(stdout.contains("Spaces:      0"));
}

#[test]
fn test_jobs_list_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (stdout, _, success) = run_kb(&config_path, &["jobs", "list"]);
    assert!(success);
    assert!(stdout.contains("No jobs."));

    let (_, _, success) = run_kb(&config_path, &["jobs", "list", "--status", "bogus"]);
    assert!(!success, "unknown status should fail");
}

#[test]
fn test_embed_pending_requires_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (_, stderr, success) = run_kb(&config_path, &["embed", "pending", "--dry-run"]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "stderr: {}", stderr);
}

#[tokio::test]
async fn test_search_after_ingest() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let (kb, _) = seed_runbook(&config_path, true).await;

    let (stdout, stderr, success) = run_kb(&config_path, &["search", &kb, "rollback pipeline"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("Deploy runbook"), "stdout: {}", stdout);
    assert!(stdout.contains("1. [1.00]"));

    let (stdout, _, success) = run_kb(
        &config_path,
        &["search", &kb, "kubernetes", "--mode", "keyword"],
    );
    assert!(success);
    assert!(stdout.contains("No results."));

    let (_, _, success) = run_kb(&config_path, &["search", &kb, "rollback", "--mode", "semantic"]);
    assert!(!success, "semantic search needs embeddings");

    let (stdout, _, _) = run_kb(&config_path, &["stats"]);
    assert!(stdout.contains("Operations"));
    assert!(stdout.contains("succeeded"));
}

#[tokio::test]
async fn test_jobs_cancel_and_retry() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let (_, job_id) = seed_runbook(&config_path, false).await;

    let (stdout, _, _) = run_kb(&config_path, &["jobs", "list", "--status", "queued"]);
    assert!(stdout.contains(&job_id));
    assert!(stdout.contains("ingest_source"));

    let (stdout, stderr, success) = run_kb(&config_path, &["jobs", "cancel", &job_id]);
    assert!(success, "cancel failed: {}", stderr);
    assert!(stdout.contains("cancelled"));

    let (_, _, success) = run_kb(&config_path, &["jobs", "cancel", &job_id]);
    assert!(!success, "cancelling twice should fail");

    let (stdout, stderr, success) = run_kb(&config_path, &["jobs", "retry", &job_id]);
    assert!(success, "retry failed: {}", stderr);
    assert!(stdout.contains("requeued"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_processes_jobs_and_stops_on_sigint() {
    use std::io::{BufRead, BufReader};
    use std::process::Stdio;
    use std::time::Duration;

    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let (_, job_id) = seed_runbook(&config_path, false).await;

    let mut child = Command::new(kb_binary())
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(["worker", "--concurrency", "1"])
        .env_remove("RUST_LOG")
        .env_remove("KB_DB_PATH")
        .env_remove("JWT_SECRET")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut lines = BufReader::new(child.stderr.take().unwrap()).lines();
    let mut read_until = |needle: &str| loop {
        match lines.next() {
            Some(Ok(line)) if line.contains(needle) => return true,
            Some(Ok(_)) => {}
            _ => return false,
        }
    };
    assert!(read_until("worker pool started"), "worker never started");
    assert!(read_until("job succeeded"), "seeded job never ran");

    // Let the signal listener install before interrupting.
    std::thread::sleep(Duration::from_millis(500));
    let status = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    assert!(read_until("worker pool stopped"), "worker did not shut down");
    let exit = child.wait().unwrap();
    assert!(exit.success(), "worker exited with {:?}", exit);

    let (stdout, _, _) = run_kb(&config_path, &["jobs", "list", "--status", "succeeded"]);
    assert!(stdout.contains(&job_id));
}
