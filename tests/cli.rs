use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn brain_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("brain");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    let migrations = root.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    fs::write(
        migrations.join("001_notes.sql"),
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);\n\n-- rollback:\nDROP TABLE notes;\n",
    )
    .unwrap();
    fs::write(
        migrations.join("002_note_source.sql"),
        "ALTER TABLE notes ADD COLUMN source TEXT;\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/brain.sqlite"

[migrations]
dir = "{root}/migrations"

[trace]
enabled = true
max_traces = 10

[logging]
level = "error"
"#,
        root = root.display()
    );
    let config_path = root.join("config/brain.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_brain(config: &Path, args: &[&str]) -> Output {
    Command::new(brain_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("VOYAGE_API_KEY")
        .output()
        .expect("failed to run brain")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_recall_prints_response_and_trace() {
    let (_tmp, config) = setup_test_env();
    let output = run_brain(&config, &["recall", "what did I write about tokio", "--trace"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let text = stdout(&output);
    assert!(text.contains("\"branch\": \"RERANK_BYPASSED\""));
    assert!(text.contains("\"selected_provider\": \"mem0\""));
    assert!(text.contains("\"trace_id\""));
    assert!(text.contains("\"status\": \"ok\""));
}

#[test]
fn test_recall_rejects_bad_threshold() {
    let (_tmp, config) = setup_test_env();
    let output = run_brain(&config, &["recall", "q", "--threshold", "1.5"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("threshold"));
}

#[test]
fn test_chat_returns_planner_reply() {
    let (_tmp, config) = setup_test_env();
    let output = run_brain(&config, &["chat", "low confidence question", "--session", "s1"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("\"action_taken\": \"clarify\""));
    assert!(text.contains("\"session_id\": \"s1\""));
}

#[test]
fn test_migrate_apply_status_rollback() {
    let (_tmp, config) = setup_test_env();

    let dry = run_brain(&config, &["migrate", "apply", "--dry-run"]);
    assert!(dry.status.success());
    assert!(stdout(&dry).contains("Would apply"));

    let apply = run_brain(&config, &["migrate", "apply"]);
    assert!(apply.status.success());
    assert!(stdout(&apply).contains("002_note_source.sql"));

    let status = run_brain(&config, &["migrate", "status"]);
    assert!(stdout(&status).contains("Applied:     2"));
    assert!(stdout(&status).contains("Pending:     0"));

    // 002 has no rollback section.
    let rollback = run_brain(&config, &["migrate", "rollback"]);
    assert!(!rollback.status.success());
    assert!(String::from_utf8_lossy(&rollback.stderr).contains("No rollback section"));
}

#[test]
fn test_migrate_lint_exit_code() {
    let (tmp, config) = setup_test_env();
    let clean = run_brain(&config, &["migrate", "lint"]);
    assert!(clean.status.success());

    let bad = tmp.path().join("bad.sql");
    fs::write(&bad, "DROP TABLE notes;\n").unwrap();
    let output = run_brain(
        &config,
        &["migrate", "lint", "--file", bad.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("drop_table"));
}

#[test]
fn test_scenarios_all_pass() {
    let (_tmp, config) = setup_test_env();
    let output = run_brain(&config, &["scenarios"]);
    assert!(output.status.success(), "{}", stdout(&output));
    assert!(stdout(&output).contains("13/13 scenarios passed"));

    let smoke = run_brain(&config, &["scenarios", "--tag", "smoke"]);
    assert!(stdout(&smoke).contains("4/4 scenarios passed"));
}

fn write_vault(root: &Path) -> PathBuf {
    let vault = root.join("vault");
    fs::create_dir_all(&vault).unwrap();
    fs::write(
        vault.join("tokio.md"),
        "# Tokio\n\nNotes on the runtime.\n\n## Tasks\n\nspawn needs Send.\n",
    )
    .unwrap();
    vault
}

#[test]
fn test_ingest_dry_run_counts_chunks() {
    let (tmp, config) = setup_test_env();
    let vault = write_vault(tmp.path());

    let output = run_brain(&config, &["ingest", vault.to_str().unwrap(), "--dry-run"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("(dry-run)"));
    assert!(text.contains("files: 1"));
    assert!(text.contains("chunks: 2"));
    assert!(!text.contains("chunks stored"));
}

#[test]
fn test_ingest_then_chunk_status_errors() {
    let (tmp, config) = setup_test_env();
    let bundled = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations/004_knowledge_chunks.sql");
    fs::copy(bundled, tmp.path().join("migrations/003_knowledge_chunks.sql")).unwrap();
    assert!(run_brain(&config, &["migrate", "apply"]).status.success());

    let vault = write_vault(tmp.path());
    let output = run_brain(&config, &["ingest", vault.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("chunks stored: 2"));

    let rerun = run_brain(&config, &["ingest", vault.to_str().unwrap()]);
    assert!(stdout(&rerun).contains("duplicates: 2"));

    let missing = run_brain(&config, &["chunk", "nope", "--status", "archived"]);
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("CHUNK_NOT_FOUND"));

    let bad = run_brain(&config, &["ingest", tmp.path().join("absent").to_str().unwrap()]);
    assert!(!bad.status.success());
}
