//! Migration runner against a real SQLite database.

use std::fs;
use std::path::Path;
use std::time::Duration;

use second_brain::db;
use second_brain::migrate::{MigrationExecutor, MigrationRunner, MIGRATION_LOCK_KEY};
use second_brain::policy;
use second_brain::schema::SchemaManager;
use second_brain::sqlite_executor::SqliteMigrationExecutor;
use second_brain_core::drift::DriftType;
use second_brain_core::error::{codes, BrainError};
use sqlx::SqlitePool;
use tempfile::TempDir;

const NOTES: &str = "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);\n\n\
                     -- rollback:\nDROP TABLE notes;\n";
const TAGS: &str = "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n\n\
                    -- rollback:\nDROP TABLE tags;\n";

fn write_migration(dir: &Path, name: &str, sql: &str) {
    fs::write(dir.join(name), sql).unwrap();
}

async fn setup(tmp: &TempDir) -> (SqlitePool, MigrationRunner<SqliteMigrationExecutor>) {
    let migrations = tmp.path().join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    let pool = db::connect_path(&tmp.path().join("data/brain.sqlite"))
        .await
        .unwrap();
    let executor = SqliteMigrationExecutor::new(pool.clone()).await.unwrap();
    (pool, MigrationRunner::new(SchemaManager::new(migrations), executor))
}

async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(pool)
            .await
            .unwrap();
    count == 1
}

#[tokio::test]
async fn test_apply_records_and_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (pool, runner) = setup(&tmp).await;
    let dir = runner.schema().migrations_dir().to_path_buf();
    write_migration(&dir, "001_notes.sql", NOTES);
    write_migration(&dir, "002_tags.sql", TAGS);

    let result = runner.apply_pending(false).await.unwrap();
    assert!(result.success);
    assert_eq!(result.applied.len(), 2);
    assert!(table_exists(&pool, "notes").await);
    assert!(table_exists(&pool, "tags").await);

    let applied = runner.executor().applied_migrations().await.unwrap();
    assert_eq!(
        applied.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let again = runner.apply_pending(false).await.unwrap();
    assert!(again.success);
    assert!(again.applied.is_empty());
}

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    let tmp = TempDir::new().unwrap();
    let (pool, runner) = setup(&tmp).await;
    write_migration(runner.schema().migrations_dir(), "001_notes.sql", NOTES);

    let result = runner.apply_pending(true).await.unwrap();
    assert!(result.dry_run);
    assert_eq!(result.applied.len(), 1);
    assert_eq!(result.pending_count, 1);
    assert!(!table_exists(&pool, "notes").await);
    assert!(runner.executor().applied_migrations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_modified_file_is_schema_drift() {
    let tmp = TempDir::new().unwrap();
    let (_pool, runner) = setup(&tmp).await;
    let dir = runner.schema().migrations_dir().to_path_buf();
    write_migration(&dir, "001_x.sql", NOTES);
    runner.apply_pending(false).await.unwrap();

    write_migration(&dir, "001_x.sql", &format!("-- edited after apply\n{}", NOTES));
    let applied = runner.executor().applied_migrations().await.unwrap();
    let err = runner.schema().validate_schema_integrity(&applied).unwrap_err();
    assert_eq!(err.code(), codes::SCHEMA_DRIFT);
    assert_eq!(err.context()["drift_count"], 1);
    assert_eq!(err.context()["drift_items"][0]["drift_type"], "modified");

    let apply_err = runner.apply_pending(false).await.unwrap_err();
    let brain = apply_err.downcast_ref::<BrainError>().unwrap();
    assert_eq!(brain.code(), codes::SCHEMA_DRIFT);

    // The lock is released on the error path.
    assert!(runner
        .executor()
        .acquire_advisory_lock(MIGRATION_LOCK_KEY)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_failing_migration_stops_after_partial_apply() {
    let tmp = TempDir::new().unwrap();
    let (pool, runner) = setup(&tmp).await;
    let dir = runner.schema().migrations_dir().to_path_buf();
    write_migration(&dir, "001_notes.sql", NOTES);
    write_migration(&dir, "002_broken.sql", "CREATE TABLE (;\n");
    write_migration(&dir, "003_tags.sql", TAGS);

    let result = runner.apply_pending(false).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.applied.len(), 1);
    assert_eq!(result.pending_count, 2);
    assert!(result.error.unwrap().contains("002_broken.sql"));
    assert!(table_exists(&pool, "notes").await);
    assert!(!table_exists(&pool, "tags").await);
}

#[tokio::test]
async fn test_lock_held_elsewhere() {
    let tmp = TempDir::new().unwrap();
    let (pool, runner) = setup(&tmp).await;
    write_migration(runner.schema().migrations_dir(), "001_notes.sql", NOTES);

    let other = SqliteMigrationExecutor::new(pool.clone()).await.unwrap();
    assert!(other.acquire_advisory_lock(MIGRATION_LOCK_KEY).await.unwrap());

    let blocked = runner.apply_pending(false).await.unwrap();
    assert!(!blocked.success);
    assert!(blocked.error.unwrap().contains("Could not acquire migration lock"));
    assert!(!table_exists(&pool, "notes").await);

    other.release_advisory_lock(MIGRATION_LOCK_KEY).await.unwrap();
    assert!(runner.apply_pending(false).await.unwrap().success);
}

#[tokio::test]
async fn test_stale_lock_row_is_taken_over() {
    let tmp = TempDir::new().unwrap();
    let (pool, _runner) = setup(&tmp).await;
    let migrations = tmp.path().join("migrations");
    write_migration(&migrations, "001_notes.sql", NOTES);

    // Row left behind by a run that died before releasing.
    sqlx::query("INSERT INTO migration_locks (lock_key, holder, acquired_at) VALUES (?, ?, ?)")
        .bind(MIGRATION_LOCK_KEY)
        .bind("crashed-run")
        .bind(chrono::Utc::now().timestamp() - 7200)
        .execute(&pool)
        .await
        .unwrap();

    let executor = SqliteMigrationExecutor::new(pool.clone())
        .await
        .unwrap()
        .with_lock_ttl(Duration::from_secs(3600));
    let runner = MigrationRunner::new(SchemaManager::new(migrations), executor);
    let result = runner.apply_pending(false).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert!(table_exists(&pool, "notes").await);

    let holders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migration_locks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(holders, 0);
}

#[tokio::test]
async fn test_fresh_lock_row_is_respected() {
    let tmp = TempDir::new().unwrap();
    let (pool, runner) = setup(&tmp).await;
    let holder = SqliteMigrationExecutor::new(pool.clone()).await.unwrap();
    assert!(holder.acquire_advisory_lock(MIGRATION_LOCK_KEY).await.unwrap());

    let other = SqliteMigrationExecutor::new(pool.clone())
        .await
        .unwrap()
        .with_lock_ttl(Duration::from_secs(3600));
    assert!(!other.acquire_advisory_lock(MIGRATION_LOCK_KEY).await.unwrap());
    assert!(!runner.executor().acquire_advisory_lock(MIGRATION_LOCK_KEY).await.unwrap());
}

#[tokio::test]
async fn test_rollback_last_and_errors() {
    let tmp = TempDir::new().unwrap();
    let (pool, runner) = setup(&tmp).await;
    let dir = runner.schema().migrations_dir().to_path_buf();

    let err = runner.rollback_last().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<BrainError>().unwrap().code(),
        codes::NO_MIGRATIONS
    );

    write_migration(&dir, "001_notes.sql", NOTES);
    write_migration(&dir, "002_forward_only.sql", "CREATE TABLE audit (id INTEGER);\n");
    runner.apply_pending(false).await.unwrap();

    let err = runner.rollback_last().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<BrainError>().unwrap().code(),
        codes::NO_ROLLBACK_SQL
    );

    fs::remove_file(dir.join("002_forward_only.sql")).unwrap();
    let err = runner.rollback_last().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<BrainError>().unwrap().code(),
        codes::MIGRATION_FILE_NOT_FOUND
    );

    runner.executor().remove_migration_record(2).await.unwrap();
    let result = runner.rollback_last().await.unwrap();
    assert!(result.success);
    assert_eq!(result.rolled_back[0].version, 1);
    assert!(!table_exists(&pool, "notes").await);
    assert!(runner.executor().applied_migrations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_file_is_not_critical_drift() {
    let tmp = TempDir::new().unwrap();
    let (_pool, runner) = setup(&tmp).await;
    let dir = runner.schema().migrations_dir().to_path_buf();
    write_migration(&dir, "001_notes.sql", NOTES);
    write_migration(&dir, "002_tags.sql", TAGS);

    let expected = runner.schema().scan_migrations().unwrap();
    let drift = second_brain_core::drift::detect_drift(&expected, &[]);
    assert!(drift.iter().all(|d| d.drift_type == DriftType::Missing));
    assert!(runner.schema().validate_schema_integrity(&[]).is_ok());
}

#[test]
fn test_bundled_migrations_pass_policy() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let reports = policy::lint_dir(&dir).unwrap();
    assert!(!reports.is_empty());
    for report in reports {
        assert!(report.passed(), "{}: {:?}", report.path.display(), report.findings);
    }
}
