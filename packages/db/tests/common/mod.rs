use std::sync::LazyLock;

use tokio::sync::{Mutex, MutexGuard};

use db::{DbConfig, DbError};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Runtime that owns the global `mem://` connection. The engine's router task
/// is spawned where the connection is opened, so it must outlive every
/// per-test `#[tokio::test]` runtime.
static DB_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("db test runtime")
});

pub async fn setup_db() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = TEST_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .expect("db init task")?;
    let db_conn = db::get_db()?;
    db_conn.query("DELETE scan_job; DELETE delivery;").await?;
    Ok(guard)
}
