#![cfg(feature = "rocksdb")]
#![allow(clippy::disallowed_methods)]

use std::error::Error;

use db::DbConfig;
use db::repositories::JobRepository;
use scan_core::{Dimensions, JobStatus};

#[tokio::test]
async fn records_are_stored_on_disk() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scan.db");
    db::init(DbConfig::rocksdb(path.display().to_string())).await?;

    let id = JobRepository::create(8, Dimensions::new(20.0, 20.0, 30.0)?).await?;
    let record = JobRepository::get(id).await?;
    assert_eq!(record.status, JobStatus::Queued);
    assert_eq!(record.input_photo_count, 8);
    assert!(path.exists());
    Ok(())
}
