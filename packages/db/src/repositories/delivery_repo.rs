//! Durable copy of the broker's deliveries.

use scan_core::{Delivery, JobId};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{DbError, get_db};

const TABLE: &str = "delivery";

/// Repository for broker delivery persistence.
pub struct DeliveryRepository;

#[derive(Debug, Serialize, Deserialize)]
struct DeliveryRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    #[serde(flatten)]
    delivery: Delivery,
}

impl DeliveryRepository {
    /// Insert or overwrite the delivery for its job.
    pub async fn save(delivery: &Delivery) -> Result<Delivery, DbError> {
        let db = get_db()?;

        let row: Option<DeliveryRow> = db
            .upsert((TABLE, delivery.job_id.to_string()))
            .content(DeliveryRow {
                id: None,
                delivery: delivery.clone(),
            })
            .await?;

        row.map(|r| r.delivery)
            .ok_or_else(|| DbError::Query("Failed to save delivery".into()))
    }

    /// Remove an acked delivery. Missing deliveries are ignored.
    pub async fn delete(job_id: JobId) -> Result<(), DbError> {
        let db = get_db()?;

        let _: Option<DeliveryRow> = db.delete((TABLE, job_id.to_string())).await?;

        Ok(())
    }

    pub async fn get(job_id: JobId) -> Result<Option<Delivery>, DbError> {
        let db = get_db()?;

        let row: Option<DeliveryRow> = db.select((TABLE, job_id.to_string())).await?;

        Ok(row.map(|r| r.delivery))
    }

    /// All stored deliveries, oldest first.
    pub async fn list() -> Result<Vec<Delivery>, DbError> {
        let db = get_db()?;

        let rows: Vec<DeliveryRow> = db.select(TABLE).await?;

        let mut deliveries: Vec<Delivery> = rows.into_iter().map(|r| r.delivery).collect();
        deliveries.sort_by_key(|d| d.enqueued_at);
        Ok(deliveries)
    }
}
