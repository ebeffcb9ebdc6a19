//! Broker delivery types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// A pending or leased message telling the pool to run one job.
///
/// A delivery stays in the broker until the owning worker acks it. While
/// leased it is invisible to other workers; once the lease expires it becomes
/// deliverable again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub job_id: JobId,
    /// How many times this job has been handed to a worker.
    #[serde(default)]
    pub delivery_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            delivery_count: 0,
            leased_by: None,
            lease_expires_at: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_leased(&self) -> bool {
        self.leased_by.is_some()
    }

    /// Whether the lease lapsed at `now`. Unleased deliveries never expire.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|t| t <= now)
    }

    /// Hand the delivery to `worker_id` for `lease`.
    pub fn leased(self, worker_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            delivery_count: self.delivery_count.saturating_add(1),
            leased_by: Some(worker_id.into()),
            lease_expires_at: Some(Utc::now() + lease),
            ..self
        }
    }

    /// Push the lease deadline forward.
    pub fn renewed(self, lease: Duration) -> Self {
        Self {
            lease_expires_at: Some(Utc::now() + lease),
            ..self
        }
    }

    /// Make the delivery visible again.
    pub fn released(self) -> Self {
        Self {
            leased_by: None,
            lease_expires_at: None,
            ..self
        }
    }
}

/// Broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Deliveries waiting for a worker.
    pub pending: u64,
    /// Deliveries currently leased.
    pub leased: u64,
    /// Deliveries acked since start.
    pub acked: u64,
    /// Leases that lapsed and were made visible again.
    pub expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_lifecycle() {
        let delivery = Delivery::new(JobId::new());
        assert!(!delivery.is_leased());
        assert!(!delivery.lease_expired(Utc::now()));

        let leased = delivery.leased("worker-0", Duration::seconds(30));
        assert_eq!(leased.delivery_count, 1);
        assert!(leased.is_leased());
        assert!(!leased.lease_expired(Utc::now()));
        assert!(leased.lease_expired(Utc::now() + Duration::seconds(31)));

        let released = leased.released();
        assert!(!released.is_leased());
        assert_eq!(released.delivery_count, 1);
        assert_eq!(released.leased("worker-1", Duration::seconds(1)).delivery_count, 2);
    }
}
