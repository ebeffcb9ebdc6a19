//! Broker actor: at-most-one active worker per job.
//!
//! Deliveries live in memory for dispatch and in the database for
//! durability. A leased delivery is invisible to other workers until it is
//! acked, released, or its lease lapses.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use db::repositories::{DeliveryRepository, JobFilter, JobRepository};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use scan_core::{BrokerStats, Delivery, JobId};

use crate::messages::BrokerMessage;

/// Broker actor arguments.
pub struct BrokerArgs {
    /// How long a lease stays valid without renewal.
    pub lease: Duration,
    /// How often lapsed leases are checked.
    pub tick_interval: Duration,
    /// Release every persisted lease on start. Set when the whole process
    /// restarted, since no worker that held one survived.
    pub release_leases: bool,
}

/// State for the broker actor.
pub struct BrokerState {
    pending: VecDeque<Delivery>,
    leased: HashMap<JobId, Delivery>,
    lease: chrono::Duration,
    acked: u64,
    expired: u64,
}

impl BrokerState {
    fn new(lease: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            leased: HashMap::new(),
            lease: chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60)),
            acked: 0,
            expired: 0,
        }
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            pending: self.pending.len() as u64,
            leased: self.leased.len() as u64,
            acked: self.acked,
            expired: self.expired,
        }
    }

    fn contains(&self, job_id: JobId) -> bool {
        self.leased.contains_key(&job_id) || self.pending.iter().any(|d| d.job_id == job_id)
    }

    /// Take a leased delivery back if `worker_id` holds it.
    fn take_lease(&mut self, job_id: JobId, worker_id: &str) -> Option<Delivery> {
        match self.leased.get(&job_id) {
            Some(d) if d.leased_by.as_deref() == Some(worker_id) => self.leased.remove(&job_id),
            Some(d) => {
                tracing::warn!(
                    %job_id,
                    worker_id,
                    holder = ?d.leased_by,
                    "ignoring request from a worker that no longer holds the lease"
                );
                None
            }
            None => None,
        }
    }

    /// Load persisted deliveries. Unfinished jobs without a delivery get one.
    async fn restore(&mut self, release_leases: bool) -> Result<(), db::DbError> {
        for delivery in DeliveryRepository::list().await? {
            if !delivery.is_leased() {
                self.pending.push_back(delivery);
            } else if release_leases {
                let released = delivery.released();
                DeliveryRepository::save(&released).await?;
                self.pending.push_back(released);
            } else if delivery.lease_expires_at.is_none() {
                self.leased.insert(delivery.job_id, delivery.renewed(self.lease));
            } else {
                self.leased.insert(delivery.job_id, delivery);
            }
        }

        for status in ["queued", "running"] {
            let records = JobRepository::list(JobFilter {
                status: Some(status.to_string()),
                ..Default::default()
            })
            .await?;
            for record in records.into_iter().rev() {
                if !self.contains(record.id) {
                    tracing::info!(job_id = %record.id, status, "re-enqueueing job without a delivery");
                    let delivery = Delivery::new(record.id);
                    DeliveryRepository::save(&delivery).await?;
                    self.pending.push_back(delivery);
                }
            }
        }
        Ok(())
    }

    async fn expire_leases(&mut self) {
        let now = Utc::now();
        let lapsed: Vec<JobId> = self
            .leased
            .values()
            .filter(|d| d.lease_expired(now))
            .map(|d| d.job_id)
            .collect();

        for job_id in lapsed {
            let Some(delivery) = self.leased.remove(&job_id) else {
                continue;
            };
            tracing::warn!(%job_id, holder = ?delivery.leased_by, "lease expired, redelivering");
            let released = delivery.released();
            if let Err(e) = DeliveryRepository::save(&released).await {
                tracing::warn!(%job_id, "failed to persist released delivery: {}", e);
            }
            self.expired += 1;
            self.pending.push_front(released);
        }
    }
}

/// Broker actor owning every delivery.
pub struct BrokerActor;

impl Actor for BrokerActor {
    type Msg = BrokerMessage;
    type State = BrokerState;
    type Arguments = BrokerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting broker");

        let mut state = BrokerState::new(args.lease);
        state.restore(args.release_leases).await?;
        tracing::info!(
            pending = state.pending.len(),
            leased = state.leased.len(),
            "broker restored deliveries"
        );

        myself.send_interval(args.tick_interval, || BrokerMessage::Tick);

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BrokerMessage::Enqueue { job_id, reply } => {
                if state.contains(job_id) {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }

                let delivery = Delivery::new(job_id);
                if let Err(e) = DeliveryRepository::save(&delivery).await {
                    let _ = reply.send(Err(format!("Failed to persist delivery: {}", e)));
                    return Ok(());
                }

                tracing::debug!(%job_id, "job enqueued");
                state.pending.push_back(delivery);
                let _ = reply.send(Ok(()));
            }

            BrokerMessage::Dequeue { worker_id, reply } => {
                let Some(delivery) = state.pending.pop_front() else {
                    let _ = reply.send(None);
                    return Ok(());
                };

                let leased = delivery.clone().leased(&worker_id, state.lease);
                if let Err(e) = DeliveryRepository::save(&leased).await {
                    tracing::warn!(job_id = %delivery.job_id, "Failed to persist lease: {}", e);
                    state.pending.push_front(delivery);
                    let _ = reply.send(None);
                    return Ok(());
                }

                tracing::debug!(
                    job_id = %leased.job_id,
                    worker_id,
                    delivery_count = leased.delivery_count,
                    "delivery leased"
                );
                state.leased.insert(leased.job_id, leased.clone());
                let _ = reply.send(Some(leased));
            }

            BrokerMessage::RenewLease {
                job_id,
                worker_id,
                reply,
            } => {
                let Some(delivery) = state.take_lease(job_id, &worker_id) else {
                    let _ = reply.send(false);
                    return Ok(());
                };
                let renewed = delivery.renewed(state.lease);
                if let Err(e) = DeliveryRepository::save(&renewed).await {
                    tracing::warn!(%job_id, "Failed to persist renewed lease: {}", e);
                }
                state.leased.insert(job_id, renewed);
                let _ = reply.send(true);
            }

            BrokerMessage::Ack { job_id, worker_id } => {
                if state.take_lease(job_id, &worker_id).is_some() {
                    if let Err(e) = DeliveryRepository::delete(job_id).await {
                        tracing::warn!(%job_id, "Failed to delete acked delivery: {}", e);
                    }
                    state.acked += 1;
                    tracing::debug!(%job_id, worker_id, "delivery acked");
                }
            }

            BrokerMessage::Release { job_id, worker_id } => {
                if let Some(delivery) = state.take_lease(job_id, &worker_id) {
                    let released = delivery.released();
                    if let Err(e) = DeliveryRepository::save(&released).await {
                        tracing::warn!(%job_id, "Failed to persist released delivery: {}", e);
                    }
                    tracing::info!(%job_id, worker_id, "delivery released");
                    state.pending.push_front(released);
                }
            }

            BrokerMessage::ReleaseWorker { worker_id } => {
                let held: Vec<JobId> = state
                    .leased
                    .values()
                    .filter(|d| d.leased_by.as_deref() == Some(worker_id.as_str()))
                    .map(|d| d.job_id)
                    .collect();
                for job_id in held {
                    let Some(delivery) = state.leased.remove(&job_id) else {
                        continue;
                    };
                    let released = delivery.released();
                    if let Err(e) = DeliveryRepository::save(&released).await {
                        tracing::warn!(%job_id, "Failed to persist released delivery: {}", e);
                    }
                    tracing::warn!(%job_id, worker_id, "worker stopped, redelivering its job");
                    state.pending.push_front(released);
                }
            }

            BrokerMessage::GetStats { reply } => {
                let _ = reply.send(state.stats());
            }

            BrokerMessage::Shutdown => {
                tracing::info!("Shutting down broker");
                myself.stop(None);
                return Ok(());
            }

            BrokerMessage::Tick => {
                state.expire_leases().await;
            }
        }

        Ok(())
    }
}
