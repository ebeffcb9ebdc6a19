//! Message types for actor communication.

use ractor::RpcReplyPort;
use scan_core::{BrokerStats, Delivery, JobId};
use serde::Serialize;

/// Messages for the BrokerActor.
#[derive(Debug)]
pub enum BrokerMessage {
    /// Make a job deliverable.
    Enqueue {
        job_id: JobId,
        reply: RpcReplyPort<Result<(), String>>,
    },

    /// Lease the oldest visible delivery to a worker.
    Dequeue {
        worker_id: String,
        reply: RpcReplyPort<Option<Delivery>>,
    },

    /// Extend a lease. Replies `false` when the worker no longer holds it.
    RenewLease {
        job_id: JobId,
        worker_id: String,
        reply: RpcReplyPort<bool>,
    },

    /// The job reached a terminal state; forget the delivery.
    Ack { job_id: JobId, worker_id: String },

    /// Give the delivery back without finishing it.
    Release { job_id: JobId, worker_id: String },

    /// Hand back every lease held by a worker that stopped.
    ReleaseWorker { worker_id: String },

    /// Get broker counters.
    GetStats { reply: RpcReplyPort<BrokerStats> },

    /// Shutdown the broker.
    Shutdown,

    /// Periodic tick that expires lapsed leases.
    Tick,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Ask the broker for work.
    Poll,

    /// Run the pipeline for a leased delivery.
    ProcessDelivery { delivery: Box<Delivery> },

    /// Shutdown the worker.
    Shutdown,
}

/// Liveness summary of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub broker_alive: bool,
    pub workers_alive: usize,
    pub workers_configured: usize,
    pub runner_backend: &'static str,
    pub broker: Option<BrokerStats>,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Hand a freshly created job to the broker.
    Submit {
        job_id: JobId,
        reply: RpcReplyPort<Result<(), String>>,
    },

    /// Report pool liveness.
    Health { reply: RpcReplyPort<PoolHealth> },

    /// Stop workers, the runner and the broker.
    Shutdown,
}
