//! Worker actor: polls the broker and runs leased jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, ActorStatus};
use scan_core::{Delivery, JobEvent};
use tokio::sync::{broadcast, watch};

use crate::executor::{Outcome, PipelineExecutor};
use crate::messages::{BrokerMessage, WorkerMessage};

/// Longest an idle worker waits between polls, in multiples of the base
/// poll interval.
const MAX_BACKOFF_SHIFT: u32 = 4;
const BROKER_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    /// Current broker; replaced when the supervisor restarts it.
    pub broker: watch::Receiver<ActorRef<BrokerMessage>>,
    pub executor: Arc<PipelineExecutor>,
    pub events: broadcast::Sender<JobEvent>,
    pub poll_interval: Duration,
    pub renew_interval: Duration,
}

/// State for the worker actor.
pub struct WorkerState {
    worker_id: String,
    broker: watch::Receiver<ActorRef<BrokerMessage>>,
    executor: Arc<PipelineExecutor>,
    events: broadcast::Sender<JobEvent>,
    poll_interval: Duration,
    renew_interval: Duration,
    /// Consecutive polls that found nothing.
    idle_polls: u32,
    running: bool,
}

impl WorkerState {
    fn broker(&self) -> ActorRef<BrokerMessage> {
        self.broker.borrow().clone()
    }

    fn backoff(&self) -> Duration {
        self.poll_interval * (1u32 << self.idle_polls.min(MAX_BACKOFF_SHIFT))
    }
}

/// Renewal task for one delivery. Dropping the guard stops the renewals, so
/// a worker that panics or is stopped mid-job lets its lease lapse.
struct RenewalGuard(tokio::task::JoinHandle<()>);

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keep the lease alive while the job runs and the worker is alive.
fn spawn_renewal(
    worker: ActorRef<WorkerMessage>,
    broker: watch::Receiver<ActorRef<BrokerMessage>>,
    delivery: &Delivery,
    worker_id: String,
    every: Duration,
) -> RenewalGuard {
    let job_id = delivery.job_id;
    RenewalGuard(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if worker.get_status() != ActorStatus::Running {
                tracing::debug!(%job_id, worker_id, "worker gone, no longer renewing");
                break;
            }
            let current = broker.borrow().clone();
            let result = ractor::rpc::call(
                &current,
                |reply| BrokerMessage::RenewLease {
                    job_id,
                    worker_id: worker_id.clone(),
                    reply,
                },
                Some(BROKER_CALL_TIMEOUT),
            )
            .await;
            match result {
                Ok(CallResult::Success(true)) => {}
                Ok(CallResult::Success(false)) => {
                    tracing::error!(%job_id, worker_id, "lease lost while the job is running");
                    break;
                }
                _ => tracing::warn!(%job_id, worker_id, "lease renewal did not reach the broker"),
            }
        }
    }))
}

/// Worker actor that executes jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        let _ = args.events.send(JobEvent::WorkerConnected {
            worker_id: args.worker_id.clone(),
            timestamp: Utc::now(),
        });
        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerState {
            worker_id: args.worker_id,
            broker: args.broker,
            executor: args.executor,
            events: args.events,
            poll_interval: args.poll_interval,
            renew_interval: args.renew_interval,
            idle_polls: 0,
            running: true,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = state.events.send(JobEvent::WorkerDisconnected {
            worker_id: state.worker_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if !state.running {
                    return Ok(());
                }

                let result = ractor::rpc::call(
                    &state.broker(),
                    |reply| BrokerMessage::Dequeue {
                        worker_id: state.worker_id.clone(),
                        reply,
                    },
                    Some(BROKER_CALL_TIMEOUT),
                )
                .await;

                if let Ok(CallResult::Success(Some(delivery))) = result {
                    state.idle_polls = 0;
                    myself.send_message(WorkerMessage::ProcessDelivery {
                        delivery: Box::new(delivery),
                    })?;
                } else {
                    let delay = state.backoff();
                    state.idle_polls = state.idle_polls.saturating_add(1);
                    myself.send_after(delay, || WorkerMessage::Poll);
                }
            }

            WorkerMessage::ProcessDelivery { delivery } => {
                let delivery = *delivery;
                let job_id = delivery.job_id;
                tracing::debug!(
                    %job_id,
                    worker_id = %state.worker_id,
                    delivery_count = delivery.delivery_count,
                    "processing delivery"
                );

                let renewal = spawn_renewal(
                    myself.clone(),
                    state.broker.clone(),
                    &delivery,
                    state.worker_id.clone(),
                    state.renew_interval,
                );
                let result = state.executor.execute(&state.worker_id, &delivery).await;
                drop(renewal);

                let broker = state.broker();
                let worker_id = state.worker_id.clone();
                let message = match result {
                    Ok(outcome) => {
                        if outcome == Outcome::Skipped {
                            tracing::debug!(%job_id, "nothing to do for delivery");
                        }
                        BrokerMessage::Ack { job_id, worker_id }
                    }
                    Err(e) => {
                        tracing::warn!(%job_id, "releasing delivery: {}", e);
                        BrokerMessage::Release { job_id, worker_id }
                    }
                };
                if let Err(e) = broker.send_message(message) {
                    tracing::warn!(%job_id, "broker unreachable, lease will lapse: {}", e);
                }

                if state.running {
                    myself.send_message(WorkerMessage::Poll)?;
                }
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                state.running = false;
                myself.stop(None);
            }
        }

        Ok(())
    }
}
