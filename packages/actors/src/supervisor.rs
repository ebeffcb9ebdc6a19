//! Supervisor actor owning the broker and the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, ActorStatus, SupervisionEvent};
use scan_core::{JobEvent, JobId};
use tokio::sync::{broadcast, watch};

use crate::PoolConfig;
use crate::broker_actor::{BrokerActor, BrokerArgs};
use crate::executor::PipelineExecutor;
use crate::messages::{BrokerMessage, PoolHealth, SupervisorMessage, WorkerMessage};
use crate::worker_actor::{WorkerActor, WorkerArgs};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// How long shutdown waits for a worker to let go of its job.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervisor arguments.
pub struct SupervisorArgs {
    pub config: PoolConfig,
    pub executor: Arc<PipelineExecutor>,
    pub events: broadcast::Sender<JobEvent>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    config: PoolConfig,
    executor: Arc<PipelineExecutor>,
    events: broadcast::Sender<JobEvent>,
    broker: ActorRef<BrokerMessage>,
    broker_tx: watch::Sender<ActorRef<BrokerMessage>>,
    workers: HashMap<ActorId, (String, ActorRef<WorkerMessage>)>,
    worker_counter: u64,
    shutting_down: bool,
}

impl SupervisorState {
    /// Generate a unique worker ID.
    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("worker-{}", self.worker_counter)
    }
}

async fn spawn_broker(
    supervisor: &ActorRef<SupervisorMessage>,
    config: &PoolConfig,
    release_leases: bool,
) -> Result<ActorRef<BrokerMessage>, ActorProcessingErr> {
    let args = BrokerArgs {
        lease: config.lease,
        tick_interval: config.lease_check_interval(),
        release_leases,
    };
    let (broker, _handle) = Actor::spawn_linked(None, BrokerActor, args, supervisor.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn broker: {}", e)))?;
    Ok(broker)
}

async fn spawn_worker(
    supervisor: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
) -> Result<(), ActorProcessingErr> {
    let worker_id = state.next_worker_id();
    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        broker: state.broker_tx.subscribe(),
        executor: state.executor.clone(),
        events: state.events.clone(),
        poll_interval: state.config.poll_interval,
        renew_interval: state.config.renew_interval(),
    };
    let (worker, _handle) = Actor::spawn_linked(None, WorkerActor, args, supervisor.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;
    state.workers.insert(worker.get_id(), (worker_id, worker));
    Ok(())
}

/// Supervisor actor that keeps the broker and workers alive.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            workers = args.config.worker_count,
            runner = args.executor.runner().backend(),
            "Starting worker pool supervisor"
        );

        match args.executor.runner().reap_orphans().await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(count = n, "removed orphaned tool processes"),
            Err(e) => tracing::warn!("Failed to reap orphaned tool processes: {}", e),
        }

        let broker = spawn_broker(&myself, &args.config, true).await?;
        let (broker_tx, _) = watch::channel(broker.clone());

        let mut state = SupervisorState {
            config: args.config,
            executor: args.executor,
            events: args.events,
            broker,
            broker_tx,
            workers: HashMap::new(),
            worker_counter: 0,
            shutting_down: false,
        };
        for _ in 0..state.config.worker_count {
            spawn_worker(&myself, &mut state).await?;
        }

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Submit { job_id, reply } => {
                let result = ractor::rpc::call(
                    &state.broker,
                    |reply| BrokerMessage::Enqueue { job_id, reply },
                    Some(CALL_TIMEOUT),
                )
                .await;
                let _ = reply.send(match result {
                    Ok(CallResult::Success(result)) => result,
                    _ => Err("Broker did not accept the job".to_string()),
                });
            }

            SupervisorMessage::Health { reply } => {
                let stats = ractor::rpc::call(
                    &state.broker,
                    |reply| BrokerMessage::GetStats { reply },
                    Some(CALL_TIMEOUT),
                )
                .await;
                let broker = match stats {
                    Ok(CallResult::Success(stats)) => Some(stats),
                    _ => None,
                };
                let workers_alive = state
                    .workers
                    .values()
                    .filter(|(_, w)| w.get_status() == ActorStatus::Running)
                    .count();
                let _ = reply.send(PoolHealth {
                    broker_alive: broker.is_some(),
                    workers_alive,
                    workers_configured: state.config.worker_count,
                    runner_backend: state.executor.runner().backend(),
                    broker,
                });
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down worker pool");
                state.shutting_down = true;

                if let Err(e) = state.executor.runner().shutdown().await {
                    tracing::warn!("Runner shutdown failed: {}", e);
                }
                for (worker_id, worker) in state.workers.values() {
                    let _ = worker.send_message(WorkerMessage::Shutdown);
                    if worker
                        .stop_and_wait(None, Some(WORKER_STOP_TIMEOUT))
                        .await
                        .is_err()
                    {
                        tracing::warn!(worker_id, "worker did not stop in time");
                    }
                }
                let _ = state.broker.send_message(BrokerMessage::Shutdown);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => (cell, reason),
            SupervisionEvent::ActorFailed(cell, err) => (cell, Some(err.to_string())),
            _ => return Ok(()),
        };
        let id = cell.get_id();

        if id == state.broker.get_id() {
            if state.shutting_down {
                return Ok(());
            }
            tracing::error!(reason = ?reason, "broker stopped, restarting");
            let broker = spawn_broker(&myself, &state.config, false).await?;
            state.broker = broker.clone();
            state.broker_tx.send_replace(broker);
            return Ok(());
        }

        if let Some((worker_id, _)) = state.workers.remove(&id) {
            if state.shutting_down {
                return Ok(());
            }
            tracing::error!(worker_id, reason = ?reason, "worker stopped, starting a replacement");
            if let Err(e) = state
                .broker
                .send_message(BrokerMessage::ReleaseWorker { worker_id })
            {
                tracing::warn!("Failed to release the stopped worker's leases: {}", e);
            }
            spawn_worker(&myself, state).await?;
        }
        Ok(())
    }
}

/// Handle to a running pool.
#[derive(Clone)]
pub struct WorkerPool {
    supervisor: ActorRef<SupervisorMessage>,
    events: broadcast::Sender<JobEvent>,
}

impl WorkerPool {
    /// Spawn the supervisor, which reaps orphans and starts the broker and
    /// workers.
    pub async fn start(
        config: PoolConfig,
        executor: Arc<PipelineExecutor>,
        events: broadcast::Sender<JobEvent>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
        let args = SupervisorArgs {
            config,
            executor,
            events: events.clone(),
        };
        let (supervisor, handle) = Actor::spawn(None, Supervisor, args).await?;
        Ok((Self { supervisor, events }, handle))
    }

    /// Make a freshly created job deliverable.
    pub async fn submit(&self, job_id: JobId) -> Result<(), String> {
        match ractor::rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::Submit { job_id, reply },
            Some(CALL_TIMEOUT * 2),
        )
        .await
        {
            Ok(CallResult::Success(result)) => result,
            Ok(_) => Err("Worker pool did not answer".to_string()),
            Err(e) => Err(format!("Worker pool unavailable: {}", e)),
        }
    }

    /// `None` when the supervisor itself is gone.
    pub async fn health(&self) -> Option<PoolHealth> {
        match ractor::rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::Health { reply },
            Some(CALL_TIMEOUT * 2),
        )
        .await
        {
            Ok(CallResult::Success(health)) => Some(health),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop the runner, the workers and the broker.
    pub fn shutdown(&self) {
        if let Err(e) = self.supervisor.send_message(SupervisorMessage::Shutdown) {
            tracing::warn!("Failed to signal pool shutdown: {}", e);
        }
    }
}
