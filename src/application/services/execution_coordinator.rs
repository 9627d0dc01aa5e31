//! Execution Coordinator
//!
//! A fixed pool of worker loops competing for messages on one order queue.
//! Each worker hands its message to the [`OrderExecutor`]; the executor's
//! per-bot lease keeps executions of one bot linear while different bots run
//! in parallel.
//!
//! Shutdown stops workers from taking new messages. An execution already in
//! flight runs to completion before its worker exits.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::services::order_executor::{ExecutionOutcome, OrderExecutor};
use crate::domain::errors::QueueError;
use crate::domain::repositories::order_queue::OrderQueue;

pub const DEFAULT_WORKERS: usize = 3;

pub struct ExecutionCoordinator {
    executor: Arc<OrderExecutor>,
    queue: Arc<dyn OrderQueue>,
    workers: usize,
}

/// Running worker pool
pub struct CoordinatorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker and waits for them to finish
    pub async fn shutdown(self) {
        info!("Stopping {} execution workers", self.workers.len());
        let _ = self.shutdown.send(true);

        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Execution worker terminated abnormally: {}", e);
            }
        }
        info!("Execution coordinator stopped");
    }
}

impl ExecutionCoordinator {
    pub fn new(executor: Arc<OrderExecutor>, queue: Arc<dyn OrderQueue>, workers: usize) -> Self {
        Self {
            executor,
            queue,
            workers: workers.max(1),
        }
    }

    pub fn start(self) -> CoordinatorHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let workers = (1..=self.workers)
            .map(|subscription| {
                tokio::spawn(run_worker(
                    subscription,
                    self.executor.clone(),
                    self.queue.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!("Execution coordinator started with {} workers", self.workers);
        CoordinatorHandle { shutdown, workers }
    }
}

async fn run_worker(
    subscription: usize,
    executor: Arc<OrderExecutor>,
    queue: Arc<dyn OrderQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Execution worker {} started", subscription);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = queue.receive() => match received {
                Ok(message) => message,
                Err(QueueError::Closed) => {
                    info!("Order queue closed, worker {} exiting", subscription);
                    break;
                }
                Err(e) => {
                    warn!("Worker {} failed to receive: {}", subscription, e);
                    continue;
                }
            },
        };

        let span = info_span!("execution", subscription, order_id = %message.order_id);
        match executor.execute(message).instrument(span).await {
            Ok(ExecutionOutcome::Executed { correlation_id, success, ledger }) => debug!(
                "Order {} executed ({}): success={} ledger={:?}",
                message.order_id, correlation_id, success, ledger
            ),
            Ok(ExecutionOutcome::Skipped(reason)) => {
                debug!("Order {} skipped: {:?}", message.order_id, reason)
            }
            Err(e) => error!("Execution of order {} failed: {}", message.order_id, e),
        }
    }

    debug!("Execution worker {} stopped", subscription);
}
