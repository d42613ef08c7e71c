use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerError, Delivery, DeliveryTag};
use crate::config::WorkerConfig;
use crate::error::{PublishError, WorkerError};
use crate::metric_consts::{TASKS_PROCESSED, TASKS_PUBLISHED, TASKS_REQUEUED, TASKS_STASHED};
use crate::registry::Registry;

/// One worker's task logic. Implementations must tolerate at-least-once
/// delivery: the runner performs no deduplication of its own.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Decoded task type pulled off this worker's queue.
    type Task: DeserializeOwned + Send + 'static;

    async fn handle(&self, task: Self::Task) -> Result<(), WorkerError>;
}

/// Cheap clonable handle for publishing follow-up tasks, resolved through
/// the registry. Fire-and-forget: no correlation, no response.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    registry: Registry,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, registry: Registry) -> Self {
        Self { broker, registry }
    }

    pub async fn add_task<T: Serialize>(
        &self,
        worker: &str,
        payload: &T,
    ) -> Result<(), PublishError> {
        let queue = self
            .registry
            .queue_for(worker)
            .ok_or_else(|| PublishError::UnknownWorker(worker.to_string()))?;
        let bytes = serde_json::to_vec(payload)?;
        self.broker.publish(queue, bytes).await?;
        metrics::counter!(TASKS_PUBLISHED, "worker" => worker.to_string()).increment(1);
        Ok(())
    }
}

/// Tasks started before `finish` cancelled the subscription, keyed by
/// delivery tag. `finish` awaits exactly these.
#[derive(Default)]
struct InFlightSet {
    tasks: Mutex<HashMap<DeliveryTag, JoinHandle<()>>>,
}

impl InFlightSet {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeliveryTag, JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(&self, tag: DeliveryTag, handle: JoinHandle<()>) {
        self.lock().insert(tag, handle);
    }

    fn remove(&self, tag: DeliveryTag) {
        // Dropping the handle detaches the (already finished) task.
        drop(self.lock().remove(&tag));
    }

    fn drain(&self) -> Vec<JoinHandle<()>> {
        self.lock().drain().map(|(_, handle)| handle).collect()
    }
}

struct Running {
    consumer_tag: String,
    pump: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Generic message pump every worker is built on. Owns the broker channel,
/// the in-flight set and the shutdown sequence; task semantics live in the
/// injected `TaskHandler`.
pub struct Worker<H: TaskHandler> {
    name: String,
    broker: Arc<dyn Broker>,
    registry: Registry,
    handler: Arc<H>,
    concurrency: usize,
    in_flight: Arc<InFlightSet>,
    state: Mutex<Option<Running>>,
}

impl<H: TaskHandler> Worker<H> {
    pub fn new(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        registry: Registry,
        handler: Arc<H>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            broker,
            registry,
            handler,
            concurrency: config.simultaneous_tasks.max(1),
            in_flight: Arc::new(InFlightSet::default()),
            state: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for publishing follow-up tasks from inside or outside the
    /// handler.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.broker.clone(), self.registry.clone())
    }

    /// Publish a follow-up task for another worker.
    pub async fn add_task<T: Serialize>(
        &self,
        worker: &str,
        payload: &T,
    ) -> Result<(), PublishError> {
        self.publisher().add_task(worker, payload).await
    }

    /// Declare this worker's queue and begin consuming, with prefetch equal
    /// to the configured concurrency limit.
    pub async fn start(&self) -> Result<(), BrokerError> {
        {
            let state = lock_state(&self.state);
            if state.is_some() {
                warn!(worker = %self.name, "start called twice, ignoring");
                return Ok(());
            }
        }

        let queue = self.registry.own_queue(&self.name).to_string();
        self.broker.declare_queue(&queue).await?;
        let subscription = self.broker.consume(&queue, self.concurrency).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(pump(
            self.broker.clone(),
            self.handler.clone(),
            self.in_flight.clone(),
            subscription.deliveries,
            shutdown_rx,
        ));

        debug!(worker = %self.name, queue, prefetch = self.concurrency, "worker started");
        *lock_state(&self.state) = Some(Running {
            consumer_tag: subscription.consumer_tag,
            pump,
            shutdown: shutdown_tx,
        });
        Ok(())
    }

    /// Cooperative drain: stop new intake, await every task dispatched
    /// before the cancellation, then close broker resources. No built-in
    /// timeout; callers needing a bound must add one externally.
    pub async fn finish(&self) -> Result<(), BrokerError> {
        let Some(running) = lock_state(&self.state).take() else {
            return Ok(());
        };

        // Stop dispatching before cancelling so deliveries the broker
        // already pushed are requeued instead of started.
        let _ = running.shutdown.send(true);
        self.broker.cancel(&running.consumer_tag).await?;
        if let Err(join_error) = running.pump.await {
            error!(worker = %self.name, %join_error, "delivery pump panicked");
        }

        for handle in self.in_flight.drain() {
            if let Err(join_error) = handle.await {
                if !join_error.is_cancelled() {
                    error!(worker = %self.name, %join_error, "in-flight task panicked");
                }
            }
        }

        debug!(worker = %self.name, "worker drained");
        self.broker.close().await
    }
}

fn lock_state(
    state: &Mutex<Option<Running>>,
) -> std::sync::MutexGuard<'_, Option<Running>> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Reads deliveries off the subscription and spawns one task per delivery.
/// On shutdown, anything still buffered goes back to the queue unhandled.
async fn pump<H: TaskHandler>(
    broker: Arc<dyn Broker>,
    handler: Arc<H>,
    in_flight: Arc<InFlightSet>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        dispatch(broker.clone(), handler.clone(), in_flight.clone(), delivery);
    }

    // Deliveries pushed before the cancel took effect were never started;
    // requeue them so another instance picks them up.
    while let Some(delivery) = deliveries.recv().await {
        if let Err(error) = broker.nack(delivery.tag).await {
            warn!(%error, tag = delivery.tag, "failed to requeue undispatched delivery");
        }
    }
}

/// Register the delivery in the in-flight set, then run it. The handshake
/// guarantees the set contains the task before any of its work happens, so
/// `finish` can never miss it.
fn dispatch<H: TaskHandler>(
    broker: Arc<dyn Broker>,
    handler: Arc<H>,
    in_flight: Arc<InFlightSet>,
    delivery: Delivery,
) {
    let tag = delivery.tag;
    let (registered_tx, registered_rx) = oneshot::channel::<()>();
    let set = in_flight.clone();

    let handle = tokio::spawn(async move {
        let _ = registered_rx.await;
        process(broker, handler, delivery).await;
        set.remove(tag);
    });

    in_flight.insert(tag, handle);
    let _ = registered_tx.send(());
}

/// Decode, handle, classify, acknowledge. Mirrors the per-task state
/// machine: received → decoding → handling → acked | requeued | stashed.
async fn process<H: TaskHandler>(broker: Arc<dyn Broker>, handler: Arc<H>, delivery: Delivery) {
    let tag = delivery.tag;
    let queue = delivery.queue;

    let task: H::Task = match serde_json::from_slice(&delivery.payload) {
        Ok(task) => task,
        Err(decode_error) => {
            warn!(%decode_error, queue, tag, "undecodable task, sending to stash");
            metrics::counter!(TASKS_STASHED, "cause" => "decode").increment(1);
            if let Err(error) = broker.reject(tag).await {
                error!(%error, tag, "failed to reject undecodable task");
            }
            return;
        }
    };

    let outcome = AssertUnwindSafe(handler.handle(task)).catch_unwind().await;
    let action = match outcome {
        Ok(Ok(())) => {
            metrics::counter!(TASKS_PROCESSED).increment(1);
            broker.ack(tag).await
        }
        Ok(Err(worker_error @ WorkerError::Critical { .. })) => {
            error!(%worker_error, context = ?worker_error.context(), queue, tag, "critical failure, requeueing task");
            metrics::counter!(TASKS_REQUEUED).increment(1);
            broker.nack(tag).await
        }
        Ok(Err(worker_error @ WorkerError::NonCritical { .. })) => {
            error!(%worker_error, context = ?worker_error.context(), queue, tag, "non-critical failure, sending to stash");
            metrics::counter!(TASKS_STASHED, "cause" => "handler").increment(1);
            broker.reject(tag).await
        }
        Err(panic) => {
            // A panic matches neither recognized class. Treat it as critical
            // and requeue rather than leaving the delivery unresolved.
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            error!(panic = %message, queue, tag, "handler panicked, requeueing task");
            metrics::counter!(TASKS_REQUEUED, "cause" => "panic").increment(1);
            broker.nack(tag).await
        }
    };

    if let Err(error) = action {
        error!(%error, tag, "failed to settle delivery");
    }
}
