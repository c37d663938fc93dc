// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry and Listener Startup
//!
//! Applications register one handler per queue in a [`HandlerRegistry`] and
//! then start a listener thread per queue with [`start_listener`]. The
//! listener thread blocks in the receive loop and dispatches each message to
//! the queue's handler:
//!
//! - `QueueHandler::Synchronous` runs inline on the listener thread.
//! - `QueueHandler::Suspending` is spawned onto the application's tokio
//!   runtime when the registry knows one; otherwise a transient runtime runs
//!   it to completion before the delivery is settled.
//!
//! Registration is closed once the first listener starts.

use crate::{
    config::BrokerConfig,
    consumer::{MessageCallback, RabbitMQListener},
    errors::{AmqpError, HandlerError},
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    thread::JoinHandle,
};
use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handler that completes on the calling thread.
pub trait SyncHandler: Send + Sync {
    fn handle(&self, message: &Value) -> Result<(), HandlerError>;
}

impl<F> SyncHandler for F
where
    F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &Value) -> Result<(), HandlerError> {
        self(message)
    }
}

/// Handler that needs an async runtime.
#[async_trait]
pub trait AsyncHandler: Send + Sync {
    async fn handle(&self, message: Value) -> Result<(), HandlerError>;
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> AsyncHandler for AsyncFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: Value) -> Result<(), HandlerError> {
        (self.0)(message).await
    }
}

/// A handler tagged with how it must be run.
#[derive(Clone)]
pub enum QueueHandler {
    Synchronous(Arc<dyn SyncHandler>),
    Suspending(Arc<dyn AsyncHandler>),
}

impl QueueHandler {
    /// Wraps a handler that runs inline on the listener thread.
    pub fn sync(handler: impl SyncHandler + 'static) -> Self {
        QueueHandler::Synchronous(Arc::new(handler))
    }

    /// Wraps a handler that needs a scheduler to run.
    pub fn suspending(handler: impl AsyncHandler + 'static) -> Self {
        QueueHandler::Suspending(Arc::new(handler))
    }

    /// Wraps an async closure as a suspending handler.
    pub fn suspending_fn<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        QueueHandler::Suspending(Arc::new(AsyncFn(handler)))
    }

    pub fn is_suspending(&self) -> bool {
        matches!(self, QueueHandler::Suspending(_))
    }
}

impl fmt::Debug for QueueHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueHandler::Synchronous(_) => f.write_str("Synchronous"),
            QueueHandler::Suspending(_) => f.write_str("Suspending"),
        }
    }
}

/// A registered handler and the topology its listener declares.
#[derive(Clone, Debug)]
pub struct HandlerEntry {
    queue: String,
    handler: QueueHandler,
    topology: Option<TopologyDescriptor>,
}

impl HandlerEntry {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn handler(&self) -> &QueueHandler {
        &self.handler
    }

    /// Present when registration named an exchange or a dead-letter queue.
    pub fn topology(&self) -> Option<&TopologyDescriptor> {
        self.topology.as_ref()
    }

    fn descriptor(&self) -> TopologyDescriptor {
        self.topology
            .clone()
            .unwrap_or_else(|| TopologyDescriptor::new(&self.queue))
    }
}

/// Queue name to handler mapping shared by the listeners of a process.
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, HandlerEntry>>,
    sealed: AtomicBool,
    scheduler: Option<Handle>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

impl HandlerRegistry {
    /// Creates a registry that schedules suspending handlers on the tokio
    /// runtime current at construction, if any.
    pub fn new() -> Self {
        HandlerRegistry {
            entries: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            scheduler: Handle::try_current().ok(),
        }
    }

    /// Creates a registry that spawns suspending handlers onto `handle`.
    ///
    /// # Parameters
    /// * `handle` - Runtime of the application, usable from listener threads
    ///
    /// # Returns
    /// An empty, unsealed registry
    pub fn with_scheduler(handle: Handle) -> Self {
        HandlerRegistry {
            scheduler: Some(handle),
            ..HandlerRegistry::new()
        }
    }

    /// Registers `handler` for the descriptor's queue. A later registration
    /// for the same queue replaces the earlier one.
    ///
    /// # Parameters
    /// * `descriptor` - Queue to serve and the topology its listener declares
    /// * `handler` - Handler that receives the queue's messages
    ///
    /// # Returns
    /// `InvalidTopology` for a descriptor the broker would refuse, or
    /// `RegistrySealed` once a listener has started
    pub fn register(
        &self,
        descriptor: TopologyDescriptor,
        handler: QueueHandler,
    ) -> Result<(), AmqpError> {
        descriptor.validate()?;

        let queue = descriptor.queue_name().to_owned();
        if self.is_sealed() {
            error!(queue, "handler registered after listeners started");
            return Err(AmqpError::RegistrySealed(queue));
        }

        let topology = if descriptor.uses_default_exchange() && descriptor.dlq_name().is_none() {
            None
        } else {
            Some(descriptor)
        };

        let entry = HandlerEntry {
            queue: queue.clone(),
            handler,
            topology,
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.insert(queue.clone(), entry).is_some() {
            warn!(queue, "replacing the handler already registered for the queue");
        } else {
            debug!(queue, "handler registered");
        }

        Ok(())
    }

    /// A copy of the entry registered for `queue`.
    pub fn entry(&self, queue: &str) -> Option<HandlerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }

    /// Queues with a registered handler, in no particular order.
    pub fn queues(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Closes the registry to further registration.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub(crate) fn unregister(&self, queue: &str) -> Option<HandlerEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue)
    }

    /// Runs the handler registered for `queue` with `message`.
    ///
    /// The error of a synchronous handler, or of a suspending handler run on
    /// a transient runtime, is returned. A suspending handler spawned onto the
    /// application's runtime reports its error there, and the call returns
    /// as soon as the task is scheduled.
    ///
    /// # Parameters
    /// * `message` - Decoded JSON payload
    /// * `queue` - Queue the message was received from
    ///
    /// # Returns
    /// The handler's result, or `NotRegistered` for an unknown queue
    pub fn dispatch(&self, message: Value, queue: &str) -> Result<(), HandlerError> {
        let entry = self
            .entry(queue)
            .ok_or_else(|| HandlerError::NotRegistered(queue.to_owned()))?;

        match entry.handler {
            QueueHandler::Synchronous(handler) => handler.handle(&message),
            QueueHandler::Suspending(handler) => match &self.scheduler {
                Some(scheduler) => {
                    let queue = queue.to_owned();
                    scheduler.spawn(async move {
                        if let Err(err) = handler.handle(message).await {
                            error!(error = err.to_string(), queue, "async handler failed");
                        }
                    });
                    Ok(())
                }
                None => run_transient(handler, message),
            },
        }
    }
}

/// Runs a suspending handler on a throwaway current-thread runtime.
fn run_transient(handler: Arc<dyn AsyncHandler>, message: Value) -> Result<(), HandlerError> {
    let run = move || {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| HandlerError::Scheduler(err.to_string()))?;
        runtime.block_on(handler.handle(message))
    };

    if Handle::try_current().is_err() {
        return run();
    }

    // a runtime cannot be blocked on from inside another one
    std::thread::scope(|scope| {
        scope.spawn(run).join().unwrap_or_else(|_| {
            Err(HandlerError::Scheduler(
                "transient handler thread panicked".to_owned(),
            ))
        })
    })
}

/// How a listener consumes and when it stops.
#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub auto_ack: bool,
    /// Stop after the first delivery and drop the queue's handler
    pub one_use: bool,
    /// Stop when the process receives Ctrl-C
    pub stop_on_interrupt: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        ListenerOptions {
            auto_ack: false,
            one_use: false,
            stop_on_interrupt: true,
        }
    }
}

impl ListenerOptions {
    /// Leaves settlement to the broker: messages are acked on delivery.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Stops after the first dispatched delivery and removes the handler.
    pub fn one_use(mut self) -> Self {
        self.one_use = true;
        self
    }

    /// Keeps listening through Ctrl-C.
    pub fn ignore_interrupt(mut self) -> Self {
        self.stop_on_interrupt = false;
        self
    }
}

/// Control over a running listener thread.
#[must_use = "dropping the handle detaches the listener thread"]
pub struct ListenerHandle {
    queue: String,
    shutdown: CancellationToken,
    thread: JoinHandle<Result<(), AmqpError>>,
}

impl ListenerHandle {
    /// Queue served by the listener.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Requests a stop; the loop exits before taking the next delivery.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled when the listener is asked to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the listener thread and returns how it ended.
    pub fn join(self) -> Result<(), AmqpError> {
        let queue = self.queue;
        self.thread.join().map_err(|_| {
            AmqpError::ListenerThreadError(format!("listener for `{}` panicked", queue))
        })?
    }
}

/// Starts a listener thread serving `queue` with its registered handler.
///
/// The registry is sealed first. The thread connects, declares the entry's
/// topology and consumes until stopped; connection failures end the thread
/// and are returned by [`ListenerHandle::join`].
///
/// # Parameters
/// * `registry` - Registry holding the queue's handler
/// * `queue` - Queue to serve
/// * `config` - Broker to consume from
/// * `options` - Acknowledgment mode and stop conditions
///
/// # Returns
/// A handle to stop and join the thread, or `HandlerNotRegistered` when
/// the queue has no handler
pub fn start_listener(
    registry: Arc<HandlerRegistry>,
    queue: &str,
    config: BrokerConfig,
    options: ListenerOptions,
) -> Result<ListenerHandle, AmqpError> {
    registry.seal();

    let entry = registry
        .entry(queue)
        .ok_or_else(|| AmqpError::HandlerNotRegistered(queue.to_owned()))?;

    let listener = RabbitMQListener::new(config, entry.descriptor());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    let thread = std::thread::Builder::new()
        .name(format!("amqp-listener-{}", queue))
        .spawn(move || run_listener(listener, registry, options, token))
        .map_err(|err| AmqpError::ListenerThreadError(err.to_string()))?;

    info!(queue, "listener thread started");

    Ok(ListenerHandle {
        queue: queue.to_owned(),
        shutdown,
        thread,
    })
}

fn run_listener(
    mut listener: RabbitMQListener,
    registry: Arc<HandlerRegistry>,
    options: ListenerOptions,
    shutdown: CancellationToken,
) -> Result<(), AmqpError> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AmqpError::ListenerThreadError(err.to_string()))?;
    let queue = listener.queue().to_owned();

    let result = runtime.block_on(async {
        if options.stop_on_interrupt {
            let token = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    signal = tokio::signal::ctrl_c() => {
                        if signal.is_ok() {
                            info!("interrupt received, stopping listener");
                            token.cancel();
                        }
                    }
                }
            });
        }

        listener.open().await?;

        let callback = listener_callback(&registry, options, &shutdown);
        let consumed = listener
            .consume(&callback, options.auto_ack, &shutdown)
            .await;
        listener.close().await;
        consumed
    });

    release_one_use(&registry, &queue, options);
    shutdown.cancel();

    match &result {
        Err(err) => error!(error = err.to_string(), queue, "listener stopped with error"),
        Ok(()) => info!(queue, "listener stopped"),
    }

    result
}

/// Dispatches through the registry; in one-use mode the first dispatched
/// delivery also stops the loop. The delivery is still settled before the
/// loop sees the cancellation.
fn listener_callback<'a>(
    registry: &'a HandlerRegistry,
    options: ListenerOptions,
    shutdown: &'a CancellationToken,
) -> impl MessageCallback + 'a {
    move |message: Value, queue: &str| -> Result<(), HandlerError> {
        let result = registry.dispatch(message, queue);
        if options.one_use {
            shutdown.cancel();
        }
        result
    }
}

fn release_one_use(registry: &HandlerRegistry, queue: &str, options: ListenerOptions) {
    if options.one_use && registry.unregister(queue).is_some() {
        debug!(queue, "one-use handler removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{drive, Acknowledger, Inbound, MockAcknowledger},
        exchange::ExchangeKind,
        message::JSON_CONTENT_TYPE,
    };
    use futures_util::stream;
    use lapin::{protocol::basic::AMQPProperties, types::ShortString};
    use serde_json::json;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    fn counting(counter: Arc<AtomicUsize>) -> QueueHandler {
        QueueHandler::sync(move |_: &Value| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry
            .register(TopologyDescriptor::new("q2"), counting(first.clone()))
            .unwrap();
        registry
            .register(TopologyDescriptor::new("q2"), counting(second.clone()))
            .unwrap();

        registry.dispatch(json!({"n": 1}), "q2").unwrap();
        registry.dispatch(json!({"n": 2}), "q2").unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sealed_registry_rejects_registration() {
        let registry = HandlerRegistry::new();
        registry.seal();

        let result = registry.register(
            TopologyDescriptor::new("q1"),
            counting(Arc::new(AtomicUsize::new(0))),
        );
        assert_eq!(result, Err(AmqpError::RegistrySealed("q1".to_owned())));
    }

    #[test]
    fn topology_is_kept_only_when_it_matters() {
        let registry = HandlerRegistry::new();
        let noop = || QueueHandler::sync(|_: &Value| -> Result<(), HandlerError> { Ok(()) });

        registry.register(TopologyDescriptor::new("plain"), noop()).unwrap();
        registry
            .register(
                TopologyDescriptor::new("bound").exchange("events", ExchangeKind::Topic),
                noop(),
            )
            .unwrap();
        registry
            .register(TopologyDescriptor::new("dead").with_dlq(), noop())
            .unwrap();

        assert!(registry.entry("plain").unwrap().topology().is_none());
        assert_eq!(
            registry.entry("bound").unwrap().topology().map(|t| t.exchange_name()),
            Some("events")
        );
        assert!(registry.entry("dead").unwrap().topology().is_some());
    }

    #[test]
    fn dispatch_to_unknown_queue_fails() {
        let registry = HandlerRegistry::new();
        assert_eq!(
            registry.dispatch(json!({}), "nowhere"),
            Err(HandlerError::NotRegistered("nowhere".to_owned()))
        );
    }

    #[test]
    fn sync_handler_error_propagates() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                TopologyDescriptor::new("q1"),
                QueueHandler::sync(|msg: &Value| -> Result<(), HandlerError> {
                    Err(HandlerError::failed(format!("cannot handle {}", msg)))
                }),
            )
            .unwrap();

        assert!(matches!(
            registry.dispatch(json!({"a": 1}), "q1"),
            Err(HandlerError::Failed(_))
        ));
    }

    #[test]
    fn suspending_handler_runs_on_transient_runtime() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        registry
            .register(
                TopologyDescriptor::new("q1"),
                QueueHandler::suspending_fn(move |_msg| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        registry.dispatch(json!({"a": 1}), "q1").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_runtime_works_inside_another_runtime() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                TopologyDescriptor::new("q1"),
                QueueHandler::suspending_fn(|_msg| async {
                    Err(HandlerError::failed("async failure"))
                }),
            )
            .unwrap();

        // mirrors the listener thread, which blocks inside its own runtime
        let runtime = Builder::new_current_thread().enable_all().build().unwrap();
        let result = runtime.block_on(async { registry.dispatch(json!({"a": 1}), "q1") });

        assert_eq!(result, Err(HandlerError::Failed("async failure".to_owned())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suspending_handler_is_spawned_on_running_scheduler() {
        let registry = HandlerRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        registry
            .register(
                TopologyDescriptor::new("q1"),
                QueueHandler::suspending_fn(move |msg| {
                    let tx = tx.clone();
                    async move {
                        tx.send(msg).map_err(HandlerError::failed)?;
                        Ok(())
                    }
                }),
            )
            .unwrap();

        registry.dispatch(json!({"a": 1}), "q1").unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(json!({"a": 1})));
    }

    #[test]
    fn starting_a_listener_requires_a_handler_and_seals() {
        let registry = Arc::new(HandlerRegistry::new());

        let result = start_listener(
            registry.clone(),
            "missing",
            BrokerConfig::new("127.0.0.1", 1),
            ListenerOptions::default(),
        );

        assert!(matches!(result, Err(AmqpError::HandlerNotRegistered(_))));
        assert!(registry.is_sealed());
    }

    #[test]
    fn listener_thread_reports_connection_failure() {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                TopologyDescriptor::new("q1"),
                counting(Arc::new(AtomicUsize::new(0))),
            )
            .unwrap();

        let mut config = BrokerConfig::new("127.0.0.1", 1);
        config.connect_timeout_secs = 1;

        let handle = start_listener(
            registry,
            "q1",
            config,
            ListenerOptions::default().ignore_interrupt(),
        )
        .unwrap();
        assert_eq!(handle.queue(), "q1");

        // default retry budget: 5 attempts, 2s apart
        assert!(matches!(
            handle.join(),
            Err(AmqpError::ConnectionError { attempts: 5, .. })
        ));
    }

    fn delivery(body: &str, tag: u64, acks: usize) -> Result<Inbound, AmqpError> {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(acks).returning(|| Ok(()));
        acker.expect_nack().never();
        let acker: Box<dyn Acknowledger> = Box::new(acker);

        Ok(Inbound {
            properties: AMQPProperties::default()
                .with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
            data: body.as_bytes().to_vec(),
            delivery_tag: tag,
            acker,
        })
    }

    #[tokio::test]
    async fn one_use_listener_takes_a_single_delivery_and_releases_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        registry
            .register(TopologyDescriptor::new("q1"), counting(counter.clone()))
            .unwrap();
        registry.seal();

        let options = ListenerOptions::default().one_use().ignore_interrupt();
        let shutdown = CancellationToken::new();
        let callback = listener_callback(&registry, options, &shutdown);

        let deliveries = stream::iter(vec![
            delivery(r#"{"n": 1}"#, 1, 1),
            delivery(r#"{"n": 2}"#, 2, 0),
        ]);
        drive("q1", deliveries, &callback, options.auto_ack, &shutdown)
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(shutdown.is_cancelled());
        assert!(registry.entry("q1").is_some());

        release_one_use(&registry, "q1", options);
        assert!(registry.entry("q1").is_none());
    }

    #[tokio::test]
    async fn regular_listener_keeps_consuming_and_keeps_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        registry
            .register(TopologyDescriptor::new("q1"), counting(counter.clone()))
            .unwrap();

        let options = ListenerOptions::default().ignore_interrupt();
        let shutdown = CancellationToken::new();
        let callback = listener_callback(&registry, options, &shutdown);

        let deliveries = stream::iter(vec![
            delivery(r#"{"n": 1}"#, 1, 1),
            delivery(r#"{"n": 2}"#, 2, 1),
        ]);
        drive("q1", deliveries, &callback, options.auto_ack, &shutdown)
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!shutdown.is_cancelled());

        release_one_use(&registry, "q1", options);
        assert!(registry.entry("q1").is_some());
    }

    #[test]
    fn options_builders() {
        let opts = ListenerOptions::default().auto_ack().one_use().ignore_interrupt();
        assert!(opts.auto_ack && opts.one_use && !opts.stop_on_interrupt);
        assert!(ListenerOptions::default().stop_on_interrupt);
    }
}
