// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Thread to Async Bridge
//!
//! [`Subscriber::listen`] runs a listener on its own thread and hands every
//! decoded message to async code through an unbounded channel, exposed as a
//! [`MessageStream`]. A message is acked once it is in the channel.
//!
//! The stream owns the listener's stop signal: dropping it, or calling
//! [`MessageStream::stop`], ends the receive loop and closes the connection.
//! A delivery that arrives after the stream is gone is returned to the queue.

use crate::{
    channel::ConnectionManager,
    config::BrokerConfig,
    consumer::{MessageCallback, RabbitMQListener},
    errors::{AmqpError, HandlerError},
    topology::{AmqpTopology, Topology, TopologyDescriptor},
};
use futures_util::Stream;
use serde_json::Value;
use std::{
    pin::Pin,
    task::{Context, Poll},
    thread::JoinHandle,
};
use tokio::{
    runtime::Builder,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

/// Subscribes a queue to extra routing keys and streams its messages.
pub struct Subscriber {
    listener: RabbitMQListener,
}

impl Subscriber {
    /// Creates a subscriber for the descriptor's queue.
    ///
    /// # Parameters
    /// * `config` - Broker to subscribe on
    /// * `descriptor` - Queue and exchange declared when the stream starts
    ///
    /// # Returns
    /// A subscriber that is not connected until `listen()`
    pub fn new(config: BrokerConfig, descriptor: TopologyDescriptor) -> Self {
        Subscriber {
            listener: RabbitMQListener::new(config, descriptor),
        }
    }

    /// Same as `new`, on a prepared connection manager.
    pub fn with_manager(manager: ConnectionManager, descriptor: TopologyDescriptor) -> Self {
        Subscriber {
            listener: RabbitMQListener::with_manager(manager, descriptor),
        }
    }

    /// Binds the queue with `routing_key` and starts streaming its messages.
    ///
    /// Resolves once the listener thread is connected and bound; connection
    /// and binding errors are returned here.
    ///
    /// # Parameters
    /// * `routing_key` - Extra key the queue is bound with
    ///
    /// # Returns
    /// A stream of the queue's messages that stops its listener when dropped
    pub async fn listen(self, routing_key: &str) -> Result<MessageStream, AmqpError> {
        let queue = self.listener.queue().to_owned();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let token = CancellationToken::new();

        let shutdown = token.clone();
        let key = routing_key.to_owned();
        let listener = self.listener;
        let thread = std::thread::Builder::new()
            .name(format!("amqp-subscriber-{}", queue))
            .spawn(move || run_subscriber(listener, key, sender, ready_tx, shutdown))
            .map_err(|err| AmqpError::ListenerThreadError(err.to_string()))?;

        let stream = MessageStream::new(queue, receiver, token, thread);

        match ready_rx.await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AmqpError::ListenerThreadError(
                "subscriber thread exited before it was ready".to_owned(),
            )),
        }
    }
}

/// Forwards each message into `sender`; a closed channel means the stream
/// is gone and the message must go back to the broker.
pub(crate) fn handoff(sender: UnboundedSender<Value>) -> impl MessageCallback {
    move |message: Value, _: &str| -> Result<(), HandlerError> {
        sender.send(message).map_err(|_| HandlerError::Shutdown)
    }
}

fn run_subscriber(
    mut listener: RabbitMQListener,
    routing_key: String,
    sender: UnboundedSender<Value>,
    ready: oneshot::Sender<Result<(), AmqpError>>,
    shutdown: CancellationToken,
) -> Result<(), AmqpError> {
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            let err = AmqpError::ListenerThreadError(err.to_string());
            let _ = ready.send(Err(err.clone()));
            return Err(err);
        }
    };

    runtime.block_on(async move {
        let bound = match listener.open().await {
            Ok(channel) => {
                AmqpTopology::new(channel)
                    .bind(listener.descriptor(), &routing_key)
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = bound {
            listener.close().await;
            let _ = ready.send(Err(err.clone()));
            return Err(err);
        }

        if ready.send(Ok(())).is_err() {
            debug!("subscriber abandoned before it started");
            listener.close().await;
            return Ok(());
        }

        info!(
            queue = listener.queue(),
            routing_key = routing_key.as_str(),
            "subscriber started"
        );

        let callback = handoff(sender);
        let result = listener.consume(&callback, false, &shutdown).await;
        listener.close().await;

        if let Err(err) = &result {
            error!(error = err.to_string(), "subscriber stopped with error");
        }
        result
    })
}

/// Messages of a running subscription.
///
/// Dropping the stream stops the subscription.
pub struct MessageStream {
    queue: String,
    receiver: UnboundedReceiver<Value>,
    token: CancellationToken,
    thread: Option<JoinHandle<Result<(), AmqpError>>>,
    _guard: DropGuard,
}

impl MessageStream {
    pub(crate) fn new(
        queue: String,
        receiver: UnboundedReceiver<Value>,
        token: CancellationToken,
        thread: JoinHandle<Result<(), AmqpError>>,
    ) -> Self {
        MessageStream {
            queue,
            receiver,
            _guard: token.clone().drop_guard(),
            token,
            thread: Some(thread),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next message; `None` once the subscription has ended.
    pub async fn next_message(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    /// Asks the listener thread to stop. Messages already handed off can
    /// still be read.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether a stop was requested, by `stop()` or by dropping the stream.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops the subscription and waits for the listener thread to exit.
    pub async fn shutdown(mut self) -> Result<(), AmqpError> {
        self.token.cancel();

        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(result)) => result,
            _ => Err(AmqpError::ListenerThreadError(format!(
                "subscriber for `{}` panicked",
                self.queue
            ))),
        }
    }
}

impl Stream for MessageStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{drive, Acknowledger, Inbound, MockAcknowledger},
        message::JSON_CONTENT_TYPE,
        retry::FixedRetry,
    };
    use futures_util::{stream, StreamExt};
    use lapin::{protocol::basic::AMQPProperties, types::ShortString};
    use serde_json::json;
    use std::time::Duration;

    fn delivery(body: &str, tag: u64, acks: usize, returns: usize) -> Result<Inbound, AmqpError> {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(acks).returning(|| Ok(()));
        acker
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(returns)
            .returning(|_| Ok(()));
        let acker: Box<dyn Acknowledger> = Box::new(acker);

        Ok(Inbound {
            properties: AMQPProperties::default()
                .with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
            data: body.as_bytes().to_vec(),
            delivery_tag: tag,
            acker,
        })
    }

    fn idle_stream(token: &CancellationToken) -> (MessageStream, UnboundedSender<Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let waiting = token.clone();
        let thread = std::thread::spawn(move || {
            while !waiting.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        (
            MessageStream::new("q1".to_owned(), receiver, token.clone(), thread),
            sender,
        )
    }

    #[tokio::test]
    async fn handed_off_messages_are_acked_and_streamed_in_order() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let callback = handoff(sender);

        let deliveries = stream::iter(vec![
            delivery(r#"{"n": 1}"#, 1, 1, 0),
            delivery(r#"{"n": 2}"#, 2, 1, 0),
        ]);
        drive("q1", deliveries, &callback, false, &CancellationToken::new())
            .await
            .unwrap();
        drop(callback);

        let received = drain(receiver).await;
        assert_eq!(received, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    async fn drain(mut receiver: UnboundedReceiver<Value>) -> Vec<Value> {
        let mut out = vec![];
        while let Some(value) = receiver.recv().await {
            out.push(value);
        }
        out
    }

    #[tokio::test]
    async fn abandoned_stream_returns_message_and_stops_loop() {
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        let callback = handoff(sender);

        // the second delivery is never taken
        let deliveries = stream::iter(vec![
            delivery(r#"{"n": 1}"#, 1, 0, 1),
            delivery(r#"{"n": 2}"#, 2, 0, 0),
        ]);

        let result = drive("q1", deliveries, &callback, false, &CancellationToken::new()).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn stream_yields_values_and_drop_cancels() {
        let token = CancellationToken::new();
        let (mut stream, sender) = idle_stream(&token);

        sender.send(json!({"a": 1})).unwrap();
        sender.send(json!({"a": 2})).unwrap();

        assert_eq!(stream.next().await, Some(json!({"a": 1})));
        assert_eq!(stream.next_message().await, Some(json!({"a": 2})));
        assert!(!token.is_cancelled());

        drop(stream);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_thread() {
        let token = CancellationToken::new();
        let (stream, _sender) = idle_stream(&token);

        stream.stop();
        assert!(stream.is_stopped());
        assert_eq!(stream.shutdown().await, Ok(()));
    }

    #[tokio::test]
    async fn listen_reports_connection_failure() {
        let manager = ConnectionManager::new(BrokerConfig::new("127.0.0.1", 1))
            .with_retry(FixedRetry::new(1, Duration::from_millis(10)));
        let subscriber = Subscriber::with_manager(manager, TopologyDescriptor::new("q1"));

        let result = subscriber.listen("q1").await;
        assert!(matches!(
            result,
            Err(AmqpError::ConnectionError { attempts: 1, .. })
        ));
    }
}
