//! A single physical connection to the broker, shared by every task that holds a handle to it.
//!
//! Each [`Connection`] runs two tasks on the current tokio runtime:
//! - the I/O loop, pumping bytes between the socket and the protocol client;
//! - the dispatcher, running completion callbacks as replies become ready.
//!
//! Callers either await an operation (it returns once the broker has replied) or attach a
//! callback to it (it returns a [`PromiseNumber`] straight away). See [`Call`].
use std::{
    cell::RefCell,
    fmt,
    future::IntoFuture,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{DeliveryTag, FieldTable, ShortString},
    BasicProperties, ExchangeKind,
};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    amqp::{
        configuration::{BrokerSettings, ConnectionOptions},
        Connector, Operation, ProtocolClient, QueueState, Resolution, Wire,
    },
    pool::Membership,
    Error, Message, ProtocolError,
};

mod call;
mod dispatcher;
mod io_loop;
mod promise;

pub use call::{Call, Consume};
pub use promise::PromiseNumber;
pub(crate) use promise::{Completion, Registration};

use promise::PromiseTable;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, increasing identifier of a connection. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything guarded by the connection lock.
struct State {
    client: Box<dyn ProtocolClient>,
    promises: PromiseTable,
    /// Set once the socket broke; every later operation fails with this reason.
    broken: Option<Arc<str>>,
}

pub(crate) struct Inner {
    id: ConnectionId,
    options: ConnectionOptions,
    /// Re-entrant: a task holding the lock may take it again through nested calls.
    /// `RefCell` borrows never outlive a single method, so they do not nest.
    state: ReentrantMutex<RefCell<State>>,
    /// `close` has been called; new operations are refused.
    closing: AtomicBool,
    /// Asks the I/O loop to flush and exit.
    stop_io: AtomicBool,
    /// Asks the dispatcher to exit once nothing is left to dispatch.
    stop_dispatch: AtomicBool,
    /// Generation of the task currently acting as the dispatcher.
    generation: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    io_loop: Mutex<Option<JoinHandle<()>>>,
    io_wakeup: Arc<Notify>,
    dispatch_wakeup: Arc<Notify>,
    membership: Mutex<Option<Membership>>,
}

/// A handle to a multiplexed connection. Cheap to clone: clones share the same socket.
///
/// # Sharing
///
/// A connection is not checked out of a pool and returned: any number of tasks can use it
/// at the same time. Operations are written to the wire in the order they are issued.
///
/// # Blocking calls from callbacks
///
/// Callbacks run on the connection's dispatcher task. A callback may await an operation on
/// the same connection: before waiting, the dispatcher hands its duty over to a fresh task,
/// so that the reply the callback is waiting for can still be dispatched.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A non-owning reference to a connection, held by [`Message`]s.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<Inner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }

    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(Weak::new())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("broken", &self.is_broken())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Start driving an already established link.
    ///
    /// Spawns the I/O loop and the dispatcher on the current tokio runtime: it must be
    /// called from within one. No handshake is performed, see [`Connection::open`].
    pub fn start(wire: Wire, options: ConnectionOptions) -> Connection {
        let Wire { transport, client } = wire;
        let inner = Arc::new(Inner {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            options,
            state: ReentrantMutex::new(RefCell::new(State {
                client,
                promises: PromiseTable::default(),
                broken: None,
            })),
            closing: AtomicBool::new(false),
            stop_io: AtomicBool::new(false),
            stop_dispatch: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
            io_loop: Mutex::new(None),
            io_wakeup: Arc::new(Notify::new()),
            dispatch_wakeup: Arc::new(Notify::new()),
            membership: Mutex::new(None),
        });
        let io_loop = tokio::spawn(io_loop::run(Arc::downgrade(&inner), transport));
        *inner.io_loop.lock() = Some(io_loop);
        inner.spawn_dispatcher();
        debug!(connection = %inner.id, "connection started");
        Connection { inner }
    }

    /// Open a new connection to a broker.
    ///
    /// Connects through `connector` and performs the post-connect handshake.
    /// Both steps together are bounded by the broker's connection timeout, or 10 seconds if
    /// left unspecified.
    #[tracing::instrument(name = "amqp_open_connection", skip_all, fields(host = %settings.host))]
    pub async fn open(
        connector: &dyn Connector,
        settings: &BrokerSettings,
        options: ConnectionOptions,
    ) -> Result<Connection, Error> {
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| Duration::from_secs(10));
        let deadline = tokio::time::Instant::now() + connection_timeout;

        let wire = match tokio::time::timeout_at(deadline, connector.connect(settings)).await {
            Ok(result) => result.map_err(Error::Connect)?,
            Err(_) => {
                return Err(Error::Connect(anyhow::anyhow!(
                    "Timed out while trying to connect to the broker."
                )))
            }
        };
        let connection = Connection::start(wire, options);

        let handshake = connection.call(
            Operation::Connect {
                vhost: settings.vhost.clone(),
                username: settings.username.clone(),
                password: settings.password.clone(),
            },
            call::done,
        );
        let outcome = match tokio::time::timeout_at(deadline, handshake.into_future()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Connect(anyhow::anyhow!(
                "Timed out during the handshake with the broker."
            ))),
        };
        if let Err(e) = outcome {
            connection.shutdown(false).await;
            return Err(e);
        }
        info!(connection = %connection.id(), "connection opened");
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Whether the socket broke. A broken connection refuses every operation.
    pub fn is_broken(&self) -> bool {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.broken.is_some()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Number of promises still tracked: replies awaited, completions queued or running,
    /// and standing consumers.
    pub fn in_flight(&self) -> usize {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        state.promises.len()
    }

    /// Read-only access to the protocol client, under the connection lock.
    pub fn with_client<R>(&self, f: impl FnOnce(&dyn ProtocolClient) -> R) -> R {
        let guard = self.inner.state.lock();
        let state = guard.borrow();
        f(state.client.as_ref())
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    pub(crate) fn attach(&self, membership: Membership) -> Result<(), Membership> {
        self.inner.attach(membership)
    }

    fn call<T: Send + 'static>(&self, operation: Operation, project: call::Project<T>) -> Call<T> {
        Call::new(Ok(self.clone()), operation, Registration::OneShot, project)
    }

    pub fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Call<()> {
        self.call(
            Operation::ExchangeDeclare {
                exchange: exchange.into(),
                kind,
                options,
                arguments,
            },
            call::done,
        )
    }

    pub fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions) -> Call<()> {
        self.call(
            Operation::ExchangeDelete {
                exchange: exchange.into(),
                options,
            },
            call::done,
        )
    }

    /// Route messages published to `source` into `destination` as well.
    pub fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    ) -> Call<()> {
        self.call(
            Operation::ExchangeBind {
                destination: destination.into(),
                source: source.into(),
                routing_key: routing_key.into(),
                options,
                arguments,
            },
            call::done,
        )
    }

    pub fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeUnbindOptions,
        arguments: FieldTable,
    ) -> Call<()> {
        self.call(
            Operation::ExchangeUnbind {
                destination: destination.into(),
                source: source.into(),
                routing_key: routing_key.into(),
                options,
                arguments,
            },
            call::done,
        )
    }

    /// Declare a queue. An empty name lets the broker pick one, see [`QueueState::queue`].
    pub fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Call<QueueState> {
        self.call(
            Operation::QueueDeclare {
                queue: queue.into(),
                options,
                arguments,
            },
            call::queue_state,
        )
    }

    /// Delete a queue, returning the number of messages it held.
    pub fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Call<u32> {
        self.call(
            Operation::QueueDelete {
                queue: queue.into(),
                options,
            },
            call::message_count,
        )
    }

    /// Drop every ready message in a queue, returning how many were dropped.
    pub fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Call<u32> {
        self.call(
            Operation::QueuePurge {
                queue: queue.into(),
                options,
            },
            call::message_count,
        )
    }

    pub fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Call<()> {
        self.call(
            Operation::QueueBind {
                queue: queue.into(),
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                options,
                arguments,
            },
            call::done,
        )
    }

    pub fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Call<()> {
        self.call(
            Operation::QueueUnbind {
                queue: queue.into(),
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                arguments,
            },
            call::done,
        )
    }

    /// Publish a message with default options.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        properties: BasicProperties,
    ) -> Call<()> {
        self.publish_with_options(
            exchange,
            routing_key,
            body,
            properties,
            BasicPublishOptions::default(),
        )
    }

    pub fn publish_with_options(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        properties: BasicProperties,
        options: BasicPublishOptions,
    ) -> Call<()> {
        self.call(
            Operation::Publish {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                body: body.into(),
                properties,
                options,
            },
            call::done,
        )
    }

    /// Consume messages from `queue`.
    ///
    /// Awaited, it returns the first delivered message. With a callback, it registers a
    /// standing consumer. An empty `consumer_tag` is replaced by a generated one.
    pub fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Consume {
        let consumer_tag: ShortString = if consumer_tag.is_empty() {
            format!("ctag-{}", Uuid::new_v4()).into()
        } else {
            consumer_tag.into()
        };
        Consume::new(
            self.clone(),
            queue.into(),
            consumer_tag,
            options,
            arguments,
        )
    }

    /// Fetch a single message, `None` if the queue is empty.
    pub fn get(&self, queue: &str, options: BasicGetOptions) -> Call<Option<Message>> {
        self.call(
            Operation::Get {
                queue: queue.into(),
                options,
            },
            call::maybe_message,
        )
    }

    /// Fetch a single message and acknowledge it straight away.
    pub async fn get_and_ack(&self, queue: &str) -> Result<Option<Message>, Error> {
        let message = self.get(queue, BasicGetOptions::default()).await?;
        if let Some(message) = &message {
            message.ack()?;
        }
        Ok(message)
    }

    /// Acknowledge a delivery. The broker does not reply: this completes as soon as the
    /// acknowledgement is queued for the socket.
    pub fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), Error> {
        self.inner.send_only(Operation::Ack {
            delivery_tag,
            options: BasicAckOptions { multiple: false },
        })
    }

    /// Reject a delivery, optionally asking the broker to requeue it.
    ///
    /// A requeued message may be delivered to this very connection again.
    pub fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), Error> {
        self.inner.send_only(Operation::Reject {
            delivery_tag,
            options: BasicRejectOptions { requeue },
        })
    }

    /// Cancel the standing consumer registered under `consumer`.
    ///
    /// Deliveries that reached the connection before the broker confirmed the cancellation
    /// are still handed to the consumer's callback.
    pub fn cancel(&self, consumer: PromiseNumber) -> Call<()> {
        let (connection, consumer_tag) = match self.inner.consumer_tag(consumer) {
            Some(consumer_tag) => (Ok(self.clone()), consumer_tag),
            None => (Err(Error::UnknownConsumer(consumer)), ShortString::from("")),
        };
        Call::new(
            connection,
            Operation::Cancel {
                consumer_tag,
                options: BasicCancelOptions::default(),
            },
            Registration::Cancels(consumer),
            call::done,
        )
    }

    /// Limit the number of unacknowledged deliveries the broker sends to this connection.
    pub fn qos(&self, prefetch_count: u16, options: BasicQosOptions) -> Call<()> {
        self.call(
            Operation::Qos {
                prefetch_count,
                options,
            },
            call::done,
        )
    }

    /// Close the connection.
    ///
    /// Performs the protocol close (bounded by the close timeout), stops the I/O loop and
    /// the dispatcher, fails whatever is still pending with [`Error::Closed`] and leaves the
    /// owning pool. Closing twice is a no-op.
    #[tracing::instrument(name = "amqp_close_connection", skip(self), fields(connection = %self.inner.id))]
    pub async fn close(&self) {
        self.shutdown(true).await
    }

    async fn shutdown(&self, handshake: bool) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if handshake && !self.is_broken() {
            let close = self.call(Operation::Close, call::done);
            match tokio::time::timeout(inner.options.close_timeout(), close.into_future()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "the broker did not acknowledge the close"),
                Err(_) => warn!("Timed out waiting for the broker to acknowledge the close"),
            }
        }
        // Joining the dispatcher from the dispatcher itself would never return.
        inner.must_now_block();

        inner.stop_io.store(true, Ordering::SeqCst);
        inner.io_wakeup.notify_one();
        let io_loop = inner.io_loop.lock().take();
        if let Some(io_loop) = io_loop {
            if let Err(e) = io_loop.await {
                error!(error = %e, "the I/O loop task failed");
            }
        }

        inner.fail_all(|| Error::Closed);
        inner.stop_dispatch.store(true, Ordering::SeqCst);
        inner.dispatch_wakeup.notify_one();
        let dispatcher = inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "the dispatcher task failed");
            }
        }

        // Whatever is left can no longer be dispatched: dropping it wakes its waiters.
        let leftovers = {
            let guard = inner.state.lock();
            let mut state = guard.borrow_mut();
            std::mem::take(&mut state.promises)
        };
        drop(leftovers);

        inner.retire();
        info!("connection closed");
    }
}

/// A call that fails with `error` once issued, for operations whose connection is gone.
pub(crate) fn refused(error: Error, operation: Operation) -> Call<()> {
    Call::new(Err(error), operation, Registration::OneShot, call::done)
}

impl Inner {
    /// Encode `operation` and register `completion` for its replies.
    pub(crate) fn issue(
        &self,
        operation: Operation,
        completion: Completion,
        registration: Registration,
    ) -> Result<PromiseNumber, Error> {
        let promise = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            if let Some(reason) = &state.broken {
                return Err(Error::ConnectionBroken(reason.clone()));
            }
            if self.closing.load(Ordering::SeqCst) && !matches!(operation, Operation::Close) {
                return Err(Error::Closed);
            }
            let promise = state.promises.allocate();
            state.client.send(Some(promise), &operation)?;
            state.promises.register(promise, completion, registration);
            promise
        };
        trace!(connection = %self.id, %promise, operation = operation.name(), "operation issued");
        self.io_wakeup.notify_one();
        Ok(promise)
    }

    /// Encode an operation the broker never replies to.
    fn send_only(&self, operation: Operation) -> Result<(), Error> {
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            if let Some(reason) = &state.broken {
                return Err(Error::ConnectionBroken(reason.clone()));
            }
            if self.closing.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            state.client.send(None, &operation)?;
        }
        trace!(connection = %self.id, operation = operation.name(), "operation sent");
        self.io_wakeup.notify_one();
        Ok(())
    }

    /// Cancel a consumer without waiting for the broker to confirm it.
    pub(crate) fn cancel_quietly(&self, consumer: PromiseNumber) {
        let Some(consumer_tag) = self.consumer_tag(consumer) else {
            return;
        };
        let completion: Completion =
            Box::new(|_, _| Box::pin(futures_util::future::ready(())));
        let operation = Operation::Cancel {
            consumer_tag,
            options: BasicCancelOptions::default(),
        };
        if let Err(e) = self.issue(operation, completion, Registration::Cancels(consumer)) {
            debug!(connection = %self.id, %consumer, error = %e, "failed to cancel consumer");
        }
    }

    /// Discard the promise of a caller that stopped waiting.
    pub(crate) fn forget(&self, promise: PromiseNumber) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.promises.forget(promise);
    }

    fn consumer_tag(&self, consumer: PromiseNumber) -> Option<ShortString> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.promises.consumer_tag(consumer)
    }

    /// The error waiting callers get once the connection can no longer reply.
    pub(crate) fn closed_error(&self) -> Error {
        let guard = self.state.lock();
        let state = guard.borrow();
        match &state.broken {
            Some(reason) => Error::ConnectionBroken(reason.clone()),
            None => Error::Closed,
        }
    }

    fn on_read(&self, data: &[u8]) -> Result<(), ProtocolError> {
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            let resolutions = state.client.on_read(data)?;
            for Resolution { promise, outcome } in resolutions {
                if !state.promises.resolve(promise, outcome.map_err(Error::from)) {
                    debug!(connection = %self.id, %promise, "dropping a reply nobody is waiting for");
                }
            }
        }
        self.dispatch_wakeup.notify_one();
        Ok(())
    }

    /// A copy of the bytes waiting to be written, empty if there are none.
    fn pending_write(&self) -> Vec<u8> {
        let guard = self.state.lock();
        let state = guard.borrow();
        if state.client.needs_write() {
            state.client.write_buffer().to_vec()
        } else {
            Vec::new()
        }
    }

    fn on_write(&self, written: usize) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.client.on_write(written);
    }

    fn has_ready(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.promises.has_ready()
    }

    fn fail_all(&self, error: impl Fn() -> Error) {
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            state.promises.fail_all(error);
        }
        self.dispatch_wakeup.notify_one();
    }

    /// The socket is unusable: fail everything in flight, stop, and leave the pool.
    fn break_connection(&self, reason: String) {
        let reason: Arc<str> = reason.into();
        {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            if state.broken.is_some() {
                return;
            }
            state.broken = Some(reason.clone());
            state
                .promises
                .fail_all(|| Error::ConnectionBroken(reason.clone()));
        }
        if self.closing.load(Ordering::SeqCst) {
            debug!(connection = %self.id, %reason, "socket closed while closing the connection");
        } else {
            warn!(connection = %self.id, %reason, "broken connection to the broker");
        }
        self.stop_io.store(true, Ordering::SeqCst);
        self.stop_dispatch.store(true, Ordering::SeqCst);
        self.dispatch_wakeup.notify_one();
        self.retire();
    }

    fn attach(&self, membership: Membership) -> Result<(), Membership> {
        let mut slot = self.membership.lock();
        let broken = {
            let guard = self.state.lock();
            let state = guard.borrow();
            state.broken.is_some()
        };
        if broken || self.closing.load(Ordering::SeqCst) {
            return Err(membership);
        }
        *slot = Some(membership);
        Ok(())
    }

    /// Leave the owning pool, if any, releasing the pool slot.
    fn retire(&self) {
        let membership = self.membership.lock().take();
        if let Some(membership) = membership {
            membership.leave(self.id);
        }
    }
}
