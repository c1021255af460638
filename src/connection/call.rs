//! The calling convention shared by every broker operation.
//!
//! An operation is described by a [`Call`] (or a [`Consume`]) and issued in one of two ways:
//! - `.await` it: the task waits until the broker has replied and gets the decoded result;
//! - `.callback(f)`: the operation is issued straight away, the [`PromiseNumber`] is
//!   returned and `f` later runs on the connection's dispatcher task with the result.
use std::{
    future::{Future, IntoFuture},
    sync::{Arc, Weak},
};

use futures_util::{
    future::{self, BoxFuture},
    FutureExt,
};
use lapin::{
    options::BasicConsumeOptions,
    types::{FieldTable, ShortString},
};
use tokio::sync::oneshot;
use tracing::debug;

use super::{Completion, Connection, Inner, PromiseNumber, Registration, WeakConnection};
use crate::{
    amqp::{Operation, QueueState, Response},
    Error, Message,
};

/// Turns the broker's reply into the value handed to the caller.
pub(crate) type Project<T> = fn(&WeakConnection, PromiseNumber, Response) -> Result<T, Error>;

fn unexpected(response: Response) -> Error {
    Error::UnexpectedResponse(Box::new(response))
}

pub(crate) fn done(_: &WeakConnection, _: PromiseNumber, response: Response) -> Result<(), Error> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

pub(crate) fn queue_state(
    _: &WeakConnection,
    _: PromiseNumber,
    response: Response,
) -> Result<QueueState, Error> {
    match response {
        Response::QueueDeclared(state) => Ok(state),
        other => Err(unexpected(other)),
    }
}

pub(crate) fn message_count(
    _: &WeakConnection,
    _: PromiseNumber,
    response: Response,
) -> Result<u32, Error> {
    match response {
        Response::MessageCount(count) => Ok(count),
        other => Err(unexpected(other)),
    }
}

pub(crate) fn maybe_message(
    connection: &WeakConnection,
    promise: PromiseNumber,
    response: Response,
) -> Result<Option<Message>, Error> {
    match response {
        Response::Delivery(frame) => Ok(Some(Message::new(connection.clone(), promise, frame))),
        Response::Empty => Ok(None),
        other => Err(unexpected(other)),
    }
}

/// Cleans up after a blocking caller that stopped waiting before its reply arrived.
struct Waiting {
    connection: Weak<Inner>,
    promise: PromiseNumber,
    consumer: bool,
    armed: bool,
}

impl Waiting {
    fn new(connection: &Connection, promise: PromiseNumber, consumer: bool) -> Self {
        Self {
            connection: Arc::downgrade(&connection.inner),
            promise,
            consumer,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.connection.upgrade() {
            if self.consumer {
                inner.cancel_quietly(self.promise);
            } else {
                inner.forget(self.promise);
            }
        }
    }
}

/// A broker operation waiting to be issued. Await it, or hand it a callback.
#[must_use = "operations are only issued once awaited or given a callback"]
pub struct Call<T> {
    connection: Result<Connection, Error>,
    operation: Operation,
    registration: Registration,
    project: Project<T>,
}

impl<T: Send + 'static> Call<T> {
    pub(crate) fn new(
        connection: Result<Connection, Error>,
        operation: Operation,
        registration: Registration,
        project: Project<T>,
    ) -> Self {
        Self {
            connection,
            operation,
            registration,
            project,
        }
    }

    /// Issue the operation and return immediately.
    ///
    /// `callback` runs exactly once, on the connection's dispatcher task, with the reply
    /// or with the error that prevented it (broker error, broken or closed connection).
    pub fn callback<F, Fut>(self, callback: F) -> Result<PromiseNumber, Error>
    where
        F: FnOnce(Result<T, Error>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let connection = self.connection?;
        let weak = connection.downgrade();
        let project = self.project;
        let mut callback = Some(callback);
        let completion: Completion = Box::new(move |promise, outcome| match callback.take() {
            Some(callback) => {
                let result = outcome.and_then(|response| project(&weak, promise, response));
                callback(result).boxed()
            }
            None => future::ready(()).boxed(),
        });
        connection
            .inner
            .issue(self.operation, completion, self.registration)
    }
}

impl<T: Send + 'static> IntoFuture for Call<T> {
    type Output = Result<T, Error>;
    type IntoFuture = BoxFuture<'static, Result<T, Error>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let connection = self.connection?;
            let weak = connection.downgrade();
            let project = self.project;
            let (sender, receiver) = oneshot::channel();
            let mut sender = Some(sender);
            let completion: Completion = Box::new(move |promise, outcome| {
                if let Some(sender) = sender.take() {
                    let result = outcome.and_then(|response| project(&weak, promise, response));
                    // The caller may have stopped waiting.
                    let _ = sender.send(result);
                }
                future::ready(()).boxed()
            });
            let promise = connection
                .inner
                .issue(self.operation, completion, self.registration)?;
            let mut waiting = Waiting::new(&connection, promise, false);

            connection.inner.must_now_block();
            let outcome = receiver.await;
            waiting.disarm();
            match outcome {
                Ok(result) => result,
                Err(_) => Err(connection.inner.closed_error()),
            }
        })
    }
}

/// A `consume` waiting to be issued.
///
/// Awaited, it waits for the first message on the queue and cancels the consumer.
/// With [`Consume::callback`], it registers a standing consumer.
#[must_use = "consumers are only registered once awaited or given a callback"]
pub struct Consume {
    connection: Connection,
    queue: ShortString,
    consumer_tag: ShortString,
    options: BasicConsumeOptions,
    arguments: FieldTable,
}

impl Consume {
    pub(crate) fn new(
        connection: Connection,
        queue: ShortString,
        consumer_tag: ShortString,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Self {
        Self {
            connection,
            queue,
            consumer_tag,
            options,
            arguments,
        }
    }

    /// The tag the consumer is registered under with the broker.
    pub fn consumer_tag(&self) -> &ShortString {
        &self.consumer_tag
    }

    fn issue(self, completion: Completion) -> Result<(Connection, PromiseNumber), Error> {
        let Consume {
            connection,
            queue,
            consumer_tag,
            options,
            arguments,
        } = self;
        let operation = Operation::Consume {
            queue,
            consumer_tag: consumer_tag.clone(),
            options,
            arguments,
        };
        let promise = connection.inner.issue(
            operation,
            completion,
            Registration::Standing { consumer_tag },
        )?;
        Ok((connection, promise))
    }

    /// Register a standing consumer and return immediately.
    ///
    /// `callback` runs on the dispatcher task once per delivery, in delivery order, until
    /// the consumer is cancelled with [`Connection::cancel`] (using the returned promise
    /// number) or the connection goes away. A broker error ends the consumer after being
    /// passed to `callback`.
    pub fn callback<F, Fut>(self, mut callback: F) -> Result<PromiseNumber, Error>
    where
        F: FnMut(Result<Message, Error>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = self.connection.downgrade();
        let completion: Completion = Box::new(move |promise, outcome| match outcome {
            Ok(Response::ConsumeOk { .. }) => future::ready(()).boxed(),
            Ok(Response::Delivery(frame)) => {
                callback(Ok(Message::new(weak.clone(), promise, frame))).boxed()
            }
            Ok(other) => callback(Err(unexpected(other))).boxed(),
            Err(e) => callback(Err(e)).boxed(),
        });
        let (_, promise) = self.issue(completion)?;
        Ok(promise)
    }
}

impl IntoFuture for Consume {
    type Output = Result<Message, Error>;
    type IntoFuture = BoxFuture<'static, Result<Message, Error>>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move {
            let weak = self.connection.downgrade();
            // Deliveries past the first one go back to the queue, so the broker must not
            // consider them settled: `no_ack` is honoured by acknowledging the first one.
            let no_ack = std::mem::replace(&mut self.options.no_ack, false);
            let (sender, receiver) = oneshot::channel();
            let mut sender = Some(sender);
            let completion: Completion = Box::new(move |promise, outcome| {
                match outcome {
                    Ok(Response::ConsumeOk { .. }) => {}
                    Ok(Response::Delivery(frame)) => {
                        let message = Message::new(weak.clone(), promise, frame);
                        let surplus = match sender.take() {
                            Some(sender) if !sender.is_closed() => {
                                if let Some(connection) = weak.upgrade() {
                                    connection.inner.cancel_quietly(promise);
                                }
                                if no_ack {
                                    if let Err(e) = message.ack() {
                                        debug!(error = %e, "failed to acknowledge a delivery");
                                    }
                                }
                                match sender.send(Ok(message)) {
                                    Err(Ok(message)) if !no_ack => Some(message),
                                    _ => None,
                                }
                            }
                            _ => Some(message),
                        };
                        // Raced the cancellation, or nobody is waiting anymore.
                        if let Some(message) = surplus {
                            if let Err(e) = message.reject(true) {
                                debug!(error = %e, "failed to requeue a surplus delivery");
                            }
                        }
                    }
                    Ok(other) => {
                        if let Some(sender) = sender.take() {
                            let _ = sender.send(Err(unexpected(other)));
                        }
                    }
                    Err(e) => {
                        if let Some(sender) = sender.take() {
                            let _ = sender.send(Err(e));
                        }
                    }
                }
                future::ready(()).boxed()
            });
            let (connection, promise) = self.issue(completion)?;
            let mut waiting = Waiting::new(&connection, promise, true);

            connection.inner.must_now_block();
            let outcome = receiver.await;
            waiting.disarm();
            match outcome {
                Ok(result) => result,
                Err(_) => Err(connection.inner.closed_error()),
            }
        })
    }
}
