//! The dispatcher task: runs completions as their promises become ready.
//!
//! Exactly one task at a time is *the* dispatcher of a connection, identified by a
//! generation number. A dispatcher that has been superseded finishes the completion it is
//! running and exits.
use std::{
    panic::AssertUnwindSafe,
    sync::{atomic::Ordering, Arc, Weak},
};

use futures_util::FutureExt;
use tracing::{debug, error, trace};

use super::{ConnectionId, Inner};

tokio::task_local! {
    static ACTIVE_DISPATCHER: DispatcherMark;
}

/// Which connection, and which generation of its dispatcher, a task was spawned as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DispatcherMark {
    connection: ConnectionId,
    generation: u64,
}

impl Inner {
    /// Spawn a new dispatcher, superseding the current one.
    pub(super) fn spawn_dispatcher(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mark = DispatcherMark {
            connection: self.id,
            generation,
        };
        let handle = tokio::spawn(ACTIVE_DISPATCHER.scope(
            mark,
            dispatch(Arc::downgrade(self), generation),
        ));
        // The superseded task is detached: it exits on its own once its callback returns.
        *self.dispatcher.lock() = Some(handle);
    }

    /// Whether the calling task is the current dispatcher of this connection.
    pub(crate) fn is_dispatcher(&self) -> bool {
        ACTIVE_DISPATCHER
            .try_with(|mark| {
                mark.connection == self.id
                    && mark.generation == self.generation.load(Ordering::SeqCst)
            })
            .unwrap_or(false)
    }

    /// Must be called by any task about to wait on this connection.
    ///
    /// If the calling task is the dispatcher, nobody would be left to run the completion it
    /// is waiting for: a replacement dispatcher takes over before it waits.
    pub(crate) fn must_now_block(self: &Arc<Self>) {
        if self.is_dispatcher() {
            debug!(connection = %self.id, "dispatcher is about to block, handing over");
            self.spawn_dispatcher();
        }
    }
}

fn superseded(inner: &Inner, generation: u64) -> bool {
    inner.generation.load(Ordering::SeqCst) != generation
}

async fn dispatch(connection: Weak<Inner>, generation: u64) {
    loop {
        let Some(inner) = connection.upgrade() else {
            return;
        };
        if superseded(&inner, generation) {
            return;
        }
        let batch = {
            let guard = inner.state.lock();
            let state = guard.borrow();
            state.promises.ready_batch()
        };
        if batch.is_empty() {
            if inner.stop_dispatch.load(Ordering::SeqCst) {
                trace!(connection = %inner.id, generation, "dispatcher stopped");
                return;
            }
            let idle = inner.options.dispatch_idle();
            let wakeup = Arc::clone(&inner.dispatch_wakeup);
            // Only a weak reference is held while idle.
            drop(inner);
            let _ = tokio::time::timeout(idle, wakeup.notified()).await;
            continue;
        }

        for promise in batch {
            let begun = {
                let guard = inner.state.lock();
                let mut state = guard.borrow_mut();
                state.promises.begin(promise)
            };
            let Some((mut completion, outcome)) = begun else {
                continue;
            };

            let invoked =
                std::panic::catch_unwind(AssertUnwindSafe(|| completion(promise, outcome)));
            let outcome = match invoked {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            if outcome.is_err() {
                error!(
                    connection = %inner.id,
                    %promise,
                    "a completion callback panicked, carrying on with the next one"
                );
            }

            {
                let guard = inner.state.lock();
                let mut state = guard.borrow_mut();
                state.promises.finish(promise, completion);
            }
            if superseded(&inner, generation) {
                trace!(connection = %inner.id, generation, "dispatcher superseded");
                return;
            }
        }
    }
}
