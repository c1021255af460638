//! Book-keeping for the requests outstanding on a single connection.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
};

use futures_util::future::BoxFuture;
use lapin::types::ShortString;

use crate::{amqp::Response, Error};

/// Identifies one outstanding request on a connection.
///
/// A consumer keeps the promise number of the `consume` call that registered it:
/// it is the handle used to cancel the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseNumber(u64);

impl PromiseNumber {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for PromiseNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<PromiseNumber> for u64 {
    fn from(value: PromiseNumber) -> Self {
        value.0
    }
}

impl fmt::Display for PromiseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The completion registered for a promise. Invoked on the dispatcher task, once per
/// outcome.
pub(crate) type Completion =
    Box<dyn FnMut(PromiseNumber, Result<Response, Error>) -> BoxFuture<'static, ()> + Send>;

/// How a promise expects to be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Registration {
    /// A single reply.
    OneShot,
    /// A single reply; on success the standing consumer registered under the given
    /// promise is released.
    Cancels(PromiseNumber),
    /// Any number of replies until the consumer is cancelled.
    Standing { consumer_tag: ShortString },
}

struct Entry {
    callback: Option<Completion>,
    /// One reference per queued outcome, plus one while a reply is still expected.
    refcount: usize,
    registration: Registration,
    resolved: bool,
    forgotten: bool,
    outcomes: VecDeque<Result<Response, Error>>,
}

impl Entry {
    fn standing(&self) -> bool {
        matches!(self.registration, Registration::Standing { .. })
    }
}

#[derive(Default)]
pub(crate) struct PromiseTable {
    last: u64,
    entries: HashMap<PromiseNumber, Entry>,
    /// Promises with a queued outcome, in the order the outcomes arrived.
    /// A promise appears once per queued outcome.
    ready: VecDeque<PromiseNumber>,
    /// Promises whose completion is executing right now.
    running: HashSet<PromiseNumber>,
}

impl PromiseTable {
    pub(crate) fn allocate(&mut self) -> PromiseNumber {
        self.last += 1;
        PromiseNumber(self.last)
    }

    pub(crate) fn register(
        &mut self,
        promise: PromiseNumber,
        callback: Completion,
        registration: Registration,
    ) {
        self.entries.insert(
            promise,
            Entry {
                callback: Some(callback),
                refcount: 1,
                registration,
                resolved: false,
                forgotten: false,
                outcomes: VecDeque::new(),
            },
        );
    }

    /// Queue an outcome for `promise`.
    ///
    /// Returns `false` if nobody is waiting for it: the promise is unknown, was forgotten,
    /// or is a one-shot promise that has already been resolved.
    pub(crate) fn resolve(
        &mut self,
        promise: PromiseNumber,
        outcome: Result<Response, Error>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&promise) else {
            return false;
        };
        if entry.forgotten {
            return false;
        }
        if entry.standing() {
            entry.refcount += 1;
        } else if entry.resolved {
            return false;
        } else {
            entry.resolved = true;
        }
        let cancelled = match (&entry.registration, &outcome) {
            (Registration::Cancels(target), Ok(_)) => Some(*target),
            _ => None,
        };
        // A consumer the broker failed is not going to receive anything else.
        let failed = entry.standing() && outcome.is_err();
        entry.outcomes.push_back(outcome);
        self.ready.push_back(promise);
        if let Some(target) = cancelled {
            self.release(target);
        }
        if failed {
            self.release(promise);
        }
        true
    }

    /// Drop the reference a standing consumer holds on itself.
    /// Outcomes already queued are still dispatched.
    pub(crate) fn release(&mut self, promise: PromiseNumber) {
        if let Some(entry) = self.entries.get_mut(&promise) {
            if entry.standing() {
                entry.registration = Registration::OneShot;
                entry.resolved = true;
                entry.refcount -= 1;
            }
        }
        self.collect(promise);
    }

    /// Stop caring about `promise`: its pending outcomes are discarded and later ones ignored.
    pub(crate) fn forget(&mut self, promise: PromiseNumber) {
        if self.running.contains(&promise) {
            if let Some(entry) = self.entries.get_mut(&promise) {
                entry.forgotten = true;
            }
        } else {
            self.remove(promise);
        }
    }

    /// Resolve every promise still expecting a reply with an error.
    /// Standing consumers receive the error and are released.
    pub(crate) fn fail_all(&mut self, error: impl Fn() -> Error) {
        let mut pending: Vec<PromiseNumber> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.forgotten && (entry.standing() || !entry.resolved))
            .map(|(promise, _)| *promise)
            .collect();
        pending.sort();
        for promise in pending {
            self.resolve(promise, Err(error()));
            self.release(promise);
        }
    }

    /// Promises with a queued outcome and no completion currently running, in arrival order.
    pub(crate) fn ready_batch(&self) -> Vec<PromiseNumber> {
        let mut batch = Vec::new();
        for promise in &self.ready {
            if !self.running.contains(promise) && !batch.contains(promise) {
                batch.push(*promise);
            }
        }
        batch
    }

    /// Take the next outcome of `promise` together with its completion, marking the promise
    /// as running. [`PromiseTable::finish`] must be called once the completion returns.
    pub(crate) fn begin(
        &mut self,
        promise: PromiseNumber,
    ) -> Option<(Completion, Result<Response, Error>)> {
        if self.running.contains(&promise) {
            return None;
        }
        let position = self.ready.iter().position(|p| *p == promise)?;
        self.ready.remove(position);
        let entry = self.entries.get_mut(&promise)?;
        let outcome = entry.outcomes.pop_front()?;
        match entry.callback.take() {
            Some(callback) => {
                self.running.insert(promise);
                Some((callback, outcome))
            }
            None => {
                entry.refcount = entry.refcount.saturating_sub(1);
                self.collect(promise);
                None
            }
        }
    }

    pub(crate) fn finish(&mut self, promise: PromiseNumber, callback: Completion) {
        self.running.remove(&promise);
        let forgotten = match self.entries.get_mut(&promise) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                if !entry.forgotten {
                    entry.callback = Some(callback);
                }
                entry.forgotten
            }
            None => false,
        };
        if forgotten {
            self.remove(promise);
        } else {
            self.collect(promise);
        }
    }

    pub(crate) fn consumer_tag(&self, promise: PromiseNumber) -> Option<ShortString> {
        match &self.entries.get(&promise)?.registration {
            Registration::Standing { consumer_tag } => Some(consumer_tag.clone()),
            _ => None,
        }
    }

    pub(crate) fn has_ready(&self) -> bool {
        self.ready.iter().any(|p| !self.running.contains(p))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn collect(&mut self, promise: PromiseNumber) {
        let unreferenced = self
            .entries
            .get(&promise)
            .map_or(false, |entry| entry.refcount == 0);
        if unreferenced && !self.running.contains(&promise) {
            self.remove(promise);
        }
    }

    fn remove(&mut self, promise: PromiseNumber) {
        self.entries.remove(&promise);
        self.ready.retain(|p| *p != promise);
    }
}
