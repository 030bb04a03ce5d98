//! Data structures for passing params into and results out of a batch
//! window.

use std::borrow::Borrow;
use std::fmt::{self, Display, Formatter};
use std::mem;
use std::sync::Arc;

/// The name of a logical batch queue, such as `"customers"` or
/// `"employees"`. Keys are cheap to clone; every window and log event of a
/// coalescer carries its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey(Arc<str>);

impl BatchKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BatchKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchKey {
    fn from(key: &str) -> Self {
        BatchKey(Arc::from(key))
    }
}

impl From<String> for BatchKey {
    fn from(key: String) -> Self {
        BatchKey(Arc::from(key))
    }
}

impl AsRef<str> for BatchKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for BatchKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The arrival position of a single param in its window. Each `BatchFuture`
/// holds exactly one ticket, and the ticket is the index of its result in
/// the handler's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Ticket(usize);

impl Ticket {
    #[inline]
    pub(crate) fn position(self) -> usize {
        self.0
    }
}

/// The ordered params of a window that is still accumulating. Duplicate
/// params are kept as independent entries; each occupies one slot of the
/// window's `max_size`.
#[derive(Debug)]
pub(crate) struct PendingParams<Param> {
    params: Vec<Param>,
}

impl<Param> Default for PendingParams<Param> {
    fn default() -> Self {
        Self { params: Vec::new() }
    }
}

impl<Param> PendingParams<Param> {
    /// Append a param to the back of the queue and return its ticket.
    pub(crate) fn push(&mut self, param: Param) -> Ticket {
        let ticket = Ticket(self.params.len());
        self.params.push(param);
        ticket
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.params.len()
    }

    /// Take the params, in arrival order, leaving this queue empty.
    pub(crate) fn take(&mut self) -> Vec<Param> {
        mem::take(&mut self.params)
    }
}

/// The outcome of claiming a ticket's slot in a [`ResultSlots`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Claim<Value> {
    Value(Value),

    /// The handler returned fewer values than params, and this ticket has
    /// no corresponding value.
    Missing { expected: usize, received: usize },
}

/// The positional results of a completed dispatch. Slot `i` belongs to the
/// future holding ticket `i`. A slot is emptied when it's claimed, or when
/// its future is dropped without claiming it.
#[derive(Debug)]
pub(crate) struct ResultSlots<Value> {
    slots: Vec<Option<Value>>,
    expected: usize,
    received: usize,
}

impl<Value> ResultSlots<Value> {
    /// Pair a handler's output with the `expected` number of params. Values
    /// past `expected` have no requester and are dropped here.
    pub(crate) fn new(mut values: Vec<Value>, expected: usize) -> Self {
        let received = values.len();
        values.truncate(expected);

        Self {
            slots: values.into_iter().map(Some).collect(),
            expected,
            received,
        }
    }

    #[inline]
    pub(crate) fn expected(&self) -> usize {
        self.expected
    }

    #[inline]
    pub(crate) fn received(&self) -> usize {
        self.received
    }

    /// Claim the value for a ticket.
    ///
    /// Panics if the slot was already claimed; tickets are never shared
    /// between futures, so this indicates a logic error in this crate.
    pub(crate) fn claim(&mut self, ticket: Ticket) -> Claim<Value> {
        match self.slots.get_mut(ticket.position()) {
            None => Claim::Missing {
                expected: self.expected,
                received: self.received,
            },
            Some(slot) => match slot.take() {
                Some(value) => Claim::Value(value),
                None => panic!("Logic error: result slot claimed twice"),
            },
        }
    }

    /// Drop the value for a ticket whose future lost interest. No-op if the
    /// slot is missing or empty.
    pub(crate) fn discard(&mut self, ticket: Ticket) {
        if let Some(slot) = self.slots.get_mut(ticket.position()) {
            *slot = None;
        }
    }
}
