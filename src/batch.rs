use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll},
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    data::{BatchKey, Claim, PendingParams, ResultSlots, Ticket},
    error::FetchError,
    wakerset::{Token as WakerToken, WakerSet},
    window::{Window, DEFAULT_WINDOW},
};

struct AccumulatingState<Param, Handler, Delay> {
    key: BatchKey,
    params: PendingParams<Param>,
    handler: Arc<Handler>,

    // None once the window is full, or when max_size is 1
    delay: Option<Pin<Box<Delay>>>,
    wakers: WakerSet,

    // Futures dropped before dispatch. Their params stay in the batch, but
    // nobody will claim their results.
    abandoned: Vec<Ticket>,
}

struct RunningState<Fut> {
    key: BatchKey,
    fut: Pin<Box<Fut>>,
    expected: usize,
    wakers: WakerSet,
    abandoned: Vec<Ticket>,
}

struct DoneState<Value, Error> {
    key: BatchKey,
    outcome: Result<ResultSlots<Value>, Error>,
}

impl<Value, Error: Clone> DoneState<Value, Error> {
    fn claim(&mut self, ticket: Ticket) -> Result<Value, FetchError<Error>> {
        match self.outcome {
            Err(ref err) => Err(FetchError::Handler(err.clone())),
            Ok(ref mut slots) => match slots.claim(ticket) {
                Claim::Value(value) => Ok(value),
                Claim::Missing { expected, received } => Err(FetchError::LengthMismatch {
                    key: self.key.clone(),
                    expected,
                    received,
                    position: ticket.position(),
                }),
            },
        }
    }
}

enum State<Param, Value, Error, Fut, Handler, Delay> {
    Accum(AccumulatingState<Param, Handler, Delay>),
    Running(RunningState<Fut>),
    Done(DoneState<Value, Error>),
}

type SharedState<Param, Value, Error, Fut, Handler, Delay> =
    Arc<Mutex<State<Param, Value, Error, Fut, Handler, Delay>>>;

/// Lock a window's state. A poisoned lock means a handler or delay panicked
/// while some other future was polling it; that panic is propagated to
/// every future sharing the window.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(..) => panic!("Batch state poisoned by a panic in another BatchFuture"),
    }
}

/// The configuration of a [`Coalescer`].
#[derive(Debug, Clone)]
pub struct BatchRules<Handler, W> {
    /// The bulk lookup. Called with the params of a window, in arrival
    /// order, it must return one value per param, where value `i`
    /// corresponds to param `i`.
    pub handler: Handler,

    /// How long a window collects params before it's dispatched, measured
    /// from the window's first param.
    pub window: W,

    /// The most params a single handler call will receive. A window that
    /// reaches this size is dispatched immediately, regardless of its delay.
    pub max_size: NonZeroUsize,
}

impl<Handler> BatchRules<Handler, Duration> {
    /// Rules with the [default window](DEFAULT_WINDOW).
    pub fn new(handler: Handler, max_size: NonZeroUsize) -> Self {
        Self {
            handler,
            window: DEFAULT_WINDOW,
            max_size,
        }
    }
}

/// A coalescer merges individual lookups into bulk handler calls for a
/// single [`BatchKey`].
///
/// Each call to [`fetch`](Coalescer::fetch) adds a param to the currently
/// accumulating window, opening a new window if there isn't one. A window
/// closes when its delay completes or when it reaches `max_size` params; it
/// is then detached from the coalescer and driven to completion by the
/// [`BatchFuture`]s that share it.
pub struct Coalescer<Param, Value, Error, Fut, Handler, W: Window> {
    key: BatchKey,
    handler: Arc<Handler>,
    window: W,
    max_size: NonZeroUsize,

    // The accumulating window, if any. Weak so that a window whose futures
    // were all dropped is freed instead of lingering here.
    #[allow(clippy::type_complexity)]
    state: Mutex<Weak<Mutex<State<Param, Value, Error, Fut, Handler, W::Delay>>>>,
}

impl<Param, Value, Error, Fut, Handler, W: Window> Debug
    for Coalescer<Param, Value, Error, Fut, Handler, W>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("key", &self.key)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl<Param, Value, Error, Fut, Handler, W: Window> Coalescer<Param, Value, Error, Fut, Handler, W> {
    pub fn new(key: impl Into<BatchKey>, rules: BatchRules<Handler, W>) -> Self {
        let BatchRules {
            handler,
            window,
            max_size,
        } = rules;

        Self {
            key: key.into(),
            handler: Arc::new(handler),
            window,
            max_size,
            state: Mutex::new(Weak::new()),
        }
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn max_size(&self) -> NonZeroUsize {
        self.max_size
    }

    /// Whether a window is attached and still accepting params
    #[cfg(test)]
    pub(crate) fn has_open_window(&self) -> bool {
        let handle = match lock(&self.state).upgrade() {
            None => return false,
            Some(handle) => handle,
        };

        let open = matches!(*lock(&handle), State::Accum(..));
        open
    }
}

impl<Param, Value, Error, Fut, Handler, W> Coalescer<Param, Value, Error, Fut, Handler, W>
where
    Error: Clone,
    W: Window,
    Handler: Fn(Vec<Param>) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, Error>>,
{
    /// Request the value for a single param. The param joins the current
    /// window immediately; the returned future resolves once that window
    /// has been dispatched and the handler has returned.
    ///
    /// There is no way to withdraw a param once it's been fetched. Dropping
    /// the future discards its result, but the param is still sent to the
    /// handler with the rest of its window, as long as some other future of
    /// that window is still alive to drive it. A window whose futures have
    /// all been dropped is freed without calling the handler.
    pub fn fetch(&self, param: Param) -> BatchFuture<Param, Value, Error, Fut, Handler, W::Delay> {
        // The slot only ever holds a Weak, which is valid even if a window
        // factory panicked while we held the lock.
        let mut slot = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // Join the accumulating window, if there is one. We don't check the
        // delay here; if it already elapsed, the next poll of any of the
        // window's futures will dispatch it, this param included. A window
        // poisoned by a panicking handler is abandoned, and replaced by a
        // new one below.
        if let Some(handle) = slot.upgrade() {
            let mut guard = match handle.lock() {
                Ok(guard) => guard,
                Err(..) => {
                    warn!(key = %self.key, "batch window poisoned, opening a new one");
                    return self.open_window(&mut slot, param);
                }
            };

            if let State::Accum(ref mut accum) = *guard {
                let ticket = accum.params.push(param);
                trace!(key = %self.key, position = ticket.position(), "param queued");

                // If we've hit the size limit:
                // - Cancel the delay
                // - Wake the driving future, so it dispatches on its next poll
                // - Detach the window from the coalescer
                let full = accum.params.len() >= self.max_size.get();
                if full {
                    debug!(
                        key = %self.key,
                        size = accum.params.len(),
                        "batch window full, dispatching early"
                    );
                    accum.delay = None;
                    accum.wakers.wake_driver();
                }

                drop(guard);
                if full {
                    *slot = Weak::new();
                }

                return BatchFuture::new(ticket, handle);
            }
        }

        self.open_window(&mut slot, param)
    }

    /// Start a new window holding `param`, and attach it to the coalescer
    /// unless it's already full.
    #[allow(clippy::type_complexity)]
    fn open_window(
        &self,
        slot: &mut Weak<Mutex<State<Param, Value, Error, Fut, Handler, W::Delay>>>,
        param: Param,
    ) -> BatchFuture<Param, Value, Error, Fut, Handler, W::Delay> {
        let mut params = PendingParams::default();
        let ticket = params.push(param);

        // A window that is full with its first param is dispatched on first
        // poll, and is never offered to later fetches.
        let full = self.max_size.get() <= 1;
        let delay = if full {
            None
        } else {
            Some(Box::pin(self.window.open()))
        };

        debug!(key = %self.key, max_size = self.max_size.get(), "batch window opened");

        let state = Arc::new(Mutex::new(State::Accum(AccumulatingState {
            key: self.key.clone(),
            params,
            handler: Arc::clone(&self.handler),
            delay,
            wakers: WakerSet::default(),
            abandoned: Vec::new(),
        })));

        *slot = if full {
            Weak::new()
        } else {
            Arc::downgrade(&state)
        };

        BatchFuture::new(ticket, state)
    }
}

/// A batch future is a request for the value of a single param. It shares
/// a window with every other param fetched in the same window; when
/// awaited, it waits until the window is dispatched, then resolves with the
/// value at its own position in the handler's output.
///
/// The batch is not spawned onto any runtime. It is driven by polling its
/// futures: whichever future polled most recently drives the delay and then
/// the handler future, and the others are woken when the result is ready.
pub struct BatchFuture<Param, Value, Error, Fut, Handler, Delay> {
    ticket: Ticket,
    waker_token: Option<WakerToken>,

    // None once the future has completed
    state: Option<SharedState<Param, Value, Error, Fut, Handler, Delay>>,
}

impl<Param, Value, Error, Fut, Handler, Delay>
    BatchFuture<Param, Value, Error, Fut, Handler, Delay>
{
    fn new(ticket: Ticket, state: SharedState<Param, Value, Error, Fut, Handler, Delay>) -> Self {
        Self {
            ticket,
            waker_token: None,
            state: Some(state),
        }
    }
}

impl<Param, Value, Error, Fut, Handler, Delay> Debug
    for BatchFuture<Param, Value, Error, Fut, Handler, Delay>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFuture")
            .field("position", &self.ticket.position())
            .field("completed", &self.state.is_none())
            .finish()
    }
}

impl<Param, Value, Error, Fut, Handler, Delay> Future
    for BatchFuture<Param, Value, Error, Fut, Handler, Delay>
where
    Error: Clone,
    Delay: Future<Output = ()>,
    Handler: Fn(Vec<Param>) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, Error>>,
{
    type Output = Result<Value, FetchError<Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        // The lock is only held for the duration of this poll, never across
        // an await, so a std Mutex is fine here.
        let state = this
            .state
            .as_ref()
            .expect("Can't re-poll a completed BatchFuture");
        let mut guard = lock(state);

        if let State::Accum(ref mut accum) = *guard {
            if let Some(ref mut delay) = accum.delay {
                if delay.as_mut().poll(ctx).is_pending() {
                    // We're now the driving future for this window
                    accum.wakers.register(&mut this.waker_token, ctx.waker());
                    return Poll::Pending;
                }
            }

            // The window is closed. Take the params and call the handler;
            // after this, no new params can join.
            let params = accum.params.take();
            let expected = params.len();
            debug!(key = %accum.key, size = expected, "dispatching batch");

            let fut = (*accum.handler)(params);

            let running = RunningState {
                key: accum.key.clone(),
                fut: Box::pin(fut),
                expected,
                wakers: mem::take(&mut accum.wakers),
                abandoned: mem::take(&mut accum.abandoned),
            };

            *guard = State::Running(running);
        }

        if let State::Running(ref mut running) = *guard {
            let outcome = match running.fut.as_mut().poll(ctx) {
                Poll::Pending => {
                    running.wakers.register(&mut this.waker_token, ctx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(outcome) => outcome,
            };

            let key = running.key.clone();

            let outcome = match outcome {
                Ok(values) => {
                    let mut slots = ResultSlots::new(values, running.expected);

                    if slots.received() != slots.expected() {
                        warn!(
                            key = %key,
                            expected = slots.expected(),
                            received = slots.received(),
                            "batch handler returned the wrong number of values"
                        );
                    }

                    // Some futures may have lost interest while the batch
                    // was pending; free their values now.
                    running
                        .abandoned
                        .drain(..)
                        .for_each(|ticket| slots.discard(ticket));

                    debug!(key = %key, "batch completed");
                    Ok(slots)
                }
                Err(err) => {
                    debug!(key = %key, "batch handler failed");
                    Err(err)
                }
            };

            // Everyone else can collect their results now. We're about to
            // take ours, so we don't need to wake ourself.
            mem::take(&mut running.wakers).wake_all_except(this.waker_token.take());

            *guard = State::Done(DoneState { key, outcome });
        }

        if let State::Done(ref mut done) = *guard {
            let result = done.claim(this.ticket);

            // Release the window before letting go of our handle to it
            drop(guard);
            this.state = None;
            return Poll::Ready(result);
        }

        unreachable!("BatchFuture contained invalid state");
    }
}

impl<Param, Value, Error, Fut, Handler, Delay> Drop
    for BatchFuture<Param, Value, Error, Fut, Handler, Delay>
{
    fn drop(&mut self) {
        // The shared batch is only driven by a single task, so if we were
        // the driver, another waiting future has to be woken to take over.
        // WakerSet::discard_and_wake takes care of that.
        let state = match self.state.take() {
            Some(state) => state,
            None => return,
        };

        let mut guard = match state.lock() {
            Ok(guard) => guard,

            // The handler or delay panicked, probably while we were polling
            // it. Wake everyone else, so that the panic reaches them when
            // they poll instead of leaving them pending forever.
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                let wakers = match *guard {
                    State::Accum(ref mut accum) => mem::take(&mut accum.wakers),
                    State::Running(ref mut running) => mem::take(&mut running.wakers),
                    State::Done(..) => return,
                };
                drop(guard);

                wakers.wake_all_except(self.waker_token.take());
                return;
            }
        };

        match *guard {
            State::Accum(ref mut accum) => {
                if let Some(token) = self.waker_token.take() {
                    accum.wakers.discard_and_wake(token);
                }
                accum.abandoned.push(self.ticket);
            }
            State::Running(ref mut running) => {
                if let Some(token) = self.waker_token.take() {
                    running.wakers.discard_and_wake(token);
                }
                running.abandoned.push(self.ticket);
            }
            State::Done(ref mut done) => {
                if let Ok(ref mut slots) = done.outcome {
                    slots.discard(self.ticket);
                }
            }
        }
    }
}
