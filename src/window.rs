use std::future::Future;
use std::time::Duration;

use futures_timer::Delay;

/// The debounce window used when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(10);

/// A source of single-shot delays, one per batch window. The delay starts
/// when a window opens; when it completes, the window is dispatched. If the
/// window fills up first, the delay is dropped, which cancels it.
///
/// Any `Fn() -> impl Future<Output = ()>` is a `Window`, so an async sleep
/// from whatever runtime you're using works directly:
///
/// ```
/// use batch_coalescer::Window;
/// use futures::future;
///
/// fn assert_window<W: Window>(_window: W) {}
///
/// assert_window(|| future::ready(()));
/// ```
///
/// A [`Duration`] is also a `Window`, backed by the runtime-agnostic
/// [`futures_timer::Delay`].
pub trait Window {
    type Delay: Future<Output = ()>;

    /// Start the delay for a newly opened window.
    fn open(&self) -> Self::Delay;
}

impl<F, D> Window for F
where
    F: Fn() -> D,
    D: Future<Output = ()>,
{
    type Delay = D;

    #[inline]
    fn open(&self) -> D {
        self()
    }
}

impl Window for Duration {
    type Delay = Delay;

    #[inline]
    fn open(&self) -> Delay {
        Delay::new(*self)
    }
}
