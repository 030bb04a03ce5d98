//! These tests ensure that only the driving future is woken while a batch
//! is pending, that another future is notified when the driver is dropped,
//! and that everyone is notified when the results are ready.

use batch_coalescer::{BatchRules, Coalescer};
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt},
};
use std::{
    collections::HashMap,
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
};

/// Records whether a task has been woken since its last poll
#[derive(Debug, Clone, Default, IntoWaker)]
struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

/// Stays pending for a fixed number of polls, waking itself each time
#[derive(Debug, Clone)]
struct Skipper {
    remaining_skips: usize,
}

impl Skipper {
    fn new(count: usize) -> Self {
        Skipper {
            remaining_skips: count,
        }
    }
}

impl Future for Skipper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().remaining_skips {
            0 => Poll::Ready(()),
            skips => {
                *skips -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// A timer that only fires when told to.
#[derive(Default)]
struct ManualTimer {
    pending: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
}

impl ManualTimer {
    fn window(&self) -> impl Fn() -> BoxFuture<'static, ()> {
        let pending = Arc::clone(&self.pending);
        move || {
            let (sender, receiver) = oneshot::channel();
            pending.lock().unwrap().push(sender);
            receiver.map(|_| ()).boxed()
        }
    }

    fn fire(&self) {
        for sender in self.pending.lock().unwrap().drain(..) {
            let _ = sender.send(());
        }
    }
}

struct Task<F: Future + Unpin> {
    fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: signal.clone().into_waker(),
            signal,
        }
    }

    fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}

/// The single task that has been woken. Panics if none or several were.
fn only_signaled<F: Future + Unpin>(tasks: &HashMap<i32, Task<F>>) -> i32 {
    let signaled: Vec<i32> = tasks
        .iter()
        .filter(|(_, task)| task.is_signaled())
        .map(|(&i, _)| i)
        .collect();

    match signaled.as_slice() {
        [single] => *single,
        other => panic!("expected exactly one woken task, found {:?}", other),
    }
}

async fn slow_identity(params: Vec<i32>) -> Result<Vec<i32>, ()> {
    Skipper::new(1).await;
    Ok(params)
}

#[test]
fn test_notify_lifecycle() {
    let timer = ManualTimer::default();
    let coalescer = Coalescer::new(
        "employees",
        BatchRules {
            handler: slow_identity,
            window: timer.window(),
            max_size: NonZeroUsize::new(10).unwrap(),
        },
    );

    let mut task1 = Task::new(coalescer.fetch(1));
    let mut task2 = Task::new(coalescer.fetch(2));
    let mut task3 = Task::new(coalescer.fetch(3));

    // Polling the futures starts waiting on the window. task1 polls last, so
    // it's the driver.
    assert_eq!(task3.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Pending);
    assert_eq!(task1.poll(), Poll::Pending);

    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    // Closing the window signals task1, and ONLY task1
    timer.fire();

    assert!(task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    // We re-poll task1. This dispatches the batch and triggers the Skipper,
    // which immediately re-signals task1. A second poll finishes the batch,
    // which should notify ALL the other tasks.
    assert_eq!(task1.poll(), Poll::Pending);

    assert!(task1.is_signaled());
    assert!(!task2.is_signaled());
    assert!(!task3.is_signaled());

    assert_eq!(task1.poll(), Poll::Ready(Ok(1)));

    assert!(task2.is_signaled());
    assert!(task3.is_signaled());

    assert_eq!(task2.poll(), Poll::Ready(Ok(2)));
    assert_eq!(task3.poll(), Poll::Ready(Ok(3)));
}

#[test]
fn test_notify_full_window() {
    let coalescer = Coalescer::new(
        "employees",
        BatchRules {
            handler: slow_identity,
            window: || futures::future::pending(),
            max_size: NonZeroUsize::new(3).unwrap(),
        },
    );

    let mut task1 = Task::new(coalescer.fetch(1));
    let mut task2 = Task::new(coalescer.fetch(2));

    assert_eq!(task1.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Pending);
    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());

    // Filling the window wakes the driver, even though the window's delay
    // never completes
    let task3 = Task::new(coalescer.fetch(3));

    assert!(!task1.is_signaled());
    assert!(task2.is_signaled());
    assert!(!task3.is_signaled());
}

#[test]
fn test_notify_lifecycle_drops() {
    let timer = ManualTimer::default();
    let coalescer = Coalescer::new(
        "employees",
        BatchRules {
            handler: slow_identity,
            window: timer.window(),
            max_size: NonZeroUsize::new(10).unwrap(),
        },
    );

    let mut tasks: HashMap<i32, _> = (1..=5)
        .map(|key| (key, Task::new(coalescer.fetch(key))))
        .collect();

    // Every task waits on the window; task 5 polled last and drives it
    for i in 1..=5 {
        assert_eq!(tasks.get_mut(&i).unwrap().poll(), Poll::Pending);
    }

    assert!(tasks.values().all(|task| !task.is_signaled()));

    // Dropping the driver hands the window to exactly one other task
    tasks.remove(&5);
    let driving_task = only_signaled(&tasks);

    // Closing the window wakes whoever last polled the delay, which was the
    // dropped task. The new driver is still signaled from its promotion, and
    // nobody else is.
    timer.fire();

    for (&i, task) in tasks.iter() {
        if i == driving_task {
            assert!(task.is_signaled());
        } else {
            assert!(!task.is_signaled());
        }
    }

    // The new driver dispatches the batch and stops in the Skipper
    assert_eq!(tasks.get_mut(&driving_task).unwrap().poll(), Poll::Pending);

    // Dropping the new driver mid-handler promotes yet another task
    tasks.remove(&driving_task);
    let driving_task = only_signaled(&tasks);

    // The third driver finishes the handler and claims its own value
    assert_eq!(
        tasks.get_mut(&driving_task).unwrap().poll(),
        Poll::Ready(Ok(driving_task))
    );

    // Completion wakes the followers but not the task that completed it
    for (&i, task) in tasks.iter() {
        if i == driving_task {
            assert!(!task.is_signaled())
        } else {
            assert!(task.is_signaled())
        }
    }

    tasks.remove(&driving_task);

    for (&i, task) in tasks.iter_mut() {
        assert_eq!(task.poll(), Poll::Ready(Ok(i)));
    }
}
