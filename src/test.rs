#![cfg(test)]

use crate::{BatchRules, Coalescer, FetchError};
use std::{cell::Cell, num::NonZeroUsize};

use futures::{executor, future};

async fn stringify(params: Vec<usize>) -> Result<Vec<String>, ()> {
    Ok(params.iter().map(|param| param.to_string()).collect())
}

fn call_counter<'a, T, R>(
    counter: &'a Cell<usize>,
    function: impl Fn(T) -> R + 'a,
) -> impl Fn(T) -> R + 'a {
    move |argument| {
        counter.set(counter.get() + 1);
        function(argument)
    }
}

fn max_size(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap()
}

#[test]
fn full_window_detaches_from_coalescer() {
    let counter = Cell::new(0);
    let coalescer = Coalescer::new(
        "variants",
        BatchRules {
            handler: call_counter(&counter, stringify),
            window: || future::pending(),
            max_size: max_size(2),
        },
    );

    assert!(!coalescer.has_open_window());

    let fut1 = coalescer.fetch(1);
    assert!(coalescer.has_open_window());

    let fut2 = coalescer.fetch(2);
    assert!(!coalescer.has_open_window());

    // A new window opens for the next param
    let fut3 = coalescer.fetch(3);
    assert!(coalescer.has_open_window());

    assert_eq!(executor::block_on(fut1), Ok(String::from("1")));
    assert_eq!(executor::block_on(fut2), Ok(String::from("2")));
    assert_eq!(counter.get(), 1);

    drop(fut3);
    assert!(!coalescer.has_open_window());
}

#[test]
fn single_param_windows_are_never_shared() {
    let counter = Cell::new(0);
    let coalescer = Coalescer::new(
        "variants",
        BatchRules {
            handler: call_counter(&counter, stringify),
            window: || future::pending(),
            max_size: max_size(1),
        },
    );

    let fut1 = coalescer.fetch(1);
    assert!(!coalescer.has_open_window());
    let fut2 = coalescer.fetch(2);

    // The window is never waited on, so a pending delay doesn't matter
    assert_eq!(executor::block_on(fut2), Ok(String::from("2")));
    assert_eq!(executor::block_on(fut1), Ok(String::from("1")));
    assert_eq!(counter.get(), 2);
}

#[test]
fn params_join_an_elapsed_window_until_it_is_polled() {
    let counter = Cell::new(0);
    let coalescer = Coalescer::new(
        "variants",
        BatchRules {
            handler: call_counter(&counter, stringify),
            window: || future::ready(()),
            max_size: max_size(10),
        },
    );

    let fut1 = coalescer.fetch(10);
    let fut2 = coalescer.fetch(20);

    assert_eq!(executor::block_on(fut1), Ok(String::from("10")));

    // The window has been dispatched, so this starts a new one
    assert!(!coalescer.has_open_window());
    let fut3 = coalescer.fetch(30);

    assert_eq!(executor::block_on(fut2), Ok(String::from("20")));
    assert_eq!(executor::block_on(fut3), Ok(String::from("30")));
    assert_eq!(counter.get(), 2);
}

#[test]
fn handler_error_reaches_every_request() {
    let coalescer = Coalescer::new(
        "variants",
        BatchRules {
            handler: |_params: Vec<usize>| future::ready(Err::<Vec<String>, _>("offline")),
            window: || future::ready(()),
            max_size: max_size(10),
        },
    );

    let fut1 = coalescer.fetch(1);
    let fut2 = coalescer.fetch(2);

    let err = executor::block_on(fut2).unwrap_err();
    assert_eq!(err.handler_error(), Some(&"offline"));
    assert_eq!(executor::block_on(fut1), Err(FetchError::Handler("offline")));
}
