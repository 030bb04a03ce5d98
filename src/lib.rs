//! batch-coalescer merges many individual "fetch by id" lookups into fewer
//! bulk calls. It sits between call sites that each want a single entity
//! (a customer, an employee, a product variant) and a bulk endpoint that
//! accepts a list of ids and returns a list of entities. Callers see an
//! ordinary async lookup and know nothing about the batching.
//!
//! ## Overview
//!
//! Suppose the backend has a bulk endpoint that looks up customers by id:
//!
//! ```
//! #[derive(Debug, Clone, PartialEq)]
//! struct Customer {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct ApiError {}
//!
//! async fn get_customers(ids: Vec<u64>) -> Result<Vec<Option<Customer>>, ApiError> {
//!     todo!()
//! }
//! ```
//!
//! The endpoint returns one entry per id, in the same order as the ids, and
//! encodes "not found" as `None` rather than failing the whole request.
//! That positional contract is all a coalescer handler needs: value `i` of
//! the output belongs to param `i` of the input.
//!
//! A [`Coalescer`] is configured with [`BatchRules`]:
//! - `handler` is the bulk lookup, an async function from `Vec<Param>` to
//!   `Result<Vec<Value>, Error>`.
//! - `window` is how long a batch collects params after its first one
//!   arrives. A [`Duration`](std::time::Duration) works, as does any
//!   function returning a delay future from your runtime; see [`Window`].
//! - `max_size` is the most params one handler call will receive. A batch
//!   that reaches it is dispatched immediately, without waiting out the
//!   window.
//!
//! ```
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! use batch_coalescer::{BatchRules, Coalescer};
//! use futures::{executor, future};
//!
//! async fn get_customer_names(ids: Vec<u64>) -> Result<Vec<String>, String> {
//!     Ok(ids.into_iter().map(|id| format!("customer-{}", id)).collect())
//! }
//!
//! let coalescer = Coalescer::new(
//!     "customers",
//!     BatchRules {
//!         handler: get_customer_names,
//!         window: Duration::from_millis(10),
//!         max_size: NonZeroUsize::new(50).unwrap(),
//!     },
//! );
//!
//! // Both lookups land in the same window, so get_customer_names is called
//! // once, with [1, 2].
//! let (first, second) = executor::block_on(future::join(
//!     coalescer.fetch(1),
//!     coalescer.fetch(2),
//! ));
//!
//! assert_eq!(first.unwrap(), "customer-1");
//! assert_eq!(second.unwrap(), "customer-2");
//! ```
//!
//! Each [`fetch`] returns a [`BatchFuture`] that resolves with the value
//! at its own position of the handler's output, or with a [`FetchError`]:
//! - [`FetchError::Handler`] when the handler failed. The failure is all or
//!   nothing: every request of that batch receives a clone of the error.
//!   Retrying is up to the caller, which knows whether its endpoint is
//!   safe to retry.
//! - [`FetchError::LengthMismatch`] when the handler returned fewer values
//!   than params. Only the requests past the end of the output get this
//!   error; the others receive their values normally.
//!
//! Applications with several kinds of lookups can keep one coalescer per
//! [`BatchKey`] in a [`CoalescerRegistry`]. Keys are fully isolated from
//! each other: separate windows, separate timers, separate handler calls.
//!
//! ## Design notes
//!
//! ### No de-duplication
//!
//! Two requests for the same param in the same window are two entries in
//! the handler's input, each taking a slot of `max_size`. The coalescer
//! batches transport; it doesn't eliminate redundant lookups, and it never
//! caches results across windows.
//!
//! ### No cancellation
//!
//! Once a param has been fetched it can't be withdrawn from its batch.
//! Dropping the [`BatchFuture`] discards its result, but the param is still
//! sent to the handler. There are no per-request timeouts either; race the
//! future against your own timer if you need one.
//!
//! ### Poll-driven design
//!
//! All the work is driven by polling [`BatchFuture`]. Nothing is spawned
//! onto a runtime: the future that polled most recently drives the window's
//! delay and then the handler future, and the other futures are only woken
//! once the result is ready (or when the driver is dropped, so that one of
//! them can take over). A consequence is that a batch whose futures have
//! all been dropped is never dispatched, since there's nobody left to
//! deliver results to.
//!
//! [`fetch`]: Coalescer::fetch

mod batch;
mod config;
mod data;
mod error;
mod registry;
mod test;
mod wakerset;
mod window;

pub use batch::{BatchFuture, BatchRules, Coalescer};
pub use config::CoalescerConfig;
pub use data::BatchKey;
pub use error::{FetchError, RegistryError};
pub use registry::{boxed_handler, BoxedHandler, CoalescerRegistry, DynRegistry};
pub use window::{Window, DEFAULT_WINDOW};
