//! # Suspense-style resource caching
//!
//! This crate implements an in-memory cache for asynchronous values whose
//! callers look synchronous: a [`Resource::read`] never blocks and never
//! awaits, it reports the current state of the requested entry and leaves the
//! decision of how to wait to the caller. The intended caller is a scheduler
//! that treats a pending entry as a *suspension point*: pause the dependent
//! computation, await the [`LoadHandle`], retry the read.
//!
//! ## Request coalescing
//!
//! The central guarantee of the cache is that the loader for one key runs at
//! most once for the life of its entry. The first read of a key creates the
//! entry and starts the load; every further read of that key, no matter how
//! concurrent, observes the same entry and receives a handle to the same
//! in-flight operation. Entry creation happens under the family's entry-map
//! lock, so there is no window in which two loads could start for one key.
//!
//! ## Entry lifecycle
//!
//! An entry is created `Pending` and settles exactly once, into either a
//! resolved value or a rejected [`CacheError`]. Settling is the only state
//! transition there is: no retry, no refresh, no eviction. A rejected load is
//! rejected for good, and every later read surfaces the same error. Entries
//! live until the owning [`ResourceCache`] is cleared or dropped; unbounded
//! growth is the documented contract, not an oversight, so keys must be drawn
//! from a bounded input space.
//!
//! ## Lifecycle ownership
//!
//! Nothing here is process-global. The surrounding application constructs a
//! [`ResourceCache`], creates its [`Resource`] families from it, and decides
//! if and when to [`clear`](ResourceCache::clear) it. Loads that are in
//! flight across a `clear` run to completion but cannot write their result
//! back into the map.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use suspense_cache::{delayed, CacheEntry, ReadOutcome, ResourceCache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = ResourceCache::new();
//! let user = cache.create_resource("user", |id: u32| {
//!     let outcome: CacheEntry<String> = Ok(format!("user {id}"));
//!     delayed(Duration::from_millis(10), outcome)
//! });
//!
//! // Speculatively warm the entry, e.g. on hover.
//! user.preload(3);
//!
//! match user.read(3) {
//!     ReadOutcome::Pending(handle) => {
//!         // Suspend: await settlement, then retry the read.
//!         handle.await.unwrap();
//!         assert!(!user.read(3).is_pending());
//!     }
//!     ReadOutcome::Value(value) => assert_eq!(*value, "user 3"),
//!     ReadOutcome::Failure(error) => panic!("load failed: {error}"),
//! }
//! # }
//! ```

#![warn(missing_docs)]

mod cache_key;
mod delay;
mod error;
mod resource;

pub use cache_key::CacheKey;
pub use delay::{delay, delayed};
pub use error::{CacheEntry, CacheError};
pub use resource::{LoadHandle, ReadOutcome, Resource, ResourceCache};

#[cfg(test)]
pub(crate) mod testutils {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt::fmt;

    /// Sets up the test environment.
    ///
    /// Initializes logs so that all console output is captured by the test
    /// runner, muting everything outside this crate.
    pub fn setup() {
        fmt()
            .with_env_filter(EnvFilter::new("suspense_cache=trace"))
            .with_target(false)
            .pretty()
            .with_test_writer()
            .try_init()
            .ok();
    }
}
