use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};

use crate::cache_key::CacheKey;
use crate::error::{CacheEntry, CacheError};

/// Distinguishes load operations started for the same key across [`ResourceCache::clear`],
/// so a stale load can never settle an entry it does not own.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(0);

// Inner result necessary because `futures::Shared` hands every waiter its own
// clone of the output, so the payload has to be behind an `Arc`.
type LoadChannel<T> = Shared<oneshot::Receiver<CacheEntry<Arc<T>>>>;

type Loader<I, T> = Box<dyn Fn(I) -> BoxFuture<'static, CacheEntry<T>> + Send + Sync>;

/// A handle to one in-flight load operation.
///
/// Every caller that observes the same pending entry receives a handle to the
/// *same* underlying operation. Awaiting the handle completes once the entry
/// has settled, yielding the settled [`CacheEntry`], after which a retried
/// [`Resource::read`] observes the terminal state.
///
/// Dropping all handles does not cancel the load. It runs to completion and
/// settles its entry regardless of whether anyone is still listening.
pub struct LoadHandle<T> {
    generation: u64,
    channel: LoadChannel<T>,
}

impl<T> Clone for LoadHandle<T> {
    fn clone(&self) -> Self {
        LoadHandle {
            generation: self.generation,
            channel: self.channel.clone(),
        }
    }
}

impl<T> fmt::Debug for LoadHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Two handles compare equal iff they reference the same load operation.
impl<T> PartialEq for LoadHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl<T> Eq for LoadHandle<T> {}

impl<T> Future for LoadHandle<T> {
    type Output = CacheEntry<Arc<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.channel).poll(cx).map(|settled| {
            // The sender is dropped without sending only if the load task was
            // torn down, e.g. during runtime shutdown.
            settled.unwrap_or(Err(CacheError::Internal))
        })
    }
}

/// The outcome of a single [`Resource::read`].
///
/// This is the tagged-result rendition of suspense: instead of raising the
/// pending or failure state as control flow, `read` hands it to the caller,
/// whose scheduler interprets [`Pending`](ReadOutcome::Pending) as the point
/// to pause and retry after the handle settles.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    /// The entry is still loading. Await the handle, then retry the read.
    Pending(LoadHandle<T>),
    /// The entry is resolved. Every read of this key returns the same value.
    Value(Arc<T>),
    /// The entry is rejected. Every read of this key surfaces the same error
    /// for the life of the entry; there is no retry or invalidation.
    Failure(CacheError),
}

impl<T> ReadOutcome<T> {
    /// Whether this read hit a still-pending entry.
    pub fn is_pending(&self) -> bool {
        matches!(self, ReadOutcome::Pending(_))
    }

    /// Returns the settled entry, or `None` if the entry is still pending.
    pub fn settled(self) -> Option<CacheEntry<Arc<T>>> {
        match self {
            ReadOutcome::Pending(_) => None,
            ReadOutcome::Value(value) => Some(Ok(value)),
            ReadOutcome::Failure(error) => Some(Err(error)),
        }
    }
}

/// One slot in a family's entry map.
///
/// State transitions are monotonic: an entry is created `Pending` and settles
/// exactly once, into a resolved or rejected [`CacheEntry`]. It is never
/// reverted, recomputed, or mutated after that; [`ResourceCache::clear`] can
/// only drop it wholesale.
enum Entry<T> {
    Pending(LoadHandle<T>),
    Settled(CacheEntry<Arc<T>>),
}

impl<T> Entry<T> {
    fn outcome(&self) -> ReadOutcome<T> {
        match self {
            Entry::Pending(handle) => ReadOutcome::Pending(handle.clone()),
            Entry::Settled(Ok(value)) => ReadOutcome::Value(Arc::clone(value)),
            Entry::Settled(Err(error)) => ReadOutcome::Failure(error.clone()),
        }
    }
}

struct ResourceInner<I, T> {
    family: Arc<str>,
    loader: Loader<I, T>,
    entries: Mutex<BTreeMap<CacheKey, Entry<T>>>,
}

/// A named, parameterized handle to deduplicated, cached asynchronous values.
///
/// Created via [`ResourceCache::create_resource`]. Each resource owns the
/// entries of its family; the [`CacheKey`] namespaces them by family name, so
/// keys are unambiguous even across resources.
///
/// `I` is the loader input, which doubles as the cache key via its `Display`
/// rendering. `T` is the loaded value.
pub struct Resource<I, T> {
    inner: Arc<ResourceInner<I, T>>,
}

impl<I, T> Clone for Resource<I, T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Resource {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, T> fmt::Debug for Resource<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .entries
            .try_lock()
            .map(|e| e.len())
            .unwrap_or_default();
        f.debug_struct("Resource")
            .field("family", &self.inner.family)
            .field("entries", &entries)
            .finish()
    }
}

impl<I, T> Resource<I, T>
where
    I: fmt::Display + 'static,
    T: Send + Sync + 'static,
{
    /// Reads the cached value for `input`.
    ///
    /// On the first call for a key this creates the entry and starts the
    /// loader, exactly once; concurrent reads of the same key coalesce onto
    /// that one operation. The result reports the entry's current state, see
    /// [`ReadOutcome`].
    ///
    /// Must be called within a Tokio runtime context, as the load is driven
    /// by a spawned task.
    pub fn read(&self, input: I) -> ReadOutcome<T> {
        let key = CacheKey::new(&self.inner.family, &input);

        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get(&key) {
            return entry.outcome();
        }
        ReadOutcome::Pending(self.start_load(&mut entries, key, input))
    }

    /// Starts the load for `input` without surfacing anything.
    ///
    /// Purely a side-effecting warm-up for speculative loading (e.g. on
    /// hover), before the value is actually needed. A no-op if the entry
    /// already exists in any state.
    pub fn preload(&self, input: I) {
        let key = CacheKey::new(&self.inner.family, &input);

        let mut entries = self.inner.entries.lock().unwrap();
        if entries.contains_key(&key) {
            return;
        }
        self.start_load(&mut entries, key, input);
    }

    /// Reads the cached value for `input`, waiting for settlement if the
    /// entry is still pending.
    ///
    /// This is the convenience for callers without a suspension-aware
    /// scheduler of their own.
    pub async fn load(&self, input: I) -> CacheEntry<Arc<T>> {
        match self.read(input) {
            ReadOutcome::Value(value) => Ok(value),
            ReadOutcome::Failure(error) => Err(error),
            ReadOutcome::Pending(handle) => handle.await,
        }
    }

    /// The name of this resource family.
    pub fn family(&self) -> &str {
        &self.inner.family
    }

    /// The number of entries currently cached for this family, in any state.
    pub fn entry_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    /// Creates the `Pending` entry for `key` and spawns the load task.
    ///
    /// The caller holds the entry map lock, which makes checking for an
    /// existing entry and storing the new one atomic: no second load can be
    /// started for the same key in between.
    fn start_load(
        &self,
        entries: &mut BTreeMap<CacheKey, Entry<T>>,
        key: CacheKey,
        input: I,
    ) -> LoadHandle<T> {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let handle = LoadHandle {
            generation,
            channel: rx.shared(),
        };

        tracing::trace!(key = %key, "starting load");

        // The entry is registered before the task can run, so a loader that
        // completes immediately still finds its slot to settle.
        entries.insert(key.clone(), Entry::Pending(handle.clone()));

        let future = (self.inner.loader)(input);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let settled = future.await.map(Arc::new);

            {
                let mut entries = inner.entries.lock().unwrap();
                match entries.get_mut(&key) {
                    Some(slot)
                        if matches!(&*slot, Entry::Pending(h) if h.generation == generation) =>
                    {
                        tracing::trace!(key = %key, ok = settled.is_ok(), "load settled");
                        *slot = Entry::Settled(settled.clone());
                    }
                    // The entry was cleared (and possibly re-created) while
                    // this load was in flight. Its result must not resurrect
                    // or overwrite the current state.
                    _ => tracing::trace!(key = %key, "discarding load for cleared entry"),
                }
            }

            // Send only after the entry is terminal, so a waiter that retries
            // its read upon waking observes the settled state.
            tx.send(settled).ok();
        });

        handle
    }
}

struct Family {
    name: Arc<str>,
    clear: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct CacheShared {
    families: Mutex<Vec<Family>>,
}

/// An explicit cache of [`Resource`] families.
///
/// The cache owns no entries itself; each resource created from it holds its
/// own family map. What the cache owns is the *lifecycle*: construction via
/// [`new`](Self::new), and [`clear`](Self::clear) over every family at once.
/// It is meant to be constructed by the surrounding application and injected
/// wherever resources are created, instead of living in global state.
///
/// Cloning is cheap and clones share the same registry.
#[derive(Clone, Default)]
pub struct ResourceCache {
    shared: Arc<CacheShared>,
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let families: Vec<String> = self
            .shared
            .families
            .try_lock()
            .map(|families| families.iter().map(|f| f.name.to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("ResourceCache")
            .field("families", &families)
            .finish()
    }
}

impl ResourceCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new [`Resource`] family backed by this cache.
    ///
    /// `loader` produces the value for a given input. The cache stores
    /// whatever it produces without interpreting it: success and failure are
    /// both cached, permanently, on first settlement. Loader inputs must
    /// render to a stable string ([`fmt::Display`]), which forms the
    /// [`CacheKey`] together with `family`.
    pub fn create_resource<I, T, L, F>(&self, family: &str, loader: L) -> Resource<I, T>
    where
        I: fmt::Display + 'static,
        T: Send + Sync + 'static,
        L: Fn(I) -> F + Send + Sync + 'static,
        F: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let family: Arc<str> = family.into();
        let inner = Arc::new(ResourceInner {
            family: Arc::clone(&family),
            loader: Box::new(move |input| loader(input).boxed()),
            entries: Mutex::new(BTreeMap::new()),
        });

        let mut families = self.shared.families.lock().unwrap();
        if families.iter().any(|f| f.name == family) {
            tracing::warn!(
                family = %family,
                "resource family name registered twice, cache keys may collide"
            );
        }
        families.push(Family {
            name: family,
            clear: clear_hook(&inner),
        });

        Resource { inner }
    }

    /// Drops every entry in every family created from this cache.
    ///
    /// Loads that are in flight when `clear` runs go on to completion, but
    /// their results are discarded rather than re-inserted; the next read for
    /// such a key starts a fresh load.
    pub fn clear(&self) {
        let families = self.shared.families.lock().unwrap();
        tracing::debug!(families = families.len(), "clearing resource cache");
        for family in families.iter() {
            (family.clear)();
        }
    }
}

/// Type-erases a family's entry map into its clear operation.
///
/// Holds only a [`Weak`] reference, so the registry does not keep entries of
/// dropped resources alive.
fn clear_hook<I, T>(inner: &Arc<ResourceInner<I, T>>) -> Box<dyn Fn() + Send + Sync>
where
    I: 'static,
    T: Send + Sync + 'static,
{
    let inner: Weak<ResourceInner<I, T>> = Arc::downgrade(inner);
    Box::new(move || {
        if let Some(inner) = inner.upgrade() {
            inner.entries.lock().unwrap().clear();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::delay::delayed;
    use crate::testutils;

    use super::*;

    /// A loader serving canned posts after a simulated network delay,
    /// counting its invocations.
    fn posts_loader(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn(&'static str) -> BoxFuture<'static, CacheEntry<Vec<String>>> + use<> {
        let calls = Arc::clone(calls);
        move |_id| {
            calls.fetch_add(1, Ordering::SeqCst);
            let outcome: CacheEntry<Vec<String>> = Ok(vec!["a".to_string(), "b".to_string()]);
            delayed(Duration::from_millis(200), outcome).boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_suspends_then_resolves() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let posts = cache.create_resource("posts:1", posts_loader(&calls));

        let ReadOutcome::Pending(handle) = posts.read("") else {
            panic!("first read must suspend");
        };
        assert_eq!(handle.await.unwrap().as_slice(), ["a", "b"]);

        // After settlement the retried read observes the resolved value.
        let ReadOutcome::Value(value) = posts.read("") else {
            panic!("read after settlement must resolve");
        };
        assert_eq!(value.as_slice(), ["a", "b"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_coalesce() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let posts = cache.create_resource("posts", posts_loader(&calls));

        let (first, second) = (posts.read("x"), posts.read("x"));
        let (ReadOutcome::Pending(a), ReadOutcome::Pending(b)) = (first, second) else {
            panic!("both reads must suspend");
        };
        // Both handles reference the same underlying operation, and the
        // loader ran exactly once.
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (a, b) = futures::join!(a, b);
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));

        // Every subsequent read returns the very same value.
        match posts.read("x") {
            ReadOutcome::Value(value) => assert!(Arc::ptr_eq(&value, &a)),
            outcome => panic!("unexpected outcome: {outcome:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_cached_permanently() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let comments = cache.create_resource("comments", {
            let calls = Arc::clone(&calls);
            move |_id: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                let outcome: CacheEntry<Vec<String>> =
                    Err(CacheError::Fetch("network error".to_string()));
                delayed(Duration::from_millis(100), outcome)
            }
        });

        let ReadOutcome::Pending(handle) = comments.read(42) else {
            panic!("first read must suspend");
        };
        assert_eq!(
            handle.await,
            Err(CacheError::Fetch("network error".to_string()))
        );

        // No retry, no invalidation: the same failure, forever.
        for _ in 0..3 {
            let ReadOutcome::Failure(error) = comments.read(42) else {
                panic!("read after rejection must fail");
            };
            assert_eq!(error, CacheError::Fetch("network error".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_warms_silently() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let posts = cache.create_resource("posts", posts_loader(&calls));

        posts.preload("x");
        assert_eq!(posts.entry_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Preloading again is a no-op in any entry state.
        posts.preload("x");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A read coalesces with the load the preload started.
        let ReadOutcome::Pending(handle) = posts.read("x") else {
            panic!("read must coalesce with the preload");
        };
        handle.await.unwrap();
        assert!(matches!(posts.read("x"), ReadOutcome::Value(_)));

        posts.preload("x");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_inputs_load_independently() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let user = cache.create_resource("user", {
            let calls = Arc::clone(&calls);
            move |id: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                let outcome: CacheEntry<String> = Ok(format!("user {id}"));
                delayed(Duration::from_millis(50), outcome)
            }
        });

        let (one, two) = futures::join!(user.load(1), user.load(2));
        assert_eq!(*one.unwrap(), "user 1");
        assert_eq!(*two.unwrap(), "user 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(user.entry_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_waits_for_settlement() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let posts = cache.create_resource("posts", posts_loader(&calls));

        let first = posts.load("x").await.unwrap();
        let second = posts.load("x").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_all_families() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let posts = cache.create_resource("posts", posts_loader(&calls));
        let comments = cache.create_resource("comments", posts_loader(&calls));

        posts.load("x").await.unwrap();
        comments.load("y").await.unwrap();
        assert_eq!(posts.entry_count(), 1);
        assert_eq!(comments.entry_count(), 1);

        cache.clear();
        assert_eq!(posts.entry_count(), 0);
        assert_eq!(comments.entry_count(), 0);

        // The next read starts over.
        posts.load("x").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_in_flight_load() {
        testutils::setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ResourceCache::new();
        let posts = cache.create_resource("posts", posts_loader(&calls));

        let ReadOutcome::Pending(handle) = posts.read("x") else {
            panic!("first read must suspend");
        };
        cache.clear();
        assert_eq!(posts.entry_count(), 0);

        // The operation itself still runs to completion and its handle
        // settles, but the result is not resurrected into the map.
        handle.await.unwrap();
        assert_eq!(posts.entry_count(), 0);

        assert!(posts.read("x").is_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
