//  Implementation of the `Broker`.

use core::{
    fmt,
    hash::{BuildHasher, Hasher},
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use lock_api::RwLock;
use parking_lot::RawRwLock;

use crate::{
    error::BrokerError,
    hash::DefaultMurmurBuildHasher,
    tree::{Tree, NODE_HASH_MASK},
    value::Value,
};

/// A string identifier broker.
///
/// The broker assigns a stable, small, dense `Value` to each distinct byte string it is shown, and supports cheap
/// lookup in both directions. It is designed to be shared across threads: queries take a read lock, insertions a
/// write lock, and the lock implementation itself is chosen by the embedder through the `R` type parameter.
pub struct Broker<H = DefaultMurmurBuildHasher, R = RawRwLock>
where
    R: lock_api::RawRwLock,
{
    hasher: H,
    counters: Counters,
    tree: RwLock<R, Tree>,
}

impl Broker {
    /// Creates a new Broker, with default configuration.
    ///
    /// The default configuration hashes with the built-in Murmur variant and locks with `parking_lot`. To customize
    /// either, use the `with_hasher` method and the `R` type parameter instead.
    pub fn new() -> Self {
        Self::with_hasher(DefaultMurmurBuildHasher::default())
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, R> Broker<H, R>
where
    R: lock_api::RawRwLock,
{
    /// Creates a new Broker using this specific hasher.
    ///
    /// Any state the embedder wants available during hashing or locking travels inside the hasher or the raw lock,
    /// rather than through a separate user-data pointer.
    pub fn with_hasher(hasher: H) -> Self {
        let counters = Counters::new(mem::size_of::<Self>());

        Self {
            hasher,
            counters,
            tree: RwLock::new(Tree::new()),
        }
    }

    /// Gets the bytes associated with a previously assigned value.
    ///
    /// Returns an error if the value was never assigned by this broker. `Value::EMPTY` always resolves to the empty
    /// slice, without taking the lock.
    ///
    /// The returned borrow remains valid until the broker is dropped: records are never freed nor mutated before
    /// then.
    ///
    /// #   Complexity
    ///
    /// O(number of records): there is no per-value index, the node pool is walked linearly under the read lock.
    pub fn resolve(&self, value: Value) -> Result<&[u8], BrokerError> {
        if Value::EMPTY == value {
            return Ok(EMPTY_BYTES);
        }

        let tree = self.tree.read();

        let bytes = tree.resolve(value).ok_or(BrokerError::NotFound)?;

        //  Safety:
        //  -   `bytes` borrows a record, and records are never destroyed, moved, nor mutated once linked, until the
        //      broker itself is dropped.
        //  -   The returned lifetime is tied to `self`, so the borrow cannot outlive the broker.
        let bytes = unsafe { &*(bytes as *const [u8]) };

        Ok(bytes)
    }

    /// Returns a snapshot of the usage counters.
    ///
    /// No lock is taken: the counters are relaxed atomics, maintained by insertions under the write lock.
    pub fn statistics(&self) -> Statistics {
        self.counters.snapshot()
    }
}

impl<H, R> Broker<H, R>
where
    H: BuildHasher,
    R: lock_api::RawRwLock,
{
    /// Checks whether a slice of bytes is interned, without interning it.
    ///
    /// Returns the value associated with the slice, or an error if the slice was never inserted. The empty slice is
    /// always `Value::EMPTY`, without taking the lock.
    ///
    /// The hash is computed outside the lock; the tree is then searched under the read lock.
    pub fn get_bytes(&self, bytes: &[u8]) -> Result<Value, BrokerError> {
        if bytes.is_empty() {
            return Ok(Value::EMPTY);
        }

        let hash = self.hash_bytes(bytes);

        self.tree.read().lookup(bytes, hash).ok_or(BrokerError::NotFound)
    }

    /// Checks whether a string is interned, without interning it.
    ///
    /// See `get_bytes`.
    pub fn get_str(&self, string: &str) -> Result<Value, BrokerError> {
        self.get_bytes(string.as_bytes())
    }

    /// Inserts a slice of bytes, unless an equal slice is already interned.
    ///
    /// Returns the value associated with the slice, existing or fresh. Fresh values are assigned densely, in
    /// insertion order, starting at 1. The empty slice is never stored and always maps to `Value::EMPTY`.
    ///
    /// The hash is computed outside the lock; the tree is searched, and possibly grown, under the write lock.
    pub fn insert_bytes(&self, bytes: &[u8]) -> Result<Value, BrokerError> {
        if bytes.is_empty() {
            return Ok(Value::EMPTY);
        }

        let hash = self.hash_bytes(bytes);

        self.tree.write().insert(bytes, hash, &self.counters)
    }

    /// Inserts a string, unless an equal string is already interned.
    ///
    /// See `insert_bytes`.
    pub fn insert_str(&self, string: &str) -> Result<Value, BrokerError> {
        self.insert_bytes(string.as_bytes())
    }

    //  Hashes the whole slice in one write, truncates to 32 bits, and clears the 6 bits reserved for the packed
    //  height.
    fn hash_bytes(&self, bytes: &[u8]) -> u32 {
        let mut hasher = self.hasher.build_hasher();

        hasher.write(bytes);

        (hasher.finish() as u32) & NODE_HASH_MASK
    }
}

impl<H, R> fmt::Debug for Broker<H, R>
where
    R: lock_api::RawRwLock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Broker").field("statistics", &self.statistics()).finish()
    }
}

/// Point-in-time usage counters of a `Broker`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Heap bytes attributed to the broker, its pool blocks, and its records.
    pub memory_size: usize,
    /// Number of live tree nodes, one per distinct masked hash.
    pub hashes_count: usize,
    /// Number of live records, one per distinct non-empty string.
    pub values_count: usize,
}

//
//  Implementation
//

const EMPTY_BYTES: &[u8] = &[];

//  Usage counters, readable without the lock.
//
//  All accesses are relaxed: the counters are monotonic and advisory, only written under the write lock, and a
//  snapshot is not required to be consistent with any particular in-flight insertion.
pub(crate) struct Counters {
    memory_size: AtomicUsize,
    nodes: AtomicUsize,
    records: AtomicUsize,
}

impl Counters {
    pub(crate) fn new(initial_memory: usize) -> Self {
        Self {
            memory_size: AtomicUsize::new(initial_memory),
            nodes: AtomicUsize::new(0),
            records: AtomicUsize::new(0),
        }
    }

    pub(crate) fn add_block(&self, size: usize) {
        self.memory_size.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn add_node(&self) {
        self.nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_record(&self, size: usize) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.memory_size.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        Statistics {
            memory_size: self.memory_size.load(Ordering::Relaxed),
            hashes_count: self.nodes.load(Ordering::Relaxed),
            values_count: self.records.load(Ordering::Relaxed),
        }
    }
}

#[doc(hidden)]
pub mod compile_tests {

    //  Bad enough it needs to be `pub`, there's really no sense in exposing it any further.
    #![allow(dead_code)]

    /// ```compile_fail,E0277
    /// fn ensure_send<T: Send>() {}
    ///
    /// struct NoSendH(std::rc::Rc<u32>);
    ///
    /// ensure_send::<strid::Broker<NoSendH>>();
    /// ```
    pub fn broker_not_send_if_hasher_not_send() {}

    /// ```compile_fail,E0277
    /// fn ensure_sync<T: Sync>() {}
    ///
    /// struct NoSyncH(std::cell::Cell<u32>);
    ///
    /// ensure_sync::<strid::Broker<NoSyncH>>();
    /// ```
    pub fn broker_not_sync_if_hasher_not_sync() {}
} // mod compile_tests

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicBool;

    use super::*;

    fn ensure_send<T: Send>() {}
    fn ensure_sync<T: Sync>() {}

    #[test]
    fn broker_send() {
        ensure_send::<Broker>();
    }

    #[test]
    fn broker_sync() {
        ensure_sync::<Broker>();
    }

    #[test]
    fn values_follow_insertion_order() {
        let broker = Broker::new();

        assert_eq!(Ok(Value::new(1)), broker.insert_str("one"));
        assert_eq!(Ok(Value::new(2)), broker.insert_str("two"));
        assert_eq!(Ok(Value::new(3)), broker.insert_str("three"));

        assert_eq!(Ok(Value::new(2)), broker.get_str("two"));
        assert_eq!(Ok(&b"three"[..]), broker.resolve(Value::new(3)));
    }

    #[test]
    fn duplicate_insertion_is_idempotent() {
        let broker = Broker::new();

        for word in ["one", "two", "three", "four", "five"] {
            broker.insert_str(word).unwrap();
        }

        let five = broker.insert_str("five").unwrap();
        let before = broker.statistics();

        assert_eq!(Ok(five), broker.insert_str("five"));

        let after = broker.statistics();

        assert_eq!(before, after);
        assert_eq!(5, after.values_count);
    }

    #[test]
    fn empty_string_identity() {
        let broker = Broker::new();

        assert_eq!(Ok(Value::EMPTY), broker.insert_str(""));
        assert_eq!(Ok(Value::EMPTY), broker.get_str(""));
        assert_eq!(Ok(&b""[..]), broker.resolve(Value::EMPTY));

        //  The empty string occupies no storage.
        assert_eq!(0, broker.statistics().values_count);
        assert_eq!(0, broker.statistics().hashes_count);
    }

    #[test]
    fn absent_lookups_report_not_found() {
        let broker = Broker::new();

        for word in ["one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten"] {
            broker.insert_str(word).unwrap();
        }

        broker.insert_str("").unwrap();

        assert_eq!(Err(BrokerError::NotFound), broker.get_str("eleven"));
        assert_eq!(Err(BrokerError::NotFound), broker.resolve(Value::new(100)));
    }

    #[test]
    fn lookup_does_not_intern() {
        let broker = Broker::new();

        assert_eq!(Err(BrokerError::NotFound), broker.get_str("ghost"));
        assert_eq!(0, broker.statistics().values_count);

        let value = broker.insert_str("ghost").unwrap();

        //  Idempotent from now on.
        assert_eq!(Ok(value), broker.get_str("ghost"));
        assert_eq!(Ok(value), broker.get_str("ghost"));
    }

    #[test]
    fn arbitrary_bytes_round_trip() {
        let broker = Broker::new();

        let bytes: &[u8] = &[0xff, 0x00, 0x80, 0x7f];

        let value = broker.insert_bytes(bytes).unwrap();

        assert_eq!(Ok(value), broker.get_bytes(bytes));
        assert_eq!(Ok(bytes), broker.resolve(value));
    }

    #[test]
    fn statistics_track_growth() {
        let broker = Broker::new();

        let initial = broker.statistics();

        assert_eq!(mem::size_of::<Broker>(), initial.memory_size);

        broker.insert_str("one").unwrap();

        let grown = broker.statistics();

        assert!(grown.memory_size > initial.memory_size);
        assert_eq!(1, grown.hashes_count);
        assert_eq!(1, grown.values_count);
    }

    #[test]
    fn ten_thousand_distinct_strings() {
        use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

        const NUMBER_STRINGS: usize = 10_000;

        let mut words: Vec<String> = (0..NUMBER_STRINGS).map(|i| format!("string-{i}")).collect();

        //  Fixed order: the seed pins the shuffle.
        words.shuffle(&mut StdRng::seed_from_u64(0x5EED));

        let broker = Broker::new();

        let mut values: Vec<u32> = words
            .iter()
            .map(|word| broker.insert_str(word).unwrap().get())
            .collect();

        //  (a) The fresh values are a permutation of 1..=N.
        values.sort_unstable();

        assert!(values.iter().copied().eq(1..=NUMBER_STRINGS as u32));

        //  (b) Every string round-trips, in both directions.
        for word in &words {
            let value = broker.get_str(word).unwrap();

            assert_eq!(Ok(word.as_bytes()), broker.resolve(value));
        }

        //  (c) The tree height honors the AVL bound.
        let bound = ((NUMBER_STRINGS as f64 + 2.0).log2() * 1.45).ceil() as i32;

        assert!(broker.tree.read().check_invariants() <= bound);
    }

    #[test]
    fn substituted_hasher() {
        let broker: Broker<fxhash::FxBuildHasher> = Broker::with_hasher(fxhash::FxBuildHasher::default());

        let one = broker.insert_str("one").unwrap();
        let two = broker.insert_str("two").unwrap();

        assert_eq!(Value::new(1), one);
        assert_eq!(Value::new(2), two);

        assert_eq!(Ok(one), broker.get_str("one"));
        assert_eq!(Ok(&b"two"[..]), broker.resolve(two));
    }

    //  A deliberately crude raw lock: every acquisition is exclusive.
    struct NaiveRawRwLock(AtomicBool);

    unsafe impl lock_api::RawRwLock for NaiveRawRwLock {
        #[allow(clippy::declare_interior_mutable_const)]
        const INIT: Self = Self(AtomicBool::new(false));

        type GuardMarker = lock_api::GuardSend;

        fn lock_shared(&self) {
            self.lock_exclusive();
        }

        fn try_lock_shared(&self) -> bool {
            self.try_lock_exclusive()
        }

        unsafe fn unlock_shared(&self) {
            //  Safety:
            //  -   Forwarded, shared acquisitions are exclusive here.
            unsafe { self.unlock_exclusive() }
        }

        fn lock_exclusive(&self) {
            while !self.try_lock_exclusive() {
                core::hint::spin_loop();
            }
        }

        fn try_lock_exclusive(&self) -> bool {
            self.0
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }

        unsafe fn unlock_exclusive(&self) {
            self.0.store(false, Ordering::Release);
        }
    }

    #[test]
    fn substituted_lock() {
        let broker: Broker<DefaultMurmurBuildHasher, NaiveRawRwLock> =
            Broker::with_hasher(DefaultMurmurBuildHasher::default());

        let one = broker.insert_str("one").unwrap();

        assert_eq!(Value::new(1), one);
        assert_eq!(Ok(one), broker.get_str("one"));
        assert_eq!(Ok(&b"one"[..]), broker.resolve(one));
    }
} // mod tests
