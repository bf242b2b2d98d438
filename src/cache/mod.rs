//! Support for caching connections.

use log::trace;
use lru::LruCache;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hash;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Represents the key of a flow, the destination and the source port of the device side.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FlowKey {
    dst: SocketAddrV4,
    src_port: u16,
}

impl FlowKey {
    /// Creates a new `FlowKey`.
    pub fn new(dst: SocketAddrV4, src_port: u16) -> FlowKey {
        FlowKey { dst, src_port }
    }

    /// Returns the destination of the flow.
    pub fn dst(&self) -> SocketAddrV4 {
        self.dst
    }

    /// Returns the source port of the flow.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.dst, self.src_port)
    }
}

/// Represents the close signal of a connection. Closing is idempotent and wakes every task
/// waiting on the connection.
#[derive(Debug, Default)]
pub struct Closer {
    closed: AtomicBool,
    notify: Notify,
}

impl Closer {
    /// Creates a new `Closer`.
    pub fn new() -> Closer {
        Closer::default()
    }

    /// Closes and returns if this call did close.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }

        first
    }

    /// Returns if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Represents the hook which releases the resources of an entry leaving the table.
pub type Cleanup<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Represents the predicate which tells if an entry may be evicted before the least
/// recently used one.
pub type EvictPredicate<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

/// Represents a capacity-bounded connection table ordered by recency of access. When an
/// insertion overflows the table, the least recently used entry satisfying the early
/// eviction predicate is evicted, or the least recently used entry if none does. Cleanup
/// hooks always run after the table lock is released.
pub struct ConnectionTable<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, V>>,
    capacity: usize,
    cleanup: Cleanup<K, V>,
    can_evict_early: EvictPredicate<V>,
}

impl<K: Hash + Eq + Clone, V: Clone> ConnectionTable<K, V> {
    /// Creates a new `ConnectionTable`.
    pub fn new<C, P>(capacity: usize, cleanup: C, can_evict_early: P) -> ConnectionTable<K, V>
    where
        C: Fn(&K, &V) + Send + Sync + 'static,
        P: Fn(&V) -> bool + Send + Sync + 'static,
    {
        ConnectionTable {
            entries: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
            cleanup: Box::new(cleanup),
            can_evict_early: Box::new(can_evict_early),
        }
    }

    fn entries(&self) -> MutexGuard<LruCache<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry of the key and marks it as the most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries().get(key).cloned()
    }

    /// Returns if the table contains the key, without touching the recency order.
    pub fn contains(&self, key: &K) -> bool {
        self.entries().contains(key)
    }

    /// Inserts an entry as the most recently used one. Returns the entry evicted to keep the
    /// table within its capacity, whose cleanup has already run.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        let (replaced, evicted) = {
            let mut entries = self.entries();
            let replaced = entries.push(key, value);
            let evicted = if entries.len() > self.capacity {
                let early = entries
                    .iter()
                    .rev()
                    .find(|(_, v)| (self.can_evict_early)(*v))
                    .map(|(k, _)| k.clone());
                match early {
                    Some(k) => entries.pop_entry(&k),
                    None => entries.pop_lru(),
                }
            } else {
                None
            };

            (replaced, evicted)
        };

        // A replaced value left the table under the same key
        if let Some((k, v)) = replaced {
            (self.cleanup)(&k, &v);
        }
        if let Some((ref k, ref v)) = evicted {
            trace!("evict connection");
            (self.cleanup)(k, v);
        }

        evicted
    }

    /// Removes the entry of the key without running its cleanup.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries().pop(key)
    }

    /// Removes the entry of the key and runs its cleanup. Closing an absent key does
    /// nothing. Returns if an entry was closed.
    pub fn close(&self, key: &K) -> bool {
        let entry = self.entries().pop_entry(key);
        match entry {
            Some((k, v)) => {
                (self.cleanup)(&k, &v);
                true
            }
            None => false,
        }
    }

    /// Closes the entry of the key only if it matches, so a stale handle never closes a
    /// newer entry stored under the same key.
    pub fn close_if<P>(&self, key: &K, predicate: P) -> bool
    where
        P: FnOnce(&V) -> bool,
    {
        let entry = {
            let mut entries = self.entries();
            if entries.peek(key).map_or(false, predicate) {
                entries.pop_entry(key)
            } else {
                None
            }
        };
        match entry {
            Some((k, v)) => {
                (self.cleanup)(&k, &v);
                true
            }
            None => false,
        }
    }

    /// Removes every entry and runs their cleanup. Returns the number of entries closed.
    pub fn close_all(&self) -> usize {
        let mut drained = Vec::new();
        {
            let mut entries = self.entries();
            while let Some(entry) = entries.pop_lru() {
                drained.push(entry);
            }
        }

        for (k, v) in drained.iter() {
            (self.cleanup)(k, v);
        }

        drained.len()
    }

    /// Returns the entries of the table, from the least to the most recently used.
    pub fn values(&self) -> Vec<V> {
        self.entries().iter().rev().map(|(_, v)| v.clone()).collect()
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Returns the capacity of the table.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Debug for ConnectionTable<K, V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
fn counting_table(
    capacity: usize,
    evictable: &'static [u32],
) -> (
    ConnectionTable<u32, u32>,
    std::sync::Arc<std::sync::Mutex<Vec<u32>>>,
) {
    use std::sync::Arc;

    let closed = Arc::new(Mutex::new(Vec::new()));
    let closed_cloned = Arc::clone(&closed);
    let table = ConnectionTable::new(
        capacity,
        move |k: &u32, _: &u32| closed_cloned.lock().unwrap().push(*k),
        move |v: &u32| evictable.contains(v),
    );

    (table, closed)
}

#[test]
fn table_evict_lru() {
    let (table, closed) = counting_table(3, &[]);
    for i in 0..3 {
        assert!(table.put(i, i).is_none());
    }
    assert_eq!(table.len(), 3);

    let evicted = table.put(3, 3);
    assert_eq!(evicted, Some((0, 0)));
    assert_eq!(table.len(), 3);
    assert_eq!(*closed.lock().unwrap(), vec![0]);
}

#[test]
fn table_get_promotes() {
    let (table, closed) = counting_table(3, &[]);
    for i in 0..3 {
        table.put(i, i);
    }
    assert_eq!(table.get(&0), Some(0));

    table.put(3, 3);
    assert!(table.contains(&0));
    assert!(!table.contains(&1));
    assert_eq!(*closed.lock().unwrap(), vec![1]);
    assert_eq!(table.values(), vec![2, 0, 3]);
}

#[test]
fn table_evict_early() {
    let (table, closed) = counting_table(4, &[2, 3]);
    for i in 0..4 {
        table.put(i, i);
    }

    // The least recent entry satisfying the predicate goes first
    assert_eq!(table.put(4, 4), Some((2, 2)));
    assert_eq!(table.put(5, 5), Some((3, 3)));
    // No candidate left, fall back to the least recent entry
    assert_eq!(table.put(6, 6), Some((0, 0)));
    assert_eq!(table.len(), 4);
    assert_eq!(*closed.lock().unwrap(), vec![2, 3, 0]);
}

#[test]
fn table_close_idempotent() {
    let (table, closed) = counting_table(4, &[]);
    table.put(1, 1);

    assert!(table.close(&1));
    assert!(!table.close(&1));
    assert!(!table.close(&2));
    assert_eq!(*closed.lock().unwrap(), vec![1]);
    assert!(table.is_empty());
}

#[test]
fn table_remove_skips_cleanup() {
    let (table, closed) = counting_table(4, &[]);
    table.put(1, 10);
    table.put(2, 20);

    assert_eq!(table.remove(&1), Some(10));
    assert_eq!(table.remove(&1), None);
    assert!(closed.lock().unwrap().is_empty());
    assert_eq!(table.len(), 1);
}

#[test]
fn table_close_all() {
    let (table, closed) = counting_table(8, &[]);
    for i in 0..5 {
        table.put(i, i);
    }

    assert_eq!(table.close_all(), 5);
    assert!(table.is_empty());
    assert_eq!(*closed.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(table.close_all(), 0);
}

#[test]
fn table_concurrent_put() {
    use std::sync::Arc;
    use std::thread;

    let (table, closed) = counting_table(16, &[]);
    let table = Arc::new(table);
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..100 {
                    table.put(t * 1000 + i, i);
                    assert!(table.len() <= 16);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.len(), 16);
    assert_eq!(closed.lock().unwrap().len(), 400 - 16);
}

#[test]
fn table_close_if() {
    let (table, closed) = counting_table(4, &[]);
    table.put(1, 10);

    assert!(!table.close_if(&1, |v| *v == 11));
    assert!(table.contains(&1));
    assert!(table.close_if(&1, |v| *v == 10));
    assert!(!table.close_if(&1, |_| true));
    assert_eq!(*closed.lock().unwrap(), vec![1]);
}

#[test]
fn flow_key_display() {
    let key = FlowKey::new("93.184.216.34:80".parse().unwrap(), 50000);
    assert_eq!(format!("{}", key), "93.184.216.34:80:50000");
}

#[tokio::test]
async fn closer_wakes_waiters() {
    use std::sync::Arc;

    let closer = Arc::new(Closer::new());
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let closer = Arc::clone(&closer);
            tokio::spawn(async move { closer.closed().await })
        })
        .collect();
    tokio::task::yield_now().await;

    assert!(closer.close());
    assert!(!closer.close());
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert!(closer.is_closed());
    // Already closed, returns at once
    closer.closed().await;
}
