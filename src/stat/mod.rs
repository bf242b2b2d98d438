//! Support for statistics.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Represents the traffic statistics.
#[derive(Clone, Debug, Default)]
pub struct Traffic {
    size: Arc<AtomicUsize>,
    count: Arc<AtomicUsize>,
}

impl Traffic {
    /// Creates a new `Traffic`.
    pub fn new() -> Traffic {
        Traffic {
            size: Arc::new(AtomicUsize::new(0)),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Records a packet of the given size.
    pub fn add(&self, size: usize) {
        self.size.fetch_add(size, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the data size of the traffic.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Returns the packet count of the traffic.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Display for Traffic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} packets ({} Bytes)", self.count(), self.size())
    }
}

#[test]
fn traffic_add() {
    let traffic = Traffic::new();
    let cloned = traffic.clone();
    cloned.add(60);
    cloned.add(1500);

    assert_eq!(traffic.count(), 2);
    assert_eq!(traffic.size(), 1560);
    assert_eq!(format!("{}", traffic), "2 packets (1560 Bytes)");
}
