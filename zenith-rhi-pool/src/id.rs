use std::sync::atomic::{AtomicU64, Ordering};
use derive_more::Display;

/// Process-unique identity of a pool or resource, used as registry key.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}
