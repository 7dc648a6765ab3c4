//! Identifier generation.

use junction_protocol::Id;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest identifier (2^53), so ids survive JSON number round-trips.
pub const MAX_ID: Id = 1 << 53;

/// Draw a random global-scope identifier.
#[must_use]
pub fn global_id() -> Id {
    rand::thread_rng().gen_range(1..=MAX_ID)
}

/// Sequential identifiers for router- and session-scope ids.
#[derive(Debug, Default)]
pub struct IdSequence(AtomicU64);

impl IdSequence {
    /// Create a sequence starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier, wrapping back to 1 after [`MAX_ID`].
    pub fn next(&self) -> Id {
        self.0.fetch_add(1, Ordering::Relaxed) % MAX_ID + 1
    }
}
