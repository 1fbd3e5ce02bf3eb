//! Transaction ID sources for the LLMNR client and the NBNS challenger.
//!
//! IDs only need to be unpredictable enough to avoid accidental reuse;
//! responses are also filtered by the pending-query map or the
//! responder address, so collisions are harmless.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

/// Supplier of 16-bit transaction IDs
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> u16;
}

/// Draws IDs from a process-wide generator seeded once from OS entropy
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

fn process_rng() -> &'static Mutex<StdRng> {
    static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();
    RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

impl IdSource for RandomIds {
    fn next_id(&self) -> u16 {
        process_rng().lock().gen()
    }
}

/// Hands out consecutive IDs; deterministic for tests and replay
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU16,
}

impl SequentialIds {
    pub fn starting_at(first: u16) -> Self {
        SequentialIds {
            next: AtomicU16::new(first),
        }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
