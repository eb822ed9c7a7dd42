//! UUID generation that can be made deterministic for tests and development.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use uuid::Uuid;

static SEEDED: Mutex<Option<StdRng>> = Mutex::new(None);

/// Switch generation to a seeded sequence. A zero seed restores random v4 UUIDs.
pub fn seed(seed: u64) {
    let mut guard = SEEDED.lock().expect("uuid generator poisoned");
    *guard = if seed == 0 {
        None
    } else {
        Some(StdRng::seed_from_u64(seed))
    };
}

/// Generate a new v4 UUID, from the seeded sequence when one is configured.
pub fn new_v4() -> Uuid {
    let mut guard = SEEDED.lock().expect("uuid generator poisoned");
    match guard.as_mut() {
        Some(rng) => {
            let mut bytes = [0u8; 16];
            rng.fill_bytes(&mut bytes);
            uuid::Builder::from_random_bytes(bytes).into_uuid()
        }
        None => Uuid::new_v4(),
    }
}
