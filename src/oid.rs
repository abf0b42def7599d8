//! `_id` generation for documents that don't supply one.
//!
//! 12 bytes: 4-byte big-endian Unix seconds timestamp, 5-byte process-wide
//! pseudo-random value, 3-byte big-endian counter that increments
//! monotonically per process. The random component is generated once per
//! process and the counter is an atomic masked to 24 bits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

static PROCESS_RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: AtomicU32 = AtomicU32::new(0);

fn process_random() -> [u8; 5] {
    *PROCESS_RANDOM.get_or_init(|| {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    })
}

/// Generate a new, unique `_id` value.
pub fn generate() -> [u8; 12] {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    let random = process_random();
    // Masked to 24 bits and wrapped: a collision across a counter wraparound
    // within the same second and same process random value is not guarded
    // against elsewhere, consistent with ObjectId being a best-effort unique
    // identifier rather than a guaranteed one.
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

    let mut oid = [0u8; 12];
    oid[0..4].copy_from_slice(&secs.to_be_bytes());
    oid[4..9].copy_from_slice(&random);
    oid[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
    oid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct_and_monotonic_in_counter() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
        // counter occupies the last 3 bytes; same-second generation should
        // see it increase.
        if a[0..4] == b[0..4] && a[4..9] == b[4..9] {
            assert!(a[9..12] < b[9..12]);
        }
    }

    #[test]
    fn timestamp_prefix_matches_current_time() {
        let oid = generate();
        let mut secs_bytes = [0u8; 4];
        secs_bytes.copy_from_slice(&oid[0..4]);
        let secs = u32::from_be_bytes(secs_bytes);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        assert!(now.abs_diff(secs) <= 2);
    }
}
