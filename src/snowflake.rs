/**
 * Snowflake ID Generator
 *
 * Produces sortable, globally-unique 64-bit IDs that stamp every event and
 * record in the system. Each ID encodes its creation time, the process that
 * produced it, and an intra-millisecond counter.
 *
 * # Bit Layout (high to low)
 *
 * - 42 bits: milliseconds since the service epoch (2024-09-05T00:00:00Z)
 * - 5 bits: worker index (process within a host)
 * - 5 bits: server index (host)
 * - 12 bits: intra-millisecond counter
 *
 * # Ordering
 *
 * Numeric order of IDs from a single generator is strictly monotonic.
 * Lexicographic order of the decimal string is NOT monotonic; callers must
 * compare numerically.
 */

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Service epoch: 2024-09-05T00:00:00Z in milliseconds since the Unix epoch.
pub const SNOWFLAKE_EPOCH_MS: u64 = 1_725_494_400_000;

const WORKER_BITS: u64 = 5;
const SERVER_BITS: u64 = 5;
const COUNTER_BITS: u64 = 12;

const WORKER_SHIFT: u64 = SERVER_BITS + COUNTER_BITS;
const TIMESTAMP_SHIFT: u64 = WORKER_BITS + SERVER_BITS + COUNTER_BITS;

const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;
const MAX_WORKER: u64 = (1 << WORKER_BITS) - 1;
const MAX_SERVER: u64 = (1 << SERVER_BITS) - 1;

/// Decoded components of a snowflake ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    /// Milliseconds since the Unix epoch (absolute, not service-epoch relative)
    pub timestamp_ms: u64,
    /// Server (host) index
    pub server_id: u8,
    /// Worker (process) index
    pub worker_id: u8,
    /// Intra-millisecond counter
    pub counter: u16,
}

/// Snowflake ID generator
///
/// One instance per worker process. The `(server_id, worker_id)` pair must
/// not be reused across live processes; both are fixed at startup.
///
/// `generate()` cannot fail: clock regressions and counter exhaustion are
/// absorbed by waiting for the next millisecond.
pub struct SnowflakeGenerator {
    server_id: u64,
    worker_id: u64,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_timestamp: u64,
    counter: u64,
}

impl SnowflakeGenerator {
    /// Create a generator for the given server/worker indices.
    ///
    /// Indices are masked to their 5-bit fields.
    pub fn new(server_id: u16, worker_id: u16) -> Self {
        Self {
            server_id: u64::from(server_id) & MAX_SERVER,
            worker_id: u64::from(worker_id) & MAX_WORKER,
            state: Mutex::new(GeneratorState {
                last_timestamp: 0,
                counter: 0,
            }),
        }
    }

    /// Generate the next ID.
    ///
    /// Within a single millisecond the counter increases strictly; when it
    /// would exceed 2^12 - 1 the generator busy-waits until the next
    /// millisecond and resets. A clock reading behind the last observed
    /// timestamp is treated the same way.
    pub fn generate(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut now = current_millis().saturating_sub(SNOWFLAKE_EPOCH_MS);
        if now < state.last_timestamp {
            now = state.last_timestamp;
        }

        if now == state.last_timestamp {
            if state.counter >= MAX_COUNTER {
                // Counter exhausted for this millisecond: spin to the next one.
                now = wait_next_millis(state.last_timestamp);
                state.counter = 0;
            } else {
                state.counter += 1;
            }
        } else {
            state.counter = 0;
        }
        state.last_timestamp = now;

        let id = (now << TIMESTAMP_SHIFT)
            | (self.worker_id << WORKER_SHIFT)
            | (self.server_id << COUNTER_BITS)
            | state.counter;
        id as i64
    }

    /// Decompose an ID into its parts.
    pub fn parse(id: i64) -> SnowflakeParts {
        let id = id as u64;
        SnowflakeParts {
            timestamp_ms: (id >> TIMESTAMP_SHIFT) + SNOWFLAKE_EPOCH_MS,
            worker_id: ((id >> WORKER_SHIFT) & MAX_WORKER) as u8,
            server_id: ((id >> COUNTER_BITS) & MAX_SERVER) as u8,
            counter: (id & MAX_COUNTER) as u16,
        }
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn wait_next_millis(last: u64) -> u64 {
    loop {
        let now = current_millis().saturating_sub(SNOWFLAKE_EPOCH_MS);
        if now > last {
            return now;
        }
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_strictly_increasing() {
        let gen = SnowflakeGenerator::new(1, 1);
        let mut last = gen.generate();
        for _ in 0..10_000 {
            let id = gen.generate();
            assert!(id > last, "expected {} > {}", id, last);
            last = id;
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let gen = SnowflakeGenerator::new(2, 3);
        let mut seen = HashSet::new();
        for _ in 0..50_000 {
            assert!(seen.insert(gen.generate()));
        }
    }

    #[test]
    fn test_parse_recovers_origin() {
        let gen = SnowflakeGenerator::new(7, 12);
        let before = current_millis();
        let id = gen.generate();
        let after = current_millis();

        let parts = SnowflakeGenerator::parse(id);
        assert_eq!(parts.server_id, 7);
        assert_eq!(parts.worker_id, 12);
        assert!(parts.timestamp_ms >= before && parts.timestamp_ms <= after);
    }

    #[test]
    fn test_counter_increments_within_same_millisecond() {
        let gen = SnowflakeGenerator::new(0, 0);
        let a = gen.generate();
        let b = gen.generate();
        let pa = SnowflakeGenerator::parse(a);
        let pb = SnowflakeGenerator::parse(b);
        if pa.timestamp_ms == pb.timestamp_ms {
            assert_eq!(pb.counter, pa.counter + 1);
        } else {
            assert_eq!(pb.counter, 0);
        }
    }

    #[test]
    fn test_indices_masked_to_five_bits() {
        let gen = SnowflakeGenerator::new(63, 40);
        let parts = SnowflakeGenerator::parse(gen.generate());
        assert_eq!(parts.server_id, 63 & 0x1F);
        assert_eq!(parts.worker_id, 40 & 0x1F);
    }

    #[test]
    fn test_counter_overflow_rolls_to_next_millisecond() {
        let gen = SnowflakeGenerator::new(0, 0);
        // Exhaust more than one millisecond's worth of counter space.
        let mut last_ts = 0;
        let mut rollovers = 0;
        for _ in 0..(MAX_COUNTER * 3) {
            let parts = SnowflakeGenerator::parse(gen.generate());
            assert!(parts.counter <= MAX_COUNTER as u16);
            if parts.timestamp_ms != last_ts {
                last_ts = parts.timestamp_ms;
                rollovers += 1;
            }
        }
        assert!(rollovers >= 1);
    }
}
