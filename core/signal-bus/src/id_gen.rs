//! Snowflake-style unique identifiers for handler registrations
//!
//! Layout (high to low): 41 bits of milliseconds since [`EPOCH_MS`],
//! 5 bits datacenter, 5 bits machine, 12 bits per-millisecond sequence.

use crate::error::{Result, SignalError};
use parking_lot::Mutex;
use tracing::warn;

/// Custom epoch (2021-07-01T16:06:40Z)
pub const EPOCH_MS: i64 = 1_625_155_600_000;

const SEQUENCE_BITS: u32 = 12;
const MACHINE_ID_BITS: u32 = 5;
const DATACENTER_ID_BITS: u32 = 5;

const MAX_MACHINE_ID: u64 = (1 << MACHINE_ID_BITS) - 1;
const MAX_DATACENTER_ID: u64 = (1 << DATACENTER_ID_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

const MACHINE_ID_SHIFT: u32 = SEQUENCE_BITS;
const DATACENTER_ID_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS + DATACENTER_ID_BITS;

#[derive(Debug)]
struct State {
    last_ms: i64,
    sequence: u64,
}

/// Generates unique, monotonically increasing 64-bit ids
#[derive(Debug)]
pub struct IdGenerator {
    datacenter_id: u64,
    machine_id: u64,
    state: Mutex<State>,
}

impl IdGenerator {
    /// Create a generator for the given datacenter/machine pair (each 0..=31)
    pub fn new(datacenter_id: u64, machine_id: u64) -> Result<Self> {
        if datacenter_id > MAX_DATACENTER_ID || machine_id > MAX_MACHINE_ID {
            return Err(SignalError::InvalidConfig(format!(
                "datacenter id {datacenter_id} / machine id {machine_id} out of range 0..={MAX_MACHINE_ID}"
            )));
        }

        Ok(Self {
            datacenter_id,
            machine_id,
            state: Mutex::new(State {
                last_ms: -1,
                sequence: 0,
            }),
        })
    }

    /// Next id. Never returns a value lower than a previous one.
    pub fn next_id(&self) -> u64 {
        self.next_id_at(current_ms())
    }

    fn next_id_at(&self, clock_ms: i64) -> u64 {
        let mut state = self.state.lock();
        let mut now = clock_ms.max(EPOCH_MS);

        if now < state.last_ms {
            // Clock went backwards: keep issuing from the last observed millisecond
            warn!(drift_ms = state.last_ms - now, "Clock moved backwards, reusing last timestamp");
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted: move on to the next millisecond without waiting for the clock
                now += 1;
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;

        let elapsed = u64::try_from(now - EPOCH_MS).unwrap_or_default();
        (elapsed << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_ID_SHIFT)
            | (self.machine_id << MACHINE_ID_SHIFT)
            | state.sequence
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self {
            datacenter_id: 1,
            machine_id: 1,
            state: Mutex::new(State {
                last_ms: -1,
                sequence: 0,
            }),
        }
    }
}

fn current_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
