//! NOC (network-on-chip) primitives.
//!
//! The NOC supports unicast writes, rectangle multicast writes, and atomic
//! increments; these are the only cross-core communication mechanisms. This
//! module holds the address/encoding math and the per-core transaction
//! counters. The hardware keeps those counters in per-core module-level
//! globals; here they live in a [`NocContext`] owned by each core model.
//!
//! # Multicast Encoding
//!
//! A multicast destination packs a physical rectangle into one 32-bit word,
//! four bit-fields of [`NOC_ADDR_NODE_ID_BITS`] bits each:
//!
//! ```text
//! | y_start | x_start | y_end | x_end |
//!   [23:18]   [17:12]   [11:6]  [5:0]
//! ```

/// Width of one coordinate field in a NOC address encoding.
pub const NOC_ADDR_NODE_ID_BITS: u32 = 6;

/// Number of NOCs per core.
pub const NUM_NOCS: usize = 2;

const NODE_ID_MASK: u32 = (1 << NOC_ADDR_NODE_ID_BITS) - 1;

/// NOC selection for a data-movement processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum NocId {
    #[default]
    Noc0,
    Noc1,
}

impl NocId {
    pub fn index(self) -> usize {
        match self {
            NocId::Noc0 => 0,
            NocId::Noc1 => 1,
        }
    }
}

/// Pack a physical rectangle into a multicast encoding word.
pub fn multicast_encoding(x_start: u32, y_start: u32, x_end: u32, y_end: u32) -> u32 {
    (x_start << (2 * NOC_ADDR_NODE_ID_BITS))
        | (y_start << (3 * NOC_ADDR_NODE_ID_BITS))
        | x_end
        | (y_end << NOC_ADDR_NODE_ID_BITS)
}

/// Unpack a multicast encoding into `(x_start, y_start, x_end, y_end)`.
pub fn decode_multicast(encoding: u32) -> (u32, u32, u32, u32) {
    let x_start = (encoding >> (2 * NOC_ADDR_NODE_ID_BITS)) & NODE_ID_MASK;
    let y_start = (encoding >> (3 * NOC_ADDR_NODE_ID_BITS)) & NODE_ID_MASK;
    let x_end = encoding & NODE_ID_MASK;
    let y_end = (encoding >> NOC_ADDR_NODE_ID_BITS) & NODE_ID_MASK;
    (x_start, y_start, x_end, y_end)
}

/// Pack a single physical coordinate into a NOC node word.
pub fn noc_xy_encoding(x: u32, y: u32) -> u32 {
    (x << NOC_ADDR_NODE_ID_BITS) | y
}

/// Unpack a NOC node word into `(x, y)`.
pub fn decode_noc_xy(xy: u32) -> (u32, u32) {
    ((xy >> NOC_ADDR_NODE_ID_BITS) & NODE_ID_MASK, xy & NODE_ID_MASK)
}

/// Form a full 64-bit NOC address: node id in the high word, L1 offset in
/// the low word.
pub fn noc_xy_addr(x: u32, y: u32, addr: u32) -> u64 {
    ((noc_xy_encoding(x, y) as u64) << 32) | addr as u64
}

/// Split a 64-bit NOC address into `(x, y, l1_addr)`.
pub fn decode_noc_addr(noc_addr: u64) -> (u32, u32, u32) {
    let (x, y) = decode_noc_xy((noc_addr >> 32) as u32);
    (x, y, noc_addr as u32)
}

/// Per-NOC transaction counters, polled by the host.
///
/// All counters are 32-bit monotonic and updated by firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NocCounters {
    pub reads_issued: u32,
    pub nonposted_writes_issued: u32,
    pub nonposted_writes_acked: u32,
    pub atomics_acked: u32,
    pub posted_writes_issued: u32,
}

/// Per-core NOC state: own coordinates plus transaction counters.
#[derive(Debug, Clone, Default)]
pub struct NocContext {
    /// Own physical coordinates as seen from each NOC.
    pub my_x: [u32; NUM_NOCS],
    pub my_y: [u32; NUM_NOCS],
    /// Active NOC index for the current launch.
    pub index: usize,
    pub counters: [NocCounters; NUM_NOCS],
}

impl NocContext {
    pub fn new(x: u32, y: u32) -> Self {
        Self {
            my_x: [x; NUM_NOCS],
            my_y: [y; NUM_NOCS],
            index: 0,
            counters: [NocCounters::default(); NUM_NOCS],
        }
    }

    /// Record a non-posted write of `num_dests` destinations on the active
    /// NOC. The emulated NOC completes synchronously, so the ack counter
    /// advances with the issue counter.
    pub fn record_nonposted_write(&mut self, num_dests: u32) {
        let c = &mut self.counters[self.index];
        c.nonposted_writes_issued = c.nonposted_writes_issued.wrapping_add(num_dests);
        c.nonposted_writes_acked = c.nonposted_writes_acked.wrapping_add(num_dests);
    }

    /// Record a posted write.
    pub fn record_posted_write(&mut self) {
        let c = &mut self.counters[self.index];
        c.posted_writes_issued = c.posted_writes_issued.wrapping_add(1);
    }

    /// Record a read.
    pub fn record_read(&mut self) {
        let c = &mut self.counters[self.index];
        c.reads_issued = c.reads_issued.wrapping_add(1);
    }

    /// Record a completed atomic increment.
    pub fn record_atomic_ack(&mut self) {
        let c = &mut self.counters[self.index];
        c.atomics_acked = c.atomics_acked.wrapping_add(1);
    }
}

/// Apply a NOC atomic increment to a counter value.
///
/// `wrap_bits` selects the wrap point: the result is taken modulo
/// `2^(wrap_bits + 1)`. The dispatch handshake uses `wrap_bits = 31`.
pub fn atomic_increment(value: u32, incr: u32, wrap_bits: u32) -> u32 {
    if wrap_bits >= 31 {
        value.wrapping_add(incr)
    } else {
        let mask = (1u32 << (wrap_bits + 1)) - 1;
        value.wrapping_add(incr) & mask
    }
}
