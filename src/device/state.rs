//! Complete device state: the worker grid, device DRAM, the dispatch ack
//! counters, and the execution trace.
//!
//! The trace records every externally-visible step the device takes
//! (commands fetched, buffers touched, kernels launched, acks sent) in
//! order. Tests assert ordering and handshake properties against it.

use super::dram::DramMemory;
use super::noc::{self, atomic_increment};
use super::tile::Tile;
use super::{CoreCoord, Grid, MemoryMap};
use crate::cq::device_command::CommandOpcode;

/// Number of dispatch ack counter slots on the dispatcher core.
pub const NUM_DISPATCH_MESSAGE_SLOTS: usize = 4;

/// One externally-visible device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// The dispatcher pulled a command header from the issue ring.
    CommandFetched { seq: u64, opcode: CommandOpcode, ring_offset: u64 },
    /// The dispatcher consumed a wrap and jumped to the ring start.
    Wrap { seq: u64, ring_offset: u64 },
    /// A buffer write landed in DRAM. `first_word` is the leading payload
    /// word, recorded so ordering tests can match payloads to enqueues.
    BufferWrite { addr: u64, len: u32, first_word: u32 },
    /// A buffer read was streamed back to the completion region.
    BufferRead { addr: u64, len: u32 },
    /// A launch message was written to a worker's ring slot.
    LaunchSent { core: CoreCoord, slot: u32, host_id: u32 },
    /// Worker firmware jumped to a kernel entry point.
    KernelCall { core: CoreCoord, class: usize, entry: u32 },
    /// A slave processor ran its kernel.
    SlaveRun { core: CoreCoord },
    /// Worker firmware acked a launch to the dispatcher.
    AckSent { core: CoreCoord, offset: u32 },
    /// The dispatcher wrote the finish sentinel.
    FinishSignaled { seq: u64 },
}

/// The emulated device.
pub struct DeviceState {
    pub grid: Grid,
    pub map: MemoryMap,
    /// Worker tiles, row-major by logical coordinate.
    tiles: Vec<Tile>,
    pub dram: DramMemory,
    /// Ack counters at `dispatch_message_addr` on the dispatcher core,
    /// bumped by worker NOC atomic increments.
    pub dispatch_messages: [u32; NUM_DISPATCH_MESSAGE_SLOTS],
    pub trace: Vec<TraceEvent>,
}

impl DeviceState {
    pub fn new(grid: Grid, map: MemoryMap) -> Self {
        let mut tiles = Vec::with_capacity(grid.num_cores() as usize);
        for y in 0..grid.rows {
            for x in 0..grid.cols {
                let logical = CoreCoord::new(x, y);
                let phys = grid.logical_to_physical(logical);
                tiles.push(Tile::new(logical, map.l1_size, phys.x, phys.y));
            }
        }
        Self {
            grid,
            map,
            tiles,
            dram: DramMemory::new(),
            dispatch_messages: [0; NUM_DISPATCH_MESSAGE_SLOTS],
            trace: Vec::new(),
        }
    }

    pub fn tile(&self, logical: CoreCoord) -> Option<&Tile> {
        if !self.grid.contains(logical) {
            return None;
        }
        self.tiles.get((logical.y * self.grid.cols + logical.x) as usize)
    }

    pub fn tile_mut(&mut self, logical: CoreCoord) -> Option<&mut Tile> {
        if !self.grid.contains(logical) {
            return None;
        }
        let idx = (logical.y * self.grid.cols + logical.x) as usize;
        self.tiles.get_mut(idx)
    }

    /// Write `data` to `dst_addr` in the L1 of every core covered by a
    /// multicast encoding. Returns the number of cores reached.
    pub fn multicast_write(&mut self, encoding: u32, dst_addr: u32, data: &[u8]) -> u32 {
        let (x_start, y_start, x_end, y_end) = noc::decode_multicast(encoding);
        let mut reached = 0;
        for py in y_start..=y_end {
            for px in x_start..=x_end {
                match self.grid.physical_to_logical(CoreCoord::new(px, py)) {
                    Some(logical) => {
                        if let Some(tile) = self.tile_mut(logical) {
                            tile.write_l1(dst_addr, data);
                            reached += 1;
                        }
                    }
                    None => {
                        log::warn!("multicast to non-worker physical core ({px},{py})");
                    }
                }
            }
        }
        reached
    }

    /// Perform a NOC atomic increment at a full 64-bit NOC address.
    ///
    /// Only the dispatcher's ack counter window is a valid increment
    /// target; anything else is logged and dropped, leaving device state
    /// unchanged.
    pub fn noc_atomic_increment(&mut self, noc_addr: u64, incr: u32, wrap_bits: u32) {
        let (x, y, l1_addr) = noc::decode_noc_addr(noc_addr);
        if CoreCoord::new(x, y) != Grid::DISPATCHER {
            log::warn!("atomic increment to unsupported core ({x},{y})");
            return;
        }
        let base = self.map.dispatch_message_addr;
        let span = (NUM_DISPATCH_MESSAGE_SLOTS * 4) as u32;
        if l1_addr < base || l1_addr >= base + span || (l1_addr - base) % 4 != 0 {
            log::warn!("atomic increment outside dispatch message window: 0x{l1_addr:X}");
            return;
        }
        let slot = ((l1_addr - base) / 4) as usize;
        self.dispatch_messages[slot] = atomic_increment(self.dispatch_messages[slot], incr, wrap_bits);
    }

    pub fn push_trace(&mut self, event: TraceEvent) {
        log::debug!("device: {:?}", event);
        self.trace.push(event);
    }

    /// Count trace events matching a predicate.
    pub fn count_trace(&self, pred: impl Fn(&TraceEvent) -> bool) -> usize {
        self.trace.iter().filter(|e| pred(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::noc::{multicast_encoding, noc_xy_addr};

    fn small_state() -> DeviceState {
        DeviceState::new(Grid::new(4, 4), MemoryMap { l1_size: 0x40000, ..MemoryMap::default() })
    }

    #[test]
    fn test_multicast_covers_rectangle() {
        let mut state = small_state();
        // Logical (0,0)..(1,1) is physical (1,1)..(2,2).
        let enc = multicast_encoding(1, 1, 2, 2);
        let reached = state.multicast_write(enc, 0x100, &[0xAB; 4]);
        assert_eq!(reached, 4);
        for core in [CoreCoord::new(0, 0), CoreCoord::new(1, 1)] {
            assert_eq!(state.tile(core).unwrap().read_u32(0x100), 0xABABABAB);
        }
        assert_eq!(state.tile(CoreCoord::new(2, 2)).unwrap().read_u32(0x100), 0);
    }

    #[test]
    fn test_atomic_increment_hits_dispatch_counter() {
        let mut state = small_state();
        let addr = noc_xy_addr(0, 0, state.map.dispatch_message_addr);
        state.noc_atomic_increment(addr, 1, 31);
        state.noc_atomic_increment(addr, 1, 31);
        assert_eq!(state.dispatch_messages[0], 2);
    }

    #[test]
    fn test_atomic_increment_elsewhere_is_dropped() {
        let mut state = small_state();
        let addr = noc_xy_addr(2, 2, 0x100);
        state.noc_atomic_increment(addr, 1, 31);
        assert_eq!(state.dispatch_messages, [0; NUM_DISPATCH_MESSAGE_SLOTS]);
    }
}
