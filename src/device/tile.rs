//! Worker-core state.
//!
//! Each worker tile holds its L1 SRAM, the per-CB sync registers the
//! firmware clears before every launch, and its NOC context. The mailbox
//! region (launch ring, go message, slave sync) lives *inside* L1 at a
//! fixed offset; typed accessors view those bytes through zerocopy so the
//! host-visible byte layout is authoritative.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{CoreCoord, NocContext, NUM_CBS};

/// One worker core: L1 plus hardware sync registers.
pub struct Tile {
    /// Logical coordinate of this core.
    pub coord: CoreCoord,
    /// L1 SRAM contents.
    l1: Vec<u8>,
    /// Per-CB tiles-received registers, cleared by firmware at launch init.
    pub tiles_received: [u32; NUM_CBS],
    /// Per-CB tiles-acked registers.
    pub tiles_acked: [u32; NUM_CBS],
    /// This core's NOC coordinates and transaction counters.
    pub noc: NocContext,
}

impl Tile {
    pub fn new(coord: CoreCoord, l1_size: u32, phys_x: u32, phys_y: u32) -> Self {
        Self {
            coord,
            l1: vec![0u8; l1_size as usize],
            tiles_received: [0; NUM_CBS],
            tiles_acked: [0; NUM_CBS],
            noc: NocContext::new(phys_x, phys_y),
        }
    }

    pub fn l1_size(&self) -> u32 {
        self.l1.len() as u32
    }

    /// Write bytes into L1. Out-of-range writes are dropped with a warning,
    /// matching how a real NOC write past L1 would be squashed.
    pub fn write_l1(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        if end > self.l1.len() {
            log::warn!(
                "L1 write out of range on core {}: 0x{:X}..0x{:X} (L1 size 0x{:X})",
                self.coord,
                start,
                end,
                self.l1.len()
            );
            return;
        }
        self.l1[start..end].copy_from_slice(data);
    }

    /// Read bytes out of L1.
    pub fn read_l1(&self, addr: u32, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = (start + len).min(self.l1.len());
        &self.l1[start..end.max(start)]
    }

    /// Read a little-endian word from L1.
    pub fn read_u32(&self, addr: u32) -> u32 {
        let start = addr as usize;
        if start + 4 > self.l1.len() {
            return 0;
        }
        u32::from_le_bytes([
            self.l1[start],
            self.l1[start + 1],
            self.l1[start + 2],
            self.l1[start + 3],
        ])
    }

    /// Write a little-endian word into L1.
    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_l1(addr, &value.to_le_bytes());
    }

    /// View a fixed-layout struct at an L1 address.
    pub fn read_struct<T: FromBytes + KnownLayout + Immutable>(&self, addr: u32) -> T {
        let start = addr as usize;
        let end = start + std::mem::size_of::<T>();
        assert!(end <= self.l1.len(), "typed L1 read past end: 0x{:X}", addr);
        T::read_from_bytes(&self.l1[start..end]).expect("exact-size L1 slice")
    }

    /// Write a fixed-layout struct at an L1 address.
    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, addr: u32, value: &T) {
        self.write_l1(addr, value.as_bytes());
    }

    /// Clear the per-CB sync registers (firmware launch-init step).
    pub fn init_sync_registers(&mut self) {
        self.tiles_received = [0; NUM_CBS];
        self.tiles_acked = [0; NUM_CBS];
    }
}
