//! Device description for the emulated tile accelerator.
//!
//! This module provides:
//! - Core coordinates, ranges, and range sets (logical placement units)
//! - The grid description and the logical-to-physical coordinate map
//! - The per-core L1 memory map (kernel slots, CB configs, mailboxes)
//! - Device DRAM, NOC primitives, worker-core state, and the full
//!   [`DeviceState`]
//!
//! # Architecture Overview
//!
//! The device is a grid of worker tiles plus a management column. Logical
//! coordinates address worker tiles only; physical coordinates include the
//! dispatcher core at (0, 0) and are what NOC encodings use:
//!
//! ```text
//!       Phys col 0   Phys col 1..cols
//!      +-----------+--------+--------+--------+
//! row 0| Dispatch  |  (reserved row)          |
//!      +-----------+--------+--------+--------+
//! row 1|           | Worker | Worker | Worker |   <- logical (0,0) is
//!      +-----------+--------+--------+--------+      physical (1,1)
//! row 2|           | Worker | Worker | Worker |
//!      +-----------+--------+--------+--------+
//! ```
//!
//! # Example
//!
//! ```
//! use tilecq::device::{CoreCoord, CoreRange, Grid};
//!
//! let grid = Grid::new(8, 8);
//! assert!(grid.contains(CoreCoord::new(7, 7)));
//! assert_eq!(grid.logical_to_physical(CoreCoord::new(0, 0)), CoreCoord::new(1, 1));
//!
//! let range = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1));
//! assert_eq!(range.num_cores(), 4);
//! ```

pub mod dram;
pub mod noc;
pub mod state;
pub mod tile;

pub use dram::{DramError, DramMemory, DramRegion};
pub use noc::{NocContext, NocCounters, NocId, NUM_NOCS};
pub use state::{DeviceState, TraceEvent};
pub use tile::Tile;

use std::fmt;

/// Number of circular-buffer operand slots per worker core.
pub const NUM_CBS: usize = 32;

/// Number of processor classes per worker core (DM0, DM1, compute).
pub const NUM_PROCESSOR_CLASSES: usize = 3;

/// A logical or physical core coordinate on the chip grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreCoord {
    pub x: u32,
    pub y: u32,
}

impl CoreCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// An inclusive rectangular span of core coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreRange {
    pub start: CoreCoord,
    pub end: CoreCoord,
}

impl CoreRange {
    /// Create a range. `start` must be the lower-left corner.
    pub fn new(start: CoreCoord, end: CoreCoord) -> Self {
        debug_assert!(start.x <= end.x && start.y <= end.y);
        Self { start, end }
    }

    /// A single-core range.
    pub fn single(core: CoreCoord) -> Self {
        Self { start: core, end: core }
    }

    pub fn contains(&self, core: CoreCoord) -> bool {
        core.x >= self.start.x && core.x <= self.end.x && core.y >= self.start.y && core.y <= self.end.y
    }

    pub fn num_cores(&self) -> u32 {
        (self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)
    }

    /// Iterate the cores of this range in row-major order.
    pub fn cores(&self) -> impl Iterator<Item = CoreCoord> + '_ {
        let (sx, ex) = (self.start.x, self.end.x);
        (self.start.y..=self.end.y).flat_map(move |y| (sx..=ex).map(move |x| CoreCoord::new(x, y)))
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// A union of core ranges.
///
/// When used as a multicast destination, the union must form a single
/// rectangle (checked during lowering, not here).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CoreRangeSet {
    ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
    pub fn new(ranges: Vec<CoreRange>) -> Self {
        Self { ranges }
    }

    pub fn single(core: CoreCoord) -> Self {
        Self { ranges: vec![CoreRange::single(core)] }
    }

    pub fn ranges(&self) -> &[CoreRange] {
        &self.ranges
    }

    pub fn contains(&self, core: CoreCoord) -> bool {
        self.ranges.iter().any(|r| r.contains(core))
    }

    pub fn num_cores(&self) -> u32 {
        self.ranges.iter().map(|r| r.num_cores()).sum()
    }

    /// Iterate all cores across all ranges.
    pub fn cores(&self) -> impl Iterator<Item = CoreCoord> + '_ {
        self.ranges.iter().flat_map(|r| r.cores())
    }

    /// The smallest rectangle covering every range in the set.
    pub fn bounding_box(&self) -> Option<CoreRange> {
        let first = self.ranges.first()?;
        let mut bb = *first;
        for r in &self.ranges[1..] {
            bb.start.x = bb.start.x.min(r.start.x);
            bb.start.y = bb.start.y.min(r.start.y);
            bb.end.x = bb.end.x.max(r.end.x);
            bb.end.y = bb.end.y.max(r.end.y);
        }
        Some(bb)
    }

    /// True when the set covers exactly one rectangle.
    ///
    /// Ranges are assumed disjoint; a set whose core count equals its
    /// bounding-box core count is a single multicast rectangle.
    pub fn is_rectangle(&self) -> bool {
        match self.bounding_box() {
            Some(bb) => bb.num_cores() == self.num_cores(),
            None => false,
        }
    }
}

/// The logical worker grid and the logical-to-physical coordinate map.
///
/// Physical coordinates offset the logical grid by one in each axis: row 0
/// and column 0 are reserved for management cores, with the dispatcher at
/// physical (0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub cols: u32,
    pub rows: u32,
}

impl Grid {
    /// Physical coordinate of the dispatcher core.
    pub const DISPATCHER: CoreCoord = CoreCoord::new(0, 0);

    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    pub fn contains(&self, logical: CoreCoord) -> bool {
        logical.x < self.cols && logical.y < self.rows
    }

    pub fn contains_range(&self, range: &CoreRange) -> bool {
        self.contains(range.start) && self.contains(range.end)
    }

    /// Map a logical worker coordinate to its physical tile coordinate.
    ///
    /// The map is a fixed injective offset, so rectangles stay rectangles.
    pub fn logical_to_physical(&self, logical: CoreCoord) -> CoreCoord {
        CoreCoord::new(logical.x + 1, logical.y + 1)
    }

    /// Inverse of [`Grid::logical_to_physical`] for worker tiles.
    pub fn physical_to_logical(&self, physical: CoreCoord) -> Option<CoreCoord> {
        if physical.x == 0 || physical.y == 0 {
            return None;
        }
        let logical = CoreCoord::new(physical.x - 1, physical.y - 1);
        self.contains(logical).then_some(logical)
    }

    pub fn num_cores(&self) -> u32 {
        self.cols * self.rows
    }
}

/// Fixed per-core L1 memory map.
///
/// These addresses are a contract between the host lowering path and the
/// on-device firmware: kernel binaries land in fixed per-class slots, CB
/// configs and semaphores in their own windows, and the mailbox region holds
/// the launch ring. All values are L1 byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    /// Total L1 bytes per worker core.
    pub l1_size: u32,
    /// Base of the mailbox region (launch ring, go message, slave sync).
    pub mailbox_base: u32,
    /// Kernel text slot base for the T0 (data-movement-0) class.
    pub t0_base: u32,
    /// Kernel text slot base for the T1 (data-movement-1) class.
    pub t1_base: u32,
    /// Kernel text slot base for the T2 (compute) class.
    pub t2_base: u32,
    /// Bytes per kernel text slot.
    pub kernel_slot_size: u32,
    /// Base of the CB config window (8 words per operand slot).
    pub cb_config_base: u32,
    /// Base of the semaphore window.
    pub sem_base: u32,
    /// Bytes in the semaphore window.
    pub sem_region_size: u32,
    /// Base of the runtime-args window.
    pub runtime_args_base: u32,
    /// Bytes per processor class within the runtime-args window.
    pub runtime_args_slot: u32,
    /// Per-core L1 budget for one program section.
    pub program_buffer_window: u32,
    /// Address of the dispatch ack counters on the dispatcher core.
    pub dispatch_message_addr: u32,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            l1_size: 1 << 20,
            mailbox_base: 0x400,
            t0_base: 0x10000,
            t1_base: 0x14000,
            t2_base: 0x18000,
            kernel_slot_size: 0x4000,
            cb_config_base: 0x1C000,
            sem_base: 0x1C400,
            sem_region_size: 0x400,
            runtime_args_base: 0x1D000,
            runtime_args_slot: 0x400,
            program_buffer_window: 0x18000,
            dispatch_message_addr: 0x100,
        }
    }
}

impl MemoryMap {
    /// Kernel text slot base for a processor class index (0 = DM0, 1 = DM1,
    /// 2 = compute).
    pub fn class_base(&self, class_index: usize) -> u32 {
        match class_index {
            0 => self.t0_base,
            1 => self.t1_base,
            2 => self.t2_base,
            _ => panic!("invalid processor class index {class_index}"),
        }
    }

    /// The L1 offset firmware treats as the base of a launch's kernel
    /// config region. Per-class text offsets in a launch message are
    /// relative to this.
    pub fn kernel_config_base(&self) -> u32 {
        self.t0_base
    }

    /// Text offset of a class slot relative to the kernel config base.
    pub fn kernel_text_offset(&self, class_index: usize) -> u32 {
        self.class_base(class_index) - self.kernel_config_base()
    }

    /// CB config window offset relative to the kernel config base.
    pub fn cb_offset(&self) -> u32 {
        self.cb_config_base - self.kernel_config_base()
    }

    /// Runtime-args destination for a class on any core.
    pub fn runtime_args_addr(&self, class_index: usize) -> u32 {
        self.runtime_args_base + class_index as u32 * self.runtime_args_slot
    }
}
