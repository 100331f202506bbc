//! Host/device firmware contract: mailbox layout, launch messages, and
//! go/done tokens.
//!
//! Every worker core has a fixed-address mailbox region in L1:
//!
//! ```text
//! mailbox_base +0                  launch[0]        \
//!              +32                 launch[1]         |  launch message ring
//!              ...                                   |  (N entries, N power
//!              +32*(N-1)           launch[N-1]      /    of two)
//!              +32*N               launch_msg_rd_ptr
//!              +32*N + 4           go_message        (signal, master x/y,
//!              +32*N + 20          slave_sync         dispatch msg offset)
//! ```
//!
//! The dispatcher writes launch messages and advances its private write
//! pointer; worker firmware mutates only `launch_msg_rd_ptr`, and only after
//! completing a launch. The ring is empty when `wr == rd` and full when
//! `wr - rd == N`.
//!
//! All structs here are plain 32-bit words viewed in L1 via zerocopy, so the
//! byte layout is exactly what firmware sees.

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{DispatcherFirmware, DispatcherStatus};
pub use worker::{WorkerFirmware, WorkerState};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::NUM_PROCESSOR_CLASSES;

/// Go-message signal: a launch is pending.
pub const RUN_MSG_GO: u32 = 0x80;
/// Go-message signal: the last launch completed.
pub const RUN_MSG_DONE: u32 = 0x40;

/// Slave-sync lane value: slave should run.
pub const RUN_SYNC_MSG_GO: u8 = 0x80;
/// Slave-sync lane value: slave finished.
pub const RUN_SYNC_MSG_DONE: u8 = 0x01;
/// Packed slave-sync word that compares equal iff every slave lane is DONE.
pub const RUN_SYNC_MSG_ALL_SLAVES_DONE: u32 =
    (RUN_SYNC_MSG_DONE as u32) | ((RUN_SYNC_MSG_DONE as u32) << 8);

/// Launch mode: dispatcher-driven; the worker acks via NOC atomic increment.
pub const DISPATCH_MODE_DEV: u32 = 0;
/// Launch mode: host-driven; no dispatcher ack.
pub const DISPATCH_MODE_HOST: u32 = 1;

/// Enable bit for the data-movement-0 processor.
pub const DISPATCH_CLASS_MASK_DM0: u32 = 1 << 0;
/// Enable bit for the data-movement-1 processor.
pub const DISPATCH_CLASS_MASK_DM1: u32 = 1 << 1;
/// Enable bit for the compute processor.
pub const DISPATCH_CLASS_MASK_COMPUTE: u32 = 1 << 2;

/// Per-launch kernel configuration, embedded in a launch message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct KernelConfig {
    /// Bitmask of enabled processor classes (`DISPATCH_CLASS_MASK_*`).
    pub enables: u32,
    /// NOC the data-movement-0 processor uses for this launch.
    pub brisc_noc_id: u32,
    /// `DISPATCH_MODE_DEV` or `DISPATCH_MODE_HOST`.
    pub mode: u32,
    /// Host-side enqueue sequence number, for tracing.
    pub host_assigned_id: u32,
    /// CB config window offset relative to the kernel config base.
    pub cb_offset: u32,
    /// Kernel text offset per processor class, relative to the kernel
    /// config base.
    pub kernel_text_offset: [u32; NUM_PROCESSOR_CLASSES],
}

/// One slot of the launch message ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LaunchMessage {
    pub kernel_config: KernelConfig,
}

/// Size of one launch message in L1.
pub const LAUNCH_MSG_BYTES: u32 = std::mem::size_of::<LaunchMessage>() as u32;

/// The go/done handshake word plus the ack routing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GoMessage {
    /// `RUN_MSG_GO` / `RUN_MSG_DONE`.
    pub signal: u32,
    /// Physical X of the dispatcher to ack.
    pub master_x: u32,
    /// Physical Y of the dispatcher to ack.
    pub master_y: u32,
    /// Byte offset added to the dispatch message address when acking.
    pub dispatch_message_offset: u32,
}

/// Byte lane of the data-movement-1 slave in the sync word.
pub const SLAVE_SYNC_LANE_DM1: u32 = 0;
/// Byte lane of the compute slave in the sync word.
pub const SLAVE_SYNC_LANE_COMPUTE: u32 = 1;

/// Read one slave-sync lane out of the packed word.
pub fn slave_sync_lane(word: u32, lane: u32) -> u8 {
    (word >> (lane * 8)) as u8
}

/// Replace one slave-sync lane in the packed word.
pub fn slave_sync_set_lane(word: u32, lane: u32, value: u8) -> u32 {
    let shift = lane * 8;
    (word & !(0xFFu32 << shift)) | ((value as u32) << shift)
}

/// Computed offsets of the mailbox region for a given ring capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxLayout {
    /// L1 base of the mailbox region.
    pub base: u32,
    /// Launch ring capacity; power of two.
    pub num_entries: u32,
}

impl MailboxLayout {
    pub fn new(base: u32, num_entries: u32) -> Self {
        assert!(num_entries.is_power_of_two(), "launch ring capacity must be a power of two");
        Self { base, num_entries }
    }

    /// L1 address of launch slot `slot` (already masked by the caller).
    pub fn launch_slot_addr(&self, slot: u32) -> u32 {
        debug_assert!(slot < self.num_entries);
        self.base + slot * LAUNCH_MSG_BYTES
    }

    /// L1 address of `launch_msg_rd_ptr`.
    pub fn rd_ptr_addr(&self) -> u32 {
        self.base + self.num_entries * LAUNCH_MSG_BYTES
    }

    /// L1 address of the go message.
    pub fn go_message_addr(&self) -> u32 {
        self.rd_ptr_addr() + 4
    }

    /// L1 address of the packed slave-sync word.
    pub fn slave_sync_addr(&self) -> u32 {
        self.go_message_addr() + std::mem::size_of::<GoMessage>() as u32
    }

    /// Total mailbox region size in bytes.
    pub fn region_bytes(&self) -> u32 {
        self.slave_sync_addr() + 4 - self.base
    }

    /// Advance a ring pointer by one slot.
    pub fn next_slot(&self, ptr: u32) -> u32 {
        (ptr + 1) & (self.num_entries - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_message_is_8_words() {
        assert_eq!(LAUNCH_MSG_BYTES, 32);
        assert_eq!(std::mem::size_of::<GoMessage>(), 16);
    }

    #[test]
    fn test_mailbox_layout_offsets() {
        let layout = MailboxLayout::new(0x400, 4);
        assert_eq!(layout.launch_slot_addr(0), 0x400);
        assert_eq!(layout.launch_slot_addr(3), 0x400 + 96);
        assert_eq!(layout.rd_ptr_addr(), 0x400 + 128);
        assert_eq!(layout.go_message_addr(), 0x400 + 132);
        assert_eq!(layout.slave_sync_addr(), 0x400 + 148);
    }

    #[test]
    fn test_slot_advance_wraps() {
        let layout = MailboxLayout::new(0, 4);
        assert_eq!(layout.next_slot(0), 1);
        assert_eq!(layout.next_slot(3), 0);
    }

    #[test]
    fn test_slave_sync_lanes() {
        let mut word = RUN_SYNC_MSG_ALL_SLAVES_DONE;
        assert_eq!(slave_sync_lane(word, SLAVE_SYNC_LANE_COMPUTE), RUN_SYNC_MSG_DONE);
        word = slave_sync_set_lane(word, SLAVE_SYNC_LANE_COMPUTE, RUN_SYNC_MSG_GO);
        assert_ne!(word, RUN_SYNC_MSG_ALL_SLAVES_DONE);
        assert_eq!(slave_sync_lane(word, SLAVE_SYNC_LANE_DM1), RUN_SYNC_MSG_DONE);
        word = slave_sync_set_lane(word, SLAVE_SYNC_LANE_COMPUTE, RUN_SYNC_MSG_DONE);
        assert_eq!(word, RUN_SYNC_MSG_ALL_SLAVES_DONE);
    }
}
