//! Host-mapped system memory: the issue ring plus the completion region.
//!
//! The host produces commands into a byte ring of `ring_size` bytes; the
//! dispatcher consumes them in order. Progress is tracked by two monotonic
//! byte counters:
//!
//! ```text
//!   issued  — total bytes the host has published (host-written)
//!   acked   — total bytes the device has consumed (device-written)
//! ```
//!
//! `issued - acked` never exceeds `ring_size`; the writer spins when a
//! reservation would break that bound. Counter publication uses
//! release/acquire ordering so every payload byte of a command is visible
//! before the command itself is: the writer fills the reservation first and
//! bumps `issued` last, and the dispatcher loads `issued` before touching
//! ring bytes.
//!
//! The completion region carries read-buffer data back to the host, plus the
//! finish sentinel the dispatcher bumps for fence commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::device_command::{CommandOpcode, DeviceCommand, COMMAND_ALIGN_BYTES};

/// A committed-to-be-written span of the issue ring. Offsets are absolute
/// (monotonic), not ring-relative.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRange {
    pub offset: u64,
    pub len: u64,
}

/// The shared host-visible memory region.
pub struct SystemMemory {
    ring_size: u64,
    ring: Mutex<Vec<u8>>,
    issued: AtomicU64,
    acked: AtomicU64,
    /// Highest finish-command sequence number the dispatcher has signaled.
    finish_seq: AtomicU64,
    completion: Mutex<Vec<u8>>,
    /// Bytes ever pushed into the completion region; host-side doorbell.
    completion_pushed: AtomicU64,
}

impl SystemMemory {
    pub fn new(ring_size: u64) -> Arc<Self> {
        assert!(ring_size % COMMAND_ALIGN_BYTES as u64 == 0, "ring size must be 64-byte aligned");
        Arc::new(Self {
            ring_size,
            ring: Mutex::new(vec![0u8; ring_size as usize]),
            issued: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            finish_seq: AtomicU64::new(0),
            completion: Mutex::new(Vec::new()),
            completion_pushed: AtomicU64::new(0),
        })
    }

    pub fn ring_size(&self) -> u64 {
        self.ring_size
    }

    pub fn issued_bytes(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked.load(Ordering::Acquire)
    }

    /// Device side: mark `n` ring bytes consumed.
    pub fn advance_acked(&self, n: u64) {
        self.acked.fetch_add(n, Ordering::Release);
    }

    fn advance_issued(&self, n: u64) {
        self.issued.fetch_add(n, Ordering::Release);
    }

    /// Copy bytes into the ring at an absolute offset.
    pub fn write_ring(&self, abs_offset: u64, bytes: &[u8]) {
        let mut ring = self.ring.lock().expect("ring lock");
        for (i, b) in bytes.iter().enumerate() {
            let pos = ((abs_offset + i as u64) % self.ring_size) as usize;
            ring[pos] = *b;
        }
    }

    /// Copy bytes out of the ring at an absolute offset.
    pub fn read_ring(&self, abs_offset: u64, len: usize) -> Vec<u8> {
        let ring = self.ring.lock().expect("ring lock");
        (0..len)
            .map(|i| ring[((abs_offset + i as u64) % self.ring_size) as usize])
            .collect()
    }

    /// Device side: record that the finish command `seq` retired.
    pub fn signal_finish(&self, seq: u64) {
        self.finish_seq.store(seq, Ordering::Release);
    }

    /// Host side: has the finish command `seq` retired yet?
    pub fn finish_reached(&self, seq: u64) -> bool {
        self.finish_seq.load(Ordering::Acquire) >= seq
    }

    /// Device side: append read-buffer data for the host.
    pub fn push_completion(&self, data: &[u8]) {
        self.completion.lock().expect("completion lock").extend_from_slice(data);
        self.completion_pushed.fetch_add(data.len() as u64, Ordering::Release);
    }

    pub fn completion_pushed_bytes(&self) -> u64 {
        self.completion_pushed.load(Ordering::Acquire)
    }

    /// Host side: take `len` bytes off the front of the completion region,
    /// once they have all arrived.
    pub fn pop_completion(&self, len: usize) -> Option<Vec<u8>> {
        let mut completion = self.completion.lock().expect("completion lock");
        if completion.len() < len {
            return None;
        }
        Some(completion.drain(..len).collect())
    }
}

/// Single-owner cursor that reserves, fills, and publishes ring spans.
///
/// Reservation and commit must alternate; the writer tracks the pending
/// reservation to catch misuse early.
pub struct SystemMemoryWriter {
    mem: Arc<SystemMemory>,
    pending: Option<ReservedRange>,
}

impl SystemMemoryWriter {
    pub fn new(mem: Arc<SystemMemory>) -> Self {
        Self { mem, pending: None }
    }

    pub fn memory(&self) -> &Arc<SystemMemory> {
        &self.mem
    }

    fn free_bytes(&self) -> u64 {
        self.mem.ring_size - (self.mem.issued_bytes() - self.mem.acked_bytes())
    }

    /// Reserve `bytes` of contiguous ring space, rounded up to the 64-byte
    /// grain. Spins while the device is behind; inserts a wrap command when
    /// the span would cross the ring end.
    pub fn reserve(&mut self, bytes: usize) -> ReservedRange {
        debug_assert!(self.pending.is_none(), "reserve while a reservation is pending");
        let align = COMMAND_ALIGN_BYTES as u64;
        let n = (bytes as u64 + align - 1) & !(align - 1);
        assert!(n <= self.mem.ring_size, "command larger than the issue ring");
        loop {
            let issued = self.mem.issued_bytes();
            let pos = issued % self.mem.ring_size;
            if pos + n > self.mem.ring_size {
                self.wrap();
                continue;
            }
            if self.free_bytes() >= n {
                let range = ReservedRange { offset: issued, len: n };
                self.pending = Some(range);
                return range;
            }
            thread::yield_now();
        }
    }

    /// Pad the ring out to its next boundary with a wrap command. No-op when
    /// already at a boundary. The wrap consumes every byte to the boundary,
    /// so it blocks like any other reservation.
    pub fn wrap(&mut self) {
        debug_assert!(self.pending.is_none(), "wrap while a reservation is pending");
        loop {
            let issued = self.mem.issued_bytes();
            let pos = issued % self.mem.ring_size;
            if pos == 0 {
                return;
            }
            let pad = self.mem.ring_size - pos;
            if self.free_bytes() >= pad {
                let wrap = DeviceCommand::new(CommandOpcode::Wrap).to_bytes();
                self.mem.write_ring(issued, &wrap);
                self.mem.advance_issued(pad);
                log::debug!("issue ring wrap at offset {pos} ({pad} pad bytes)");
                return;
            }
            thread::yield_now();
        }
    }

    /// Fill part of the pending reservation.
    pub fn write(&self, range: &ReservedRange, rel_offset: u64, bytes: &[u8]) {
        debug_assert!(rel_offset + bytes.len() as u64 <= range.len);
        self.mem.write_ring(range.offset + rel_offset, bytes);
    }

    /// Publish the pending reservation to the device.
    pub fn commit(&mut self, range: ReservedRange) {
        debug_assert!(matches!(self.pending, Some(p) if p.offset == range.offset));
        self.pending = None;
        self.mem.advance_issued(range.len);
    }
}
