//! Dispatcher-core firmware: consumes the issue ring and distributes work.
//!
//! The dispatcher is the single consumer of system memory. Each command is
//! fetched at the `acked` cursor, executed, and only then retired by
//! advancing `acked`, so host-side back-pressure and the finish fence both
//! follow from the cursor alone. Program commands additionally park the
//! dispatcher in an ack-wait state until every launched worker has bumped
//! the dispatch message counter.

use std::sync::Arc;

use zerocopy::FromBytes;

use crate::cq::device_command::{
    CommandOpcode, CommandParseError, DeviceCommand, LaunchRecord, COMMAND_HEADER_BYTES,
    LAUNCH_RECORD_BYTES,
};
use crate::cq::sysmem::SystemMemory;
use crate::device::state::NUM_DISPATCH_MESSAGE_SLOTS;
use crate::device::{noc, CoreCoord, DeviceState, Grid, NocContext, TraceEvent};

use super::{
    GoMessage, KernelConfig, LaunchMessage, MailboxLayout, DISPATCH_MODE_DEV, RUN_MSG_GO,
};

/// What the dispatcher is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherStatus {
    /// Polling the issue ring for the next command.
    FetchWait,
    /// A launch is in flight; waiting for worker acks.
    WaitLaunchAcks { needed: u32, base: u32, slot: usize, retire_bytes: u64 },
    /// A protocol violation was logged; the ring is no longer consumed.
    Halted,
}

/// The dispatcher core's command loop.
pub struct DispatcherFirmware {
    mem: Arc<SystemMemory>,
    mailbox: MailboxLayout,
    pub status: DispatcherStatus,
    /// Launch ring write pointer, shared across all workers.
    pub launch_wr: u32,
    /// Commands fetched so far; trace sequence numbers.
    seq: u64,
    pub heartbeat: u64,
    pub noc: NocContext,
}

impl DispatcherFirmware {
    pub fn new(mem: Arc<SystemMemory>, mailbox: MailboxLayout) -> Self {
        Self {
            mem,
            mailbox,
            status: DispatcherStatus::FetchWait,
            launch_wr: 0,
            seq: 0,
            heartbeat: 0,
            noc: NocContext::new(Grid::DISPATCHER.x, Grid::DISPATCHER.y),
        }
    }

    pub fn is_idle(&self) -> bool {
        match self.status {
            DispatcherStatus::FetchWait => {
                self.mem.issued_bytes() == self.mem.acked_bytes()
            }
            DispatcherStatus::WaitLaunchAcks { .. } => false,
            DispatcherStatus::Halted => true,
        }
    }

    /// Advance by one command phase. Returns true when progress was made.
    pub fn step(&mut self, dev: &mut DeviceState) -> bool {
        self.heartbeat = self.heartbeat.wrapping_add(1);
        match self.status {
            DispatcherStatus::FetchWait => self.step_fetch(dev),
            DispatcherStatus::WaitLaunchAcks { needed, base, slot, retire_bytes } => {
                let acked = dev.dispatch_messages[slot].wrapping_sub(base);
                if acked < needed {
                    return false;
                }
                self.launch_wr = self.mailbox.next_slot(self.launch_wr);
                self.mem.advance_acked(retire_bytes);
                self.status = DispatcherStatus::FetchWait;
                true
            }
            DispatcherStatus::Halted => false,
        }
    }

    fn step_fetch(&mut self, dev: &mut DeviceState) -> bool {
        let rd = self.mem.acked_bytes();
        if self.mem.issued_bytes() - rd < COMMAND_HEADER_BYTES as u64 {
            return false;
        }
        let header = self.mem.read_ring(rd, COMMAND_HEADER_BYTES);
        let cmd = match DeviceCommand::parse_header(&header) {
            Ok(cmd) => cmd,
            Err(err) => {
                self.violation(err);
                return false;
            }
        };
        self.seq += 1;
        let ring_offset = rd % self.mem.ring_size();
        dev.push_trace(TraceEvent::CommandFetched { seq: self.seq, opcode: cmd.opcode, ring_offset });

        match cmd.opcode {
            CommandOpcode::Wrap => {
                let pad = self.mem.ring_size() - ring_offset;
                self.mem.advance_acked(pad);
                dev.push_trace(TraceEvent::Wrap { seq: self.seq, ring_offset });
            }
            CommandOpcode::WriteBuffer => {
                let data = self
                    .mem
                    .read_ring(rd + cmd.data_section_offset as u64, cmd.data_size_in_bytes as usize);
                let first_word = data
                    .get(0..4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .unwrap_or(0);
                dev.dram.write(cmd.buffer_addr, &data);
                dev.push_trace(TraceEvent::BufferWrite {
                    addr: cmd.buffer_addr,
                    len: cmd.data_size_in_bytes,
                    first_word,
                });
                self.mem.advance_acked(cmd.wire_size() as u64);
            }
            CommandOpcode::ReadBuffer => {
                let data = dev.dram.read(cmd.buffer_addr, cmd.data_size_in_bytes as usize);
                self.mem.push_completion(&data);
                self.noc.record_read();
                dev.push_trace(TraceEvent::BufferRead {
                    addr: cmd.buffer_addr,
                    len: cmd.data_size_in_bytes,
                });
                self.mem.advance_acked(cmd.wire_size() as u64);
            }
            CommandOpcode::Program => {
                // Re-read with the descriptor table this time.
                let region = self.mem.read_ring(rd, cmd.data_section_offset as usize);
                let cmd = match DeviceCommand::parse(&region) {
                    Ok(cmd) => cmd,
                    Err(err) => {
                        self.violation(err);
                        return false;
                    }
                };
                self.execute_program(dev, rd, &cmd);
            }
            CommandOpcode::Finish => {
                self.mem.signal_finish(cmd.host_assigned_id as u64);
                dev.push_trace(TraceEvent::FinishSignaled { seq: self.seq });
                self.mem.advance_acked(cmd.wire_size() as u64);
            }
        }
        true
    }

    fn execute_program(&mut self, dev: &mut DeviceState, rd: u64, cmd: &DeviceCommand) {
        let data = self
            .mem
            .read_ring(rd + cmd.data_section_offset as u64, cmd.data_size_in_bytes as usize);

        for t in &cmd.transfers {
            let end = (t.src_offset + t.size_bytes) as usize;
            let Some(slice) = data.get(t.src_offset as usize..end) else {
                self.violation(CommandParseError::Truncated { need: end, have: data.len() });
                return;
            };
            let reached = dev.multicast_write(t.multicast_encoding, t.dst_addr, slice);
            self.noc.record_nonposted_write(t.num_receivers);
            if reached != t.num_receivers {
                log::warn!(
                    "transfer to 0x{:X} reached {reached} cores, descriptor says {}",
                    t.dst_addr,
                    t.num_receivers
                );
            }
        }

        // Launch records tell us which cores take part and with what enables.
        let slot = self.launch_wr as usize % NUM_DISPATCH_MESSAGE_SLOTS;
        let base = dev.dispatch_messages[slot];
        let Some(records) = data.get(cmd.launch_records_offset as usize..) else {
            self.violation(CommandParseError::Truncated {
                need: cmd.launch_records_offset as usize,
                have: data.len(),
            });
            return;
        };
        let mut launched = 0u32;
        for chunk in records.chunks_exact(LAUNCH_RECORD_BYTES) {
            let Ok(record) = LaunchRecord::read_from_bytes(chunk) else { continue };
            let (x, y) = noc::decode_noc_xy(record.core_xy);
            let core = CoreCoord::new(x, y);
            self.send_launch(dev, core, record.enables, cmd, slot as u32);
            launched += 1;
        }
        if launched != cmd.num_workers {
            log::warn!(
                "program declares {} workers but carries {launched} launch records",
                cmd.num_workers
            );
        }

        self.status = DispatcherStatus::WaitLaunchAcks {
            needed: launched,
            base,
            slot,
            retire_bytes: cmd.wire_size() as u64,
        };
        log::debug!(
            "program id={} launched on {launched} cores (ring slot {}, ack slot {slot})",
            cmd.host_assigned_id,
            self.launch_wr
        );
    }

    fn send_launch(
        &mut self,
        dev: &mut DeviceState,
        core: CoreCoord,
        enables: u32,
        cmd: &DeviceCommand,
        ack_slot: u32,
    ) {
        let map = dev.map;
        let wr = self.launch_wr & (self.mailbox.num_entries - 1);
        let msg = LaunchMessage {
            kernel_config: KernelConfig {
                enables,
                brisc_noc_id: cmd.brisc_noc_id,
                mode: DISPATCH_MODE_DEV,
                host_assigned_id: cmd.host_assigned_id,
                cb_offset: map.cb_offset(),
                kernel_text_offset: [
                    map.kernel_text_offset(0),
                    map.kernel_text_offset(1),
                    map.kernel_text_offset(2),
                ],
            },
        };
        let go = GoMessage {
            signal: RUN_MSG_GO,
            master_x: Grid::DISPATCHER.x,
            master_y: Grid::DISPATCHER.y,
            dispatch_message_offset: ack_slot * 4,
        };
        let Some(tile) = dev.tile_mut(core) else {
            log::warn!("launch record names core {core} outside the grid");
            return;
        };
        tile.write_struct(self.mailbox.launch_slot_addr(wr), &msg);
        tile.write_struct(self.mailbox.go_message_addr(), &go);
        self.noc.record_posted_write();
        self.noc.record_posted_write();
        dev.push_trace(TraceEvent::LaunchSent { core, slot: wr, host_id: cmd.host_assigned_id });
    }

    fn violation(&mut self, err: CommandParseError) {
        log::warn!("protocol violation in the issue ring: {err}; dispatcher halted");
        self.status = DispatcherStatus::Halted;
    }
}
