//! Worker-core management firmware: the go/done launch loop.
//!
//! Each worker runs one [`WorkerFirmware`] state machine, the emulated
//! equivalent of the management processor's main loop. One `step` advances
//! at most one observable action, so interleavings with the dispatcher and
//! other cores are exercised by the engine's round-robin scheduler.
//!
//! The loop: clear CB sync registers, spin on the go message, read the
//! launch slot at `launch_msg_rd_ptr`, kick the enabled slaves, call the
//! DM0 kernel, wait for the slaves, flip the go signal to DONE, and (in
//! device dispatch mode) ack the dispatcher with a NOC atomic increment and
//! advance the read pointer.

use crate::device::{noc, CoreCoord, DeviceState, TraceEvent};

use super::{
    slave_sync_lane, slave_sync_set_lane, GoMessage, KernelConfig, LaunchMessage, MailboxLayout,
    DISPATCH_CLASS_MASK_COMPUTE, DISPATCH_CLASS_MASK_DM0, DISPATCH_CLASS_MASK_DM1,
    DISPATCH_MODE_DEV, RUN_MSG_DONE, RUN_MSG_GO, RUN_SYNC_MSG_ALL_SLAVES_DONE, RUN_SYNC_MSG_DONE,
    RUN_SYNC_MSG_GO, SLAVE_SYNC_LANE_COMPUTE, SLAVE_SYNC_LANE_DM1,
};

/// Observable phase of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Reset,
    /// Clearing sync registers before the next launch.
    Init,
    /// Spinning on the go message.
    GoWait,
    /// Decoding the launch slot and starting kernels.
    Launch,
    /// Waiting for slave processors to finish.
    WaitSlaves,
    /// Publishing DONE and acking the dispatcher.
    Done,
    /// Loop exited; core ignores further go messages.
    Terminal,
}

/// One worker core's management-processor loop.
pub struct WorkerFirmware {
    pub core: CoreCoord,
    pub state: WorkerState,
    /// Debug waypoint string, updated at each phase edge.
    pub waypoint: &'static str,
    /// Bumped every step; lets the host tell a spinning core from a hung one.
    pub heartbeat: u64,
    mailbox: MailboxLayout,
    relaunch_after_done: bool,
    current: Option<KernelConfig>,
}

impl WorkerFirmware {
    pub fn new(core: CoreCoord, mailbox: MailboxLayout, relaunch_after_done: bool) -> Self {
        Self {
            core,
            state: WorkerState::Reset,
            waypoint: "",
            heartbeat: 0,
            mailbox,
            relaunch_after_done,
            current: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, WorkerState::GoWait | WorkerState::Terminal)
    }

    /// Advance the loop by one action.
    pub fn step(&mut self, dev: &mut DeviceState) {
        self.heartbeat = self.heartbeat.wrapping_add(1);
        match self.state {
            WorkerState::Reset => {
                self.waypoint = "I";
                self.state = WorkerState::Init;
            }
            WorkerState::Init => self.step_init(dev),
            WorkerState::GoWait => self.step_go_wait(dev),
            WorkerState::Launch => self.step_launch(dev),
            WorkerState::WaitSlaves => self.step_wait_slaves(dev),
            WorkerState::Done => self.step_done(dev),
            WorkerState::Terminal => {}
        }
    }

    fn step_init(&mut self, dev: &mut DeviceState) {
        let Some(tile) = dev.tile_mut(self.core) else { return };
        tile.init_sync_registers();
        self.waypoint = "GW";
        self.state = WorkerState::GoWait;
    }

    fn step_go_wait(&mut self, dev: &mut DeviceState) {
        let Some(tile) = dev.tile_mut(self.core) else { return };
        let go: GoMessage = tile.read_struct(self.mailbox.go_message_addr());
        if go.signal == RUN_MSG_GO {
            self.waypoint = "GD";
            self.state = WorkerState::Launch;
        }
    }

    fn step_launch(&mut self, dev: &mut DeviceState) {
        let mailbox = self.mailbox;
        let config_base = dev.map.kernel_config_base();
        let Some(tile) = dev.tile_mut(self.core) else { return };

        let rd = tile.read_u32(mailbox.rd_ptr_addr()) & (mailbox.num_entries - 1);
        let launch: LaunchMessage = tile.read_struct(mailbox.launch_slot_addr(rd));
        let cfg = launch.kernel_config;

        tile.noc.index = cfg.brisc_noc_id as usize % crate::device::NUM_NOCS;
        // Icache flush before jumping into freshly written text; the model
        // has no icache, so only the ordering point remains.

        let mut sync = 0u32;
        let dm1 = if cfg.enables & DISPATCH_CLASS_MASK_DM1 != 0 { RUN_SYNC_MSG_GO } else { RUN_SYNC_MSG_DONE };
        let compute =
            if cfg.enables & DISPATCH_CLASS_MASK_COMPUTE != 0 { RUN_SYNC_MSG_GO } else { RUN_SYNC_MSG_DONE };
        sync = slave_sync_set_lane(sync, SLAVE_SYNC_LANE_DM1, dm1);
        sync = slave_sync_set_lane(sync, SLAVE_SYNC_LANE_COMPUTE, compute);
        tile.write_u32(mailbox.slave_sync_addr(), sync);

        if cfg.enables & DISPATCH_CLASS_MASK_DM0 != 0 {
            let entry = config_base + cfg.kernel_text_offset[0];
            dev.push_trace(TraceEvent::KernelCall { core: self.core, class: 0, entry });
        }
        self.current = Some(cfg);
        self.waypoint = "R";
        self.state = WorkerState::WaitSlaves;
    }

    fn step_wait_slaves(&mut self, dev: &mut DeviceState) {
        let mailbox = self.mailbox;
        let config_base = dev.map.kernel_config_base();
        let cfg = match self.current {
            Some(cfg) => cfg,
            None => {
                self.state = WorkerState::Init;
                return;
            }
        };
        let sync = match dev.tile(self.core) {
            Some(tile) => tile.read_u32(mailbox.slave_sync_addr()),
            None => return,
        };

        // One slave completes per step.
        for (lane, class) in [(SLAVE_SYNC_LANE_DM1, 1usize), (SLAVE_SYNC_LANE_COMPUTE, 2usize)] {
            if slave_sync_lane(sync, lane) == RUN_SYNC_MSG_GO {
                let entry = config_base + cfg.kernel_text_offset[class];
                dev.push_trace(TraceEvent::SlaveRun { core: self.core });
                dev.push_trace(TraceEvent::KernelCall { core: self.core, class, entry });
                let done = slave_sync_set_lane(sync, lane, RUN_SYNC_MSG_DONE);
                if let Some(tile) = dev.tile_mut(self.core) {
                    tile.write_u32(mailbox.slave_sync_addr(), done);
                }
                return;
            }
        }
        if sync == RUN_SYNC_MSG_ALL_SLAVES_DONE {
            self.waypoint = "SED";
            self.state = WorkerState::Done;
        } else {
            self.waypoint = "SEW";
        }
    }

    fn step_done(&mut self, dev: &mut DeviceState) {
        let mailbox = self.mailbox;
        let dispatch_message_addr = dev.map.dispatch_message_addr;
        let cfg = self.current.take().unwrap_or_default();

        let go = {
            let Some(tile) = dev.tile_mut(self.core) else { return };
            let mut go: GoMessage = tile.read_struct(mailbox.go_message_addr());
            go.signal = RUN_MSG_DONE;
            tile.write_struct(mailbox.go_message_addr(), &go);
            go
        };

        if cfg.mode == DISPATCH_MODE_DEV {
            let rd = {
                let Some(tile) = dev.tile_mut(self.core) else { return };
                let rd = tile.read_u32(mailbox.rd_ptr_addr()) & (mailbox.num_entries - 1);
                // Scrub the consumed slot's enables so a stale GO cannot
                // relaunch it.
                tile.write_u32(mailbox.launch_slot_addr(rd), 0);
                tile.write_u32(mailbox.rd_ptr_addr(), mailbox.next_slot(rd));
                tile.noc.record_atomic_ack();
                rd
            };
            let ack_addr = noc::noc_xy_addr(
                go.master_x,
                go.master_y,
                dispatch_message_addr + go.dispatch_message_offset,
            );
            dev.noc_atomic_increment(ack_addr, 1, 31);
            dev.push_trace(TraceEvent::AckSent { core: self.core, offset: go.dispatch_message_offset });
            log::debug!("worker {} acked launch slot {}", self.core, rd);
        }

        self.waypoint = "D";
        self.state = if self.relaunch_after_done { WorkerState::Init } else { WorkerState::Terminal };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Grid, MemoryMap};

    fn setup() -> (DeviceState, WorkerFirmware, MailboxLayout) {
        let map = MemoryMap { l1_size: 0x40000, ..MemoryMap::default() };
        let dev = DeviceState::new(Grid::new(4, 4), map);
        let mailbox = MailboxLayout::new(map.mailbox_base, 4);
        let fw = WorkerFirmware::new(CoreCoord::new(1, 1), mailbox, true);
        (dev, fw, mailbox)
    }

    fn post_launch(dev: &mut DeviceState, mailbox: &MailboxLayout, slot: u32, enables: u32, mode: u32) {
        let tile = dev.tile_mut(CoreCoord::new(1, 1)).unwrap();
        let msg = LaunchMessage {
            kernel_config: KernelConfig {
                enables,
                brisc_noc_id: 0,
                mode,
                host_assigned_id: 42,
                cb_offset: 0,
                kernel_text_offset: [0, 0x4000, 0x8000],
            },
        };
        tile.write_struct(mailbox.launch_slot_addr(slot), &msg);
        let go = GoMessage { signal: RUN_MSG_GO, master_x: 0, master_y: 0, dispatch_message_offset: 0 };
        tile.write_struct(mailbox.go_message_addr(), &go);
    }

    fn run_to_idle(fw: &mut WorkerFirmware, dev: &mut DeviceState) {
        for _ in 0..64 {
            fw.step(dev);
            if fw.is_idle() {
                return;
            }
        }
        panic!("worker did not reach an idle state (state {:?})", fw.state);
    }

    #[test]
    fn test_full_launch_cycle_acks_once() {
        let (mut dev, mut fw, mailbox) = setup();
        fw.step(&mut dev); // Reset -> Init
        fw.step(&mut dev); // Init -> GoWait
        assert_eq!(fw.state, WorkerState::GoWait);
        fw.step(&mut dev);
        assert_eq!(fw.state, WorkerState::GoWait, "no launch without GO");

        post_launch(&mut dev, &mailbox, 0, DISPATCH_CLASS_MASK_DM0 | DISPATCH_CLASS_MASK_COMPUTE, DISPATCH_MODE_DEV);
        run_to_idle(&mut fw, &mut dev);

        assert_eq!(dev.dispatch_messages[0], 1);
        assert_eq!(dev.count_trace(|e| matches!(e, TraceEvent::AckSent { .. })), 1);
        // DM0 and compute ran; DM1 was disabled.
        assert_eq!(dev.count_trace(|e| matches!(e, TraceEvent::KernelCall { class: 0, .. })), 1);
        assert_eq!(dev.count_trace(|e| matches!(e, TraceEvent::KernelCall { class: 1, .. })), 0);
        assert_eq!(dev.count_trace(|e| matches!(e, TraceEvent::KernelCall { class: 2, .. })), 1);

        let tile = dev.tile(CoreCoord::new(1, 1)).unwrap();
        assert_eq!(tile.read_u32(mailbox.rd_ptr_addr()), 1);
        let go: GoMessage = tile.read_struct(mailbox.go_message_addr());
        assert_eq!(go.signal, RUN_MSG_DONE);
        assert_eq!(fw.state, WorkerState::GoWait, "relaunch re-arms the loop");
    }

    #[test]
    fn test_rd_ptr_wraps_modulo_ring() {
        let (mut dev, mut fw, mailbox) = setup();
        run_to_idle(&mut fw, &mut dev);
        for k in 0..6u32 {
            post_launch(&mut dev, &mailbox, k % 4, DISPATCH_CLASS_MASK_DM0, DISPATCH_MODE_DEV);
            run_to_idle(&mut fw, &mut dev);
            let tile = dev.tile(CoreCoord::new(1, 1)).unwrap();
            assert_eq!(tile.read_u32(mailbox.rd_ptr_addr()), (k + 1) % 4);
        }
        assert_eq!(dev.dispatch_messages[0], 6);
    }

    #[test]
    fn test_host_mode_skips_ack() {
        let (mut dev, mut fw, mailbox) = setup();
        run_to_idle(&mut fw, &mut dev);
        post_launch(&mut dev, &mailbox, 0, DISPATCH_CLASS_MASK_DM0, super::super::DISPATCH_MODE_HOST);
        run_to_idle(&mut fw, &mut dev);
        assert_eq!(dev.dispatch_messages[0], 0);
        // Host mode leaves the rd ptr alone too.
        assert_eq!(dev.tile(CoreCoord::new(1, 1)).unwrap().read_u32(mailbox.rd_ptr_addr()), 0);
    }

    #[test]
    fn test_no_relaunch_reaches_terminal() {
        let map = MemoryMap { l1_size: 0x40000, ..MemoryMap::default() };
        let mut dev = DeviceState::new(Grid::new(4, 4), map);
        let mailbox = MailboxLayout::new(map.mailbox_base, 4);
        let mut fw = WorkerFirmware::new(CoreCoord::new(1, 1), mailbox, false);
        run_to_idle(&mut fw, &mut dev);
        post_launch(&mut dev, &mailbox, 0, DISPATCH_CLASS_MASK_DM0, DISPATCH_MODE_DEV);
        run_to_idle(&mut fw, &mut dev);
        assert_eq!(fw.state, WorkerState::Terminal);
        let heartbeat = fw.heartbeat;
        fw.step(&mut dev);
        assert_eq!(fw.state, WorkerState::Terminal);
        assert_eq!(fw.heartbeat, heartbeat + 1);
    }

    #[test]
    fn test_slot_scrubbed_after_consumption() {
        let (mut dev, mut fw, mailbox) = setup();
        run_to_idle(&mut fw, &mut dev);
        post_launch(&mut dev, &mailbox, 0, DISPATCH_CLASS_MASK_DM0, DISPATCH_MODE_DEV);
        run_to_idle(&mut fw, &mut dev);
        let tile = dev.tile(CoreCoord::new(1, 1)).unwrap();
        assert_eq!(tile.read_u32(mailbox.launch_slot_addr(0)), 0);
    }
}
