//! The dispatch engine: a step-driven scheduler over the dispatcher and
//! every worker core's firmware loop.
//!
//! One engine step advances the dispatcher by one command phase and every
//! worker by one action, round-robin. Single-stepping keeps interleavings
//! deterministic for tests; [`Device`] wraps the engine in a background
//! thread so host-side blocking calls (`finish`, reads, ring back-pressure)
//! behave like they would against real hardware.
//!
//! # Usage
//!
//! ```no_run
//! use tilecq::cq::{Buffer, CqOptions};
//! use tilecq::emu::{Device, DeviceOptions};
//!
//! let device = Device::start(DeviceOptions::default());
//! let mut cq = device.command_queue(CqOptions::default());
//! let buffer = Buffer { address: 0x1000, size: 64, page_size: 64 };
//! cq.enqueue_write_buffer(&buffer, &[7u8; 64], false).unwrap();
//! cq.finish().unwrap();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Config;
use crate::cq::sysmem::SystemMemory;
use crate::cq::{CommandQueue, CqOptions};
use crate::device::{CoreCoord, DeviceState, Grid, MemoryMap};
use crate::firmware::dispatcher::{DispatcherFirmware, DispatcherStatus};
use crate::firmware::worker::WorkerFirmware;
use crate::firmware::MailboxLayout;

/// Engine scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// At least one firmware loop has pending work.
    Running,
    /// Every loop is parked and the issue ring is drained.
    Idle,
    /// The dispatcher hit a protocol violation and stopped consuming.
    Halted,
}

/// Steps the dispatcher and all worker firmware against one device state.
pub struct DispatchEngine {
    pub state: DeviceState,
    pub dispatcher: DispatcherFirmware,
    workers: Vec<WorkerFirmware>,
    cycle: u64,
}

impl DispatchEngine {
    pub fn new(
        mem: Arc<SystemMemory>,
        grid: Grid,
        map: MemoryMap,
        launch_entries: u32,
        relaunch_after_done: bool,
    ) -> Self {
        let mailbox = MailboxLayout::new(map.mailbox_base, launch_entries);
        let state = DeviceState::new(grid, map);
        let dispatcher = DispatcherFirmware::new(mem, mailbox);
        let mut workers = Vec::with_capacity(grid.num_cores() as usize);
        for y in 0..grid.rows {
            for x in 0..grid.cols {
                workers.push(WorkerFirmware::new(CoreCoord::new(x, y), mailbox, relaunch_after_done));
            }
        }
        Self { state, dispatcher, workers, cycle: 0 }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Advance every firmware loop by one action.
    pub fn step(&mut self) {
        self.cycle += 1;
        let Self { state, dispatcher, workers, .. } = self;
        dispatcher.step(state);
        for worker in workers.iter_mut() {
            worker.step(state);
        }
    }

    pub fn status(&self) -> EngineStatus {
        if self.dispatcher.status == DispatcherStatus::Halted {
            return EngineStatus::Halted;
        }
        if self.dispatcher.is_idle() && self.workers.iter().all(|w| w.is_idle()) {
            EngineStatus::Idle
        } else {
            EngineStatus::Running
        }
    }

    /// Step until the engine goes idle, up to `max_cycles`.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> EngineStatus {
        for _ in 0..max_cycles {
            if self.status() != EngineStatus::Running {
                break;
            }
            self.step();
        }
        self.status()
    }

    pub fn worker(&self, core: CoreCoord) -> Option<&WorkerFirmware> {
        self.workers.iter().find(|w| w.core == core)
    }
}

/// Device construction knobs, mirroring the config file fields.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub ring_size: u64,
    pub grid: Grid,
    pub map: MemoryMap,
    pub launch_entries: u32,
    pub relaunch_after_done: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            ring_size: 1 << 20,
            grid: Grid::new(8, 8),
            map: MemoryMap::default(),
            launch_entries: 4,
            relaunch_after_done: true,
        }
    }
}

impl DeviceOptions {
    /// Options backed by the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            ring_size: config.ring_size_bytes(),
            grid: Grid::new(config.grid_cols(), config.grid_rows()),
            map: MemoryMap::default(),
            launch_entries: config.launch_msg_entries(),
            relaunch_after_done: config.relaunch_after_done(),
        }
    }
}

/// A running emulated device: the engine on its own thread, plus the shared
/// system memory the host enqueues into.
pub struct Device {
    mem: Arc<SystemMemory>,
    engine: Arc<Mutex<DispatchEngine>>,
    paused: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    grid: Grid,
    map: MemoryMap,
}

impl Device {
    /// Start the device with its engine thread running.
    pub fn start(opts: DeviceOptions) -> Self {
        let mem = SystemMemory::new(opts.ring_size);
        let engine = Arc::new(Mutex::new(DispatchEngine::new(
            mem.clone(),
            opts.grid,
            opts.map,
            opts.launch_entries,
            opts.relaunch_after_done,
        )));
        let paused = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let engine2 = engine.clone();
        let paused2 = paused.clone();
        let stop2 = stop.clone();
        let thread = thread::Builder::new()
            .name("tilecq-engine".into())
            .spawn(move || {
                log::info!("engine thread up");
                while !stop2.load(Ordering::Relaxed) {
                    if paused2.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_micros(100));
                        continue;
                    }
                    let status = {
                        let mut engine = engine2.lock().expect("engine lock");
                        engine.step();
                        engine.status()
                    };
                    if status != EngineStatus::Running {
                        thread::sleep(Duration::from_micros(50));
                    }
                }
                log::info!("engine thread down");
            })
            .expect("spawn engine thread");

        Self { mem, engine, paused, stop, thread: Some(thread), grid: opts.grid, map: opts.map }
    }

    pub fn memory(&self) -> &Arc<SystemMemory> {
        &self.mem
    }

    /// Build a command queue bound to this device.
    pub fn command_queue(&self, opts: CqOptions) -> CommandQueue {
        CommandQueue::new(self.mem.clone(), self.grid, self.map, opts)
    }

    /// Freeze the engine; enqueued commands stay in the ring.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Inspect the engine under its lock.
    pub fn with_engine<R>(&self, f: impl FnOnce(&DispatchEngine) -> R) -> R {
        f(&self.engine.lock().expect("engine lock"))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cq::{Buffer, CqMode};
    use crate::device::{CoreRange, CoreRangeSet, TraceEvent};
    use crate::program::{CircularBuffer, DataFormat, Kernel, ProcessorClass, Program};

    fn test_opts() -> DeviceOptions {
        DeviceOptions {
            ring_size: 1 << 16,
            grid: Grid::new(4, 4),
            map: MemoryMap { l1_size: 0x40000, ..MemoryMap::default() },
            ..DeviceOptions::default()
        }
    }

    fn cq_opts() -> CqOptions {
        CqOptions { finish_timeout: Duration::from_secs(5), ..CqOptions::default() }
    }

    fn dm0_program(grid: &Grid, cores: CoreRangeSet, binary: Vec<u8>) -> Program {
        let mut program = Program::new();
        program
            .add_kernel(Kernel::new("reader", ProcessorClass::Dm0, binary, cores), grid)
            .unwrap();
        program
    }

    #[test]
    fn test_single_kernel_program_runs_once() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let binary = vec![0x5Au8; 1000];
        let program = dm0_program(&Grid::new(4, 4), CoreRangeSet::single(CoreCoord::new(0, 0)), binary.clone());

        cq.enqueue_program(&program, false).unwrap();
        cq.finish().unwrap();

        device.with_engine(|engine| {
            let state = &engine.state;
            assert_eq!(state.count_trace(|e| matches!(e, TraceEvent::LaunchSent { .. })), 1);
            assert_eq!(state.count_trace(|e| matches!(e, TraceEvent::KernelCall { class: 0, .. })), 1);
            assert_eq!(state.count_trace(|e| matches!(e, TraceEvent::AckSent { .. })), 1);
            // Binary landed in the DM0 text slot.
            let tile = state.tile(CoreCoord::new(0, 0)).unwrap();
            assert_eq!(tile.read_l1(state.map.t0_base, 1000), &binary[..]);
        });
    }

    #[test]
    fn test_cb_config_multicast_to_rectangle() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let grid = Grid::new(4, 4);
        let cores = CoreRangeSet::new(vec![CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1))]);
        let mut program = dm0_program(&grid, cores.clone(), vec![0x11; 64]);
        program
            .add_circular_buffer(
                CircularBuffer {
                    operand: 3,
                    cores,
                    address: 0x30000,
                    num_tiles: 8,
                    tile_size: 2048,
                    data_format: DataFormat::Float16B,
                },
                &test_opts().map,
            )
            .unwrap();

        cq.enqueue_program(&program, false).unwrap();
        cq.finish().unwrap();

        device.with_engine(|engine| {
            let state = &engine.state;
            let cb_addr = state.map.cb_config_base + 3 * 32;
            for core in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let tile = state.tile(CoreCoord::new(core.0, core.1)).unwrap();
                assert_eq!(tile.read_u32(cb_addr), 0x30000, "core {core:?}");
                assert_eq!(tile.read_u32(cb_addr + 4), 8 * 2048);
            }
            // A core outside the rectangle is untouched.
            assert_eq!(state.tile(CoreCoord::new(2, 2)).unwrap().read_u32(cb_addr), 0);
        });
    }

    #[test]
    fn test_launch_ring_slots_cycle() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let grid = Grid::new(4, 4);
        let core = CoreCoord::new(2, 1);

        let n = 100u32;
        for _ in 0..n {
            let program = dm0_program(&grid, CoreRangeSet::single(core), vec![0x77; 32]);
            cq.enqueue_program(&program, false).unwrap();
        }
        cq.finish().unwrap();

        device.with_engine(|engine| {
            let state = &engine.state;
            let slots: Vec<u32> = state
                .trace
                .iter()
                .filter_map(|e| match e {
                    TraceEvent::LaunchSent { slot, .. } => Some(*slot),
                    _ => None,
                })
                .collect();
            assert_eq!(slots.len(), n as usize);
            for (k, slot) in slots.iter().enumerate() {
                assert_eq!(*slot, k as u32 % 4, "launch {k}");
            }
            assert_eq!(state.count_trace(|e| matches!(e, TraceEvent::AckSent { .. })), n as usize);
            // All acks land in cycling counter slots; their sum is n.
            assert_eq!(state.dispatch_messages.iter().sum::<u32>(), n);
            // rd caught up with wr.
            let mailbox = MailboxLayout::new(state.map.mailbox_base, 4);
            let tile = state.tile(core).unwrap();
            assert_eq!(tile.read_u32(mailbox.rd_ptr_addr()), n % 4);
        });
    }

    #[test]
    fn test_large_write_wraps_ring_and_reads_back() {
        let opts = DeviceOptions { ring_size: 256 * 1024, ..test_opts() };
        let device = Device::start(opts);
        let mut cq = device.command_queue(cq_opts());

        let len = 1 << 20;
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let buffer = Buffer { address: 0x10_0000, size: len as u64, page_size: 4096 };
        cq.enqueue_write_buffer(&buffer, &data, false).unwrap();
        cq.finish().unwrap();

        device.with_engine(|engine| {
            let wraps = engine.state.count_trace(|e| matches!(e, TraceEvent::Wrap { .. }));
            assert!(wraps >= 4, "1 MiB through a 256 KiB ring needs wraps, saw {wraps}");
        });

        let back = cq.enqueue_read_buffer(&buffer).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_stalled_read_resumes_with_exact_bytes() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let data: Vec<u8> = (0u8..128).collect();
        let buffer = Buffer { address: 0x8000, size: 128, page_size: 64 };
        cq.enqueue_write_buffer(&buffer, &data, false).unwrap();
        cq.finish().unwrap();

        device.pause();
        let mem = device.memory().clone();
        let reader = thread::spawn(move || cq.enqueue_read_buffer(&buffer));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mem.completion_pushed_bytes(), 0, "paused device must not answer");
        device.resume();
        assert_eq!(reader.join().unwrap().unwrap(), data);
    }

    #[test]
    fn test_write_ordering_last_write_wins() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let buffer = Buffer { address: 0x2000, size: 64, page_size: 64 };
        let a = [0x0Au8; 64];
        let b = [0x0Bu8; 64];
        cq.enqueue_write_buffer(&buffer, &a, false).unwrap();
        cq.enqueue_write_buffer(&buffer, &b, false).unwrap();
        cq.finish().unwrap();

        assert_eq!(cq.enqueue_read_buffer(&buffer).unwrap(), b);
        device.with_engine(|engine| {
            let first_words: Vec<u32> = engine
                .state
                .trace
                .iter()
                .filter_map(|e| match e {
                    TraceEvent::BufferWrite { first_word, .. } => Some(*first_word),
                    _ => None,
                })
                .collect();
            assert_eq!(first_words, vec![0x0A0A0A0A, 0x0B0B0B0B]);
        });
    }

    #[test]
    fn test_write_ordering_holds_across_a_thousand_commands() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let buffer = Buffer { address: 0x2000, size: 64, page_size: 64 };

        // 1000 commands of 128 ring bytes each overflow the 64 KiB ring,
        // so the sequence crosses wraps and back-pressure stalls.
        let n = 1000u32;
        for k in 0..n {
            let mut data = [0u8; 64];
            data[..4].copy_from_slice(&k.to_le_bytes());
            cq.enqueue_write_buffer(&buffer, &data, false).unwrap();
        }
        cq.finish().unwrap();

        let back = cq.enqueue_read_buffer(&buffer).unwrap();
        assert_eq!(back[..4], (n - 1).to_le_bytes());
        device.with_engine(|engine| {
            let first_words: Vec<u32> = engine
                .state
                .trace
                .iter()
                .filter_map(|e| match e {
                    TraceEvent::BufferWrite { first_word, .. } => Some(*first_word),
                    _ => None,
                })
                .collect();
            assert_eq!(first_words.len(), n as usize);
            for (k, word) in first_words.iter().enumerate() {
                assert_eq!(*word, k as u32, "write {k} landed out of order");
            }
        });
    }

    #[test]
    fn test_blocking_write_drains_the_ring() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let buffer = Buffer { address: 0x6000, size: 256, page_size: 64 };
        cq.enqueue_write_buffer(&buffer, &[0x42; 256], true).unwrap();

        let mem = device.memory().clone();
        assert_eq!(mem.issued_bytes(), mem.acked_bytes());
        assert_eq!(cq.enqueue_read_buffer(&buffer).unwrap(), vec![0x42; 256]);
    }

    #[test]
    fn test_blocking_write_in_async_mode() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(CqOptions { mode: CqMode::Async, ..cq_opts() });
        let buffer = Buffer { address: 0x7000, size: 64, page_size: 64 };
        cq.enqueue_write_buffer(&buffer, &[0x5C; 64], true).unwrap();

        let mem = device.memory().clone();
        assert!(mem.issued_bytes() >= 128, "submit thread must have flushed");
        assert_eq!(mem.issued_bytes(), mem.acked_bytes());
    }

    #[test]
    fn test_blocking_program_fences_the_launch() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let program =
            dm0_program(&Grid::new(4, 4), CoreRangeSet::single(CoreCoord::new(1, 2)), vec![0x9A; 48]);
        cq.enqueue_program(&program, true).unwrap();

        device.with_engine(|engine| {
            assert_eq!(engine.state.count_trace(|e| matches!(e, TraceEvent::AckSent { .. })), 1);
        });
    }

    #[test]
    fn test_back_pressure_bounded_by_ring() {
        let opts = DeviceOptions { ring_size: 4096, ..test_opts() };
        let device = Device::start(opts);
        let mem = device.memory().clone();
        device.pause();

        let mut cq = device.command_queue(cq_opts());
        let buffer = Buffer { address: 0x1000, size: 2048, page_size: 64 };
        let writer = thread::spawn(move || {
            for _ in 0..4 {
                cq.enqueue_write_buffer(&buffer, &[3u8; 2048], false).unwrap();
            }
            cq
        });
        // The producer must stall rather than overrun the ring.
        thread::sleep(Duration::from_millis(50));
        assert!(mem.issued_bytes() - mem.acked_bytes() <= 4096);
        assert!(!writer.is_finished());

        device.resume();
        let mut cq = writer.join().unwrap();
        cq.finish().unwrap();
        assert!(mem.issued_bytes() - mem.acked_bytes() <= 4096);
    }

    #[test]
    fn test_finish_is_a_fence() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let buffer = Buffer { address: 0x3000, size: 256, page_size: 64 };
        cq.enqueue_write_buffer(&buffer, &[9u8; 256], false).unwrap();
        let issued_before = device.memory().issued_bytes();
        cq.finish().unwrap();
        assert!(device.memory().acked_bytes() >= issued_before);
    }

    #[test]
    fn test_rerun_program_with_new_runtime_args() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let grid = Grid::new(4, 4);
        let core = CoreCoord::new(0, 0);
        let mut program = dm0_program(&grid, CoreRangeSet::single(core), vec![0x44; 64]);
        program.set_runtime_args(core, ProcessorClass::Dm0, vec![11, 22]);
        cq.enqueue_program(&program, false).unwrap();
        cq.finish().unwrap();

        let args_addr = test_opts().map.runtime_args_addr(0);
        device.with_engine(|engine| {
            assert_eq!(engine.state.tile(core).unwrap().read_u32(args_addr), 11);
        });

        program.set_runtime_args(core, ProcessorClass::Dm0, vec![33, 44]);
        cq.enqueue_program(&program, false).unwrap();
        cq.finish().unwrap();
        device.with_engine(|engine| {
            let tile = engine.state.tile(core).unwrap();
            assert_eq!(tile.read_u32(args_addr), 33);
            assert_eq!(tile.read_u32(args_addr + 4), 44);
            assert_eq!(engine.state.count_trace(|e| matches!(e, TraceEvent::KernelCall { .. })), 2);
        });
    }

    #[test]
    fn test_async_mode_end_to_end() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(CqOptions { mode: CqMode::Async, ..cq_opts() });
        let buffer = Buffer { address: 0x5000, size: 64, page_size: 64 };
        cq.enqueue_write_buffer(&buffer, &[0xC3; 64], false).unwrap();
        cq.finish().unwrap();
        assert_eq!(cq.enqueue_read_buffer(&buffer).unwrap(), vec![0xC3; 64]);
    }

    #[test]
    fn test_multi_class_program_runs_all_processors() {
        let device = Device::start(test_opts());
        let mut cq = device.command_queue(cq_opts());
        let grid = Grid::new(4, 4);
        let cores = CoreRangeSet::single(CoreCoord::new(1, 2));
        let mut program = dm0_program(&grid, cores.clone(), vec![1; 64]);
        program
            .add_kernel(Kernel::new("writer", ProcessorClass::Dm1, vec![2; 64], cores.clone()), &grid)
            .unwrap();
        program
            .add_kernel(Kernel::new("math", ProcessorClass::Compute, vec![3; 64], cores), &grid)
            .unwrap();

        cq.enqueue_program(&program, false).unwrap();
        cq.finish().unwrap();

        device.with_engine(|engine| {
            let state = &engine.state;
            for class in 0..3usize {
                assert_eq!(
                    state.count_trace(|e| matches!(e, TraceEvent::KernelCall { class: c, .. } if *c == class)),
                    1,
                    "class {class}"
                );
            }
            assert_eq!(state.count_trace(|e| matches!(e, TraceEvent::AckSent { .. })), 1);
        });
    }
}
