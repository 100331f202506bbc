//! The host-facing command queue.
//!
//! Every operation lowers to one tagged [`Command`] value, which assembles
//! into a [`DeviceCommand`] region plus payload and lands in the issue ring
//! in strict enqueue order. Programs are lowered once and cached by
//! [`ProgramId`]; a re-enqueue with changed runtime arguments patches only
//! the runtime-args spans of the cached payload.
//!
//! # Usage
//!
//! ```no_run
//! use tilecq::cq::{Buffer, CommandQueue, CqOptions};
//! use tilecq::cq::sysmem::SystemMemory;
//! use tilecq::device::{Grid, MemoryMap};
//!
//! let mem = SystemMemory::new(1 << 20);
//! let mut cq = CommandQueue::new(mem, Grid::new(8, 8), MemoryMap::default(), CqOptions::default());
//! let buffer = Buffer { address: 0x1000, size: 64, page_size: 64 };
//! cq.enqueue_write_buffer(&buffer, &[0u8; 64], false).unwrap();
//! cq.finish().unwrap();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::device::{noc, Grid, MemoryMap};
use crate::program::{
    lower, LayoutError, ProcessorClass, Program, ProgramId, ProgramSrcToDstAddrMap, RuntimeArgSpan,
};

use super::device_command::{
    CommandOpcode, DeviceCommand, LaunchRecord, TransferDescriptor, COMMAND_ALIGN_BYTES,
};
use super::sysmem::{SystemMemory, SystemMemoryWriter};
use super::ts_queue::TsQueue;
use crate::firmware::{DISPATCH_CLASS_MASK_COMPUTE, DISPATCH_CLASS_MASK_DM0, DISPATCH_CLASS_MASK_DM1};

use zerocopy::IntoBytes;

/// A device DRAM buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    pub address: u64,
    pub size: u64,
    pub page_size: u32,
}

/// Host-side queue failures.
#[derive(Debug, Error)]
pub enum CqError {
    #[error("buffer access not 32-bit aligned (address 0x{address:X}, {len} bytes)")]
    BufferAlignment { address: u64, len: u64 },
    #[error("device did not retire the fence within {waited_ms} ms")]
    DispatchHang { waited_ms: u64 },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Enqueue execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CqMode {
    /// Operations write the issue ring on the calling thread.
    #[default]
    Sync,
    /// Operations hand off to a submit thread through a bounded queue.
    Async,
}

/// Queue construction knobs.
#[derive(Debug, Clone)]
pub struct CqOptions {
    pub mode: CqMode,
    /// How long `finish` and blocking reads wait before declaring a hang.
    pub finish_timeout: Duration,
    /// Largest payload per write-buffer command; larger writes are split.
    /// Defaults to the ring size minus one reservation grain worth of
    /// command regions.
    pub max_chunk: Option<usize>,
    /// Async-mode handoff queue depth.
    pub queue_depth: usize,
}

impl Default for CqOptions {
    fn default() -> Self {
        Self {
            mode: CqMode::Sync,
            finish_timeout: Duration::from_millis(5000),
            max_chunk: None,
            queue_depth: 32,
        }
    }
}

/// One enqueue operation, tagged by kind.
#[derive(Debug, Clone)]
pub enum Command {
    WriteBuffer {
        dst: u64,
        page_size: u32,
        data: Vec<u8>,
    },
    ReadBuffer {
        src: u64,
        len: u32,
        page_size: u32,
    },
    Program {
        num_workers: u32,
        brisc_noc_id: u32,
        transfers: Vec<TransferDescriptor>,
        /// Program vector followed by launch records.
        data: Vec<u8>,
        launch_records_offset: u32,
    },
    Finish,
    Wrap,
}

impl Command {
    /// Build the wire command and its payload. `host_id` is the enqueue
    /// sequence number.
    pub fn assemble(&self, host_id: u32) -> (DeviceCommand, Vec<u8>) {
        match self {
            Command::WriteBuffer { dst, page_size, data } => {
                let mut cmd = DeviceCommand::new(CommandOpcode::WriteBuffer);
                cmd.buffer_addr = *dst;
                cmd.page_size = *page_size;
                cmd.num_pages = (data.len() as u32).div_ceil((*page_size).max(1));
                cmd.data_size_in_bytes = data.len() as u32;
                cmd.host_assigned_id = host_id;
                (cmd, data.clone())
            }
            Command::ReadBuffer { src, len, page_size } => {
                let mut cmd = DeviceCommand::new(CommandOpcode::ReadBuffer);
                cmd.buffer_addr = *src;
                cmd.page_size = *page_size;
                cmd.num_pages = len.div_ceil((*page_size).max(1));
                cmd.data_size_in_bytes = *len;
                cmd.host_assigned_id = host_id;
                (cmd, Vec::new())
            }
            Command::Program { num_workers, brisc_noc_id, transfers, data, launch_records_offset } => {
                let mut cmd = DeviceCommand::new(CommandOpcode::Program);
                cmd.num_workers = *num_workers;
                cmd.brisc_noc_id = *brisc_noc_id;
                cmd.data_size_in_bytes = data.len() as u32;
                cmd.launch_records_offset = *launch_records_offset;
                cmd.host_assigned_id = host_id;
                for t in transfers {
                    cmd.add_transfer(*t);
                }
                (cmd, data.clone())
            }
            Command::Finish => {
                let mut cmd = DeviceCommand::new(CommandOpcode::Finish);
                cmd.host_assigned_id = host_id;
                (cmd, Vec::new())
            }
            Command::Wrap => (DeviceCommand::new(CommandOpcode::Wrap), Vec::new()),
        }
    }
}

/// Write one assembled command into the ring.
fn submit(writer: &mut SystemMemoryWriter, command: &Command, host_id: u32) {
    if matches!(command, Command::Wrap) {
        writer.wrap();
        return;
    }
    let (cmd, data) = command.assemble(host_id);
    let range = writer.reserve(cmd.wire_size());
    writer.write(&range, 0, &cmd.to_bytes());
    if !data.is_empty() {
        writer.write(&range, cmd.region_bytes() as u64, &data);
    }
    writer.commit(range);
    log::debug!(
        "issued {:?} id={} ({} bytes at ring offset {})",
        cmd.opcode,
        host_id,
        range.len,
        range.offset
    );
}

struct CachedProgram {
    transfers: Vec<TransferDescriptor>,
    data: Vec<u8>,
    launch_records_offset: u32,
    num_workers: u32,
    brisc_noc_id: u32,
    spans: Vec<RuntimeArgSpan>,
}

enum Backend {
    Sync(SystemMemoryWriter),
    Async {
        tx: Arc<TsQueue<(Command, u32)>>,
        /// Commands handed to the submit thread.
        pushed: u64,
        /// Commands the submit thread has written to the ring.
        submitted: Arc<AtomicU64>,
        worker: Option<JoinHandle<()>>,
    },
}

/// The host command queue for one device.
pub struct CommandQueue {
    mem: Arc<SystemMemory>,
    backend: Backend,
    cache: HashMap<ProgramId, CachedProgram>,
    grid: Grid,
    map: MemoryMap,
    finish_timeout: Duration,
    max_chunk: usize,
    next_id: u32,
    /// Completion bytes already claimed by past reads.
    completion_claimed: u64,
}

impl CommandQueue {
    pub fn new(mem: Arc<SystemMemory>, grid: Grid, map: MemoryMap, opts: CqOptions) -> Self {
        let max_chunk = opts
            .max_chunk
            .unwrap_or((mem.ring_size() as usize).saturating_sub(4 * COMMAND_ALIGN_BYTES))
            & !(COMMAND_ALIGN_BYTES - 1);
        assert!(max_chunk > 0, "ring too small for any payload");
        let backend = match opts.mode {
            CqMode::Sync => Backend::Sync(SystemMemoryWriter::new(mem.clone())),
            CqMode::Async => {
                let tx = Arc::new(TsQueue::new(opts.queue_depth));
                let rx = tx.clone();
                let submitted = Arc::new(AtomicU64::new(0));
                let submitted_tx = submitted.clone();
                let mut writer = SystemMemoryWriter::new(mem.clone());
                let worker = thread::Builder::new()
                    .name("cq-submit".into())
                    .spawn(move || {
                        while let Some((command, host_id)) = rx.pop() {
                            submit(&mut writer, &command, host_id);
                            submitted_tx.fetch_add(1, Ordering::Release);
                        }
                    })
                    .expect("spawn submit thread");
                Backend::Async { tx, pushed: 0, submitted, worker: Some(worker) }
            }
        };
        Self {
            mem,
            backend,
            cache: HashMap::new(),
            grid,
            map,
            finish_timeout: opts.finish_timeout,
            max_chunk,
            next_id: 0,
            completion_claimed: 0,
        }
    }

    pub fn memory(&self) -> &Arc<SystemMemory> {
        &self.mem
    }

    fn issue(&mut self, command: Command) -> u32 {
        self.next_id += 1;
        let host_id = self.next_id;
        match &mut self.backend {
            Backend::Sync(writer) => submit(writer, &command, host_id),
            Backend::Async { tx, pushed, .. } => {
                tx.push((command, host_id));
                *pushed += 1;
            }
        }
        host_id
    }

    /// Copy `data` into device DRAM at `buffer.address`. Splits writes
    /// larger than one ring's worth into chunked commands. With `blocking`
    /// set, returns only after the device has consumed every issued ring
    /// byte.
    pub fn enqueue_write_buffer(
        &mut self,
        buffer: &Buffer,
        data: &[u8],
        blocking: bool,
    ) -> Result<(), CqError> {
        if buffer.address % 4 != 0 || data.len() % 4 != 0 {
            return Err(CqError::BufferAlignment { address: buffer.address, len: data.len() as u64 });
        }
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(self.max_chunk);
            self.issue(Command::WriteBuffer {
                dst: buffer.address + offset as u64,
                page_size: buffer.page_size,
                data: data[offset..offset + chunk].to_vec(),
            });
            offset += chunk;
        }
        if blocking {
            self.wait_until_drained()?;
        }
        Ok(())
    }

    /// Read `buffer` back from device DRAM. Blocks until the dispatcher has
    /// streamed the data into the completion region.
    pub fn enqueue_read_buffer(&mut self, buffer: &Buffer) -> Result<Vec<u8>, CqError> {
        if buffer.address % 4 != 0 || buffer.size % 4 != 0 {
            return Err(CqError::BufferAlignment { address: buffer.address, len: buffer.size });
        }
        self.issue(Command::ReadBuffer {
            src: buffer.address,
            len: buffer.size as u32,
            page_size: buffer.page_size,
        });
        let expect = self.completion_claimed + buffer.size;
        let start = Instant::now();
        loop {
            if self.mem.completion_pushed_bytes() >= expect {
                break;
            }
            if start.elapsed() > self.finish_timeout {
                return Err(CqError::DispatchHang { waited_ms: start.elapsed().as_millis() as u64 });
            }
            thread::yield_now();
        }
        self.completion_claimed = expect;
        let data = self
            .mem
            .pop_completion(buffer.size as usize)
            .unwrap_or_default();
        Ok(data)
    }

    /// Lower (or fetch from cache) and enqueue `program`. With `blocking`
    /// set, fences with [`CommandQueue::finish`] so the launch has retired
    /// before returning.
    pub fn enqueue_program(&mut self, program: &Program, blocking: bool) -> Result<(), CqError> {
        self.issue_program(program)?;
        if blocking {
            self.finish()?;
        }
        Ok(())
    }

    fn issue_program(&mut self, program: &Program) -> Result<(), CqError> {
        if let Some(cached) = self.cache.get_mut(&program.id()) {
            if patch_runtime_args(cached, program) {
                log::debug!("program {:?}: cache hit", program.id());
                let command = Command::Program {
                    num_workers: cached.num_workers,
                    brisc_noc_id: cached.brisc_noc_id,
                    transfers: cached.transfers.clone(),
                    data: cached.data.clone(),
                    launch_records_offset: cached.launch_records_offset,
                };
                self.issue(command);
                return Ok(());
            }
            // Args changed shape; fall through and lower again.
            self.cache.remove(&program.id());
        }

        let lowered = lower(&self.grid, &self.map, program)?;
        let cached = build_cached(&lowered, program);
        let command = Command::Program {
            num_workers: cached.num_workers,
            brisc_noc_id: cached.brisc_noc_id,
            transfers: cached.transfers.clone(),
            data: cached.data.clone(),
            launch_records_offset: cached.launch_records_offset,
        };
        self.cache.insert(program.id(), cached);
        self.issue(command);
        Ok(())
    }

    /// Blocking fence: returns once the device has retired every prior
    /// command.
    pub fn finish(&mut self) -> Result<(), CqError> {
        let seq = self.issue(Command::Finish);
        let start = Instant::now();
        while !self.mem.finish_reached(seq as u64) {
            if start.elapsed() > self.finish_timeout {
                return Err(CqError::DispatchHang { waited_ms: start.elapsed().as_millis() as u64 });
            }
            thread::yield_now();
        }
        Ok(())
    }

    /// Force the issue ring to its next boundary.
    pub fn wrap(&mut self) {
        self.issue(Command::Wrap);
    }

    /// Spin until the submit path is empty and the device has consumed
    /// every issued ring byte.
    fn wait_until_drained(&self) -> Result<(), CqError> {
        let start = Instant::now();
        loop {
            let handed_off = match &self.backend {
                Backend::Sync(_) => true,
                Backend::Async { pushed, submitted, .. } => {
                    *pushed == submitted.load(Ordering::Acquire)
                }
            };
            if handed_off && self.mem.issued_bytes() == self.mem.acked_bytes() {
                return Ok(());
            }
            if start.elapsed() > self.finish_timeout {
                return Err(CqError::DispatchHang { waited_ms: start.elapsed().as_millis() as u64 });
            }
            thread::yield_now();
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Backend::Async { tx, worker, .. } = &mut self.backend {
            tx.close();
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

fn pack_args(args: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(args.len() * 4);
    for a in args {
        bytes.extend_from_slice(&a.to_le_bytes());
    }
    bytes.resize((bytes.len() + 15) & !15, 0);
    bytes
}

/// Patch cached runtime-args spans in place. Returns false when the args
/// changed shape and the program must be lowered again.
fn patch_runtime_args(cached: &mut CachedProgram, program: &Program) -> bool {
    let mut spans_seen = 0;
    for (&core, per_class) in program.runtime_args() {
        for (&class, args) in per_class {
            if args.is_empty() {
                continue;
            }
            let Some(span) = cached
                .spans
                .iter()
                .find(|s| s.core == core && s.class == class)
            else {
                return false;
            };
            let bytes = pack_args(args);
            if bytes.len() as u32 != span.len {
                return false;
            }
            let off = span.offset as usize;
            cached.data[off..off + bytes.len()].copy_from_slice(&bytes);
            spans_seen += 1;
        }
    }
    spans_seen == cached.spans.len()
}

fn class_mask(class: ProcessorClass) -> u32 {
    match class {
        ProcessorClass::Dm0 => DISPATCH_CLASS_MASK_DM0,
        ProcessorClass::Dm1 => DISPATCH_CLASS_MASK_DM1,
        ProcessorClass::Compute => DISPATCH_CLASS_MASK_COMPUTE,
    }
}

/// Flatten a lowered program into wire transfers plus payload, and append
/// one launch record per participating core.
fn build_cached(lowered: &ProgramSrcToDstAddrMap, program: &Program) -> CachedProgram {
    let mut transfers = Vec::with_capacity(lowered.num_transfers() as usize);
    let mut section_base = 0u32;
    for section in &lowered.sections {
        for t in section.iter_transfers() {
            transfers.push(TransferDescriptor {
                dst_addr: t.dst_addr,
                src_offset: section_base + t.start_in_bytes,
                size_bytes: t.size_bytes,
                multicast_encoding: t.multicast_encoding,
                num_receivers: t.num_receivers,
                linked: 0,
            });
        }
        section_base += section.size_in_bytes;
    }

    let mut data = lowered.program_vector.clone();
    let launch_records_offset = data.len() as u32;
    for core in program.logical_cores() {
        let group = program.kernels_on_core(core);
        let mut enables = 0;
        for class in ProcessorClass::ALL {
            if group.get(class).is_some() {
                enables |= class_mask(class);
            }
        }
        let record = LaunchRecord {
            core_xy: noc::noc_xy_encoding(core.x, core.y),
            enables,
            reserved: [0; 2],
        };
        data.extend_from_slice(record.as_bytes());
    }

    let brisc_noc_id = program
        .kernels()
        .iter()
        .find(|k| k.class == ProcessorClass::Dm0)
        .and_then(|k| k.noc)
        .map(|n| n.index() as u32)
        .unwrap_or(0);

    CachedProgram {
        transfers,
        data,
        launch_records_offset,
        num_workers: lowered.num_workers,
        brisc_noc_id,
        spans: lowered.runtime_arg_spans.clone(),
    }
}
