//! User program model: kernels, circular buffers, semaphores, and runtime
//! arguments bound to logical core placements.
//!
//! A [`Program`] is a validated bag of work for one launch: each kernel
//! carries a compiled binary and a core-range set, circular buffers describe
//! L1 FIFOs for the kernels to communicate through, and semaphores seed
//! 32-bit counters at fixed L1 addresses. Programs are immutable once
//! enqueued; the command queue caches their lowered form keyed by
//! [`ProgramId`].

pub mod lowering;

pub use lowering::{
    lower, LayoutError, ProgramSection, ProgramSrcToDstAddrMap, RuntimeArgSpan, TransferInfo,
    TransferType,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::device::{CoreCoord, CoreRangeSet, Grid, MemoryMap, NocId, NUM_CBS};

/// Which on-core processor a kernel targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessorClass {
    /// Data-movement processor 0 (the launch master).
    Dm0,
    /// Data-movement processor 1 (slave).
    Dm1,
    /// The compute processor.
    Compute,
}

impl ProcessorClass {
    pub const ALL: [ProcessorClass; 3] = [ProcessorClass::Dm0, ProcessorClass::Dm1, ProcessorClass::Compute];

    pub fn index(self) -> usize {
        match self {
            ProcessorClass::Dm0 => 0,
            ProcessorClass::Dm1 => 1,
            ProcessorClass::Compute => 2,
        }
    }

    pub fn is_data_movement(self) -> bool {
        !matches!(self, ProcessorClass::Compute)
    }
}

/// Tile data format stored in a circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
    #[default]
    Float16B,
    Float32,
    Uint32,
    Bfp8B,
}

impl DataFormat {
    pub fn as_u32(self) -> u32 {
        match self {
            DataFormat::Float16B => 0,
            DataFormat::Float32 => 1,
            DataFormat::Uint32 => 2,
            DataFormat::Bfp8B => 3,
        }
    }
}

/// A compiled kernel bound to a core-range set.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    pub class: ProcessorClass,
    /// Compiled binary image, loaded into the class's L1 text slot.
    pub binary: Vec<u8>,
    pub cores: CoreRangeSet,
    pub compile_args: Vec<u32>,
    /// NOC assignment; data-movement kernels only.
    pub noc: Option<NocId>,
}

impl Kernel {
    pub fn new(name: impl Into<String>, class: ProcessorClass, binary: Vec<u8>, cores: CoreRangeSet) -> Self {
        Self { name: name.into(), class, binary, cores, compile_args: Vec::new(), noc: None }
    }

    pub fn with_noc(mut self, noc: NocId) -> Self {
        self.noc = Some(noc);
        self
    }

    pub fn with_compile_args(mut self, args: Vec<u32>) -> Self {
        self.compile_args = args;
        self
    }
}

/// A bounded FIFO in worker L1, identified by an operand index.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    /// Operand index in `[0, NUM_CBS)`.
    pub operand: u8,
    pub cores: CoreRangeSet,
    /// L1 base address of the FIFO storage.
    pub address: u32,
    pub num_tiles: u32,
    pub tile_size: u32,
    pub data_format: DataFormat,
}

impl CircularBuffer {
    pub fn size_bytes(&self) -> u32 {
        self.num_tiles * self.tile_size
    }

    pub fn end_address(&self) -> u32 {
        self.address + self.size_bytes()
    }

    fn overlaps(&self, other: &CircularBuffer) -> bool {
        self.address < other.end_address() && other.address < self.end_address()
    }
}

/// A 32-bit counter seeded at a fixed L1 address.
#[derive(Debug, Clone)]
pub struct Semaphore {
    pub cores: CoreRangeSet,
    pub address: u32,
    pub initial_value: u32,
}

/// Per-core, per-class runtime arguments.
pub type RuntimeArgs = BTreeMap<CoreCoord, BTreeMap<ProcessorClass, Vec<u32>>>;

/// Stable identity of a program for the queue-side cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(u64);

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// Errors raised while assembling a program.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("kernel '{kernel}' targets cores outside the {cols}x{rows} grid")]
    KernelOutOfGrid { kernel: String, cols: u32, rows: u32 },
    #[error("CB operand {operand} out of range (max {max})")]
    BadOperand { operand: u8, max: usize },
    #[error("CB operand {operand} window [0x{start:X}, 0x{end:X}) exceeds L1 size 0x{l1_size:X}")]
    CbOutOfL1 { operand: u8, start: u32, end: u32, l1_size: u32 },
    #[error("CB operands {a} and {b} overlap on core {core}")]
    CbOverlap { core: CoreCoord, a: u8, b: u8 },
    #[error("duplicate semaphore address 0x{address:X} on core {core}")]
    SemaphoreDuplicate { core: CoreCoord, address: u32 },
    #[error("semaphore address 0x{address:X} outside the semaphore window")]
    SemaphoreOutOfRegion { address: u32 },
    #[error("compute kernel '{kernel}' cannot carry a NOC assignment")]
    NocOnComputeKernel { kernel: String },
    #[error("kernels '{a}' and '{b}' both target the {class:?} processor on core {core}")]
    KernelClassConflict { a: String, b: String, class: ProcessorClass, core: CoreCoord },
}

/// Kernels resident on one core, by class.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelGroup<'a> {
    pub dm0: Option<&'a Kernel>,
    pub dm1: Option<&'a Kernel>,
    pub compute: Option<&'a Kernel>,
}

impl<'a> KernelGroup<'a> {
    pub fn get(&self, class: ProcessorClass) -> Option<&'a Kernel> {
        match class {
            ProcessorClass::Dm0 => self.dm0,
            ProcessorClass::Dm1 => self.dm1,
            ProcessorClass::Compute => self.compute,
        }
    }
}

/// An immutable-after-construction container of kernels, CBs, semaphores,
/// and runtime args.
pub struct Program {
    id: ProgramId,
    kernels: Vec<Kernel>,
    circular_buffers: Vec<CircularBuffer>,
    semaphores: Vec<Semaphore>,
    runtime_args: RuntimeArgs,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        Self {
            id: ProgramId(NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed)),
            kernels: Vec::new(),
            circular_buffers: Vec::new(),
            semaphores: Vec::new(),
            runtime_args: RuntimeArgs::new(),
        }
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    pub fn circular_buffers(&self) -> &[CircularBuffer] {
        &self.circular_buffers
    }

    pub fn semaphores(&self) -> &[Semaphore] {
        &self.semaphores
    }

    pub fn runtime_args(&self) -> &RuntimeArgs {
        &self.runtime_args
    }

    /// Add a kernel, checking its placement against the grid and that its
    /// processor is still free on every targeted core.
    pub fn add_kernel(&mut self, kernel: Kernel, grid: &Grid) -> Result<(), ProgramError> {
        if kernel.class == ProcessorClass::Compute && kernel.noc.is_some() {
            return Err(ProgramError::NocOnComputeKernel { kernel: kernel.name.clone() });
        }
        for range in kernel.cores.ranges() {
            if !grid.contains_range(range) {
                return Err(ProgramError::KernelOutOfGrid {
                    kernel: kernel.name.clone(),
                    cols: grid.cols,
                    rows: grid.rows,
                });
            }
        }
        // Each core runs at most one kernel per processor class; a second
        // binary for an occupied slot would clobber the first in L1.
        for existing in &self.kernels {
            if existing.class != kernel.class {
                continue;
            }
            if let Some(core) = kernel.cores.cores().find(|c| existing.cores.contains(*c)) {
                return Err(ProgramError::KernelClassConflict {
                    a: existing.name.clone(),
                    b: kernel.name.clone(),
                    class: kernel.class,
                    core,
                });
            }
        }
        self.kernels.push(kernel);
        Ok(())
    }

    /// Add a circular buffer, checking its L1 window and overlap with CBs
    /// already placed on shared cores.
    pub fn add_circular_buffer(&mut self, cb: CircularBuffer, map: &MemoryMap) -> Result<(), ProgramError> {
        if cb.operand as usize >= NUM_CBS {
            return Err(ProgramError::BadOperand { operand: cb.operand, max: NUM_CBS - 1 });
        }
        if cb.end_address() > map.l1_size {
            return Err(ProgramError::CbOutOfL1 {
                operand: cb.operand,
                start: cb.address,
                end: cb.end_address(),
                l1_size: map.l1_size,
            });
        }
        for existing in &self.circular_buffers {
            if !existing.overlaps(&cb) {
                continue;
            }
            if let Some(core) = cb.cores.cores().find(|c| existing.cores.contains(*c)) {
                return Err(ProgramError::CbOverlap { core, a: existing.operand, b: cb.operand });
            }
        }
        self.circular_buffers.push(cb);
        Ok(())
    }

    /// Add a semaphore, checking address uniqueness per core.
    pub fn add_semaphore(&mut self, sem: Semaphore, map: &MemoryMap) -> Result<(), ProgramError> {
        if sem.address < map.sem_base || sem.address + 4 > map.sem_base + map.sem_region_size {
            return Err(ProgramError::SemaphoreOutOfRegion { address: sem.address });
        }
        for existing in &self.semaphores {
            if existing.address != sem.address {
                continue;
            }
            if let Some(core) = sem.cores.cores().find(|c| existing.cores.contains(*c)) {
                return Err(ProgramError::SemaphoreDuplicate { core, address: sem.address });
            }
        }
        self.semaphores.push(sem);
        Ok(())
    }

    /// Set runtime args for one (core, class). Replaces any previous args.
    pub fn set_runtime_args(&mut self, core: CoreCoord, class: ProcessorClass, args: Vec<u32>) {
        self.runtime_args.entry(core).or_default().insert(class, args);
    }

    /// Kernels resident on `core`, by class.
    pub fn kernels_on_core(&self, core: CoreCoord) -> KernelGroup<'_> {
        let mut group = KernelGroup::default();
        for kernel in &self.kernels {
            if !kernel.cores.contains(core) {
                continue;
            }
            match kernel.class {
                ProcessorClass::Dm0 => group.dm0 = Some(kernel),
                ProcessorClass::Dm1 => group.dm1 = Some(kernel),
                ProcessorClass::Compute => group.compute = Some(kernel),
            }
        }
        group
    }

    pub fn circular_buffers_on_core(&self, core: CoreCoord) -> Vec<&CircularBuffer> {
        self.circular_buffers.iter().filter(|cb| cb.cores.contains(core)).collect()
    }

    pub fn semaphores_on_core(&self, core: CoreCoord) -> Vec<&Semaphore> {
        self.semaphores.iter().filter(|s| s.cores.contains(core)).collect()
    }

    /// All cores that run at least one kernel, sorted and deduplicated.
    pub fn logical_cores(&self) -> Vec<CoreCoord> {
        let mut cores: Vec<CoreCoord> = self.kernels.iter().flat_map(|k| k.cores.cores()).collect();
        cores.sort();
        cores.dedup();
        cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CoreRange;

    fn grid() -> Grid {
        Grid::new(8, 8)
    }

    fn map() -> MemoryMap {
        MemoryMap::default()
    }

    fn dm0_kernel(cores: CoreRangeSet) -> Kernel {
        Kernel::new("reader", ProcessorClass::Dm0, vec![0u8; 64], cores)
    }

    #[test]
    fn test_kernel_out_of_grid_rejected() {
        let mut program = Program::new();
        let cores = CoreRangeSet::single(CoreCoord::new(8, 0));
        let err = program.add_kernel(dm0_kernel(cores), &grid()).unwrap_err();
        assert!(matches!(err, ProgramError::KernelOutOfGrid { .. }));
    }

    #[test]
    fn test_cb_overlap_on_shared_core_rejected() {
        let mut program = Program::new();
        let cores = CoreRangeSet::single(CoreCoord::new(1, 1));
        program
            .add_circular_buffer(
                CircularBuffer {
                    operand: 0,
                    cores: cores.clone(),
                    address: 0x32000,
                    num_tiles: 8,
                    tile_size: 2048,
                    data_format: DataFormat::Float16B,
                },
                &map(),
            )
            .unwrap();
        let err = program
            .add_circular_buffer(
                CircularBuffer {
                    operand: 1,
                    cores,
                    address: 0x33000,
                    num_tiles: 8,
                    tile_size: 2048,
                    data_format: DataFormat::Float16B,
                },
                &map(),
            )
            .unwrap_err();
        assert!(matches!(err, ProgramError::CbOverlap { .. }));
    }

    #[test]
    fn test_cb_overlap_on_disjoint_cores_allowed() {
        let mut program = Program::new();
        program
            .add_circular_buffer(
                CircularBuffer {
                    operand: 0,
                    cores: CoreRangeSet::single(CoreCoord::new(0, 0)),
                    address: 0x32000,
                    num_tiles: 8,
                    tile_size: 2048,
                    data_format: DataFormat::Float16B,
                },
                &map(),
            )
            .unwrap();
        program
            .add_circular_buffer(
                CircularBuffer {
                    operand: 1,
                    cores: CoreRangeSet::single(CoreCoord::new(1, 0)),
                    address: 0x32000,
                    num_tiles: 8,
                    tile_size: 2048,
                    data_format: DataFormat::Float16B,
                },
                &map(),
            )
            .unwrap();
    }

    #[test]
    fn test_semaphore_duplicate_rejected() {
        let mut program = Program::new();
        let m = map();
        let cores = CoreRangeSet::single(CoreCoord::new(2, 2));
        program
            .add_semaphore(Semaphore { cores: cores.clone(), address: m.sem_base, initial_value: 1 }, &m)
            .unwrap();
        let err = program
            .add_semaphore(Semaphore { cores, address: m.sem_base, initial_value: 2 }, &m)
            .unwrap_err();
        assert!(matches!(err, ProgramError::SemaphoreDuplicate { .. }));
    }

    #[test]
    fn test_kernels_on_core() {
        let mut program = Program::new();
        let range = CoreRangeSet::new(vec![CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1))]);
        program.add_kernel(dm0_kernel(range.clone()), &grid()).unwrap();
        program
            .add_kernel(
                Kernel::new("math", ProcessorClass::Compute, vec![0u8; 32], range),
                &grid(),
            )
            .unwrap();

        let group = program.kernels_on_core(CoreCoord::new(1, 0));
        assert!(group.dm0.is_some());
        assert!(group.dm1.is_none());
        assert!(group.compute.is_some());
        assert_eq!(program.logical_cores().len(), 4);
    }

    #[test]
    fn test_same_class_kernel_conflict_rejected() {
        let mut program = Program::new();
        let cores = CoreRangeSet::new(vec![CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1))]);
        program.add_kernel(dm0_kernel(cores.clone()), &grid()).unwrap();

        // Identical core set: the second DM0 binary has nowhere to go.
        let err = program.add_kernel(dm0_kernel(cores), &grid()).unwrap_err();
        assert!(matches!(err, ProgramError::KernelClassConflict { .. }));

        // Overlapping-but-distinct core sets conflict on the shared core.
        let overlap = CoreRangeSet::new(vec![CoreRange::new(CoreCoord::new(1, 1), CoreCoord::new(2, 2))]);
        let err = program.add_kernel(dm0_kernel(overlap), &grid()).unwrap_err();
        assert!(matches!(
            err,
            ProgramError::KernelClassConflict { core: CoreCoord { x: 1, y: 1 }, .. }
        ));

        // Disjoint placement of the same class is fine.
        program
            .add_kernel(dm0_kernel(CoreRangeSet::single(CoreCoord::new(3, 3))), &grid())
            .unwrap();
        // A different class may share the original cores.
        program
            .add_kernel(
                Kernel::new(
                    "math",
                    ProcessorClass::Compute,
                    vec![0u8; 32],
                    CoreRangeSet::single(CoreCoord::new(0, 0)),
                ),
                &grid(),
            )
            .unwrap();
    }

    #[test]
    fn test_program_ids_unique() {
        assert_ne!(Program::new().id(), Program::new().id());
    }
}
