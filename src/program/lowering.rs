//! Program lowering: flatten a [`Program`](super::Program) into the
//! contiguous byte vector and transfer descriptors the dispatcher replays.
//!
//! Lowering walks the program in a fixed order (kernel groups, then CB
//! configs, then semaphores, then runtime args), emits one transfer per
//! destination write, and packs transfers into sections bounded by the
//! per-core program buffer window. The output is deterministic: lowering the
//! same program twice yields byte-identical results, which is what makes the
//! queue-side program cache sound.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use thiserror::Error;

use crate::device::{noc, CoreCoord, CoreRangeSet, Grid, MemoryMap};

use super::{CircularBuffer, Program, ProcessorClass};

/// Destination kind of one transfer, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferType {
    /// Reserved legacy slot (unused by this device generation).
    B,
    /// Reserved legacy slot.
    Nc,
    /// Kernel text for the data-movement-0 class.
    T0,
    /// Kernel text for the data-movement-1 class.
    T1,
    /// Kernel text for the compute class.
    T2,
    /// Circular-buffer config words.
    Cb,
    /// Semaphore initial values.
    Sem,
}

impl TransferType {
    fn for_class(class: ProcessorClass) -> Self {
        match class {
            ProcessorClass::Dm0 => TransferType::T0,
            ProcessorClass::Dm1 => TransferType::T1,
            ProcessorClass::Compute => TransferType::T2,
        }
    }
}

/// One destination write within a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferInfo {
    /// Destination L1 address (same on every receiver).
    pub dst_addr: u32,
    /// Source offset in bytes, relative to the start of the owning section's
    /// slice of the program vector.
    pub start_in_bytes: u32,
    /// Payload size; 16-byte padded.
    pub size_bytes: u32,
    /// Physical-rectangle multicast encoding of the receivers.
    pub multicast_encoding: u32,
    /// Number of physical cores the encoding covers.
    pub num_receivers: u32,
}

/// One dispatch section: everything the dispatcher can write before worker
/// L1 program windows would overflow.
#[derive(Debug, Default)]
pub struct ProgramSection {
    pub transfers: BTreeMap<TransferType, SmallVec<[TransferInfo; 4]>>,
    /// Bytes of the program vector owned by this section, padding included.
    pub size_in_bytes: u32,
}

impl ProgramSection {
    pub fn num_transfers(&self) -> u32 {
        self.transfers.values().map(|v| v.len() as u32).sum()
    }

    /// Transfers in wire order.
    pub fn iter_transfers(&self) -> impl Iterator<Item = &TransferInfo> {
        self.transfers.values().flat_map(|v| v.iter())
    }
}

/// Location of one (core, class) runtime-args payload inside the program
/// vector, for in-place rewrites on re-enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeArgSpan {
    pub core: CoreCoord,
    pub class: ProcessorClass,
    /// Absolute byte offset into `program_vector`.
    pub offset: u32,
    pub len: u32,
}

/// The fully lowered program.
#[derive(Debug)]
pub struct ProgramSrcToDstAddrMap {
    /// Every payload byte the dispatcher will write, in section order.
    pub program_vector: Vec<u8>,
    pub sections: Vec<ProgramSection>,
    /// `(multicast_encoding, num_receivers)` per kernel group, in
    /// first-seen kernel order.
    pub multicast_coords: Vec<(u32, u32)>,
    /// Number of logical cores that run at least one kernel.
    pub num_workers: u32,
    pub runtime_arg_spans: Vec<RuntimeArgSpan>,
}

impl ProgramSrcToDstAddrMap {
    pub fn num_transfers(&self) -> u32 {
        self.sections.iter().map(|s| s.num_transfers()).sum()
    }
}

/// Fatal lowering failures; nothing reaches the device.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("kernel '{kernel}' core set is not a multicast rectangle")]
    NonRectangularMulticast { kernel: String },
    #[error("kernel '{kernel}' binary is {size} bytes, exceeds the {slot}-byte class slot")]
    BinaryTooLarge { kernel: String, size: u32, slot: u32 },
    #[error("program exceeds the per-core buffer window: core {core} needs {needed} bytes, window is {window}")]
    WindowOverflow { core: CoreCoord, needed: u32, window: u32 },
    #[error("program has no kernels")]
    EmptyProgram,
}

/// A transfer plus its payload and coverage, before section packing.
struct PendingTransfer {
    ty: TransferType,
    dst_addr: u32,
    payload: Vec<u8>,
    multicast_encoding: u32,
    num_receivers: u32,
    /// Logical cores covered, for the per-core footprint bound.
    cores: Vec<CoreCoord>,
    /// Set when the payload is a runtime-args block.
    runtime_args_of: Option<(CoreCoord, ProcessorClass)>,
}

fn pad16(len: usize) -> usize {
    (len + 15) & !15
}

fn pad32(len: usize) -> usize {
    (len + 31) & !31
}

/// Encode a logical rectangle set as a physical multicast.
fn encode_rect(grid: &Grid, cores: &CoreRangeSet) -> Option<(u32, u32)> {
    if !cores.is_rectangle() {
        return None;
    }
    let bb = cores.bounding_box()?;
    let start = grid.logical_to_physical(bb.start);
    let end = grid.logical_to_physical(bb.end);
    Some((noc::multicast_encoding(start.x, start.y, end.x, end.y), bb.num_cores()))
}

fn cb_config_words(cb: &CircularBuffer) -> [u32; 8] {
    [
        cb.address,
        cb.size_bytes(),
        cb.num_tiles,
        cb.tile_size,
        cb.data_format.as_u32(),
        0,
        0,
        0,
    ]
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// Lower `program` to its dispatcher address map.
pub fn lower(
    grid: &Grid,
    map: &MemoryMap,
    program: &Program,
) -> Result<ProgramSrcToDstAddrMap, LayoutError> {
    if program.kernels().is_empty() {
        return Err(LayoutError::EmptyProgram);
    }

    let mut pending: Vec<PendingTransfer> = Vec::new();
    let mut multicast_coords: Vec<(u32, u32)> = Vec::new();

    // 1. Kernel groups: kernels sharing a core-range set share one multicast.
    let mut groups: Vec<&CoreRangeSet> = Vec::new();
    for kernel in program.kernels() {
        if !groups.contains(&&kernel.cores) {
            groups.push(&kernel.cores);
        }
    }
    for &group_cores in &groups {
        let first = program
            .kernels()
            .iter()
            .find(|k| k.cores == *group_cores)
            .map(|k| k.name.clone())
            .unwrap_or_default();
        let (encoding, receivers) = encode_rect(grid, group_cores)
            .ok_or(LayoutError::NonRectangularMulticast { kernel: first })?;
        multicast_coords.push((encoding, receivers));

        // 2. One text transfer per class present in the group.
        for class in ProcessorClass::ALL {
            let Some(kernel) = program
                .kernels()
                .iter()
                .find(|k| k.class == class && k.cores == *group_cores)
            else {
                continue;
            };
            let padded = pad16(kernel.binary.len());
            if padded as u32 > map.kernel_slot_size {
                return Err(LayoutError::BinaryTooLarge {
                    kernel: kernel.name.clone(),
                    size: padded as u32,
                    slot: map.kernel_slot_size,
                });
            }
            let mut payload = kernel.binary.clone();
            payload.resize(padded, 0);
            pending.push(PendingTransfer {
                ty: TransferType::for_class(class),
                dst_addr: map.class_base(class.index()),
                payload,
                multicast_encoding: encoding,
                num_receivers: receivers,
                cores: group_cores.cores().collect(),
                runtime_args_of: None,
            });
        }
    }

    // 3. CB configs: one transfer per CB per core range.
    for cb in program.circular_buffers() {
        let payload = words_to_bytes(&cb_config_words(cb));
        for range in cb.cores.ranges() {
            let single = CoreRangeSet::new(vec![*range]);
            let (encoding, receivers) = encode_rect(grid, &single)
                .ok_or(LayoutError::NonRectangularMulticast { kernel: format!("cb{}", cb.operand) })?;
            pending.push(PendingTransfer {
                ty: TransferType::Cb,
                dst_addr: map.cb_config_base + cb.operand as u32 * 32,
                payload: payload.clone(),
                multicast_encoding: encoding,
                num_receivers: receivers,
                cores: range.cores().collect(),
                runtime_args_of: None,
            });
        }
    }

    // 4. Semaphores: one 4-byte value, 16-byte padded, per core range.
    for sem in program.semaphores() {
        let mut payload = sem.initial_value.to_le_bytes().to_vec();
        payload.resize(pad16(payload.len()), 0);
        for range in sem.cores.ranges() {
            let single = CoreRangeSet::new(vec![*range]);
            let (encoding, receivers) = encode_rect(grid, &single)
                .ok_or(LayoutError::NonRectangularMulticast { kernel: "sem".into() })?;
            pending.push(PendingTransfer {
                ty: TransferType::Sem,
                dst_addr: sem.address,
                payload: payload.clone(),
                multicast_encoding: encoding,
                num_receivers: receivers,
                cores: range.cores().collect(),
                runtime_args_of: None,
            });
        }
    }

    // 5. Runtime args: unicast per (core, class).
    for (&core, per_class) in program.runtime_args() {
        for (&class, args) in per_class {
            if args.is_empty() {
                continue;
            }
            let mut payload = words_to_bytes(args);
            payload.resize(pad16(payload.len()), 0);
            let phys = grid.logical_to_physical(core);
            pending.push(PendingTransfer {
                ty: TransferType::for_class(class),
                dst_addr: map.runtime_args_addr(class.index()),
                payload,
                multicast_encoding: noc::multicast_encoding(phys.x, phys.y, phys.x, phys.y),
                num_receivers: 1,
                cores: vec![core],
                runtime_args_of: Some((core, class)),
            });
        }
    }

    // 6. Section packing by per-core footprint, then vector concatenation.
    let mut sections: Vec<ProgramSection> = vec![ProgramSection::default()];
    let mut footprint: BTreeMap<CoreCoord, u32> = BTreeMap::new();
    let mut program_vector: Vec<u8> = Vec::new();
    let mut runtime_arg_spans: Vec<RuntimeArgSpan> = Vec::new();
    let mut section_start = 0usize;

    for t in pending {
        let size = t.payload.len() as u32;
        let over = t
            .cores
            .iter()
            .any(|c| footprint.get(c).copied().unwrap_or(0) + size > map.program_buffer_window);
        if over {
            if size > map.program_buffer_window {
                return Err(LayoutError::WindowOverflow {
                    core: t.cores[0],
                    needed: size,
                    window: map.program_buffer_window,
                });
            }
            let padded = pad32(program_vector.len() - section_start);
            program_vector.resize(section_start + padded, 0);
            if let Some(s) = sections.last_mut() {
                s.size_in_bytes = padded as u32;
            }
            sections.push(ProgramSection::default());
            footprint.clear();
            section_start = program_vector.len();
        }

        let start_in_section = (program_vector.len() - section_start) as u32;
        if let Some((core, class)) = t.runtime_args_of {
            runtime_arg_spans.push(RuntimeArgSpan {
                core,
                class,
                offset: program_vector.len() as u32,
                len: size,
            });
        }
        program_vector.extend_from_slice(&t.payload);
        for core in &t.cores {
            *footprint.entry(*core).or_insert(0) += size;
        }
        let section = sections.last_mut().expect("at least one section");
        section.transfers.entry(t.ty).or_default().push(TransferInfo {
            dst_addr: t.dst_addr,
            start_in_bytes: start_in_section,
            size_bytes: size,
            multicast_encoding: t.multicast_encoding,
            num_receivers: t.num_receivers,
        });
    }

    let padded = pad32(program_vector.len() - section_start);
    program_vector.resize(section_start + padded, 0);
    if let Some(s) = sections.last_mut() {
        s.size_in_bytes = padded as u32;
    }

    let out = ProgramSrcToDstAddrMap {
        program_vector,
        sections,
        multicast_coords,
        num_workers: program.logical_cores().len() as u32,
        runtime_arg_spans,
    };
    debug_assert_eq!(
        out.sections.iter().map(|s| s.size_in_bytes as usize).sum::<usize>(),
        out.program_vector.len()
    );
    log::debug!(
        "lowered program {:?}: {} bytes, {} sections, {} transfers, {} workers",
        program.id(),
        out.program_vector.len(),
        out.sections.len(),
        out.num_transfers(),
        out.num_workers
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CoreRange;
    use crate::program::{DataFormat, Kernel, Program, Semaphore};

    fn grid() -> Grid {
        Grid::new(8, 8)
    }

    fn map() -> MemoryMap {
        MemoryMap::default()
    }

    fn single_kernel_program(binary_len: usize) -> Program {
        let mut program = Program::new();
        program
            .add_kernel(
                Kernel::new(
                    "reader",
                    ProcessorClass::Dm0,
                    vec![0x5A; binary_len],
                    CoreRangeSet::single(CoreCoord::new(0, 0)),
                ),
                &grid(),
            )
            .unwrap();
        program
    }

    #[test]
    fn test_single_kernel_single_transfer() {
        let program = single_kernel_program(1000);
        let lowered = lower(&grid(), &map(), &program).unwrap();

        // 1000 -> 1008 padded transfer, 1024 padded section.
        assert_eq!(lowered.sections.len(), 1);
        assert_eq!(lowered.program_vector.len(), 1024);
        assert_eq!(lowered.num_workers, 1);
        let t0 = &lowered.sections[0].transfers[&TransferType::T0];
        assert_eq!(t0.len(), 1);
        assert_eq!(t0[0].dst_addr, map().t0_base);
        assert_eq!(t0[0].size_bytes, 1008);
        assert_eq!(t0[0].num_receivers, 1);
        // Logical (0,0) is physical (1,1).
        assert_eq!(noc::decode_multicast(t0[0].multicast_encoding), (1, 1, 1, 1));
    }

    #[test]
    fn test_lowering_is_idempotent() {
        let program = single_kernel_program(700);
        let a = lower(&grid(), &map(), &program).unwrap();
        let b = lower(&grid(), &map(), &program).unwrap();
        assert_eq!(a.program_vector, b.program_vector);
        assert_eq!(a.num_transfers(), b.num_transfers());
    }

    #[test]
    fn test_shared_range_set_shares_multicast() {
        let mut program = Program::new();
        let cores = CoreRangeSet::new(vec![CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1))]);
        program
            .add_kernel(Kernel::new("rd", ProcessorClass::Dm0, vec![1; 64], cores.clone()), &grid())
            .unwrap();
        program
            .add_kernel(Kernel::new("wr", ProcessorClass::Dm1, vec![2; 64], cores), &grid())
            .unwrap();

        let lowered = lower(&grid(), &map(), &program).unwrap();
        assert_eq!(lowered.multicast_coords.len(), 1);
        assert_eq!(lowered.multicast_coords[0].1, 4);
        assert_eq!(lowered.num_workers, 4);
        let section = &lowered.sections[0];
        assert_eq!(section.transfers[&TransferType::T0][0].multicast_encoding,
                   section.transfers[&TransferType::T1][0].multicast_encoding);
    }

    #[test]
    fn test_non_rectangular_group_rejected() {
        let mut program = Program::new();
        let cores = CoreRangeSet::new(vec![
            CoreRange::single(CoreCoord::new(0, 0)),
            CoreRange::single(CoreCoord::new(1, 1)),
        ]);
        program
            .add_kernel(Kernel::new("diag", ProcessorClass::Dm0, vec![1; 16], cores), &grid())
            .unwrap();
        let err = lower(&grid(), &map(), &program).unwrap_err();
        assert!(matches!(err, LayoutError::NonRectangularMulticast { .. }));
    }

    #[test]
    fn test_oversized_binary_rejected() {
        let program = single_kernel_program(map().kernel_slot_size as usize + 1);
        let err = lower(&grid(), &map(), &program).unwrap_err();
        assert!(matches!(err, LayoutError::BinaryTooLarge { .. }));
    }

    #[test]
    fn test_cb_and_semaphore_transfers() {
        let mut program = Program::new();
        let cores = CoreRangeSet::new(vec![CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1))]);
        program
            .add_kernel(Kernel::new("rd", ProcessorClass::Dm0, vec![1; 32], cores.clone()), &grid())
            .unwrap();
        program
            .add_circular_buffer(
                CircularBuffer {
                    operand: 2,
                    cores: cores.clone(),
                    address: 0x32000,
                    num_tiles: 4,
                    tile_size: 2048,
                    data_format: DataFormat::Float16B,
                },
                &map(),
            )
            .unwrap();
        program
            .add_semaphore(Semaphore { cores, address: map().sem_base + 16, initial_value: 3 }, &map())
            .unwrap();

        let lowered = lower(&grid(), &map(), &program).unwrap();
        let section = &lowered.sections[0];
        let cb = &section.transfers[&TransferType::Cb][0];
        assert_eq!(cb.dst_addr, map().cb_config_base + 2 * 32);
        assert_eq!(cb.size_bytes, 32);
        assert_eq!(cb.num_receivers, 4);
        let sem = &section.transfers[&TransferType::Sem][0];
        assert_eq!(sem.dst_addr, map().sem_base + 16);
        assert_eq!(sem.size_bytes, 16);
        // Payload starts with the initial value.
        let start = sem.start_in_bytes as usize;
        assert_eq!(&lowered.program_vector[start..start + 4], &3u32.to_le_bytes());
    }

    #[test]
    fn test_runtime_arg_spans_recorded() {
        let mut program = single_kernel_program(64);
        program.set_runtime_args(CoreCoord::new(0, 0), ProcessorClass::Dm0, vec![7, 8, 9]);
        let lowered = lower(&grid(), &map(), &program).unwrap();

        assert_eq!(lowered.runtime_arg_spans.len(), 1);
        let span = lowered.runtime_arg_spans[0];
        assert_eq!(span.core, CoreCoord::new(0, 0));
        assert_eq!(span.len, 16);
        let off = span.offset as usize;
        assert_eq!(&lowered.program_vector[off..off + 4], &7u32.to_le_bytes());
    }

    #[test]
    fn test_section_split_on_window_overflow() {
        // Shrink the window so two 4 KiB kernels on the same core cannot
        // share a section.
        let mut m = map();
        m.program_buffer_window = 0x1800;
        m.kernel_slot_size = 0x1000;
        let mut program = Program::new();
        let cores = CoreRangeSet::single(CoreCoord::new(0, 0));
        program
            .add_kernel(Kernel::new("a", ProcessorClass::Dm0, vec![1; 0x1000], cores.clone()), &grid())
            .unwrap();
        program
            .add_kernel(Kernel::new("b", ProcessorClass::Dm1, vec![2; 0x1000], cores), &grid())
            .unwrap();

        let lowered = lower(&grid(), &m, &program).unwrap();
        assert_eq!(lowered.sections.len(), 2);
        assert_eq!(
            lowered.sections.iter().map(|s| s.size_in_bytes).sum::<u32>() as usize,
            lowered.program_vector.len()
        );
        // Each section's transfer offsets are section-relative.
        assert_eq!(lowered.sections[1].transfers[&TransferType::T1][0].start_in_bytes, 0);
    }
}
