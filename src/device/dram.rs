//! Simulated device DRAM reachable through the dispatcher.
//!
//! Buffer reads and writes issued through the command queue land here. The
//! allocator that hands out buffer addresses is an external collaborator;
//! this model only needs to honor reads and writes at arbitrary 64-bit
//! addresses, so it uses sparse 4 KiB pages instead of materializing the
//! whole address space.
//!
//! # Usage
//!
//! ```
//! use tilecq::device::DramMemory;
//!
//! let mut dram = DramMemory::new();
//! dram.allocate_region("input", 0x1000_0000, 4096).unwrap();
//! dram.write(0x1000_0000, &[1, 2, 3, 4]);
//! assert_eq!(dram.read(0x1000_0000, 4), vec![1, 2, 3, 4]);
//! ```

use std::collections::BTreeMap;

/// A named DRAM region, for debugging and accounting.
#[derive(Debug, Clone)]
pub struct DramRegion {
    pub name: String,
    pub base_address: u64,
    pub size: usize,
}

impl DramRegion {
    /// Check if an address range overlaps this region.
    #[inline]
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let end = addr.saturating_add(len as u64);
        let region_end = self.base_address.saturating_add(self.size as u64);
        addr < region_end && end > self.base_address
    }
}

/// Error type for DRAM region bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DramError {
    /// Region overlap on allocation
    RegionOverlap { new_base: u64, existing_name: String },
    /// Region not found
    RegionNotFound(String),
}

impl std::fmt::Display for DramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegionOverlap { new_base, existing_name } => {
                write!(f, "Region at 0x{:016x} overlaps with '{}'", new_base, existing_name)
            }
            Self::RegionNotFound(name) => write!(f, "Region '{}' not found", name),
        }
    }
}

impl std::error::Error for DramError {}

/// Sparse device DRAM.
///
/// Pages are allocated on first touch; untouched bytes read as zero.
#[derive(Default)]
pub struct DramMemory {
    /// Sparse storage: page_address -> page_data
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,
    /// Named regions for debugging
    regions: Vec<DramRegion>,
    /// Statistics
    total_bytes_written: u64,
    total_bytes_read: u64,
}

impl DramMemory {
    /// Page size for sparse storage (4 KiB).
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named region. Pages are still allocated on demand.
    pub fn allocate_region(
        &mut self,
        name: impl Into<String>,
        base_address: u64,
        size: usize,
    ) -> Result<(), DramError> {
        let name = name.into();
        for existing in &self.regions {
            if existing.overlaps(base_address, size) {
                return Err(DramError::RegionOverlap {
                    new_base: base_address,
                    existing_name: existing.name.clone(),
                });
            }
        }
        self.regions.push(DramRegion { name, base_address, size });
        Ok(())
    }

    /// Look up a region by name.
    pub fn region(&self, name: &str) -> Option<&DramRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Write bytes at an address, allocating pages as needed.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let mut offset = 0usize;
        while offset < data.len() {
            let cur = addr + offset as u64;
            let page_addr = cur & Self::PAGE_MASK;
            let in_page = (cur - page_addr) as usize;
            let chunk = (Self::PAGE_SIZE - in_page).min(data.len() - offset);

            let page = self
                .pages
                .entry(page_addr)
                .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]));
            page[in_page..in_page + chunk].copy_from_slice(&data[offset..offset + chunk]);
            offset += chunk;
        }
        self.total_bytes_written += data.len() as u64;
    }

    /// Read bytes at an address. Unallocated bytes read as zero.
    pub fn read(&mut self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(addr, &mut out);
        out
    }

    /// Read into a caller-provided slice.
    pub fn read_into(&mut self, addr: u64, out: &mut [u8]) {
        let mut offset = 0usize;
        while offset < out.len() {
            let cur = addr + offset as u64;
            let page_addr = cur & Self::PAGE_MASK;
            let in_page = (cur - page_addr) as usize;
            let chunk = (Self::PAGE_SIZE - in_page).min(out.len() - offset);

            if let Some(page) = self.pages.get(&page_addr) {
                out[offset..offset + chunk].copy_from_slice(&page[in_page..in_page + chunk]);
            }
            // Missing pages read back as zero.
            offset += chunk;
        }
        self.total_bytes_read += out.len() as u64;
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }
}
