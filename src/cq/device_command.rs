//! DeviceCommand wire format.
//!
//! Every command occupies a region in the issue ring: a 16-word header
//! followed by 6-word transfer descriptors, rounded up to the 64-byte
//! reservation grain. Variable-length payload (buffer data or a lowered
//! program vector plus launch records) follows the region,
//! `data_size_in_bytes` long. All words are little-endian; the host
//! publishes a command only after every byte is in place, so the dispatcher
//! never observes a half-written command.
//!
//! A wrap is header-only: the dispatcher reads the first 64 bytes, sees the
//! wrap flag, and jumps to the ring start, so a wrap fits in any 64-byte
//! remainder of the ring.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Largest allowed header + descriptor region.
pub const MAX_COMMAND_REGION_BYTES: usize = 1536;
/// Header size: 16 little-endian words.
pub const COMMAND_HEADER_BYTES: usize = 64;
/// Words per transfer descriptor.
pub const TRANSFER_DESC_WORDS: usize = 6;
/// Descriptor slots available within the largest region.
pub const MAX_TRANSFERS: usize =
    (MAX_COMMAND_REGION_BYTES - COMMAND_HEADER_BYTES) / (TRANSFER_DESC_WORDS * 4);
/// Ring reservation grain; regions and payloads round up to this.
pub const COMMAND_ALIGN_BYTES: usize = 64;

/// What the dispatcher should do with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandOpcode {
    WriteBuffer = 1,
    ReadBuffer = 2,
    Program = 3,
    Finish = 4,
    Wrap = 5,
}

impl TryFrom<u32> for CommandOpcode {
    type Error = CommandParseError;

    fn try_from(value: u32) -> Result<Self, CommandParseError> {
        match value {
            1 => Ok(CommandOpcode::WriteBuffer),
            2 => Ok(CommandOpcode::ReadBuffer),
            3 => Ok(CommandOpcode::Program),
            4 => Ok(CommandOpcode::Finish),
            5 => Ok(CommandOpcode::Wrap),
            other => Err(CommandParseError::BadOpcode(other)),
        }
    }
}

/// One data-section write: where the payload slice goes and who receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferDescriptor {
    /// Destination L1 address.
    pub dst_addr: u32,
    /// Byte offset of the payload within the data section.
    pub src_offset: u32,
    pub size_bytes: u32,
    pub multicast_encoding: u32,
    pub num_receivers: u32,
    /// Linked-transaction flag; always zero on this device generation.
    pub linked: u32,
}

/// Per-core launch parameters appended to a program command's data section.
///
/// The header carries one `enables` mask only; cores whose kernel set
/// differs get their own record here, located by `launch_records_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct LaunchRecord {
    /// Logical core packed as a NOC node word.
    pub core_xy: u32,
    /// Processor-class enable mask for this core.
    pub enables: u32,
    pub reserved: [u32; 2],
}

/// Size of one launch record in the data section.
pub const LAUNCH_RECORD_BYTES: usize = std::mem::size_of::<LaunchRecord>();

/// Wire-format decode failures. The dispatcher logs these and leaves device
/// state untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("unknown command opcode {0}")]
    BadOpcode(u32),
    #[error("command declares {n} transfers, region holds {max}")]
    TooManyTransfers { n: u32, max: usize },
    #[error("command region truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// An assembled command, ready for serialization into the issue ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    pub opcode: CommandOpcode,
    /// Wrap flag; the dispatcher checks it before anything else.
    pub wrap: u32,
    /// Finish flag; set only on finish commands.
    pub finish: u32,
    /// Cores that must ack before the next command (program commands).
    pub num_workers: u32,
    /// Payload bytes following the command region.
    pub data_size_in_bytes: u32,
    pub page_size: u32,
    /// Reserved-zero: CB configuration travels as ordinary transfer
    /// descriptors on this device generation, so the host never fills
    /// words 6 and 7.
    pub producer_cb_size: u32,
    /// Reserved-zero, like `producer_cb_size`.
    pub consumer_cb_size: u32,
    /// DRAM buffer address (buffer commands).
    pub buffer_addr: u64,
    pub num_pages: u32,
    /// Offset from the command start to its data section.
    pub data_section_offset: u32,
    /// Offset of the launch records within the data section.
    pub launch_records_offset: u32,
    pub brisc_noc_id: u32,
    /// Host-side enqueue sequence number, echoed into launch messages.
    pub host_assigned_id: u32,
    pub transfers: Vec<TransferDescriptor>,
}

impl DeviceCommand {
    pub fn new(opcode: CommandOpcode) -> Self {
        Self {
            opcode,
            wrap: (opcode == CommandOpcode::Wrap) as u32,
            finish: (opcode == CommandOpcode::Finish) as u32,
            num_workers: 0,
            data_size_in_bytes: 0,
            page_size: 0,
            producer_cb_size: 0,
            consumer_cb_size: 0,
            buffer_addr: 0,
            num_pages: 0,
            data_section_offset: COMMAND_HEADER_BYTES as u32,
            launch_records_offset: 0,
            brisc_noc_id: 0,
            host_assigned_id: 0,
            transfers: Vec::new(),
        }
    }

    pub fn add_transfer(&mut self, desc: TransferDescriptor) {
        self.transfers.push(desc);
        self.data_section_offset = self.region_bytes() as u32;
    }

    /// Size of the header + descriptor region, rounded to the reservation
    /// grain.
    pub fn region_bytes(&self) -> usize {
        let raw = COMMAND_HEADER_BYTES + self.transfers.len() * TRANSFER_DESC_WORDS * 4;
        (raw + COMMAND_ALIGN_BYTES - 1) & !(COMMAND_ALIGN_BYTES - 1)
    }

    /// Payload bytes that follow the region in the ring. Read commands
    /// stream their data back through the completion region, so only writes
    /// and programs carry ring payload.
    pub fn ring_payload_bytes(&self) -> usize {
        match self.opcode {
            CommandOpcode::WriteBuffer | CommandOpcode::Program => self.data_size_in_bytes as usize,
            _ => 0,
        }
    }

    /// Total ring bytes this command occupies: region plus payload, rounded
    /// to the reservation grain.
    pub fn wire_size(&self) -> usize {
        let pad = COMMAND_ALIGN_BYTES - 1;
        self.region_bytes() + ((self.ring_payload_bytes() + pad) & !pad)
    }

    /// Serialize the command region. Payload bytes are written separately by
    /// the queue, after the region.
    pub fn to_bytes(&self) -> Vec<u8> {
        let region = self.region_bytes();
        let mut out = Vec::with_capacity(region);
        out.write_u32::<LittleEndian>(self.wrap).expect("vec write");
        out.write_u32::<LittleEndian>(self.finish).expect("vec write");
        out.write_u32::<LittleEndian>(self.num_workers).expect("vec write");
        out.write_u32::<LittleEndian>(self.data_size_in_bytes).expect("vec write");
        out.write_u32::<LittleEndian>(self.transfers.len() as u32).expect("vec write");
        out.write_u32::<LittleEndian>(self.page_size).expect("vec write");
        out.write_u32::<LittleEndian>(self.producer_cb_size).expect("vec write");
        out.write_u32::<LittleEndian>(self.consumer_cb_size).expect("vec write");
        out.write_u32::<LittleEndian>(self.opcode as u32).expect("vec write");
        out.write_u32::<LittleEndian>(self.buffer_addr as u32).expect("vec write");
        out.write_u32::<LittleEndian>((self.buffer_addr >> 32) as u32).expect("vec write");
        out.write_u32::<LittleEndian>(self.num_pages).expect("vec write");
        out.write_u32::<LittleEndian>(self.data_section_offset).expect("vec write");
        out.write_u32::<LittleEndian>(self.launch_records_offset).expect("vec write");
        out.write_u32::<LittleEndian>(self.brisc_noc_id).expect("vec write");
        out.write_u32::<LittleEndian>(self.host_assigned_id).expect("vec write");
        for t in &self.transfers {
            out.write_u32::<LittleEndian>(t.dst_addr).expect("vec write");
            out.write_u32::<LittleEndian>(t.src_offset).expect("vec write");
            out.write_u32::<LittleEndian>(t.size_bytes).expect("vec write");
            out.write_u32::<LittleEndian>(t.multicast_encoding).expect("vec write");
            out.write_u32::<LittleEndian>(t.num_receivers).expect("vec write");
            out.write_u32::<LittleEndian>(t.linked).expect("vec write");
        }
        out.resize(region, 0);
        out
    }

    fn decode_header(bytes: &[u8]) -> Result<(Self, u32), CommandParseError> {
        if bytes.len() < COMMAND_HEADER_BYTES {
            return Err(CommandParseError::Truncated {
                need: COMMAND_HEADER_BYTES,
                have: bytes.len(),
            });
        }
        let mut rdr = Cursor::new(bytes);
        let mut word = || rdr.read_u32::<LittleEndian>().expect("bounds checked above");

        let wrap = word();
        let finish = word();
        let num_workers = word();
        let data_size_in_bytes = word();
        let num_transfers = word();
        let page_size = word();
        let producer_cb_size = word();
        let consumer_cb_size = word();
        let opcode = CommandOpcode::try_from(word())?;
        let addr_lo = word();
        let addr_hi = word();
        let num_pages = word();
        let data_section_offset = word();
        let launch_records_offset = word();
        let brisc_noc_id = word();
        let host_assigned_id = word();

        let cmd = DeviceCommand {
            opcode,
            wrap,
            finish,
            num_workers,
            data_size_in_bytes,
            page_size,
            producer_cb_size,
            consumer_cb_size,
            buffer_addr: (addr_hi as u64) << 32 | addr_lo as u64,
            num_pages,
            data_section_offset,
            launch_records_offset,
            brisc_noc_id,
            host_assigned_id,
            transfers: Vec::new(),
        };
        if opcode != CommandOpcode::Wrap && num_transfers as usize > MAX_TRANSFERS {
            return Err(CommandParseError::TooManyTransfers { n: num_transfers, max: MAX_TRANSFERS });
        }
        Ok((cmd, num_transfers))
    }

    /// Decode the 16-word header alone; the descriptor table is left empty.
    /// The dispatcher uses this to size the full region fetch.
    pub fn parse_header(bytes: &[u8]) -> Result<Self, CommandParseError> {
        Ok(Self::decode_header(bytes)?.0)
    }

    /// Parse a full command region, descriptors included. `bytes` must hold
    /// at least `data_section_offset` bytes for anything but a wrap.
    pub fn parse(bytes: &[u8]) -> Result<Self, CommandParseError> {
        let (mut cmd, num_transfers) = Self::decode_header(bytes)?;
        if cmd.opcode == CommandOpcode::Wrap {
            return Ok(cmd);
        }
        let need = COMMAND_HEADER_BYTES + num_transfers as usize * TRANSFER_DESC_WORDS * 4;
        if bytes.len() < need {
            return Err(CommandParseError::Truncated { need, have: bytes.len() });
        }
        let mut rdr = Cursor::new(&bytes[COMMAND_HEADER_BYTES..]);
        for _ in 0..num_transfers {
            let mut word = || rdr.read_u32::<LittleEndian>().expect("bounds checked above");
            cmd.transfers.push(TransferDescriptor {
                dst_addr: word(),
                src_offset: word(),
                size_bytes: word(),
                multicast_encoding: word(),
                num_receivers: word(),
                linked: word(),
            });
        }
        Ok(cmd)
    }
}
