//! Host command queue: wire format, issue ring, and the enqueue API.
//!
//! The host talks to the device through a byte ring in host-mapped system
//! memory ([`sysmem`]). Operations become tagged [`Command`] values that
//! assemble into [`DeviceCommand`] regions ([`device_command`]); the
//! dispatcher firmware consumes them in strict order.

pub mod device_command;
pub mod queue;
pub mod sysmem;
pub mod ts_queue;

pub use device_command::{CommandOpcode, CommandParseError, DeviceCommand, TransferDescriptor};
pub use queue::{Buffer, Command, CommandQueue, CqError, CqMode, CqOptions};
pub use sysmem::{SystemMemory, SystemMemoryWriter};
pub use ts_queue::TsQueue;
