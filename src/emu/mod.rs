//! Emulation engine: drives the dispatcher and worker firmware.

pub mod engine;

pub use engine::{Device, DeviceOptions, DispatchEngine, EngineStatus};
