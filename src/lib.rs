//! tilecq library
//!
//! Host command queue and dispatch emulation for a tile-grid AI accelerator.

pub mod config;
pub mod cq;
pub mod device;
pub mod emu;
pub mod firmware;
pub mod program;
