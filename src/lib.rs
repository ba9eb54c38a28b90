//! double-buffered atomic modesetting
//!
//! every connected display gets a crtc, a primary plane and two dumb
//! buffers; frames are flipped in step with the hardware until the run
//! ends, then in-flight flips are drained before anything is freed
//!
//! - [`strobe`], the event loop and shutdown
//! - [`state`], discovery and the output registry
//! - [`output`], per display commit cycle
//! - [`utils::drm_scanner`], conflict free pipeline assignment
pub mod atomic;
pub mod backend;
pub mod config;
pub mod error;
pub mod output;
pub mod props;
pub mod render;
pub mod state;
pub mod strobe;
pub mod swapchain;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{exit_status, Error, ErrorKind};
pub use strobe::{run, Strobe};
