// Frame pacer: a spinning cube drawn with several frames in flight.
//
// The frame engine (`frame`) is generic over `backend::GpuBackend`; the
// Vulkan implementation lives in `backend`, the orchestration in `renderer`.

pub mod backend;
pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod frame;
pub mod renderer;
pub mod scene;

pub use error::{exit_code, FatalError};
pub use renderer::{Renderer, RendererSettings, TickPhase};
