//! Host-side orchestration for an iterative GPU ray tracer.
//!
//! The device runs three cooperating compute kernels per frame: a primary
//! pass that traces and shades bounce iterations into a color accumulator,
//! a prefix-sum pass that compacts the surviving ray stream between
//! frames, and a draw pass that writes the accumulator into a display
//! texture shared with the windowing side. This crate owns everything the
//! host does around those kernels: buffer lifetimes, double-buffered ray
//! state, argument binding, stream compaction and the synchronization
//! bracket around the shared texture.
//!
//! [`RayTracer`] is the top-level entry point; it is generic over a
//! [`DeviceContext`], with [`WgpuContext`] as the wgpu-backed
//! implementation.

pub mod buffers;
pub mod compact;
pub mod compute;
pub mod context;
pub mod error;
pub mod gpu;
pub mod renderer;
pub mod scene;

pub use buffers::FrameBuffers;
pub use compact::RayStreamCompactor;
pub use compute::KernelPipeline;
pub use context::{kernels, BufferAccess, BufferId, DeviceContext, DispatchRange, KernelArg};
pub use error::{AllocationError, DispatchError, ProgramBuildError, SetupError, UploadError};
pub use gpu::WgpuContext;
pub use renderer::{RayTracer, RenderConfig};
pub use scene::{Light, Plane, Scene, SceneUploader, Sphere};
