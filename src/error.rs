use thiserror::Error;

use crate::context::BufferId;

/// Device buffer or context creation failure. Fatal to the whole
/// pipeline; no partial construction is left live.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("device rejected a {size} byte buffer: {reason}")]
    DeviceRejected { size: usize, reason: String },
    #[error("zero-sized buffer request")]
    ZeroSized,
    #[error("failed to share external texture: {0}")]
    ShareTexture(String),
    #[error("failed to create device context: {0}")]
    Context(String),
}

/// The device program source failed to compile or link, or a requested
/// kernel entry point does not exist in the built program.
#[derive(Debug, Error)]
pub enum ProgramBuildError {
    #[error("program source failed to build: {0}")]
    Build(String),
    #[error("kernel `{0}` not found in program")]
    MissingKernel(String),
    #[error("no program has been built on this context")]
    NoProgram,
}

/// A kernel invocation failed. Fatal to the current frame only; the
/// previously presented texture remains valid.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("kernel `{0}` has not been prepared")]
    UnpreparedKernel(String),
    #[error("invalid dispatch range: {0}")]
    InvalidRange(String),
    #[error("invalid buffer handle {0:?}")]
    InvalidHandle(BufferId),
    #[error("device error in `{kernel}`: {reason}")]
    Device { kernel: String, reason: String },
    #[error("scratch allocation failed")]
    Scratch(#[from] AllocationError),
}

/// Scene data inconsistent with its declared counts. Fatal to the upload
/// call; previously uploaded scene buffers stay valid.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{what} upload declared {count} elements but has no backing storage")]
    EmptyBacking { what: &'static str, count: usize },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Setup-phase failure. The renderer was not constructed; the caller must
/// not call `update()` on anything.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid render configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    ProgramBuild(#[from] ProgramBuildError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}
