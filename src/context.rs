use crate::error::{AllocationError, DispatchError, ProgramBuildError};

/// Entry points of the device program. Argument order and local-memory
/// sizing are a binding contract with the kernel source on the other side;
/// neither may change independently.
pub mod kernels {
    /// Iterative bounce pass writing into the color accumulator.
    pub const PRIMARY: &str = "primaryRayTracingKernel";
    /// Presentation pass reading the accumulator, writing the shared texture.
    pub const DRAW_TO_TEXTURE: &str = "drawToTextureKernel";
    /// Segmented exclusive prefix sum of the ray-activity predicate
    /// (`input[i] > 0`), per-segment totals into its third argument.
    pub const PREFIX_SUM: &str = "prefixSumKernel";
    /// Compacting scatter using the prefix-sum offsets.
    pub const SCATTER: &str = "scatterRaysKernel";

    pub const ALL: [&str; 4] = [PRIMARY, DRAW_TO_TEXTURE, PREFIX_SUM, SCATTER];
}

/// Opaque handle into the context-owned resource table. Valid until
/// explicitly released; never a native pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u32);

impl BufferId {
    pub fn from_raw(raw: u32) -> Self {
        BufferId(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// One positional kernel argument. `Local` reserves device local memory of
/// the given byte size instead of binding a resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferId),
    Int(i32),
    UInt(u32),
    Float(f32),
    Local(usize),
}

/// Index space of one kernel invocation.
///
/// The device requires the global size to be a multiple of the local size
/// in every dimension, and the local size must not exceed the workgroup
/// maximum reported for the kernel. Constructors round the global size up;
/// out-of-range lanes are the kernel's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRange {
    pub dims: usize,
    pub global_offset: [usize; 3],
    pub global_size: [usize; 3],
    pub local_size: [usize; 3],
}

impl DispatchRange {
    /// 1-D range over `count` items in groups of `group`, rounded up.
    pub fn linear(count: usize, group: usize) -> Self {
        let padded = round_up(count, group);
        DispatchRange {
            dims: 1,
            global_offset: [0; 3],
            global_size: [padded, 1, 1],
            local_size: [group.max(1), 1, 1],
        }
    }

    /// 2-D range covering a `width` x `height` frame at the given tile size.
    pub fn tiled(width: u32, height: u32, tile: (u32, u32)) -> Self {
        DispatchRange {
            dims: 2,
            global_offset: [0; 3],
            global_size: [
                round_up(width as usize, tile.0 as usize),
                round_up(height as usize, tile.1 as usize),
                1,
            ],
            local_size: [tile.0.max(1) as usize, tile.1.max(1) as usize, 1],
        }
    }

    pub fn validate(&self, max_workgroup: usize) -> Result<(), DispatchError> {
        if self.dims == 0 || self.dims > 3 {
            return Err(DispatchError::InvalidRange(format!(
                "work dimension {} outside 1..=3",
                self.dims
            )));
        }
        let mut lanes = 1usize;
        for d in 0..self.dims {
            let (global, local) = (self.global_size[d], self.local_size[d]);
            if local == 0 || global == 0 {
                return Err(DispatchError::InvalidRange(format!(
                    "empty dimension {d}: global {global}, local {local}"
                )));
            }
            if global % local != 0 {
                return Err(DispatchError::InvalidRange(format!(
                    "global size {global} not a multiple of local size {local} in dimension {d}"
                )));
            }
            lanes *= local;
        }
        if lanes > max_workgroup {
            return Err(DispatchError::InvalidRange(format!(
                "local size {lanes} exceeds workgroup maximum {max_workgroup}"
            )));
        }
        Ok(())
    }

    /// Workgroup counts per dimension.
    pub fn workgroups(&self) -> [usize; 3] {
        let mut out = [1; 3];
        for d in 0..self.dims {
            out[d] = self.global_size[d] / self.local_size[d];
        }
        out
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// The device capability this pipeline is built against.
///
/// Implementations own every resource behind [`BufferId`] handles and run
/// one in-order command queue: kernels execute in issue order with respect
/// to their data dependencies, so the host never fences between dependent
/// dispatches. The shared display texture is the one externally visible
/// resource; writes to it happen only inside [`run_synchronized`].
///
/// [`run_synchronized`]: DeviceContext::run_synchronized
pub trait DeviceContext {
    /// Backend representation of the externally owned display texture.
    type ExternalTexture;

    /// Create an uninitialized buffer of `size` bytes.
    fn create_buffer(&mut self, size: usize, access: BufferAccess)
        -> Result<BufferId, AllocationError>;

    /// Create a buffer initialized from host bytes.
    fn create_buffer_from_bytes(
        &mut self,
        bytes: &[u8],
        access: BufferAccess,
    ) -> Result<BufferId, AllocationError>;

    /// Typed convenience over [`create_buffer_from_bytes`].
    ///
    /// [`create_buffer_from_bytes`]: DeviceContext::create_buffer_from_bytes
    fn create_buffer_from_slice<T: bytemuck::Pod>(
        &mut self,
        data: &[T],
        access: BufferAccess,
    ) -> Result<BufferId, AllocationError>
    where
        Self: Sized,
    {
        self.create_buffer_from_bytes(bytemuck::cast_slice(data), access)
    }

    fn release_buffer(&mut self, id: BufferId);

    /// Register the display texture for device-side writes.
    fn share_texture(
        &mut self,
        texture: Self::ExternalTexture,
    ) -> Result<BufferId, AllocationError>;

    fn build_program(&mut self, source: &str) -> Result<(), ProgramBuildError>;

    fn prepare_kernel(&mut self, name: &str) -> Result<(), ProgramBuildError>;

    fn max_workgroup_size(&self) -> usize;

    fn kernel_workgroup_size(&self, kernel: &str) -> Result<usize, DispatchError>;

    fn write_buffer(
        &mut self,
        id: BufferId,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), DispatchError>;

    fn read_buffer(
        &mut self,
        id: BufferId,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DispatchError>;

    /// Issue one kernel over `range` with positionally bound arguments.
    fn dispatch(
        &mut self,
        kernel: &str,
        range: &DispatchRange,
        args: &[KernelArg],
    ) -> Result<(), DispatchError>;

    /// Run `block` while this context exclusively owns the listed shared
    /// handles. Ownership is released on every exit path, including when
    /// `block` fails; acquisition may suspend the calling thread until the
    /// display consumer relinquishes the resource.
    fn run_synchronized<F>(&mut self, shared: &[BufferId], block: F) -> Result<(), DispatchError>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<(), DispatchError>;

    /// Block until all issued work has completed.
    fn finish(&mut self) -> Result<(), DispatchError>;
}
