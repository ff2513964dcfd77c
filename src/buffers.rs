use log::debug;

use crate::context::{BufferAccess, BufferId, DeviceContext};
use crate::error::AllocationError;

/// Per-pixel byte layouts. These are a wire contract with the device
/// program and must match it exactly.
///
/// Ray slots pack 2 origins + 2 directions, 4 float components each, for
/// up to two in-flight sub-rays per pixel.
pub const RAY_STRIDE: usize = 4 * 4 * 4;
/// (x, y) coordinate tag per pixel, two ints.
pub const PIXEL_STRIDE: usize = 2 * 4;
/// Pending-ray count per pixel, one int.
pub const COUNT_STRIDE: usize = 4;
/// RGBA color accumulator per pixel, four floats.
pub const ACCUM_STRIDE: usize = 4 * 4;

/// All device buffers for one (width, height) render configuration.
///
/// The ray and pixel-index buffers are ping-pong pairs with an explicit
/// `current` role: the current slot is read by a pass while the other is
/// written, and the roles swap after each compaction. There is no in-place
/// resize; a dimension change tears the set down and allocates afresh.
#[derive(Debug)]
pub struct FrameBuffers {
    width: u32,
    height: u32,
    rays: [BufferId; 2],
    pixels: [BufferId; 2],
    ray_counts: BufferId,
    accumulator: BufferId,
    current: usize,
}

impl FrameBuffers {
    /// Allocate the full set. On any device rejection every buffer created
    /// so far is released before the error propagates.
    pub fn allocate<C: DeviceContext>(
        ctx: &mut C,
        width: u32,
        height: u32,
    ) -> Result<Self, AllocationError> {
        let pixels = width as usize * height as usize;
        let mut created: Vec<BufferId> = Vec::with_capacity(6);

        let mut alloc = |ctx: &mut C, created: &mut Vec<BufferId>, stride: usize| {
            let id = ctx.create_buffer(stride * pixels, BufferAccess::ReadWrite)?;
            created.push(id);
            Ok::<BufferId, AllocationError>(id)
        };

        let result = (|| {
            let rays = [
                alloc(ctx, &mut created, RAY_STRIDE)?,
                alloc(ctx, &mut created, RAY_STRIDE)?,
            ];
            let pixel_tags = [
                alloc(ctx, &mut created, PIXEL_STRIDE)?,
                alloc(ctx, &mut created, PIXEL_STRIDE)?,
            ];
            let ray_counts = alloc(ctx, &mut created, COUNT_STRIDE)?;
            let accumulator = alloc(ctx, &mut created, ACCUM_STRIDE)?;
            Ok(FrameBuffers {
                width,
                height,
                rays,
                pixels: pixel_tags,
                ray_counts,
                accumulator,
                current: 0,
            })
        })();

        match result {
            Ok(buffers) => {
                debug!(
                    "allocated frame buffers for {width}x{height} ({} bytes per pixel)",
                    2 * RAY_STRIDE + 2 * PIXEL_STRIDE + COUNT_STRIDE + ACCUM_STRIDE
                );
                Ok(buffers)
            }
            Err(err) => {
                for id in created {
                    ctx.release_buffer(id);
                }
                Err(err)
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of per-pixel slots in every buffer of the set.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Ray buffer currently holding the live ray stream.
    pub fn current_rays(&self) -> BufferId {
        self.rays[self.current]
    }

    /// Ray buffer a compaction pass writes into.
    pub fn next_rays(&self) -> BufferId {
        self.rays[1 - self.current]
    }

    pub fn current_pixels(&self) -> BufferId {
        self.pixels[self.current]
    }

    pub fn next_pixels(&self) -> BufferId {
        self.pixels[1 - self.current]
    }

    pub fn ray_counts(&self) -> BufferId {
        self.ray_counts
    }

    pub fn accumulator(&self) -> BufferId {
        self.accumulator
    }

    /// Index of the slot currently in the read role.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Swap the ping-pong roles. Called once per successful compaction;
    /// within one dispatch the two roles never alias.
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// Tear the set down. Required before allocating for new dimensions.
    pub fn release<C: DeviceContext>(self, ctx: &mut C) {
        for id in self
            .rays
            .into_iter()
            .chain(self.pixels)
            .chain([self.ray_counts, self.accumulator])
        {
            ctx.release_buffer(id);
        }
    }
}
