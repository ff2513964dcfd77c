use glam::Vec3;
use log::{debug, info, warn};

use crate::buffers::{FrameBuffers, ACCUM_STRIDE};
use crate::compact::RayStreamCompactor;
use crate::compute::KernelPipeline;
use crate::context::{kernels, BufferId, DeviceContext};
use crate::error::{DispatchError, SetupError, UploadError};
use crate::scene::{Scene, SceneUploader};

/// Render configuration. Texture dimensions are fixed at construction;
/// tile size and the bounce budget are tunable defaults, not law.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    /// Local workgroup tile, in lanes.
    pub tile_size: (u32, u32),
    /// Bounce iterations per primary dispatch.
    pub iteration_budget: u32,
    /// Compact the ray stream between passes.
    pub compaction: bool,
}

impl RenderConfig {
    pub fn new(width: u32, height: u32) -> Self {
        RenderConfig {
            width,
            height,
            tile_size: (16, 16),
            iteration_budget: 6,
            compaction: true,
        }
    }

    fn validate(&self) -> Result<(), SetupError> {
        if self.width == 0 || self.height == 0 {
            return Err(SetupError::Config(format!(
                "texture dimensions {}x{} are empty",
                self.width, self.height
            )));
        }
        if self.tile_size.0 == 0 || self.tile_size.1 == 0 {
            return Err(SetupError::Config("tile size must be non-zero".into()));
        }
        if self.iteration_budget == 0 {
            return Err(SetupError::Config("iteration budget must be non-zero".into()));
        }
        Ok(())
    }
}

/// Host-side orchestration of the iterative ray tracer.
///
/// Owns the device context, the scene and frame buffers, and the shared
/// view of the display texture. One `update()` call renders one frame:
/// the primary bounce pass, a compaction pass over the ray stream, and
/// the synchronized draw into the shared texture. A failed frame makes no
/// visible change to the texture and the next `update()` starts from
/// scratch; there is no automatic retry.
#[derive(Debug)]
pub struct RayTracer<C: DeviceContext> {
    ctx: C,
    cfg: RenderConfig,
    eye: Vec3,
    uploader: SceneUploader,
    frame: FrameBuffers,
    compactor: RayStreamCompactor,
    shared_texture: BufferId,
    clear_bytes: Vec<u8>,
    frames: u64,
    active_rays: u32,
}

impl<C: DeviceContext> RayTracer<C> {
    /// Build the program, prepare the kernels, share the display texture,
    /// upload the scene and allocate the frame buffers. Any failure aborts
    /// construction; the context is dropped with everything it allocated.
    pub fn new(
        mut ctx: C,
        program_source: &str,
        scene: &Scene,
        texture: C::ExternalTexture,
        cfg: RenderConfig,
    ) -> Result<Self, SetupError> {
        cfg.validate()?;
        info!(
            "creating {}x{} ray tracer, max workgroup size {}",
            cfg.width,
            cfg.height,
            ctx.max_workgroup_size()
        );

        ctx.build_program(program_source)?;
        for name in kernels::ALL {
            ctx.prepare_kernel(name)?;
        }
        let shared_texture = ctx.share_texture(texture)?;

        let mut uploader = SceneUploader::new();
        uploader.upload(&mut ctx, scene)?;
        let frame = FrameBuffers::allocate(&mut ctx, cfg.width, cfg.height)?;

        let pixels = cfg.width as usize * cfg.height as usize;
        Ok(RayTracer {
            ctx,
            cfg,
            eye: Vec3::ZERO,
            uploader,
            frame,
            compactor: RayStreamCompactor::new(),
            shared_texture,
            clear_bytes: vec![0; pixels * ACCUM_STRIDE],
            frames: 0,
            active_rays: pixels as u32,
        })
    }

    pub fn set_eye(&mut self, eye: Vec3) {
        self.eye = eye;
    }

    pub fn eye(&self) -> Vec3 {
        self.eye
    }

    pub fn config(&self) -> &RenderConfig {
        &self.cfg
    }

    /// Rays still pending after the last compaction pass.
    pub fn active_rays(&self) -> u32 {
        self.active_rays
    }

    /// Frames fully rendered and presented.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Replace the device-side scene. On failure the previous scene stays
    /// in use.
    pub fn upload_scene(&mut self, scene: &Scene) -> Result<(), UploadError> {
        self.uploader.mark_dirty();
        self.uploader.upload(&mut self.ctx, scene)
    }

    /// Render one frame into the shared texture.
    ///
    /// Either fully completes (primary pass, compaction, synchronized
    /// presentation) or returns the frame's error without touching the
    /// texture. A compaction failure alone is not fatal: the pass writes
    /// only into the inactive buffer slot, so the frame continues
    /// uncompacted.
    pub fn update(&mut self) -> Result<(), DispatchError> {
        let scene = *self
            .uploader
            .buffers()
            .expect("scene uploaded at construction");

        KernelPipeline::clear_accumulator(&mut self.ctx, &self.frame, &self.clear_bytes)?;
        KernelPipeline::primary_pass(&mut self.ctx, &self.cfg, &scene, &self.frame, self.eye)?;

        if self.cfg.compaction {
            match self.compactor.compact(&mut self.ctx, &mut self.frame) {
                Ok(survivors) => self.active_rays = survivors,
                Err(err) => warn!("compaction failed, continuing uncompacted: {err}"),
            }
        }

        KernelPipeline::present_pass(&mut self.ctx, &self.cfg, self.shared_texture, &self.frame)?;

        self.frames += 1;
        debug!(
            "frame {} presented, {} rays active",
            self.frames, self.active_rays
        );
        Ok(())
    }

    /// Block until all issued device work has completed.
    pub fn finish(&mut self) -> Result<(), DispatchError> {
        self.ctx.finish()
    }

    /// Release every owned device resource and hand the context back.
    pub fn shutdown(self) -> C {
        let RayTracer {
            mut ctx,
            mut uploader,
            frame,
            mut compactor,
            shared_texture,
            ..
        } = self;
        uploader.release(&mut ctx);
        compactor.release(&mut ctx);
        frame.release(&mut ctx);
        ctx.release_buffer(shared_texture);
        ctx
    }
}
