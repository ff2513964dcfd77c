use glam::Vec3;

use crate::buffers::FrameBuffers;
use crate::context::{kernels, BufferId, DeviceContext, DispatchRange, KernelArg};
use crate::error::DispatchError;
use crate::renderer::RenderConfig;
use crate::scene::SceneBuffers;

/// Per-frame kernel sequencing: the iterative primary-ray pass and the
/// synchronized presentation pass. Kernels execute in issue order on the
/// device queue, so the draw pass never observes a partially written
/// accumulator.
pub struct KernelPipeline;

impl KernelPipeline {
    /// Per-tile temporary workspace required by the primary kernel,
    /// 16 floats per lane.
    pub fn local_workspace_size(tile: (u32, u32)) -> usize {
        4 * 16 * tile.0 as usize * tile.1 as usize
    }

    /// Per-tile light cache, 8 floats per light. A zero-sized local
    /// allocation is invalid on the device, so an empty scene still
    /// reserves one slot.
    pub fn local_light_cache_size(light_count: i32) -> usize {
        4 * 8 * (light_count.max(1) as usize)
    }

    /// Zero the accumulator. Each frame starts from black; color
    /// accumulates only across the bounce iterations within one frame.
    pub fn clear_accumulator<C: DeviceContext>(
        ctx: &mut C,
        frame: &FrameBuffers,
        zeros: &[u8],
    ) -> Result<(), DispatchError> {
        ctx.write_buffer(frame.accumulator(), 0, zeros)
    }

    /// One primary-ray dispatch over the full frame with the configured
    /// bounce budget. Argument order is the device program contract.
    pub fn primary_pass<C: DeviceContext>(
        ctx: &mut C,
        cfg: &RenderConfig,
        scene: &SceneBuffers,
        frame: &FrameBuffers,
        eye: Vec3,
    ) -> Result<(), DispatchError> {
        let range = DispatchRange::tiled(cfg.width, cfg.height, cfg.tile_size);
        let workspace = Self::local_workspace_size(cfg.tile_size);
        let light_cache = Self::local_light_cache_size(scene.light_count);

        ctx.dispatch(
            kernels::PRIMARY,
            &range,
            &[
                KernelArg::Buffer(frame.accumulator()),
                KernelArg::Buffer(scene.spheres),
                KernelArg::Int(scene.sphere_count),
                KernelArg::Buffer(scene.planes),
                KernelArg::Int(scene.plane_count),
                KernelArg::Buffer(scene.lights),
                KernelArg::Int(scene.light_count),
                KernelArg::Buffer(frame.current_rays()),
                KernelArg::Buffer(frame.ray_counts()),
                KernelArg::Buffer(frame.current_pixels()),
                KernelArg::Local(workspace),
                KernelArg::Local(light_cache),
                KernelArg::Int(cfg.iteration_budget as i32),
                KernelArg::Float(eye.x),
                KernelArg::Float(eye.y),
                KernelArg::Float(eye.z),
            ],
        )
    }

    /// Draw the accumulator into the shared texture under exclusive
    /// ownership. The texture is write-only from this side and is touched
    /// by exactly one dispatch inside the bracket.
    pub fn present_pass<C: DeviceContext>(
        ctx: &mut C,
        cfg: &RenderConfig,
        shared_texture: BufferId,
        frame: &FrameBuffers,
    ) -> Result<(), DispatchError> {
        let range = DispatchRange::tiled(cfg.width, cfg.height, cfg.tile_size);
        ctx.run_synchronized(&[shared_texture], |ctx| {
            ctx.dispatch(
                kernels::DRAW_TO_TEXTURE,
                &range,
                &[
                    KernelArg::Buffer(shared_texture),
                    KernelArg::Buffer(frame.accumulator()),
                ],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{Event, FakeContext};

    fn ready_context() -> FakeContext {
        let mut ctx = FakeContext::new();
        ctx.build_program("__kernels__").unwrap();
        for name in kernels::ALL {
            ctx.prepare_kernel(name).unwrap();
        }
        ctx
    }

    #[test]
    fn local_buffer_sizes_scale_with_tile_area_and_light_count() {
        assert_eq!(KernelPipeline::local_workspace_size((16, 16)), 4 * 16 * 256);
        assert_eq!(KernelPipeline::local_workspace_size((8, 8)), 4 * 16 * 64);
        assert_eq!(KernelPipeline::local_light_cache_size(3), 4 * 8 * 3);
        // Empty scenes still reserve one light slot.
        assert_eq!(KernelPipeline::local_light_cache_size(0), 4 * 8);
    }

    #[test]
    fn primary_pass_binds_arguments_in_contract_order() {
        let mut ctx = ready_context();
        let frame = FrameBuffers::allocate(&mut ctx, 64, 48).unwrap();
        let scene = SceneBuffers {
            spheres: ctx.create_buffer(32, crate::context::BufferAccess::ReadOnly).unwrap(),
            sphere_count: 2,
            planes: ctx.create_buffer(32, crate::context::BufferAccess::ReadOnly).unwrap(),
            plane_count: 1,
            lights: ctx.create_buffer(96, crate::context::BufferAccess::ReadOnly).unwrap(),
            light_count: 3,
        };
        let cfg = RenderConfig::new(64, 48);

        KernelPipeline::primary_pass(&mut ctx, &cfg, &scene, &frame, Vec3::new(0.0, 1.0, 5.0))
            .unwrap();

        let record = &ctx.dispatches_of(kernels::PRIMARY)[0];
        assert_eq!(record.range.global_size, [64, 48, 1]);
        assert_eq!(record.args[0], KernelArg::Buffer(frame.accumulator()));
        assert_eq!(record.args[2], KernelArg::Int(2));
        assert_eq!(record.args[6], KernelArg::Int(3));
        assert_eq!(record.args[7], KernelArg::Buffer(frame.current_rays()));
        assert_eq!(record.args[10], KernelArg::Local(4 * 16 * 256));
        assert_eq!(record.args[11], KernelArg::Local(4 * 8 * 3));
        assert_eq!(record.args[12], KernelArg::Int(6));
        assert_eq!(record.args[15], KernelArg::Float(5.0));
    }

    #[test]
    fn present_pass_brackets_exactly_one_draw_dispatch() {
        let mut ctx = ready_context();
        let frame = FrameBuffers::allocate(&mut ctx, 64, 48).unwrap();
        let texture = ctx.share_texture(7).unwrap();
        let cfg = RenderConfig::new(64, 48);

        KernelPipeline::present_pass(&mut ctx, &cfg, texture, &frame).unwrap();

        assert_eq!(
            ctx.events,
            vec![
                Event::Acquire,
                Event::Dispatch(kernels::DRAW_TO_TEXTURE.to_owned()),
                Event::Release,
            ]
        );
    }

    #[test]
    fn present_pass_releases_after_an_injected_failure() {
        let mut ctx = ready_context();
        let frame = FrameBuffers::allocate(&mut ctx, 64, 48).unwrap();
        let texture = ctx.share_texture(7).unwrap();
        let cfg = RenderConfig::new(64, 48);
        ctx.fail_dispatch_on = Some(kernels::DRAW_TO_TEXTURE.to_owned());

        let err = KernelPipeline::present_pass(&mut ctx, &cfg, texture, &frame).unwrap_err();
        assert!(matches!(err, DispatchError::Device { .. }));
        assert_eq!(ctx.acquires(), 1);
        assert_eq!(ctx.releases(), 1);
    }
}
