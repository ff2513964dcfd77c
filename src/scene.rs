use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::context::{BufferAccess, BufferId, DeviceContext};
use crate::error::UploadError;

/// Sphere primitive, 32 bytes. Layout is a wire contract with the device
/// program and must match the kernel source exactly.
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Sphere {
    pub center: [f32; 3],
    pub radius: f32,
    pub color: [f32; 4],
}

/// Infinite plane primitive, 32 bytes.
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Plane {
    pub normal: [f32; 3],
    pub distance: f32,
    pub color: [f32; 4],
}

/// Point light, 32 bytes.
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Light {
    pub position: [f32; 3],
    pub intensity: f32,
    pub color: [f32; 4],
}

impl Sphere {
    pub fn new(center: [f32; 3], radius: f32, color: [f32; 4]) -> Self {
        Sphere {
            center,
            radius,
            color,
        }
    }
}

impl Plane {
    pub fn new(normal: [f32; 3], distance: f32, color: [f32; 4]) -> Self {
        Plane {
            normal,
            distance,
            color,
        }
    }
}

impl Light {
    pub fn new(position: [f32; 3], intensity: f32, color: [f32; 4]) -> Self {
        Light {
            position,
            intensity,
            color,
        }
    }
}

/// Host-side scene description. Immutable per upload: changing it requires
/// a full re-upload, there is no incremental update.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub spheres: Vec<Sphere>,
    pub planes: Vec<Plane>,
    pub lights: Vec<Light>,
}

impl Scene {
    pub fn sphere_count(&self) -> usize {
        self.spheres.len()
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn light_count(&self) -> usize {
        self.lights.len()
    }
}

/// Read-only device copies of the scene arrays plus their counts. Counts
/// ride along as plain kernel arguments.
#[derive(Debug, Clone, Copy)]
pub struct SceneBuffers {
    pub spheres: BufferId,
    pub sphere_count: i32,
    pub planes: BufferId,
    pub plane_count: i32,
    pub lights: BufferId,
    pub light_count: i32,
}

impl SceneBuffers {
    fn release<C: DeviceContext>(&self, ctx: &mut C) {
        ctx.release_buffer(self.spheres);
        ctx.release_buffer(self.planes);
        ctx.release_buffer(self.lights);
    }
}

/// One-time (or on-change) transfer of host scene data into read-only
/// device buffers. Re-invoking `upload` with an unchanged scene is a no-op
/// until `mark_dirty` is called or the counts differ.
#[derive(Debug)]
pub struct SceneUploader {
    buffers: Option<SceneBuffers>,
    last_counts: (usize, usize, usize),
    dirty: bool,
}

impl SceneUploader {
    pub fn new() -> Self {
        SceneUploader {
            buffers: None,
            last_counts: (0, 0, 0),
            dirty: true,
        }
    }

    /// Device buffers from the last successful upload.
    pub fn buffers(&self) -> Option<&SceneBuffers> {
        self.buffers.as_ref()
    }

    /// Force the next `upload` to re-transfer even if counts are unchanged.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Upload the scene, fully replacing the previous geometry buffers.
    /// On failure the previously uploaded buffers remain valid.
    pub fn upload<C: DeviceContext>(
        &mut self,
        ctx: &mut C,
        scene: &Scene,
    ) -> Result<(), UploadError> {
        let counts = (
            scene.sphere_count(),
            scene.plane_count(),
            scene.light_count(),
        );
        if !self.dirty && self.buffers.is_some() && counts == self.last_counts {
            return Ok(());
        }

        let spheres = upload_array(ctx, &scene.spheres, scene.sphere_count(), "spheres")?;
        let planes = match upload_array(ctx, &scene.planes, scene.plane_count(), "planes") {
            Ok(id) => id,
            Err(err) => {
                ctx.release_buffer(spheres);
                return Err(err);
            }
        };
        let lights = match upload_array(ctx, &scene.lights, scene.light_count(), "lights") {
            Ok(id) => id,
            Err(err) => {
                ctx.release_buffer(spheres);
                ctx.release_buffer(planes);
                return Err(err);
            }
        };

        if let Some(old) = self.buffers.take() {
            old.release(ctx);
        }
        self.buffers = Some(SceneBuffers {
            spheres,
            sphere_count: counts.0 as i32,
            planes,
            plane_count: counts.1 as i32,
            lights,
            light_count: counts.2 as i32,
        });
        self.last_counts = counts;
        self.dirty = false;
        debug!(
            "uploaded scene: {} spheres, {} planes, {} lights",
            counts.0, counts.1, counts.2
        );
        Ok(())
    }

    pub fn release<C: DeviceContext>(&mut self, ctx: &mut C) {
        if let Some(buffers) = self.buffers.take() {
            buffers.release(ctx);
        }
        self.dirty = true;
    }
}

impl Default for SceneUploader {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffer creation must never be asked to read past the declared element
/// count. An empty array with a positive count is a structural error; an
/// empty array with count 0 uploads a single zeroed placeholder element,
/// since devices reject zero-sized buffers.
fn upload_array<C: DeviceContext, T: Pod>(
    ctx: &mut C,
    data: &[T],
    count: usize,
    what: &'static str,
) -> Result<BufferId, UploadError> {
    if data.is_empty() && count > 0 {
        return Err(UploadError::EmptyBacking { what, count });
    }
    let id = if data.is_empty() {
        ctx.create_buffer_from_slice(&[T::zeroed()], BufferAccess::ReadOnly)?
    } else {
        ctx.create_buffer_from_slice(&data[..count], BufferAccess::ReadOnly)?
    };
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::FakeContext;

    fn test_scene() -> Scene {
        Scene {
            spheres: vec![
                Sphere::new([0.0, 0.0, -4.0], 1.0, [1.0, 0.0, 0.0, 1.0]),
                Sphere::new([2.0, 0.0, -5.0], 0.5, [0.0, 1.0, 0.0, 1.0]),
            ],
            planes: vec![Plane::new([0.0, 1.0, 0.0], -1.0, [0.8, 0.8, 0.8, 1.0])],
            lights: vec![
                Light::new([0.0, 5.0, 0.0], 1.0, [1.0; 4]),
                Light::new([3.0, 5.0, 0.0], 0.5, [1.0; 4]),
                Light::new([-3.0, 5.0, 0.0], 0.5, [1.0; 4]),
            ],
        }
    }

    #[test]
    fn upload_creates_read_only_buffers_with_exact_sizes() {
        let mut ctx = FakeContext::new();
        let mut uploader = SceneUploader::new();
        uploader.upload(&mut ctx, &test_scene()).unwrap();

        let buffers = *uploader.buffers().unwrap();
        assert_eq!(buffers.sphere_count, 2);
        assert_eq!(buffers.plane_count, 1);
        assert_eq!(buffers.light_count, 3);
        assert_eq!(ctx.buffer_size(buffers.spheres), 2 * 32);
        assert_eq!(ctx.buffer_size(buffers.planes), 32);
        assert_eq!(ctx.buffer_size(buffers.lights), 3 * 32);
        assert_eq!(ctx.buffer_access(buffers.spheres), BufferAccess::ReadOnly);
    }

    #[test]
    fn upload_is_idempotent_until_marked_dirty() {
        let mut ctx = FakeContext::new();
        let mut uploader = SceneUploader::new();
        let scene = test_scene();

        uploader.upload(&mut ctx, &scene).unwrap();
        let after_first = ctx.alloc_count();
        uploader.upload(&mut ctx, &scene).unwrap();
        assert_eq!(ctx.alloc_count(), after_first);

        uploader.mark_dirty();
        uploader.upload(&mut ctx, &scene).unwrap();
        assert_eq!(ctx.alloc_count(), after_first + 3);
    }

    #[test]
    fn reupload_replaces_and_releases_previous_buffers() {
        let mut ctx = FakeContext::new();
        let mut uploader = SceneUploader::new();
        let mut scene = test_scene();

        uploader.upload(&mut ctx, &scene).unwrap();
        let old = *uploader.buffers().unwrap();

        scene.spheres.push(Sphere::new([0.0; 3], 2.0, [1.0; 4]));
        uploader.upload(&mut ctx, &scene).unwrap();
        let new = *uploader.buffers().unwrap();

        assert_ne!(old.spheres, new.spheres);
        assert!(ctx.released.contains(&old.spheres));
        assert!(ctx.released.contains(&old.planes));
        assert!(ctx.released.contains(&old.lights));
        assert_eq!(new.sphere_count, 3);
    }

    #[test]
    fn failed_reupload_keeps_previous_buffers_live() {
        let mut ctx = FakeContext::new();
        let mut uploader = SceneUploader::new();
        let scene = test_scene();
        uploader.upload(&mut ctx, &scene).unwrap();
        let old = *uploader.buffers().unwrap();

        // Second buffer of the re-upload fails; the first must be rolled
        // back and the previous set stay installed.
        ctx.fail_alloc_after = Some(ctx.alloc_count() + 1);
        uploader.mark_dirty();
        let err = uploader.upload(&mut ctx, &scene).unwrap_err();
        assert!(matches!(err, UploadError::Allocation(_)));
        assert_eq!(uploader.buffers().unwrap().spheres, old.spheres);
        assert!(!ctx.released.contains(&old.spheres));
    }

    #[test]
    fn empty_backing_with_positive_count_is_rejected() {
        let mut ctx = FakeContext::new();
        let empty: [Sphere; 0] = [];
        let err = upload_array(&mut ctx, &empty, 2, "spheres").unwrap_err();
        assert!(matches!(
            err,
            UploadError::EmptyBacking {
                what: "spheres",
                count: 2
            }
        ));
    }

    #[test]
    fn empty_scene_uploads_placeholders_with_zero_counts() {
        let mut ctx = FakeContext::new();
        let mut uploader = SceneUploader::new();
        uploader.upload(&mut ctx, &Scene::default()).unwrap();

        let buffers = *uploader.buffers().unwrap();
        assert_eq!(buffers.sphere_count, 0);
        assert_eq!(buffers.light_count, 0);
        // Placeholder element keeps the device happy.
        assert_eq!(ctx.buffer_size(buffers.spheres), 32);
    }
}
