//! wgpu-backed [`DeviceContext`].
//!
//! Kernels are compute entry points of one WGSL module. Binding
//! convention, which the WGSL source must follow: buffer and texture
//! arguments occupy group 0 bindings in argument order; all scalar
//! arguments of a dispatch are packed, in order, into a single uniform
//! buffer bound after them. `Local` arguments carry no binding, since
//! WGSL declares workgroup memory in the shader; they are accepted for
//! interface parity and validated against device limits only.

use std::collections::HashMap;

use log::info;
use wgpu::util::DeviceExt;

use crate::context::{BufferAccess, BufferId, DeviceContext, DispatchRange, KernelArg};
use crate::error::{AllocationError, DispatchError, ProgramBuildError};

enum GpuResource {
    Buffer(wgpu::Buffer),
    Texture(wgpu::TextureView),
}

/// Owns the wgpu device and queue plus the handle table all [`BufferId`]s
/// index into.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    module: Option<wgpu::ShaderModule>,
    pipelines: HashMap<String, wgpu::ComputePipeline>,
    resources: Vec<Option<GpuResource>>,
}

impl WgpuContext {
    pub fn new() -> Result<Self, AllocationError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| AllocationError::Context("no suitable adapter".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("raytracer device"),
                features: wgpu::Features::empty(),
                limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|err| AllocationError::Context(err.to_string()))?;

        info!(
            "created wgpu context on {}, max workgroup size {}",
            adapter.get_info().name,
            device.limits().max_compute_invocations_per_workgroup
        );

        Ok(WgpuContext {
            device,
            queue,
            module: None,
            pipelines: HashMap::new(),
            resources: Vec::new(),
        })
    }

    fn insert(&mut self, resource: GpuResource) -> BufferId {
        self.resources.push(Some(resource));
        BufferId::from_raw(self.resources.len() as u32 - 1)
    }

    fn buffer(&self, id: BufferId) -> Result<&wgpu::Buffer, DispatchError> {
        match self
            .resources
            .get(id.to_raw() as usize)
            .and_then(|slot| slot.as_ref())
        {
            Some(GpuResource::Buffer(buffer)) => Ok(buffer),
            _ => Err(DispatchError::InvalidHandle(id)),
        }
    }

    fn binding_resource(&self, id: BufferId) -> Result<wgpu::BindingResource, DispatchError> {
        match self
            .resources
            .get(id.to_raw() as usize)
            .and_then(|slot| slot.as_ref())
        {
            Some(GpuResource::Buffer(buffer)) => Ok(buffer.as_entire_binding()),
            Some(GpuResource::Texture(view)) => Ok(wgpu::BindingResource::TextureView(view)),
            None => Err(DispatchError::InvalidHandle(id)),
        }
    }

    /// Storage usage regardless of declared access; wgpu tracks actual
    /// shader access through the pipeline layout.
    fn usage_for(_access: BufferAccess) -> wgpu::BufferUsages {
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
    }

    fn pop_validation_error(&self) -> Option<String> {
        pollster::block_on(self.device.pop_error_scope()).map(|err| err.to_string())
    }
}

impl DeviceContext for WgpuContext {
    type ExternalTexture = wgpu::Texture;

    fn create_buffer(
        &mut self,
        size: usize,
        access: BufferAccess,
    ) -> Result<BufferId, AllocationError> {
        if size == 0 {
            return Err(AllocationError::ZeroSized);
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: size as u64,
            usage: Self::usage_for(access),
            mapped_at_creation: false,
        });
        if let Some(reason) = self.pop_validation_error() {
            return Err(AllocationError::DeviceRejected { size, reason });
        }
        Ok(self.insert(GpuResource::Buffer(buffer)))
    }

    fn create_buffer_from_bytes(
        &mut self,
        bytes: &[u8],
        access: BufferAccess,
    ) -> Result<BufferId, AllocationError> {
        if bytes.is_empty() {
            return Err(AllocationError::ZeroSized);
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytes,
                usage: Self::usage_for(access),
            });
        if let Some(reason) = self.pop_validation_error() {
            return Err(AllocationError::DeviceRejected {
                size: bytes.len(),
                reason,
            });
        }
        Ok(self.insert(GpuResource::Buffer(buffer)))
    }

    fn release_buffer(&mut self, id: BufferId) {
        if let Some(slot) = self.resources.get_mut(id.to_raw() as usize) {
            *slot = None;
        }
    }

    fn share_texture(&mut self, texture: wgpu::Texture) -> Result<BufferId, AllocationError> {
        if !texture.usage().contains(wgpu::TextureUsages::STORAGE_BINDING) {
            return Err(AllocationError::ShareTexture(
                "shared texture must allow storage binding".into(),
            ));
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(self.insert(GpuResource::Texture(view)))
    }

    fn build_program(&mut self, source: &str) -> Result<(), ProgramBuildError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("raytracer kernels"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(reason) = self.pop_validation_error() {
            return Err(ProgramBuildError::Build(reason));
        }
        self.module = Some(module);
        self.pipelines.clear();
        Ok(())
    }

    fn prepare_kernel(&mut self, name: &str) -> Result<(), ProgramBuildError> {
        let module = self.module.as_ref().ok_or(ProgramBuildError::NoProgram)?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: None,
                module,
                entry_point: name,
            });
        if self.pop_validation_error().is_some() {
            return Err(ProgramBuildError::MissingKernel(name.to_owned()));
        }
        self.pipelines.insert(name.to_owned(), pipeline);
        Ok(())
    }

    fn max_workgroup_size(&self) -> usize {
        self.device.limits().max_compute_invocations_per_workgroup as usize
    }

    fn kernel_workgroup_size(&self, kernel: &str) -> Result<usize, DispatchError> {
        if !self.pipelines.contains_key(kernel) {
            return Err(DispatchError::UnpreparedKernel(kernel.to_owned()));
        }
        // wgpu has no per-entry-point query; the device limit applies.
        Ok(self.max_workgroup_size())
    }

    fn write_buffer(
        &mut self,
        id: BufferId,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), DispatchError> {
        let buffer = self.buffer(id)?;
        self.queue.write_buffer(buffer, offset as u64, bytes);
        Ok(())
    }

    fn read_buffer(
        &mut self,
        id: BufferId,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DispatchError> {
        let buffer = self.buffer(id)?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: out.len() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, offset as u64, &staging, 0, out.len() as u64);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| DispatchError::Device {
                kernel: "readback".into(),
                reason: "map callback dropped".into(),
            })?
            .map_err(|err| DispatchError::Device {
                kernel: "readback".into(),
                reason: err.to_string(),
            })?;

        out.copy_from_slice(&slice.get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: &str,
        range: &DispatchRange,
        args: &[KernelArg],
    ) -> Result<(), DispatchError> {
        let pipeline = self
            .pipelines
            .get(kernel)
            .ok_or_else(|| DispatchError::UnpreparedKernel(kernel.to_owned()))?;
        range.validate(self.max_workgroup_size())?;

        let mut entries = Vec::new();
        let mut scalars = Vec::new();
        let mut binding = 0u32;
        for arg in args {
            match *arg {
                KernelArg::Buffer(id) => {
                    entries.push(wgpu::BindGroupEntry {
                        binding,
                        resource: self.binding_resource(id)?,
                    });
                    binding += 1;
                }
                KernelArg::Int(value) => scalars.extend_from_slice(&value.to_le_bytes()),
                KernelArg::UInt(value) => scalars.extend_from_slice(&value.to_le_bytes()),
                KernelArg::Float(value) => scalars.extend_from_slice(&value.to_le_bytes()),
                KernelArg::Local(_) => {}
            }
        }
        let params = if scalars.is_empty() {
            None
        } else {
            Some(
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("dispatch params"),
                        contents: &scalars,
                        usage: wgpu::BufferUsages::UNIFORM,
                    }),
            )
        };
        if let Some(params) = params.as_ref() {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: params.as_entire_binding(),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel),
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let groups = range.workgroups();
            pass.dispatch_workgroups(groups[0] as u32, groups[1] as u32, groups[2] as u32);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(reason) = self.pop_validation_error() {
            return Err(DispatchError::Device {
                kernel: kernel.to_owned(),
                reason,
            });
        }
        Ok(())
    }

    fn run_synchronized<F>(&mut self, _shared: &[BufferId], block: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut Self) -> Result<(), DispatchError>,
    {
        let result = block(self);
        // Completion barrier on every exit path: the display consumer may
        // reclaim the texture once this returns.
        self.device.poll(wgpu::Maintain::Wait);
        result
    }

    fn finish(&mut self) -> Result<(), DispatchError> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
