//! wgpu backend
//!
//! Allocates the stereo screen as a wgpu texture and runs the correction
//! passes onto the display: the distortion mesh, or the full-screen
//! undistortion shader. Scene rendering itself belongs to the application;
//! it looks up the stereo screen's view here.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::{debug, info, warn};
use wgpu::util::DeviceExt;
use wgpu::{BindGroup, BindGroupLayout, Buffer, Device, Queue, RenderPipeline};

use crate::compositor::{CompositorBackend, ShaderUndistortion, UndistortionUniforms};
use crate::context::{RenderTargetAllocator, RenderTargetId, StereoScreen};
use crate::error::{Result, StereoError};
use crate::mesh::{DistortionMesh, MeshVertex};
use crate::viewport::Rect;

// Mesh uniforms
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MeshUniforms {
    screen_aspect: f32,
    _padding: [f32; 3],
}

// Undistortion uniforms, both eyes
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct EyeUniformsBlock {
    eyes: [UndistortionUniforms; 2],
}

struct StereoTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    bind_group: BindGroup,
}

struct UploadedMesh {
    mesh_id: u64,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
}

pub struct GpuBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    format: wgpu::TextureFormat,

    // Stereo screens
    next_id: u64,
    targets: HashMap<RenderTargetId, StereoTarget>,
    sampler: wgpu::Sampler,
    texture_bind_group_layout: BindGroupLayout,

    // Mesh pass
    mesh_pipeline: RenderPipeline,
    mesh_uniform_buffer: Buffer,
    mesh_uniform_bind_group: BindGroup,
    mesh: Option<UploadedMesh>,

    // Full-screen undistortion pass
    undistortion_pipeline: RenderPipeline,
    undistortion_buffer: Buffer,
    undistortion_bind_group: BindGroup,

    // Display view for the current frame
    output: Option<wgpu::TextureView>,
}

impl GpuBackend {
    /// `format` is used for both the stereo screen and the display.
    pub fn new(device: Arc<Device>, queue: Arc<Queue>, format: wgpu::TextureFormat) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Stereo Screen Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let texture_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Stereo Screen Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let uniform_layout = |label: &str, visibility: wgpu::ShaderStages| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            })
        };

        // --- Mesh Pipeline Setup ---

        let mesh_uniform_layout = uniform_layout("Mesh Uniform Layout", wgpu::ShaderStages::VERTEX);
        let mesh_uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Mesh Uniform Buffer"),
            contents: bytemuck::bytes_of(&MeshUniforms { screen_aspect: 1.0, _padding: [0.0; 3] }),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let mesh_uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mesh Uniform Bind Group"),
            layout: &mesh_uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: mesh_uniform_buffer.as_entire_binding(),
            }],
        });

        let mesh_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Distortion Mesh Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/distortion_mesh.wgsl").into()),
        });
        let mesh_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Distortion Mesh Pipeline Layout"),
            bind_group_layouts: &[&texture_bind_group_layout, &mesh_uniform_layout],
            push_constant_ranges: &[],
        });
        let mesh_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Distortion Mesh Pipeline"),
            layout: Some(&mesh_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &mesh_shader,
                entry_point: Some("vs_main"),
                buffers: &[MeshVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &mesh_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        // --- Undistortion Pipeline Setup ---

        let undistortion_layout = uniform_layout("Undistortion Uniform Layout", wgpu::ShaderStages::FRAGMENT);
        let undistortion_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Undistortion Buffer"),
            size: std::mem::size_of::<EyeUniformsBlock>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let undistortion_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Undistortion Bind Group"),
            layout: &undistortion_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: undistortion_buffer.as_entire_binding(),
            }],
        });

        let undistortion_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Undistortion Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/undistortion.wgsl").into()),
        });
        let undistortion_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Undistortion Pipeline Layout"),
            bind_group_layouts: &[&texture_bind_group_layout, &undistortion_layout],
            push_constant_ranges: &[],
        });
        let undistortion_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Undistortion Pipeline"),
            layout: Some(&undistortion_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &undistortion_shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &undistortion_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        info!("GPU compositor initialized ({:?})", format);

        Self {
            device,
            queue,
            format,
            next_id: 1,
            targets: HashMap::new(),
            sampler,
            texture_bind_group_layout,
            mesh_pipeline,
            mesh_uniform_buffer,
            mesh_uniform_bind_group,
            mesh: None,
            undistortion_pipeline,
            undistortion_buffer,
            undistortion_bind_group,
            output: None,
        }
    }

    /// Sets the display view the next correction pass draws into. Cleared
    /// once the pass has run.
    pub fn set_output(&mut self, view: wgpu::TextureView) {
        self.output = Some(view);
    }

    /// Render target view of a stereo screen, for the scene renderer.
    pub fn stereo_screen_view(&self, screen: &StereoScreen) -> Option<&wgpu::TextureView> {
        self.targets.get(&screen.id).map(|t| &t.view)
    }

    /// Pixel viewport `(x, y, w, h)` of a normalized rect on the stereo
    /// screen, ready for `RenderPass::set_viewport`.
    pub fn eye_viewport(screen: &StereoScreen, rect: &Rect) -> (f32, f32, f32, f32) {
        rect.to_pixels(screen.width, screen.height)
    }

    /// Copies an eye rendered into a temporary full-size texture into its
    /// half of the stereo screen.
    pub fn blit_eye(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        source: &wgpu::Texture,
        screen: &StereoScreen,
        rect: &Rect,
    ) {
        let Some(target) = self.targets.get(&screen.id) else {
            warn!("Blit into released stereo screen {:?}", screen.id);
            return;
        };
        let (x, y, w, h) = Self::eye_viewport(screen, rect);
        let origin = wgpu::Origin3d { x: x.max(0.0) as u32, y: y.max(0.0) as u32, z: 0 };
        let width = (w as u32).min(screen.width.saturating_sub(origin.x));
        let height = (h as u32).min(screen.height.saturating_sub(origin.y));
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: source,
                mip_level: 0,
                origin,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
    }

    fn upload_mesh(&mut self, mesh: &DistortionMesh) {
        if self.mesh.as_ref().is_some_and(|m| m.mesh_id == mesh.id()) {
            return;
        }
        debug!("Uploading distortion mesh {}", mesh.id());
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Distortion Mesh Vertices"),
            contents: bytemuck::cast_slice(mesh.vertices()),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Distortion Mesh Indices"),
            contents: bytemuck::cast_slice(mesh.indices()),
            usage: wgpu::BufferUsages::INDEX,
        });
        let uniforms = MeshUniforms { screen_aspect: mesh.screen_aspect(), _padding: [0.0; 3] };
        self.queue.write_buffer(&self.mesh_uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        self.mesh = Some(UploadedMesh {
            mesh_id: mesh.id(),
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices().len() as u32,
        });
    }

    /// Begins a pass on the display, cleared to black.
    fn begin_output_pass<'a>(
        encoder: &'a mut wgpu::CommandEncoder,
        output: &'a wgpu::TextureView,
        label: &str,
    ) -> wgpu::RenderPass<'a> {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: output,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }
}

impl RenderTargetAllocator for GpuBackend {
    fn supports_render_targets(&self) -> bool {
        true
    }

    fn allocate(&mut self, width: u32, height: u32) -> Result<StereoScreen> {
        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(StereoError::RenderTargetAllocation(format!(
                "{width}x{height} exceeds device limit {max}"
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Stereo Screen"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Stereo Screen Bind Group"),
            layout: &self.texture_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&self.sampler) },
            ],
        });

        let id = RenderTargetId(self.next_id);
        self.next_id += 1;
        self.targets.insert(id, StereoTarget { texture, view, bind_group });
        Ok(StereoScreen { id, width, height })
    }

    fn release(&mut self, screen: StereoScreen) {
        if let Some(target) = self.targets.remove(&screen.id) {
            target.texture.destroy();
        }
    }
}

impl CompositorBackend for GpuBackend {
    fn draw_mesh(&mut self, stereo_screen: &StereoScreen, mesh: &DistortionMesh) {
        self.upload_mesh(mesh);
        let output = self.output.take();
        let (Some(output), Some(target), Some(uploaded)) = (
            output.as_ref(),
            self.targets.get(&stereo_screen.id),
            self.mesh.as_ref(),
        ) else {
            warn!("Distortion mesh pass skipped: no output view or stereo screen");
            return;
        };

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Distortion Mesh Encoder"),
        });
        {
            let mut render_pass = Self::begin_output_pass(&mut encoder, output, "Distortion Mesh Pass");
            render_pass.set_pipeline(&self.mesh_pipeline);
            render_pass.set_bind_group(0, &target.bind_group, &[]);
            render_pass.set_bind_group(1, &self.mesh_uniform_bind_group, &[]);
            render_pass.set_vertex_buffer(0, uploaded.vertex_buffer.slice(..));
            render_pass.set_index_buffer(uploaded.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            render_pass.draw_indexed(0..uploaded.index_count, 0, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn draw_undistortion(&mut self, stereo_screen: &StereoScreen, shader: &ShaderUndistortion) {
        let output = self.output.take();
        let (Some(output), Some(target)) = (output.as_ref(), self.targets.get(&stereo_screen.id)) else {
            warn!("Undistortion pass skipped: no output view or stereo screen");
            return;
        };
        let block = EyeUniformsBlock { eyes: shader.eyes };
        self.queue.write_buffer(&self.undistortion_buffer, 0, bytemuck::bytes_of(&block));

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Undistortion Encoder"),
        });
        {
            let mut render_pass = Self::begin_output_pass(&mut encoder, output, "Undistortion Pass");
            render_pass.set_pipeline(&self.undistortion_pipeline);
            render_pass.set_bind_group(0, &target.bind_group, &[]);
            render_pass.set_bind_group(1, &self.undistortion_bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn discard(&mut self, _stereo_screen: &StereoScreen) {
        // wgpu has no explicit invalidate. The next eye pass clears the
        // stereo screen with a load op.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::DistortionMeshBuilder;
    use crate::profile::DeviceProfile;

    // Skips on machines without any GPU adapter.
    fn backend() -> Option<GpuBackend> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None)).ok()?;
        Some(GpuBackend::new(Arc::new(device), Arc::new(queue), wgpu::TextureFormat::Rgba8Unorm))
    }

    fn output_view(gpu: &GpuBackend) -> wgpu::TextureView {
        gpu.device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Test Display"),
                size: wgpu::Extent3d { width: 64, height: 32, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default())
    }

    #[test]
    fn output_is_consumed_by_the_pass_not_by_discard() {
        let Some(mut gpu) = backend() else {
            return;
        };
        let screen = gpu.allocate(64, 32).unwrap();
        assert!(gpu.stereo_screen_view(&screen).is_some());

        gpu.set_output(output_view(&gpu));
        gpu.discard(&screen);
        assert!(gpu.output.is_some());

        let mesh = DistortionMeshBuilder::new(8, 8, Default::default()).build(&DeviceProfile::default());
        gpu.draw_mesh(&screen, &mesh);
        assert!(gpu.output.is_none());
        assert_eq!(gpu.mesh.as_ref().map(|m| m.mesh_id), Some(mesh.id()));

        gpu.release(screen);
        assert!(gpu.stereo_screen_view(&screen).is_none());
    }

    #[test]
    fn oversized_stereo_screen_is_an_allocation_error() {
        let Some(mut gpu) = backend() else {
            return;
        };
        assert!(matches!(gpu.allocate(0, 16), Err(StereoError::RenderTargetAllocation(_))));
        assert!(matches!(
            gpu.allocate(u32::MAX, 16),
            Err(StereoError::RenderTargetAllocation(_))
        ));
    }
}
