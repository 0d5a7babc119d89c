// Frame renderer
//
// FRAME FLOW:
// 1. Wait for the frame-in-flight fence, acquire a swapchain image
// 2. Update camera and frustum
// 3. Begin the primary buffer and the render pass (secondary contents only)
// 4. Record the starfield secondary on this thread
// 5. Workers animate, cull and record one secondary per visible UFO
// 6. Execute starfield + visible secondaries, submit, present
//
// Field order matters for Drop: the recorder (and its worker threads) goes
// first, the device last.

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::pipeline::{self, create_framebuffers, create_render_pass, destroy_framebuffers};
use crate::backend::{
    Acquired, CommandPool, DepthImage, FrameSync, Pipeline, PipelineDesc, Surface, Swapchain,
    VulkanDevice,
};
use crate::camera::Camera;
use crate::config::Config;
use crate::frustum::Frustum;
use crate::mesh::{GpuMesh, Mesh, MeshHandles};
use crate::recorder::{objects_per_worker, FrameState, ObjectRecorder, ParallelRecorder};
use crate::scene::{ObjectData, PushConstantBlock};
use crate::thread_pool::ThreadPool;

const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstantBlock>() as u32;

/// Begin a secondary buffer that continues the render pass on `framebuffer`
pub fn begin_secondary(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
) -> Result<()> {
    let inheritance = vk::CommandBufferInheritanceInfo::default()
        .render_pass(render_pass)
        .subpass(0)
        .framebuffer(framebuffer);

    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
        .inheritance_info(&inheritance);

    unsafe { device.begin_command_buffer(cmd, &begin_info) }
        .context("Failed to begin secondary command buffer")
}

/// Records one UFO draw into a worker-owned secondary buffer
pub struct UfoRecorder {
    device: Arc<VulkanDevice>,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    mesh: MeshHandles,
}

impl ObjectRecorder for UfoRecorder {
    type Target = vk::CommandBuffer;

    fn record(
        &self,
        cmd: vk::CommandBuffer,
        _object: &ObjectData,
        push_constants: &PushConstantBlock,
    ) -> Result<()> {
        let device = &self.device.device;
        begin_secondary(device, cmd, self.render_pass, self.framebuffer)?;

        pipeline::set_viewport(device, cmd, self.extent);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            device.cmd_push_constants(
                cmd,
                self.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(push_constants),
            );
        }
        self.mesh.bind_and_draw(device, cmd);

        unsafe { device.end_command_buffer(cmd) }.context("Failed to end UFO command buffer")
    }
}

pub struct Renderer {
    recorder: ParallelRecorder<vk::CommandBuffer>,
    // One pool per worker; only that worker records from it
    worker_pools: Vec<CommandPool>,

    primary: Vec<vk::CommandBuffer>,
    background: Vec<vk::CommandBuffer>,
    // Owns `primary` and `background`
    _command_pool: CommandPool,
    frame_sync: Vec<FrameSync>,

    ufo_pipeline: Pipeline,
    star_pipeline: Pipeline,
    ufo_mesh: GpuMesh,
    star_mesh: GpuMesh,

    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    depth: DepthImage,
    swapchain: Swapchain,
    surface: Surface,

    pub camera: Camera,
    frustum: Frustum,
    cull_radius: f32,
    clear_color: [f32; 4],
    present_mode: vk::PresentModeKHR,
    current_frame: usize,
    /// Freeze object animation (the camera still moves)
    pub paused: bool,
    needs_resize: bool,

    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let device = VulkanDevice::new(
            &config.window.title,
            config.debug.validation_layers,
            display,
        )?;
        let surface = Surface::new(&device, display, window_handle)?;

        let size = window.inner_size();
        let present_mode = config.get_present_mode();
        let swapchain = Swapchain::new(
            Arc::clone(&device),
            &surface,
            size.width,
            size.height,
            present_mode,
            None,
        )?;

        let depth = DepthImage::new(&device, swapchain.extent)?;
        let render_pass = create_render_pass(&device, swapchain.format)?;
        let framebuffers = create_framebuffers(
            &device,
            &swapchain.image_views,
            depth.view,
            render_pass,
            swapchain.extent,
        )?;

        let shaders = &config.shaders;
        let front_face = pipeline::front_face(config.camera.flip_y);
        let ufo_pipeline = Pipeline::new(
            &device,
            render_pass,
            &PipelineDesc {
                name: "ufo",
                vertex_shader: shaders.path("phong.vert.spv"),
                fragment_shader: shaders.path("phong.frag.spv"),
                cull_mode: vk::CullModeFlags::BACK,
                front_face,
                depth_test: true,
                depth_write: true,
                push_constant_size: PUSH_CONSTANT_SIZE,
            },
        )?;
        // Seen from inside, so the outward faces are culled
        let star_pipeline = Pipeline::new(
            &device,
            render_pass,
            &PipelineDesc {
                name: "starsphere",
                vertex_shader: shaders.path("starsphere.vert.spv"),
                fragment_shader: shaders.path("starsphere.frag.spv"),
                cull_mode: vk::CullModeFlags::FRONT,
                front_face,
                depth_test: false,
                depth_write: false,
                push_constant_size: PUSH_CONSTANT_SIZE,
            },
        )?;

        let ufo_mesh = GpuMesh::upload(&device, &Mesh::saucer(), "ufo")?;
        let star_mesh = GpuMesh::upload(&device, &Mesh::uv_sphere(1.0, 16, 32, Vec3::ONE), "starsphere")?;
        let cull_radius = ufo_mesh.bounding_radius * config.threading.cull_radius_scale;

        let frames_in_flight = config.graphics.max_frames_in_flight;
        let command_pool = CommandPool::new(&device)?;
        let primary = command_pool.allocate(vk::CommandBufferLevel::PRIMARY, frames_in_flight)?;
        let background = command_pool.allocate(vk::CommandBufferLevel::SECONDARY, frames_in_flight)?;
        let frame_sync = (0..frames_in_flight)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let pool = ThreadPool::new(config.threading.resolved_worker_count())?;
        let worker_pools = (0..pool.thread_count())
            .map(|_| CommandPool::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let per_worker = objects_per_worker(config.threading.object_count, pool.thread_count());
        let mut rng = StdRng::seed_from_u64(config.threading.seed);
        let recorder = ParallelRecorder::new(
            pool,
            per_worker,
            frames_in_flight,
            &mut rng,
            |worker, count| worker_pools[worker].allocate(vk::CommandBufferLevel::SECONDARY, count),
        )?;

        let camera_config = &config.camera;
        let mut camera = Camera::new(camera_config.position(), camera_config.rotation());
        camera.set_flip_y(camera_config.flip_y);
        camera.set_perspective(
            camera_config.fov,
            swapchain.aspect_ratio(),
            camera_config.near,
            camera_config.far,
        );
        camera.movement_speed = camera_config.movement_speed;
        let frustum = Frustum::from_matrix(camera.view_projection());

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            recorder,
            worker_pools,
            primary,
            background,
            _command_pool: command_pool,
            frame_sync,
            ufo_pipeline,
            star_pipeline,
            ufo_mesh,
            star_mesh,
            framebuffers,
            render_pass,
            depth,
            swapchain,
            surface,
            camera,
            frustum,
            cull_radius,
            clear_color: config.graphics.clear_color,
            present_mode,
            current_frame: 0,
            paused: false,
            needs_resize: false,
            device,
        })
    }

    pub fn request_resize(&mut self) {
        self.needs_resize = true;
    }

    /// Render one frame. Returns false if nothing was presented.
    pub fn render_frame(&mut self, delta_time: f32, width: u32, height: u32) -> Result<bool> {
        if self.needs_resize {
            self.recreate_swapchain(width, height)?;
            if self.needs_resize {
                return Ok(false);
            }
        }

        let frame = self.current_frame;
        self.frame_sync[frame].wait()?;

        let image_index = match self
            .swapchain
            .acquire_next_image(u64::MAX, self.frame_sync[frame].image_available)?
        {
            Acquired::Image { index, suboptimal } => {
                if suboptimal {
                    self.needs_resize = true;
                }
                index
            }
            Acquired::OutOfDate => {
                self.needs_resize = true;
                return Ok(false);
            }
        };

        self.camera.update(delta_time);
        self.frustum.update(self.camera.view_projection());
        let frame_timer = if self.paused { 0.0 } else { delta_time };

        self.record_primary(frame, image_index, frame_timer)?;
        let signal_semaphores = [self.swapchain.render_finished(image_index)?];

        let sync = &self.frame_sync[frame];
        // Reset only once a submission is certain to follow
        sync.reset()?;

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.primary[frame]];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                std::slice::from_ref(&submit_info),
                sync.in_flight_fence,
            )
        }
        .context("Failed to submit frame")?;

        if self
            .swapchain
            .present(self.device.graphics_queue, image_index)?
        {
            self.needs_resize = true;
        }

        self.current_frame = (frame + 1) % self.frame_sync.len();
        Ok(true)
    }

    fn record_primary(&self, frame: usize, image_index: u32, frame_timer: f32) -> Result<()> {
        let device = &self.device.device;
        let cmd = self.primary[frame];
        let framebuffer = *self
            .framebuffers
            .get(image_index as usize)
            .context("Swapchain returned an unknown image")?;

        unsafe {
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .context("Failed to begin primary command buffer")?;
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(
                cmd,
                &render_pass_info,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
        }

        self.record_background(frame, framebuffer)?;

        let ufo = Arc::new(UfoRecorder {
            device: Arc::clone(&self.device),
            render_pass: self.render_pass,
            framebuffer,
            extent: self.swapchain.extent,
            pipeline: self.ufo_pipeline.pipeline,
            layout: self.ufo_pipeline.layout,
            mesh: self.ufo_mesh.handles(),
        });
        let state = FrameState {
            frustum: self.frustum,
            view_projection: self.camera.view_projection(),
            frame_timer,
            cull_radius: self.cull_radius,
        };

        // Objects whose recording failed are already marked invisible
        let visible = match self.recorder.record_frame(frame, state, ufo) {
            Ok(visible) => visible,
            Err(e) => {
                log::error!("{:#}", e);
                self.recorder.visible_targets(frame)
            }
        };

        let mut secondaries = Vec::with_capacity(visible.len() + 1);
        secondaries.push(self.background[frame]);
        secondaries.extend(visible);

        unsafe {
            device.cmd_execute_commands(cmd, &secondaries);
            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .context("Failed to end primary command buffer")?;
        }

        Ok(())
    }

    /// Starfield sphere around the camera, drawn first with depth off
    fn record_background(&self, frame: usize, framebuffer: vk::Framebuffer) -> Result<()> {
        let device = &self.device.device;
        let cmd = self.background[frame];

        begin_secondary(device, cmd, self.render_pass, framebuffer)?;
        pipeline::set_viewport(device, cmd, self.swapchain.extent);

        let mvp = self.camera.rotation_only_view_projection() * Mat4::from_scale(Vec3::splat(2.0));
        let push = PushConstantBlock::new(mvp, Vec3::ONE);

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.star_pipeline.pipeline);
            device.cmd_push_constants(
                cmd,
                self.star_pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&push),
            );
        }
        self.star_mesh.handles().bind_and_draw(device, cmd);

        unsafe { device.end_command_buffer(cmd) }.context("Failed to end starfield command buffer")
    }

    /// Rebuild size-dependent resources. A zero-sized (minimised) window
    /// leaves `needs_resize` set so the next frame tries again.
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.device.wait_idle()?;
        destroy_framebuffers(&self.device, &mut self.framebuffers);

        let swapchain = Swapchain::new(
            Arc::clone(&self.device),
            &self.surface,
            width,
            height,
            self.present_mode,
            Some(&self.swapchain),
        )?;
        // The render pass and pipelines were built for the old format
        anyhow::ensure!(
            swapchain.format == self.swapchain.format,
            "Surface format changed from {:?} to {:?}",
            self.swapchain.format,
            swapchain.format
        );
        self.swapchain = swapchain;

        self.depth = DepthImage::new(&self.device, self.swapchain.extent)?;
        self.framebuffers = create_framebuffers(
            &self.device,
            &self.swapchain.image_views,
            self.depth.view,
            self.render_pass,
            self.swapchain.extent,
        )?;

        self.camera.update_aspect_ratio(self.swapchain.aspect_ratio());
        self.frustum.update(self.camera.view_projection());
        log::debug!("Frustum after resize: {:?}", self.frustum.planes());
        self.needs_resize = false;
        Ok(())
    }

    /// (visible, total) objects of the last recorded frame
    pub fn object_counts(&self) -> (usize, usize) {
        (self.recorder.visible_count(), self.recorder.object_count())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_pools.len()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Nothing below may be in use by the GPU
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle failed during cleanup: {:#}", e);
        }

        destroy_framebuffers(&self.device, &mut self.framebuffers);
        unsafe {
            self.device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}
