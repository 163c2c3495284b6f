use std::collections::VecDeque;
use std::sync::Arc;
use clap::Parser;
use log::info;
use zenith_core::cli::CommonArgs;
use zenith_rhi_pool::multi_device::{
    MultiDeviceBuffer, MultiDeviceBufferInitRequest, MultiDeviceBufferMapRequest, MultiDeviceBufferPool, MultiDeviceBufferStreamRequest,
    MultiDeviceBufferView, MultiDeviceShaderResourceGroup, MultiDeviceShaderResourceGroupData,
    MultiDeviceShaderResourceGroupPool,
};
use zenith_rhi_pool::{
    BufferDescriptor, BufferPoolDescriptorBuilder, BufferViewDescriptor, HeapMemoryLevel, MemoryReportDetail,
    RhiConfigBuilder, RhiContext, SamplerConfig, ShaderResourceGroupLayout, ShaderResourceGroupPoolDescriptor,
};

const OBJECT_COUNT: usize = 8;
const OBJECT_CONSTANTS_SIZE: u64 = 64;
const FRAME_CONSTANTS_SIZE: u64 = 256;

#[derive(Parser, Debug)]
#[command(version, about = "Runs simulated frames over multi-device resource pools")]
struct SandboxArgs {
    /// Number of simulated devices
    #[arg(short = 'd', long, default_value_t = 2)]
    devices: u32,

    /// Frames to run before shutting down
    #[arg(short = 'f', long, default_value_t = 8)]
    frames: u64,

    /// Per-device budget of the instance buffer pool in bytes, zero for unlimited
    #[arg(short = 'b', long, default_value_t = 0)]
    budget: u64,

    /// Frames the simulated GPU lags behind the CPU
    #[arg(long = "gpu-latency", default_value_t = 2)]
    gpu_latency: usize,

    #[command(flatten)]
    common: CommonArgs,
}

struct Scene {
    frame_constants: Arc<MultiDeviceBufferPool>,
    frame_buffer: Arc<MultiDeviceBuffer>,
    instances: Arc<MultiDeviceBufferPool>,
    groups: Arc<MultiDeviceShaderResourceGroupPool>,
    layout: Arc<ShaderResourceGroupLayout>,
    instance_buffer: Arc<MultiDeviceBuffer>,
    instance_view: Arc<MultiDeviceBufferView>,
    objects: Vec<Arc<MultiDeviceShaderResourceGroup>>,
}

impl Scene {
    fn new(context: &RhiContext, budget: u64) -> anyhow::Result<Self> {
        let mask = context.all_devices_mask();

        let frame_constants = MultiDeviceBufferPool::new("Frame constants");
        let descriptor = BufferPoolDescriptorBuilder::default()
            .heap_memory_level(HeapMemoryLevel::Host)
            .build()?;
        frame_constants.init(context, mask, &descriptor)?;
        let frame_buffer = MultiDeviceBuffer::new("frame constants");
        frame_constants.init_buffer(&MultiDeviceBufferInitRequest::new(
            &frame_buffer,
            BufferDescriptor::constant(FRAME_CONSTANTS_SIZE),
        ))?;

        let instances = MultiDeviceBufferPool::new("Instances");
        let descriptor = BufferPoolDescriptorBuilder::default()
            .heap_memory_level(HeapMemoryLevel::Device)
            .budget_in_bytes(budget)
            .build()?;
        instances.init(context, mask, &descriptor)?;

        let instance_buffer = MultiDeviceBuffer::new("instance data");
        let instance_bytes = OBJECT_COUNT as u64 * OBJECT_CONSTANTS_SIZE;
        instances.init_buffer(
            &MultiDeviceBufferInitRequest::new(&instance_buffer, BufferDescriptor::shader_read(instance_bytes))
                .with_initial_data(&vec![0; instance_bytes as usize]),
        )?;
        let instance_view = MultiDeviceBufferView::new(&instance_buffer, BufferViewDescriptor::whole())?;

        let layout = Arc::new(
            ShaderResourceGroupLayout::new("Object")
                .with_constants(16)
                .with_buffer("instances", 1)
                .with_sampler("sampler", 1),
        );
        let groups = MultiDeviceShaderResourceGroupPool::new("Objects");
        groups.init(context, mask, &ShaderResourceGroupPoolDescriptor::new(&layout))?;
        let objects = (0..OBJECT_COUNT)
            .map(|index| {
                let group = MultiDeviceShaderResourceGroup::new(format!("object {index}"));
                groups.init_group(&group).map(|_| group)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            frame_constants,
            frame_buffer,
            instances,
            groups,
            layout,
            instance_buffer,
            instance_view,
            objects,
        })
    }

    #[profiling::function]
    fn update(&self, frame: u64) -> anyhow::Result<()> {
        // The previous frame's constants may still be read by the GPU.
        self.frame_constants.orphan_buffer(&self.frame_buffer)?;
        let mapped = self
            .frame_constants
            .map_buffer(&MultiDeviceBufferMapRequest::new(&self.frame_buffer, 0, FRAME_CONSTANTS_SIZE))?;
        mapped.write_all(0, &frame.to_le_bytes())?;
        self.frame_constants.unmap_buffer(&self.frame_buffer)?;

        let bytes: Vec<u8> = (0..OBJECT_CONSTANTS_SIZE).map(|i| (frame + i) as u8).collect();
        let slot = frame % OBJECT_COUNT as u64;
        self.instances.stream_buffer(&MultiDeviceBufferStreamRequest {
            buffer: &self.instance_buffer,
            byte_offset: slot * OBJECT_CONSTANTS_SIZE,
            source_data: &bytes,
        })?;

        for (index, group) in self.objects.iter().enumerate() {
            let mut data = MultiDeviceShaderResourceGroupData::new(&self.layout);
            data.set_constants(0, &(frame as u32).to_le_bytes())?
                .set_constants(4, &(index as u32).to_le_bytes())?
                .bind_buffer("instances", 0, &self.instance_view)?
                .bind_sampler("sampler", 0, SamplerConfig::linear())?;
            self.groups.queue_for_compile(group, &data)?;
        }
        Ok(())
    }

    /// Compiles the queued groups in two halves, the way parallel jobs would split them.
    #[profiling::function]
    fn compile(&self) -> anyhow::Result<()> {
        let total = self.groups.compile_groups_begin()?;
        let half = total / 2;
        self.groups.compile_groups_for_interval(0..half)?;
        self.groups.compile_groups_for_interval(half..total)?;
        self.groups.compile_groups_end()?;
        Ok(())
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.groups.shutdown()?;
        self.instances.shutdown()?;
        self.frame_constants.shutdown()?;
        Ok(())
    }
}

fn print_memory_report(context: &RhiContext) {
    for report in context.memory_statistics(MemoryReportDetail::Detail) {
        info!("device {}:", report.device_index);
        for pool in &report.pools {
            let host = pool.memory_usage.heap(HeapMemoryLevel::Host);
            let device = pool.memory_usage.heap(HeapMemoryLevel::Device);
            info!(
                "  {}: host {}/{} bytes, device {}/{} bytes, {} resource(s), pushed {} bytes",
                pool.name,
                host.used_resident_in_bytes,
                host.total_resident_in_bytes,
                device.used_resident_in_bytes,
                device.total_resident_in_bytes,
                pool.resources.len(),
                pool.memory_usage.transfer_push_bytes,
            );
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = SandboxArgs::parse();
    zenith_core::log::initialize(args.common.level_filter())?;

    let context = RhiContext::new(&RhiConfigBuilder::default().device_count(args.devices).build()?)?;
    let scene = Scene::new(&context, args.budget)?;

    let mut in_flight = VecDeque::new();
    for frame in 0..args.frames {
        profiling::scope!("frame");
        context.begin_frame()?;
        scene.update(frame)?;
        context.compile_frame()?;
        scene.compile()?;
        let fence_values = context.end_frame()?;
        in_flight.push_back(fence_values.into_iter().max().unwrap_or_default());

        while in_flight.len() > args.gpu_latency {
            if let Some(fence_value) = in_flight.pop_front() {
                context.complete_gpu_work(fence_value)?;
            }
        }
        profiling::finish_frame!();
    }

    print_memory_report(&context);
    scene.shutdown()?;
    let freed = context.wait_for_idle()?;
    info!("released {} object(s), {} bytes after idle", freed.object_count, freed.bytes);
    Ok(())
}
