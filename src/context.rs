//! Compute Context
//!
//! The context owns the device connection and everything shared between the
//! layers of every network built against it: the command queue, the kernel
//! source cache, the just-in-time program builder, and the pattern-fill and
//! dispatch utilities. Layer programs are compiled lazily, with their shapes
//! baked in as WGSL `const` options.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;
use wgpu::{Adapter, Buffer, BufferUsages, ComputePipeline, Device, Instance, Queue, ShaderModule};

use crate::kernels;
use crate::layers::Activation;

/// Fixed 1-D workgroup size, matching the `@workgroup_size(64)` baked into
/// every kernel. Dispatches round the global size up to the next multiple.
pub(crate) const WORKGROUP_SIZE: u32 = 64;

/// Handle for the most recent device operation issued by a node. Later host
/// code waits on it before reading the buffers that operation writes; device
/// operations on the single FIFO queue are already ordered by submission.
#[derive(Clone, Debug, Default)]
pub struct Barrier(Option<wgpu::SubmissionIndex>);

impl Barrier {
    /// A barrier that nothing has to wait for.
    pub fn none() -> Self {
        Self(None)
    }

    /// Block the host until the tracked submission has completed.
    pub fn wait(&self, ctx: &Context) {
        if let Some(index) = &self.0 {
            ctx.device
                .poll(wgpu::Maintain::WaitForSubmissionIndex(index.clone()));
        }
    }
}

/// A built shader module holding one or more named kernels.
#[derive(Debug)]
pub struct Program {
    module: ShaderModule,
    label: String,
}

/// A named entry point extracted from a [`Program`], ready to dispatch.
#[derive(Clone, Debug)]
pub struct Kernel {
    pipeline: Arc<ComputePipeline>,
    entry: String,
}

#[derive(Default)]
struct ProgramBuilder {
    active: bool,
    label: String,
    options: Vec<String>,
    fragments: Vec<String>,
}

/// Grow-only staging state for [`Context::fill_pattern`].
#[derive(Default)]
struct FillCache {
    staging: Option<Buffer>,
    capacity: u64,
    staged: Vec<u8>,
}

struct CommonKernels {
    fill: Kernel,
    derive: Kernel,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FillParams {
    total_words: u32,
    pattern_words: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Owns the GPU connection and the cross-network kernel registries.
///
/// One host thread drives the context; interior state is `RefCell`-guarded
/// accordingly and the type is deliberately not `Sync`.
pub struct Context {
    #[allow(dead_code)]
    instance: Instance,
    adapter: Adapter,
    pub(crate) device: Arc<Device>,
    pub(crate) queue: Arc<Queue>,
    sources: RefCell<HashMap<String, &'static str>>,
    builder: RefCell<ProgramBuilder>,
    fill: RefCell<FillCache>,
    common: RefCell<Option<Arc<CommonKernels>>>,
}

impl Context {
    /// Connect to the best available GPU adapter. Panics when the host has
    /// none; use [`Context::try_new`] to probe first.
    pub fn new() -> Self {
        Self::try_new().expect("no suitable GPU adapter found")
    }

    /// Connect to the best available GPU adapter, or `None` when the host has
    /// no usable device.
    pub fn try_new() -> Option<Self> {
        pollster::block_on(Self::try_new_async())
    }

    /// Async variant of [`Context::try_new`].
    pub async fn try_new_async() -> Option<Self> {
        let instance = Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("synapse device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .expect("failed to create GPU device");

        let info = adapter.get_info();
        log::info!("compute context on {} ({:?})", info.name, info.backend);

        Some(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            sources: RefCell::new(HashMap::new()),
            builder: RefCell::new(ProgramBuilder::default()),
            fill: RefCell::new(FillCache::default()),
            common: RefCell::new(None),
        })
    }

    /// Raw device handle, for building auxiliary buffers outside the layer
    /// machinery.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Adapter name and backend, for diagnostics.
    pub fn adapter_info(&self) -> String {
        let info = self.adapter.get_info();
        format!("{} ({:?})", info.name, info.backend)
    }

    // ========================================================================
    // KERNEL SOURCES & PROGRAM BUILDING
    // ========================================================================

    /// Cached kernel source text by file name; fatal if the registry has no
    /// such file.
    pub fn read_code(&self, name: &str) -> &'static str {
        *self
            .sources
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| kernels::lookup(name))
    }

    /// Start accumulating a new program. At most one program may be under
    /// construction at a time.
    pub fn begin_program(&self, label: &str) {
        let mut b = self.builder.borrow_mut();
        assert!(
            !b.active,
            "program '{}' is already under construction",
            b.label
        );
        b.active = true;
        b.label = label.to_string();
        b.options.clear();
        b.fragments.clear();
    }

    /// Append a compile option. Options become `const` declarations prepended
    /// to the program source, the WGSL analogue of macro definitions.
    pub fn add_option(&self, line: impl Into<String>) {
        let mut b = self.builder.borrow_mut();
        assert!(b.active, "add_option outside begin_program/build_program");
        b.options.push(line.into());
    }

    /// Append the source fragment for an activation function.
    pub fn add_activation_source(&self, activation: Activation) {
        self.add_source_file(activation.source_name());
    }

    /// Append a named kernel source file.
    pub fn add_source_file(&self, name: &str) {
        let text = self.read_code(name);
        self.add_source_text(text);
    }

    /// Append raw WGSL text.
    pub fn add_source_text(&self, text: &str) {
        let mut b = self.builder.borrow_mut();
        assert!(b.active, "add_source_text outside begin_program/build_program");
        b.fragments.push(text.to_string());
    }

    /// Compile the accumulated sources. A build failure is a programming
    /// defect; the compiler diagnostic is logged before aborting. The
    /// accumulation state is cleared whether or not the build succeeds.
    pub fn build_program(&self) -> Program {
        let (label, source) = {
            let mut b = self.builder.borrow_mut();
            assert!(b.active, "build_program without begin_program");
            b.active = false;
            let source = assemble_source(&b.options, &b.fragments);
            (std::mem::take(&mut b.label), source)
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!("kernel build failed for program '{}':\n{}", label, err);
            panic!("kernel build failed for program '{}': {}", label, err);
        }

        log::debug!("built program '{}'", label);
        Program { module, label }
    }

    /// Extract a named entry point as a dispatchable kernel; fatal if the
    /// program has no such entry point.
    pub fn get_kernel(&self, program: &Program, entry: &str) -> Kernel {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: None,
                module: &program.module,
                entry_point: entry,
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!(
                "no kernel '{}' in program '{}': {}",
                entry,
                program.label,
                err
            );
            panic!("no kernel '{}' in program '{}'", entry, program.label);
        }
        Kernel {
            pipeline: Arc::new(pipeline),
            entry: entry.to_string(),
        }
    }

    fn common(&self) -> Arc<CommonKernels> {
        if self.common.borrow().is_none() {
            self.begin_program("common");
            self.add_source_file("common");
            let program = self.build_program();
            let kernels = CommonKernels {
                fill: self.get_kernel(&program, "fill_pattern"),
                derive: self.get_kernel(&program, "derive_gradient"),
            };
            *self.common.borrow_mut() = Some(Arc::new(kernels));
        }
        self.common.borrow().as_ref().unwrap().clone()
    }

    /// The shared elementwise `gradient *= derivative` kernel.
    pub(crate) fn derive_gradient_kernel(&self) -> Kernel {
        self.common().derive.clone()
    }

    // ========================================================================
    // BUFFERS & BIND GROUPS
    // ========================================================================

    /// Storage buffer of `len` f32 elements, uninitialized.
    pub(crate) fn create_storage_buffer(&self, label: &str, len: usize) -> Arc<Buffer> {
        assert!(len > 0, "zero-sized buffer '{}'", label);
        Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len * std::mem::size_of::<f32>()) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    /// Storage buffer initialized from host data.
    pub(crate) fn create_storage_buffer_init(&self, label: &str, data: &[f32]) -> Arc<Buffer> {
        assert!(!data.is_empty(), "zero-sized buffer '{}'", label);
        Arc::new(
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytemuck::cast_slice(data),
                    usage: BufferUsages::STORAGE
                        | BufferUsages::COPY_SRC
                        | BufferUsages::COPY_DST,
                }),
        )
    }

    /// Small uniform buffer initialized from a Pod value.
    pub(crate) fn create_uniform_buffer(&self, label: &str, contents: &[u8]) -> Arc<Buffer> {
        Arc::new(
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents,
                    usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                }),
        )
    }

    /// Bind group assigning `buffers` to bindings `0..n` of the kernel's
    /// first group. Every kernel in this crate declares its bindings densely
    /// from zero, so positional binding is enough.
    pub(crate) fn bind_group(
        &self,
        label: &str,
        kernel: &Kernel,
        buffers: &[&Buffer],
    ) -> wgpu::BindGroup {
        let layout = kernel.pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        })
    }

    // ========================================================================
    // DISPATCH, FILL, TRANSFER
    // ========================================================================

    /// Dispatch `work_items` invocations of a kernel: the global size is the
    /// work-item count rounded up to the next multiple of the workgroup size,
    /// and each kernel guards against the overhang.
    pub fn dispatch(
        &self,
        kernel: &Kernel,
        bind_group: &wgpu::BindGroup,
        work_items: u32,
    ) -> Barrier {
        assert!(work_items > 0, "empty dispatch of '{}'", kernel.entry);
        let groups = (work_items + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.entry.as_str()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        Barrier(Some(self.queue.submit(std::iter::once(encoder.finish()))))
    }

    /// Fill `total_bytes` of device memory with a repeating byte pattern, on
    /// the device. The pattern is staged through a grow-only cache buffer and
    /// the upload is skipped when the staged bytes are unchanged.
    ///
    /// `total_bytes` must be a multiple of the pattern length, and both must
    /// be word-aligned (storage buffers are addressed in 32-bit words).
    pub fn fill_pattern(&self, buffer: &Buffer, total_bytes: u64, pattern: &[u8]) -> Barrier {
        assert!(!pattern.is_empty(), "empty fill pattern");
        assert!(
            total_bytes % pattern.len() as u64 == 0,
            "fill size {} is not a multiple of the pattern size {}",
            total_bytes,
            pattern.len()
        );
        assert!(
            pattern.len() % 4 == 0 && total_bytes % 4 == 0,
            "fill pattern must be word-aligned"
        );

        {
            let mut cache = self.fill.borrow_mut();
            if cache.capacity < pattern.len() as u64 {
                cache.staging = Some(self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("fill staging"),
                    size: pattern.len() as u64,
                    usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }));
                cache.capacity = pattern.len() as u64;
                cache.staged.clear();
            }
            if cache.staged != pattern {
                self.queue
                    .write_buffer(cache.staging.as_ref().unwrap(), 0, pattern);
                cache.staged = pattern.to_vec();
            }
        }

        let params = FillParams {
            total_words: (total_bytes / 4) as u32,
            pattern_words: (pattern.len() / 4) as u32,
            _pad0: 0,
            _pad1: 0,
        };
        let params_buffer = self.create_uniform_buffer("fill params", bytemuck::bytes_of(&params));

        let kernel = self.common().fill.clone();
        let cache = self.fill.borrow();
        let bind = self.bind_group(
            "fill",
            &kernel,
            &[cache.staging.as_ref().unwrap(), buffer, &params_buffer],
        );
        drop(cache);
        self.dispatch(&kernel, &bind, params.total_words)
    }

    /// Queue-ordered host-to-device write.
    pub(crate) fn write_buffer(&self, buffer: &Buffer, data: &[f32]) {
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
    }

    /// Flush all staged writes and block until everything submitted so far
    /// has completed. This is an explicit synchronization point; use it
    /// sparingly.
    pub(crate) fn flush_and_wait(&self) -> Barrier {
        let index = self
            .queue
            .submit(std::iter::empty::<wgpu::CommandBuffer>());
        self.device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(index.clone()));
        Barrier(Some(index))
    }

    /// Synchronous device-to-host readback of `count` f32 values starting at
    /// element `offset`.
    pub fn read_buffer(&self, buffer: &Buffer, offset: usize, count: usize) -> Vec<f32> {
        let bytes = (count * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: bytes,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(
            buffer,
            (offset * std::mem::size_of::<f32>()) as u64,
            &staging,
            0,
            bytes,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).unwrap();
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv().unwrap().expect("readback mapping failed");

        let data = slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        result
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("adapter", &self.adapter_info())
            .finish()
    }
}

fn assemble_source(options: &[String], fragments: &[String]) -> String {
    let mut source = String::new();
    for line in options {
        source.push_str(line);
        source.push('\n');
    }
    for fragment in fragments {
        source.push_str(fragment);
        source.push('\n');
    }
    source
}

#[cfg(test)]
mod tests {
    use super::assemble_source;

    #[test]
    fn options_precede_fragments() {
        let source = assemble_source(
            &["const SIZE: u32 = 4u;".into()],
            &["fn activation(x: f32) -> f32 { return x; }".into()],
        );
        let const_pos = source.find("const SIZE").unwrap();
        let fn_pos = source.find("fn activation").unwrap();
        assert!(const_pos < fn_pos);
    }

    #[test]
    fn empty_builder_assembles_empty_source() {
        assert!(assemble_source(&[], &[]).is_empty());
    }
}
