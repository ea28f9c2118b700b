//! The compute context: device setup, object factories and registries.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use opencl3::context::Context;
use opencl3::types::{cl_context_properties, cl_device_id, cl_int};

use crate::config::ComputeConfig;
use crate::error::{self, ClError, Result, Status};
use crate::global;
use crate::interop::{GlBuffer, GlTexture, TextureAllocator};
use crate::registry::{KernelId, MemId, ProgramId, Registry};

use super::buffer::Buffer;
use super::cache::ProgramCache;
use super::device::{self, Device, DeviceInfo, DeviceSelection, DeviceType};
use super::event::Event;
use super::image::{Image, ImageDims, ImageFormat};
use super::kernel::Kernel;
use super::ledger::ReleaseLedger;
use super::memory::{MemFlags, MemoryObject};
use super::program::Program;
use super::queue::Queue;

const CL_INVALID_DEVICE: cl_int = -33;

/// Native context state shared by every object created through it.
///
/// Programs, kernels and memory objects each hold a clone of the queue they
/// were bound to, and programs hold the context itself, so the native context
/// outlives everything created from it.
pub struct SharedContext {
    default_queue: Queue,
    context: Context,
    devices: Vec<Device>,
    include_root: PathBuf,
    build_options: Option<String>,
    release_lock: bool,
    ledger: Arc<ReleaseLedger>,
}

impl SharedContext {
    fn create(
        devices: Vec<Device>,
        properties: &[cl_context_properties],
        config: &ComputeConfig,
        ledger: Arc<ReleaseLedger>,
    ) -> Result<Self> {
        let ids: Vec<cl_device_id> = devices.iter().map(Device::id).collect();
        let context = Context::from_devices(&ids, properties, None, ptr::null_mut()).map_err(|e| {
            let status = Status::from(e);
            error!("Error creating OpenCL context: {}", status);
            ClError::ContextCreationFailed(status)
        })?;

        let primary = devices
            .first()
            .ok_or_else(|| ClError::NoDeviceFound("empty device selection".into()))?;
        let default_queue = Queue::create(&context, primary)?;

        Ok(SharedContext {
            default_queue,
            context,
            devices,
            include_root: config.include_root.clone(),
            build_options: config.build_options.clone(),
            release_lock: config.release_lock,
            ledger,
        })
    }

    /// Returns the underlying OpenCL context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Devices the context spans; the first one is the primary device.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn primary_device(&self) -> &Device {
        &self.devices[0]
    }

    pub(crate) fn device_ids(&self) -> Vec<cl_device_id> {
        self.devices.iter().map(Device::id).collect()
    }

    /// Queue bound to the primary device.
    pub fn default_queue(&self) -> &Queue {
        &self.default_queue
    }

    /// Creates a new queue on the device at `device` in [`devices`](Self::devices).
    pub fn create_queue(&self, device: usize) -> Result<Queue> {
        let Some(target) = self.devices.get(device) else {
            error!(
                "Error creating command queue: device {} out of range ({} devices)",
                device,
                self.devices.len()
            );
            return Err(ClError::QueueCreationFailed {
                device,
                status: Status(CL_INVALID_DEVICE),
            });
        };
        Queue::create(&self.context, target)
    }

    /// Largest single allocation the primary device accepts.
    pub fn max_mem_alloc_size(&self) -> u64 {
        self.primary_device().info().max_mem_alloc_size
    }

    pub fn include_root(&self) -> &Path {
        &self.include_root
    }

    pub fn build_options(&self) -> Option<&str> {
        self.build_options.as_deref()
    }

    /// Whether memory release is serialised process-wide.
    pub fn release_lock(&self) -> bool {
        self.release_lock
    }

    pub fn ledger(&self) -> &Arc<ReleaseLedger> {
        &self.ledger
    }
}

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext")
            .field("devices", &self.devices)
            .field("default_queue", &self.default_queue)
            .finish()
    }
}

// OpenCL handles thread safety internally
unsafe impl Send for SharedContext {}
unsafe impl Sync for SharedContext {}

/// Owner of one OpenCL context and of everything created through it.
///
/// Programs, kernels and memory objects live in per-kind registries and are
/// addressed by typed ids. Each registry has its own lock, so creating a
/// buffer never waits on a kernel creation. Dropping the context finishes
/// every queue and releases all remaining objects, memory first, then
/// kernels, then programs.
pub struct ComputeContext {
    config: ComputeConfig,
    ledger: Arc<ReleaseLedger>,
    memory: Registry<dyn MemoryObject>,
    kernels: Registry<Kernel>,
    programs: Registry<Program>,
    program_cache: ProgramCache,
    queues: RwLock<Vec<Queue>>,
    shared: Option<Arc<SharedContext>>,
}

impl ComputeContext {
    pub fn new(config: ComputeConfig) -> Self {
        ComputeContext {
            config,
            ledger: Arc::new(ReleaseLedger::new()),
            memory: Registry::new(),
            kernels: Registry::new(),
            programs: Registry::new(),
            program_cache: ProgramCache::new(),
            queues: RwLock::new(Vec::new()),
            shared: None,
        }
    }

    /// Creates a context configured from `CLHOST_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(ComputeConfig::from_env())
    }

    /// Enumerates devices without creating a context.
    pub fn list_devices(device_type: DeviceType) -> Result<Vec<Device>> {
        device::enumerate(device_type)
    }

    /// Sets up a context on every device of `device_type`.
    ///
    /// Calling it again once set up does nothing and succeeds.
    pub fn setup(&mut self, device_type: DeviceType) -> Result<()> {
        self.setup_with(device_type, &DeviceSelection::All)
    }

    /// Sets up a context with the device class from the configuration.
    pub fn setup_default(&mut self) -> Result<()> {
        let device_type = self.config.device_type;
        self.setup(device_type)
    }

    /// Sets up a context on a subset of the devices of `device_type`.
    pub fn setup_with(&mut self, device_type: DeviceType, selection: &DeviceSelection) -> Result<()> {
        self.setup_with_properties(device_type, selection, &[])
    }

    /// Sets up a context with native context properties, such as the
    /// graphics share group needed for interop. `properties` must be empty or
    /// zero terminated.
    pub fn setup_with_properties(
        &mut self,
        device_type: DeviceType,
        selection: &DeviceSelection,
        properties: &[cl_context_properties],
    ) -> Result<()> {
        debug!("Setup compute context ({})", device_type);
        if self.shared.is_some() {
            debug!("... already set up, returning");
            return Ok(());
        }

        let devices = selection.apply(&device::enumerate(device_type)?)?;
        if devices.is_empty() {
            return Err(ClError::NoDeviceFound(device_type.to_string()));
        }
        for device in &devices {
            info!("Using device {}: {} ({})", device.index(), device.name(), device.platform_name());
            debug!("{}", device.info());
        }

        let shared = Arc::new(SharedContext::create(
            devices,
            properties,
            &self.config,
            self.ledger.clone(),
        )?);
        if self.config.set_current {
            global::set_current(&shared);
        }
        self.shared = Some(shared);
        Ok(())
    }

    pub fn is_initialised(&self) -> bool {
        self.shared.is_some()
    }

    /// Native state shared with created objects, `None` before setup.
    pub fn shared(&self) -> Option<&Arc<SharedContext>> {
        self.shared.as_ref()
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    fn require(&self) -> Result<&Arc<SharedContext>> {
        self.shared.as_ref().ok_or_else(|| {
            error!("Compute context used before setup");
            ClError::NotInitialised
        })
    }

    pub fn devices(&self) -> &[Device] {
        self.shared.as_ref().map_or(&[], |s| s.devices())
    }

    /// Capabilities of the primary device.
    pub fn device_info(&self) -> Result<&DeviceInfo> {
        Ok(self.require()?.primary_device().info())
    }

    /// Human readable report of every device in the context.
    pub fn device_report(&self) -> Result<String> {
        let shared = self.require()?;
        Ok(shared
            .devices()
            .iter()
            .map(|d| format!("Device {}:\n{}", d.index(), d.info()))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Message for a native status code. Total over `cl_int`.
    pub fn error_as_str(code: cl_int) -> &'static str {
        error::error_as_str(code)
    }

    pub fn default_queue(&self) -> Result<&Queue> {
        Ok(self.require()?.default_queue())
    }

    /// Creates an independent queue on the device at `device` of this
    /// context.
    ///
    /// The context keeps the queue until teardown or until a later call finds
    /// that no caller, kernel or memory object still holds it. Such queues are
    /// finished and released then.
    pub fn create_additional_queue(&self, device: usize) -> Result<Queue> {
        let queue = self.require()?.create_queue(device)?;
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        queues.retain(|q| {
            if !q.is_unshared() {
                return true;
            }
            if let Err(e) = q.finish() {
                warn!("Error finishing released queue {}: {}", q.id(), e);
            }
            debug!("Releasing unused queue {}", q.id());
            false
        });
        queues.push(queue.clone());
        Ok(queue)
    }

    /// Number of additional queues the context still keeps.
    pub fn num_additional_queues(&self) -> usize {
        self.queues.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Submits the default queue's commands without waiting.
    pub fn flush(&self) -> Result<()> {
        self.default_queue()?.flush()
    }

    /// Blocks until the default queue has drained.
    pub fn finish(&self) -> Result<()> {
        self.default_queue()?.finish()
    }

    /// Blocks until the default queue and every additional queue have drained.
    pub fn finish_all(&self) -> Result<()> {
        self.finish()?;
        for queue in self.queues.read().unwrap_or_else(|e| e.into_inner()).iter() {
            queue.finish()?;
        }
        Ok(())
    }

    /// Builds `source` and registers the program.
    pub fn load_program_from_source(&self, source: &str) -> Result<ProgramId> {
        self.load_program_from_source_with(source, None, None)
    }

    /// Builds `source` with a label and extra compiler flags.
    ///
    /// A failed build is still registered; its id comes back inside
    /// [`ClError::BuildFailed`].
    pub fn load_program_from_source_with(
        &self,
        source: &str,
        label: Option<&str>,
        options: Option<&str>,
    ) -> Result<ProgramId> {
        let shared = self.require()?;
        debug!("Load program from source {}", label.unwrap_or_default());

        let full_options = Program::options_for(shared, options);
        let cached = self
            .config
            .program_cache
            .then(|| self.program_cache.get(source, &full_options))
            .flatten();
        let program = match cached {
            Some(compiled) => Program::from_compiled(shared, compiled, label, full_options),
            None => {
                let program = Program::from_source(shared, source, label, options);
                if self.config.program_cache && program.is_built() {
                    if let Some(compiled) = program.compiled() {
                        self.program_cache.insert(source, program.options(), compiled.clone());
                    }
                }
                program
            }
        };
        self.register_program(program)
    }

    /// Reads and builds the program at `path`. Binary programs are not
    /// supported.
    pub fn load_program_from_file(
        &self,
        path: impl AsRef<Path>,
        is_binary: bool,
        options: Option<&str>,
    ) -> Result<ProgramId> {
        let shared = self.require()?;
        debug!("Load program from file {}", path.as_ref().display());
        let program = Program::from_file(shared, path, is_binary, options)?;
        self.register_program(program)
    }

    fn register_program(&self, program: Program) -> Result<ProgramId> {
        let failure = program.build_error();
        let id = self.programs.insert(Arc::new(program));
        match failure {
            Some(ClError::BuildFailed {
                label, status, log, ..
            }) => Err(ClError::BuildFailed {
                label,
                program: Some(id),
                status,
                log,
            }),
            Some(other) => Err(other),
            None => Ok(id),
        }
    }

    pub fn program(&self, id: ProgramId) -> Option<Arc<Program>> {
        self.programs.get(id)
    }

    /// Removes a program. Kernels created from it keep the native program
    /// alive until they are deleted.
    pub fn delete_program(&self, id: ProgramId) -> bool {
        let removed = self.programs.remove(id).is_some();
        debug_assert!(removed, "program {} is not registered", id.index());
        removed
    }

    /// Drops every cached build. Programs already loaded are unaffected.
    pub fn clear_program_cache(&self) {
        self.program_cache.clear();
    }

    /// Number of cached builds and cache hits so far.
    pub fn program_cache_stats(&self) -> (usize, usize) {
        (self.program_cache.len(), self.program_cache.hits())
    }

    /// Creates kernel `name` from a registered program, bound to `queue` or
    /// to the default queue.
    pub fn load_kernel(&self, name: &str, program: ProgramId, queue: Option<&Queue>) -> Result<KernelId> {
        let shared = self.require()?;
        let entry = self.programs.get(program).ok_or_else(|| {
            ClError::invalid_argument(format!("program {} is not registered", program.index()))
        })?;
        debug!("Load kernel {} from {}", name, entry.label());

        let queue = queue.unwrap_or_else(|| shared.default_queue());
        let kernel = entry.load_kernel(name, queue)?;
        Ok(self.kernels.insert(Arc::new(kernel)))
    }

    pub fn kernel(&self, id: KernelId) -> Option<Arc<Kernel>> {
        self.kernels.get(id)
    }

    /// Removes and releases a kernel, once no caller holds it any more.
    ///
    /// Deleting an id that is not registered is a caller bug.
    pub fn delete_kernel(&self, id: KernelId) -> bool {
        debug!("Delete kernel {}", id.index());
        let removed = self.kernels.remove(id).is_some();
        debug_assert!(removed, "kernel {} is not registered", id.index());
        removed
    }

    /// Allocates a buffer of `size` bytes, optionally uploading
    /// `initial_data` to its start.
    pub fn create_buffer(
        &self,
        size: usize,
        flags: MemFlags,
        initial_data: Option<&[u8]>,
        blocking: bool,
        queue: Option<&Queue>,
    ) -> Result<MemId> {
        let shared = self.require()?;
        debug!("Create buffer of {} bytes; blocking: {}", size, blocking);
        let buffer = Buffer::create(shared, size, flags)?;
        if let Some(data) = initial_data {
            buffer.write(data, 0, blocking, queue)?;
        }
        Ok(self.register_memory(Arc::new(buffer)))
    }

    /// Wraps a graphics buffer without copying.
    pub fn create_buffer_from_gl(&self, gl: GlBuffer, flags: MemFlags) -> Result<MemId> {
        let shared = self.require()?;
        debug!("Create buffer from GL buffer {}", gl.id);
        let buffer = Buffer::from_gl(shared, gl, flags)?;
        Ok(self.register_memory(Arc::new(buffer)))
    }

    /// Allocates a 2D image, optionally uploading a tightly packed
    /// `initial_data`.
    pub fn create_image_2d(
        &self,
        width: usize,
        height: usize,
        format: ImageFormat,
        flags: MemFlags,
        initial_data: Option<&[u8]>,
        blocking: bool,
    ) -> Result<MemId> {
        self.create_image_3d(width, height, 1, format, flags, initial_data, blocking)
    }

    /// Allocates a 3D image; a depth of 1 gives a 2D image.
    #[allow(clippy::too_many_arguments)]
    pub fn create_image_3d(
        &self,
        width: usize,
        height: usize,
        depth: usize,
        format: ImageFormat,
        flags: MemFlags,
        initial_data: Option<&[u8]>,
        blocking: bool,
    ) -> Result<MemId> {
        let shared = self.require()?;
        debug!("Create image {}x{}x{} ({})", width, height, depth, format);
        let dims = if depth == 1 {
            ImageDims::new_2d(width, height)
        } else {
            ImageDims::new_3d(width, height, depth)
        };
        let image = Image::create(shared, dims, format, flags)?;
        if let Some(data) = initial_data {
            image.write_all(data, blocking, None)?;
        }
        Ok(self.register_memory(Arc::new(image)))
    }

    /// Wraps mip level `mip_level` of an existing texture.
    pub fn create_image_from_texture(
        &self,
        texture: GlTexture,
        flags: MemFlags,
        mip_level: u32,
    ) -> Result<MemId> {
        let shared = self.require()?;
        debug!("Create image from texture {}", texture.id);
        let image = Image::from_texture(shared, texture, flags, mip_level)?;
        Ok(self.register_memory(Arc::new(image)))
    }

    /// Allocates a texture through `allocator` and an image sharing it.
    pub fn create_image_with_texture(
        &self,
        width: usize,
        height: usize,
        format: ImageFormat,
        flags: MemFlags,
        allocator: &mut dyn TextureAllocator,
    ) -> Result<MemId> {
        let shared = self.require()?;
        debug!("Create image with texture {}x{} ({})", width, height, format);
        let image = Image::with_texture(shared, width, height, format, flags, allocator)?;
        Ok(self.register_memory(Arc::new(image)))
    }

    fn register_memory(&self, object: Arc<dyn MemoryObject>) -> MemId {
        self.memory.insert(object)
    }

    pub fn memory_object(&self, id: MemId) -> Option<Arc<dyn MemoryObject>> {
        self.memory.get(id)
    }

    /// The buffer registered under `id`, `None` if absent or an image.
    pub fn buffer(&self, id: MemId) -> Option<Arc<Buffer>> {
        self.memory.get(id)?.into_any().downcast::<Buffer>().ok()
    }

    /// The image registered under `id`, `None` if absent or a buffer.
    pub fn image(&self, id: MemId) -> Option<Arc<Image>> {
        self.memory.get(id)?.into_any().downcast::<Image>().ok()
    }

    /// Removes and releases a buffer or image, once no caller holds it any
    /// more.
    ///
    /// Deleting an id that is not registered is a caller bug.
    pub fn delete_buffer(&self, id: MemId) -> bool {
        debug!("Delete memory object {}", id.index());
        let removed = self.memory.remove(id).is_some();
        debug_assert!(removed, "memory object {} is not registered", id.index());
        removed
    }

    /// Alias of [`delete_buffer`](Self::delete_buffer) for images.
    pub fn delete_memory_object(&self, id: MemId) -> bool {
        self.delete_buffer(id)
    }

    /// Hands graphics-shared objects to the compute device, waiting until
    /// the acquire completes.
    pub fn acquire_gl_objects(&self, ids: &[MemId], queue: Option<&Queue>) -> Result<()> {
        self.gl_objects(ids, queue, true)
    }

    /// Hands graphics-shared objects back to the graphics API, waiting until
    /// the release completes.
    pub fn release_gl_objects(&self, ids: &[MemId], queue: Option<&Queue>) -> Result<()> {
        self.gl_objects(ids, queue, false)
    }

    fn gl_objects(&self, ids: &[MemId], queue: Option<&Queue>, acquire: bool) -> Result<()> {
        let shared = self.require()?;
        let what = if acquire { "acquire" } else { "release" };
        if ids.is_empty() {
            return Ok(());
        }

        let objects = ids
            .iter()
            .map(|&id| {
                self.memory
                    .get(id)
                    .filter(|object| object.is_gl_shared())
                    .ok_or_else(|| ClError::InteropFailed {
                        what: format!("{} of memory object {}: not a shared object", what, id.index()),
                        status: None,
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let mems = objects
            .iter()
            .map(|object| {
                object
                    .raw_mem()
                    .map(|mem| mem as *const c_void)
                    .ok_or_else(|| ClError::invalid_argument(format!("{} of a released memory object", what)))
            })
            .collect::<Result<Vec<_>>>()?;

        let queue = queue.unwrap_or_else(|| shared.default_queue());
        let event = unsafe {
            if acquire {
                queue.cl_queue().enqueue_acquire_gl_objects(&mems, &[])
            } else {
                queue.cl_queue().enqueue_release_gl_objects(&mems, &[])
            }
        }
        .map_err(|e| {
            let status = Status::from(e);
            error!("Error during GL {} of {} objects: {}", what, mems.len(), status);
            ClError::InteropFailed {
                what: format!("GL {} of {} objects", what, mems.len()),
                status: Some(status),
            }
        })?;
        Event::new(event).wait()
    }

    pub fn num_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn num_kernels(&self) -> usize {
        self.kernels.len()
    }

    pub fn num_memory_objects(&self) -> usize {
        self.memory.len()
    }

    /// Creation and release counts of every native object of this context.
    pub fn ledger(&self) -> &Arc<ReleaseLedger> {
        &self.ledger
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new(ComputeConfig::default())
    }
}

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("initialised", &self.is_initialised())
            .field("programs", &self.programs.len())
            .field("kernels", &self.kernels.len())
            .field("memory_objects", &self.memory.len())
            .finish()
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        debug!("Teardown compute context");

        let queues = std::mem::take(self.queues.get_mut().unwrap_or_else(|e| e.into_inner()));
        for queue in std::iter::once(shared.default_queue()).chain(&queues) {
            if let Err(e) = queue.finish() {
                warn!("Error finishing queue {} during teardown: {}", queue.id(), e);
            }
        }

        drop(self.memory.drain());
        drop(self.kernels.drain());
        drop(self.programs.drain());
        self.program_cache.clear();
        drop(queues);

        global::clear_current(&shared);
        drop(shared);
        debug!("Teardown complete: {}", self.ledger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_not_initialised() {
        let context = ComputeContext::default();
        assert!(!context.is_initialised());
        assert!(context.devices().is_empty());

        let err = context.load_program_from_source("kernel void k() {}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialised);
        let err = context
            .create_buffer(16, crate::runtime::opencl::memory::CL_MEM_READ_WRITE, None, true, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialised);
        assert!(context.finish().is_err());
    }

    #[test]
    fn test_teardown_without_setup() {
        let context = ComputeContext::default();
        let ledger = context.ledger().clone();
        drop(context);
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_error_as_str_passthrough() {
        assert_eq!(ComputeContext::error_as_str(0), error::error_as_str(0));
        assert_eq!(ComputeContext::error_as_str(-9999), error::UNHANDLED_ERROR);
    }
}
