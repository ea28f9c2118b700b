//! OpenCL device discovery.

use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use opencl3::device::{
    CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
    Device as ClDevice, get_device_ids,
};
use opencl3::platform::get_platforms;
use opencl3::types::{cl_device_id, cl_device_type};

use crate::error::{ClError, Result, Status};

/// Device class filter used during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    Cpu,
    #[default]
    Gpu,
    Accelerator,
    /// Any device class.
    All,
}

impl DeviceType {
    /// Returns the native device type bitfield.
    pub fn to_cl(self) -> cl_device_type {
        match self {
            DeviceType::Cpu => CL_DEVICE_TYPE_CPU,
            DeviceType::Gpu => CL_DEVICE_TYPE_GPU,
            DeviceType::Accelerator => CL_DEVICE_TYPE_ACCELERATOR,
            DeviceType::All => CL_DEVICE_TYPE_ALL,
        }
    }

    /// Classifies a native device type bitfield.
    pub fn from_cl(bits: cl_device_type) -> DeviceType {
        if bits & CL_DEVICE_TYPE_GPU != 0 {
            DeviceType::Gpu
        } else if bits & CL_DEVICE_TYPE_CPU != 0 {
            DeviceType::Cpu
        } else if bits & CL_DEVICE_TYPE_ACCELERATOR != 0 {
            DeviceType::Accelerator
        } else {
            DeviceType::All
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::Accelerator => "accelerator",
            DeviceType::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for DeviceType {
    type Err = ClError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            "accelerator" | "acc" => Ok(DeviceType::Accelerator),
            "all" | "any" => Ok(DeviceType::All),
            other => Err(ClError::invalid_argument(format!(
                "unknown device type '{}'",
                other
            ))),
        }
    }
}

/// Which of the discovered devices a context should span.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    /// Every discovered device of the primary device's platform.
    #[default]
    All,
    /// Indices into the merged device list; the first one is the primary device.
    Indices(Vec<usize>),
}

impl DeviceSelection {
    /// Applies the selection to a discovered device list.
    pub fn apply(&self, devices: &[Device]) -> Result<Vec<Device>> {
        let selected: Vec<Device> = match self {
            DeviceSelection::All => {
                let Some(primary) = devices.first() else {
                    return Ok(Vec::new());
                };
                let (same, other): (Vec<&Device>, Vec<&Device>) = devices
                    .iter()
                    .partition(|d| d.platform_index == primary.platform_index);
                if !other.is_empty() {
                    warn!(
                        "Skipping {} device(s) outside platform {}: one context cannot span platforms",
                        other.len(),
                        primary.platform_name
                    );
                }
                same.into_iter().cloned().collect()
            }
            DeviceSelection::Indices(indices) => {
                let mut selected = Vec::with_capacity(indices.len());
                for &index in indices {
                    let device = devices.get(index).ok_or_else(|| {
                        ClError::invalid_argument(format!(
                            "device index {} out of range (found {} devices)",
                            index,
                            devices.len()
                        ))
                    })?;
                    if !selected.iter().any(|d: &Device| d.index == index) {
                        selected.push(device.clone());
                    }
                }
                selected
            }
        };
        Ok(selected)
    }
}

/// Capability snapshot of one device, queried once at discovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub vendor: String,
    pub name: String,
    pub driver_version: String,
    pub device_version: String,
    pub profile: String,
    pub device_type: Option<DeviceType>,
    pub max_compute_units: u32,
    pub max_work_item_dimensions: u32,
    pub max_work_item_sizes: Vec<usize>,
    pub max_work_group_size: usize,
    pub max_clock_frequency: u32,
    pub max_mem_alloc_size: u64,
    pub image_support: bool,
    pub max_read_image_args: u32,
    pub max_write_image_args: u32,
    pub image2d_max_width: usize,
    pub image2d_max_height: usize,
    pub image3d_max_width: usize,
    pub image3d_max_height: usize,
    pub image3d_max_depth: usize,
    pub max_samplers: u32,
    pub max_parameter_size: usize,
    pub global_mem_cache_size: u64,
    pub global_mem_size: u64,
    pub max_constant_buffer_size: u64,
    pub max_constant_args: u32,
    pub local_mem_size: u64,
    pub error_correction_support: bool,
    pub profiling_timer_resolution: usize,
    pub endian_little: bool,
    pub extensions: Vec<String>,
}

impl DeviceInfo {
    /// Queries every capability of a native device.
    ///
    /// A failing query leaves the field at its default and is logged; it never
    /// fails discovery.
    pub fn query(device: &ClDevice) -> Self {
        fn get<T: Default>(what: &str, r: opencl3::Result<T>) -> T {
            r.unwrap_or_else(|e| {
                debug!("Device query {} failed: {}", what, Status::from(e));
                T::default()
            })
        }

        DeviceInfo {
            vendor: get("vendor", device.vendor()),
            name: get("name", device.name()),
            driver_version: get("driver version", device.driver_version()),
            device_version: get("device version", device.version()),
            profile: get("profile", device.profile()),
            device_type: device.dev_type().ok().map(DeviceType::from_cl),
            max_compute_units: get("compute units", device.max_compute_units()),
            max_work_item_dimensions: get("work item dims", device.max_work_item_dimensions()),
            max_work_item_sizes: get("work item sizes", device.max_work_item_sizes()),
            max_work_group_size: get("work group size", device.max_work_group_size()),
            max_clock_frequency: get("clock frequency", device.max_clock_frequency()),
            max_mem_alloc_size: get("max mem alloc", device.max_mem_alloc_size()),
            image_support: get("image support", device.image_support()),
            max_read_image_args: get("read image args", device.max_read_image_args()),
            max_write_image_args: get("write image args", device.max_write_image_args()),
            image2d_max_width: get("image2d width", device.image2d_max_width()),
            image2d_max_height: get("image2d height", device.image2d_max_height()),
            image3d_max_width: get("image3d width", device.image3d_max_width()),
            image3d_max_height: get("image3d height", device.image3d_max_height()),
            image3d_max_depth: get("image3d depth", device.image3d_max_depth()),
            // CL_DEVICE_MAX_SAMPLERS
            max_samplers: get("samplers", device.max_device_samples()),
            max_parameter_size: get("parameter size", device.max_parameter_size()),
            global_mem_cache_size: get("cache size", device.global_mem_cache_size()),
            global_mem_size: get("global mem", device.global_mem_size()),
            max_constant_buffer_size: get("constant buffer", device.max_constant_buffer_size()),
            max_constant_args: get("constant args", device.max_constant_args()),
            local_mem_size: get("local mem", device.local_mem_size()),
            error_correction_support: get("ecc", device.error_correction_support()),
            profiling_timer_resolution: get("timer resolution", device.profiling_timer_resolution()),
            endian_little: get("endianness", device.endian_little()),
            extensions: parse_extensions(&get("extensions", device.extensions())),
        }
    }

    /// Returns true if the device advertises an extension.
    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }

    /// Returns true if the device can share objects with OpenGL.
    pub fn supports_gl_sharing(&self) -> bool {
        self.has_extension("cl_khr_gl_sharing") || self.has_extension("cl_APPLE_gl_sharing")
    }
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |b: bool| if b { "YES" } else { "NO" };
        writeln!(f, "Vendor: {}", self.vendor)?;
        writeln!(f, "Device name: {}", self.name)?;
        writeln!(f, "Driver version: {}", self.driver_version)?;
        writeln!(f, "Device version: {}", self.device_version)?;
        writeln!(f, "Profile: {}", self.profile)?;
        if let Some(device_type) = self.device_type {
            writeln!(f, "Device type: {}", device_type)?;
        }
        writeln!(f, "Max compute units: {}", self.max_compute_units)?;
        writeln!(f, "Max work item dimensions: {}", self.max_work_item_dimensions)?;
        writeln!(f, "Max work item sizes: {:?}", self.max_work_item_sizes)?;
        writeln!(f, "Max work group size: {}", self.max_work_group_size)?;
        writeln!(f, "Max clock frequency: {} MHz", self.max_clock_frequency)?;
        writeln!(f, "Max memory allocation: {} MB", self.max_mem_alloc_size / (1024 * 1024))?;
        writeln!(f, "Image support: {}", yes_no(self.image_support))?;
        writeln!(f, "Max read image args: {}", self.max_read_image_args)?;
        writeln!(f, "Max write image args: {}", self.max_write_image_args)?;
        writeln!(
            f,
            "Max image 2D size: {}x{}",
            self.image2d_max_width, self.image2d_max_height
        )?;
        writeln!(
            f,
            "Max image 3D size: {}x{}x{}",
            self.image3d_max_width, self.image3d_max_height, self.image3d_max_depth
        )?;
        writeln!(f, "Max samplers: {}", self.max_samplers)?;
        writeln!(f, "Max parameter size: {}", self.max_parameter_size)?;
        writeln!(f, "Global memory cache size: {} KB", self.global_mem_cache_size / 1024)?;
        writeln!(f, "Global memory size: {} MB", self.global_mem_size / (1024 * 1024))?;
        writeln!(f, "Max constant buffer size: {} KB", self.max_constant_buffer_size / 1024)?;
        writeln!(f, "Max constant args: {}", self.max_constant_args)?;
        writeln!(f, "Local memory size: {} KB", self.local_mem_size / 1024)?;
        writeln!(f, "Error correction support: {}", yes_no(self.error_correction_support))?;
        writeln!(f, "Profiling timer resolution: {} ns", self.profiling_timer_resolution)?;
        writeln!(f, "Little endian: {}", yes_no(self.endian_little))?;
        write!(f, "Extensions: {}", self.extensions.join(" "))
    }
}

/// One discovered device.
#[derive(Clone)]
pub struct Device {
    native: ClDevice,
    index: usize,
    platform_index: usize,
    platform_name: String,
    info: DeviceInfo,
}

impl Device {
    fn new(id: cl_device_id, index: usize, platform_index: usize, platform_name: String) -> Self {
        let native = ClDevice::new(id);
        let info = DeviceInfo::query(&native);
        Device {
            native,
            index,
            platform_index,
            platform_name,
            info,
        }
    }

    /// Position in the merged device list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Returns the native device id.
    pub fn id(&self) -> cl_device_id {
        self.native.id()
    }

    /// Returns the underlying OpenCL device.
    pub fn cl_device(&self) -> &ClDevice {
        &self.native
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("name", &self.info.name)
            .field("platform", &self.platform_name)
            .finish()
    }
}

// Device ids are immutable platform-owned handles
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

/// Enumerates the devices of every platform matching a device class.
///
/// Platforms without matching devices are skipped. When no platform can be
/// listed, discovery falls back to the implementation's default platform.
/// Fails with `NoDeviceFound` when the merged list is empty.
pub fn enumerate(device_type: DeviceType) -> Result<Vec<Device>> {
    let platforms = match get_platforms() {
        Ok(platforms) if !platforms.is_empty() => platforms,
        Ok(_) => {
            warn!("No OpenCL platforms listed, trying the default platform");
            return default_platform_devices(device_type);
        }
        Err(e) => {
            warn!(
                "Failed to get OpenCL platforms: {}, trying the default platform",
                Status::from(e)
            );
            return default_platform_devices(device_type);
        }
    };

    let mut devices = Vec::new();
    for (platform_index, platform) in platforms.iter().enumerate() {
        let platform_name = platform.name().unwrap_or_else(|_| "Unknown".into());
        let ids = match platform.get_devices(device_type.to_cl()) {
            Ok(ids) => ids,
            Err(e) => {
                debug!(
                    "Platform {} has no {} devices: {}",
                    platform_name,
                    device_type,
                    Status::from(e)
                );
                continue;
            }
        };
        for id in ids {
            let index = devices.len();
            devices.push(Device::new(id, index, platform_index, platform_name.clone()));
        }
    }

    if devices.is_empty() {
        return Err(ClError::NoDeviceFound(device_type.to_string()));
    }

    debug!("Found {} {} device(s)", devices.len(), device_type);
    Ok(devices)
}

/// Devices of the platform an implementation picks for a null platform id.
fn default_platform_devices(device_type: DeviceType) -> Result<Vec<Device>> {
    let ids = get_device_ids(std::ptr::null_mut(), device_type.to_cl()).map_err(|e| {
        debug!("Default platform has no {} devices: {}", device_type, Status(e));
        ClError::NoDeviceFound(device_type.to_string())
    })?;
    if ids.is_empty() {
        return Err(ClError::NoDeviceFound(device_type.to_string()));
    }

    let devices: Vec<Device> = ids
        .into_iter()
        .enumerate()
        .map(|(index, id)| Device::new(id, index, 0, "Default".into()))
        .collect();
    debug!("Found {} {} device(s) on the default platform", devices.len(), device_type);
    Ok(devices)
}
