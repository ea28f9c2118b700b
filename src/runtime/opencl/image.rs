//! 2D and 3D images, optionally sharing storage with an OpenGL texture.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, warn};
use opencl3::memory::Image as ClImage;
use opencl3::types::{
    CL_BLOCKING, CL_NON_BLOCKING, cl_channel_order, cl_channel_type, cl_image_desc,
    cl_image_format, cl_mem,
};

use crate::error::{ClError, Result, Status};
use crate::interop::{GlTexture, TextureAllocator, gl_format_for_image};

use super::context::SharedContext;
use super::event::{Event, PendingTransfer};
use super::memory::{MemFlags, MemHandle, MemoryKind, MemoryObject, released_error};
use super::queue::Queue;

const CL_MEM_OBJECT_IMAGE2D: u32 = 0x10F1;
const CL_MEM_OBJECT_IMAGE3D: u32 = 0x10F2;

/// Image channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    R,
    A,
    Rg,
    Ra,
    Rgb,
    Rgba,
    Bgra,
    Argb,
    Intensity,
    Luminance,
}

impl ChannelOrder {
    pub fn to_cl(self) -> cl_channel_order {
        match self {
            ChannelOrder::R => 0x10B0,
            ChannelOrder::A => 0x10B1,
            ChannelOrder::Rg => 0x10B2,
            ChannelOrder::Ra => 0x10B3,
            ChannelOrder::Rgb => 0x10B4,
            ChannelOrder::Rgba => 0x10B5,
            ChannelOrder::Bgra => 0x10B6,
            ChannelOrder::Argb => 0x10B7,
            ChannelOrder::Intensity => 0x10B8,
            ChannelOrder::Luminance => 0x10B9,
        }
    }

    pub fn num_channels(self) -> usize {
        match self {
            ChannelOrder::R | ChannelOrder::A | ChannelOrder::Intensity | ChannelOrder::Luminance => 1,
            ChannelOrder::Rg | ChannelOrder::Ra => 2,
            ChannelOrder::Rgb => 3,
            ChannelOrder::Rgba | ChannelOrder::Bgra | ChannelOrder::Argb => 4,
        }
    }
}

/// Image channel data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    SnormInt8,
    SnormInt16,
    UnormInt8,
    UnormInt16,
    UnormShort565,
    UnormShort555,
    UnormInt101010,
    SignedInt8,
    SignedInt16,
    SignedInt32,
    UnsignedInt8,
    UnsignedInt16,
    UnsignedInt32,
    HalfFloat,
    Float,
}

impl ChannelType {
    pub fn to_cl(self) -> cl_channel_type {
        match self {
            ChannelType::SnormInt8 => 0x10D0,
            ChannelType::SnormInt16 => 0x10D1,
            ChannelType::UnormInt8 => 0x10D2,
            ChannelType::UnormInt16 => 0x10D3,
            ChannelType::UnormShort565 => 0x10D4,
            ChannelType::UnormShort555 => 0x10D5,
            ChannelType::UnormInt101010 => 0x10D6,
            ChannelType::SignedInt8 => 0x10D7,
            ChannelType::SignedInt16 => 0x10D8,
            ChannelType::SignedInt32 => 0x10D9,
            ChannelType::UnsignedInt8 => 0x10DA,
            ChannelType::UnsignedInt16 => 0x10DB,
            ChannelType::UnsignedInt32 => 0x10DC,
            ChannelType::HalfFloat => 0x10DD,
            ChannelType::Float => 0x10DE,
        }
    }

    /// Bytes per channel, or `None` for packed types that describe a whole
    /// pixel.
    fn channel_size(self) -> Option<usize> {
        match self {
            ChannelType::SnormInt8 | ChannelType::UnormInt8 => Some(1),
            ChannelType::SignedInt8 | ChannelType::UnsignedInt8 => Some(1),
            ChannelType::SnormInt16 | ChannelType::UnormInt16 => Some(2),
            ChannelType::SignedInt16 | ChannelType::UnsignedInt16 => Some(2),
            ChannelType::HalfFloat => Some(2),
            ChannelType::SignedInt32 | ChannelType::UnsignedInt32 => Some(4),
            ChannelType::Float => Some(4),
            ChannelType::UnormShort565 | ChannelType::UnormShort555 => None,
            ChannelType::UnormInt101010 => None,
        }
    }
}

/// Channel order and data type of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub channel_type: ChannelType,
}

impl ImageFormat {
    pub const fn new(order: ChannelOrder, channel_type: ChannelType) -> Self {
        ImageFormat {
            order,
            channel_type,
        }
    }

    /// Bytes per pixel for this format.
    pub fn bytes_per_pixel(&self) -> usize {
        match self.channel_type {
            ChannelType::UnormShort565 | ChannelType::UnormShort555 => 2,
            ChannelType::UnormInt101010 => 4,
            other => self.order.num_channels() * other.channel_size().unwrap_or(1),
        }
    }

    fn to_cl(self) -> cl_image_format {
        cl_image_format {
            image_channel_order: self.order.to_cl(),
            image_channel_data_type: self.channel_type.to_cl(),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.order, self.channel_type)
    }
}

/// Extent of an image in pixels. `depth == 1` describes a 2D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDims {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl ImageDims {
    pub fn new_2d(width: usize, height: usize) -> Self {
        ImageDims {
            width,
            height,
            depth: 1,
        }
    }

    pub fn new_3d(width: usize, height: usize, depth: usize) -> Self {
        ImageDims {
            width,
            height,
            depth,
        }
    }

    pub fn is_3d(&self) -> bool {
        self.depth > 1
    }

    /// The full image as a transfer region.
    pub fn region(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(ClError::InvalidSize(format!(
                "image dimensions must be positive, got {}x{}x{}",
                self.width, self.height, self.depth
            )));
        }
        Ok(())
    }

    /// Checks the extent against device limits. Zero limits mean the
    /// device did not report them and are not enforced.
    fn validate_limits(&self, shared: &SharedContext) -> Result<()> {
        let info = shared.primary_device().info();
        let limits = if self.is_3d() {
            [info.image3d_max_width, info.image3d_max_height, info.image3d_max_depth]
        } else {
            [info.image2d_max_width, info.image2d_max_height, 1]
        };
        let over = self
            .region()
            .iter()
            .zip(limits)
            .any(|(&size, limit)| limit != 0 && size > limit);
        if over {
            return Err(ClError::InvalidSize(format!(
                "image of {}x{}x{} exceeds device limit {}x{}x{}",
                self.width, self.height, self.depth, limits[0], limits[1], limits[2]
            )));
        }
        Ok(())
    }
}

/// Number of host bytes a transfer of `region` reads or writes.
///
/// A pitch of zero means tightly packed rows or slices.
fn transfer_size(
    region: [usize; 3],
    bytes_per_pixel: usize,
    row_pitch: usize,
    slice_pitch: usize,
) -> Result<usize> {
    if region.contains(&0) {
        return Err(ClError::InvalidSize(format!(
            "empty transfer region {:?}",
            region
        )));
    }
    let [w, h, d] = region;
    let overflow = || {
        ClError::InvalidSize(format!(
            "transfer of {:?} with pitches ({}, {}) overflows",
            region, row_pitch, slice_pitch
        ))
    };
    let row_bytes = w.checked_mul(bytes_per_pixel).ok_or_else(overflow)?;
    let row = if row_pitch == 0 { row_bytes } else { row_pitch };
    if row < row_bytes {
        return Err(ClError::invalid_argument(format!(
            "row pitch {} is smaller than a row of {} bytes",
            row, row_bytes
        )));
    }
    let packed_slice = row.checked_mul(h).ok_or_else(overflow)?;
    let slice = if slice_pitch == 0 { packed_slice } else { slice_pitch };
    if slice < packed_slice {
        return Err(ClError::invalid_argument(format!(
            "slice pitch {} is smaller than a slice of {} bytes",
            slice, packed_slice
        )));
    }
    slice
        .checked_mul(d - 1)
        .and_then(|n| n.checked_add(row.checked_mul(h - 1)?))
        .and_then(|n| n.checked_add(row_bytes))
        .ok_or_else(overflow)
}

/// Dimensions of `mip_level` of `texture` and the level as GL expects it.
fn mip_dims(texture: &GlTexture, mip_level: u32) -> Result<(ImageDims, i32)> {
    let level = i32::try_from(mip_level)
        .ok()
        .filter(|&l| l < usize::BITS as i32)
        .ok_or_else(|| ClError::invalid_argument(format!("mip level {}", mip_level)))?;
    let shrink = |extent: usize| (extent >> mip_level).max(1);
    let dims = ImageDims {
        width: shrink(texture.width),
        height: shrink(texture.height),
        depth: shrink(texture.depth),
    };
    Ok((dims, level))
}

fn check_region(origin: [usize; 3], region: [usize; 3], dims: ImageDims) -> Result<()> {
    let inside = origin
        .iter()
        .zip(region)
        .zip(dims.region())
        .all(|((&o, r), size)| o.checked_add(r).is_some_and(|end| end <= size));
    if !inside {
        return Err(ClError::InvalidSize(format!(
            "region {:?} at {:?} exceeds image of {}x{}x{}",
            region, origin, dims.width, dims.height, dims.depth
        )));
    }
    Ok(())
}

/// A device image.
pub struct Image {
    handle: MemHandle<ClImage>,
    dims: ImageDims,
    format: ImageFormat,
    flags: MemFlags,
    texture: Option<GlTexture>,
    mip_level: u32,
    queue: Queue,
}

impl Image {
    /// Allocates a device image without texture sharing.
    pub fn create(
        shared: &SharedContext,
        dims: ImageDims,
        format: ImageFormat,
        flags: MemFlags,
    ) -> Result<Self> {
        dims.validate()?;
        dims.validate_limits(shared)?;
        if !shared.primary_device().info().image_support {
            warn!(
                "Device {} reports no image support",
                shared.primary_device().name()
            );
        }

        let cl_format = format.to_cl();
        // Zeroed: pitches, array size, mip levels, samples and the buffer
        // handle all default to 0/null.
        let mut desc: cl_image_desc = unsafe { std::mem::zeroed() };
        desc.image_type = if dims.is_3d() {
            CL_MEM_OBJECT_IMAGE3D
        } else {
            CL_MEM_OBJECT_IMAGE2D
        };
        desc.image_width = dims.width;
        desc.image_height = dims.height;
        desc.image_depth = dims.depth;

        let native = unsafe {
            ClImage::create(
                shared.context(),
                flags,
                &cl_format,
                &desc,
                std::ptr::null_mut(),
            )
        }
        .map_err(|e| {
            let status = Status::from(e);
            error!(
                "Error creating image {}x{}x{} ({}): {}",
                dims.width, dims.height, dims.depth, format, status
            );
            ClError::from_status("create image", status)
        })?;

        debug!(
            "Created image {}x{}x{} ({})",
            dims.width, dims.height, dims.depth, format
        );
        Ok(Image {
            handle: MemHandle::new(native, shared.release_lock(), shared.ledger().clone()),
            dims,
            format,
            flags,
            texture: None,
            mip_level: 0,
            queue: shared.default_queue().clone(),
        })
    }

    /// Wraps one mip level of an existing OpenGL texture without copying.
    pub fn from_texture(
        shared: &SharedContext,
        texture: GlTexture,
        flags: MemFlags,
        mip_level: u32,
    ) -> Result<Self> {
        let format = texture.image_format().ok_or_else(|| ClError::InteropFailed {
            what: format!(
                "texture {} with unsupported internal format 0x{:X}",
                texture.id, texture.internal_format
            ),
            status: None,
        })?;
        let (dims, level) = mip_dims(&texture, mip_level)?;

        let native = unsafe {
            ClImage::create_from_gl_texture(
                shared.context(),
                flags,
                texture.target,
                level,
                texture.id,
            )
        }
        .map_err(|e| {
            let status = Status::from(e);
            error!(
                "Error creating image from texture {} (mip {}): {}",
                texture.id, mip_level, status
            );
            ClError::InteropFailed {
                what: format!("texture {}", texture.id),
                status: Some(status),
            }
        })?;

        debug!(
            "Created image from texture {} (mip {}, {}x{}x{})",
            texture.id, mip_level, dims.width, dims.height, dims.depth
        );
        Ok(Image {
            handle: MemHandle::new(native, shared.release_lock(), shared.ledger().clone()),
            dims,
            format,
            flags,
            texture: Some(texture),
            mip_level,
            queue: shared.default_queue().clone(),
        })
    }

    /// Allocates a texture through `allocator` and an image sharing it.
    pub fn with_texture(
        shared: &SharedContext,
        width: usize,
        height: usize,
        format: ImageFormat,
        flags: MemFlags,
        allocator: &mut dyn TextureAllocator,
    ) -> Result<Self> {
        ImageDims::new_2d(width, height).validate()?;
        let gl_format = gl_format_for_image(format).ok_or_else(|| ClError::InteropFailed {
            what: format!("no GL texture format for {}", format),
            status: None,
        })?;
        let texture = allocator
            .allocate(width, height, gl_format)
            .map_err(|msg| {
                error!("Error allocating {}x{} texture: {}", width, height, msg);
                ClError::InteropFailed {
                    what: format!("texture allocation: {}", msg),
                    status: None,
                }
            })?;
        Self::from_texture(shared, texture, flags, 0).inspect_err(|_| allocator.release(texture))
    }

    pub fn dims(&self) -> ImageDims {
        self.dims
    }

    pub fn width(&self) -> usize {
        self.dims.width
    }

    pub fn height(&self) -> usize {
        self.dims.height
    }

    pub fn depth(&self) -> usize {
        self.dims.depth
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// The texture this image shares storage with.
    pub fn texture(&self) -> Option<GlTexture> {
        self.texture
    }

    pub fn mip_level(&self) -> u32 {
        self.mip_level
    }

    /// Queue used when a transfer is not given one explicitly.
    pub fn default_queue(&self) -> &Queue {
        &self.queue
    }

    /// Uploads `data` into `region` at `origin`.
    ///
    /// Pitches of zero mean tightly packed host data. With
    /// `blocking == false` the bytes are staged until the upload completes.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        data: &[u8],
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        blocking: bool,
        queue: Option<&Queue>,
    ) -> Result<()> {
        check_region(origin, region, self.dims)?;
        let needed = transfer_size(region, self.format.bytes_per_pixel(), row_pitch, slice_pitch)?;
        if data.len() < needed {
            return Err(ClError::InvalidSize(format!(
                "image write needs {} bytes, got {}",
                needed,
                data.len()
            )));
        }

        if blocking {
            self.enqueue_write(data, origin, region, row_pitch, slice_pitch, true, queue)?;
        } else {
            let staged = data[..needed].to_vec();
            let event =
                self.enqueue_write(&staged, origin, region, row_pitch, slice_pitch, false, queue)?;
            self.handle.stage(PendingTransfer::new(event, staged));
        }
        Ok(())
    }

    /// Uploads the whole image from tightly packed `data`.
    pub fn write_all(&self, data: &[u8], blocking: bool, queue: Option<&Queue>) -> Result<()> {
        self.write(data, [0, 0, 0], self.dims.region(), 0, 0, blocking, queue)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_write(
        &self,
        data: &[u8],
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        blocking: bool,
        queue: Option<&Queue>,
    ) -> Result<Event> {
        let queue = queue.unwrap_or(&self.queue);
        let _guard = self.handle.transfer_guard();
        let mut native = self.handle.write();
        let image = native.as_mut().ok_or_else(|| released_error("image write"))?;
        let flag = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        let event = unsafe {
            queue.cl_queue().enqueue_write_image(
                image,
                flag,
                origin.as_ptr(),
                region.as_ptr(),
                row_pitch,
                slice_pitch,
                data.as_ptr() as *mut c_void,
                &[],
            )
        }
        .map_err(|e| {
            let status = Status::from(e);
            error!("Error writing image region {:?}: {}", region, status);
            ClError::transfer("image write", status)
        })?;
        Ok(Event::new(event))
    }

    /// Downloads `region` at `origin` into `out`, blocking until done.
    pub fn read(
        &self,
        out: &mut [u8],
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
        queue: Option<&Queue>,
    ) -> Result<()> {
        check_region(origin, region, self.dims)?;
        let needed = transfer_size(region, self.format.bytes_per_pixel(), row_pitch, slice_pitch)?;
        if out.len() < needed {
            return Err(ClError::InvalidSize(format!(
                "image read needs {} bytes, got {}",
                needed,
                out.len()
            )));
        }

        let queue = queue.unwrap_or(&self.queue);
        let _guard = self.handle.transfer_guard();
        let native = self.handle.read();
        let image = native.as_ref().ok_or_else(|| released_error("image read"))?;
        unsafe {
            queue.cl_queue().enqueue_read_image(
                image,
                CL_BLOCKING,
                origin.as_ptr(),
                region.as_ptr(),
                row_pitch,
                slice_pitch,
                out.as_mut_ptr() as *mut c_void,
                &[],
            )
        }
        .map_err(|e| {
            let status = Status::from(e);
            error!("Error reading image region {:?}: {}", region, status);
            ClError::transfer("image read", status)
        })?;
        Ok(())
    }

    /// Reads the whole image as tightly packed bytes.
    pub fn to_vec(&self, queue: Option<&Queue>) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.size()];
        self.read(&mut data, [0, 0, 0], self.dims.region(), 0, 0, queue)?;
        Ok(data)
    }

    /// Waits for every upload issued with `blocking == false`.
    pub fn sync(&self) -> Result<()> {
        self.handle.sync()
    }
}

impl MemoryObject for Image {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Image
    }

    fn flags(&self) -> MemFlags {
        self.flags
    }

    fn size(&self) -> usize {
        [self.dims.height, self.dims.depth, self.format.bytes_per_pixel()]
            .into_iter()
            .fold(self.dims.width, usize::saturating_mul)
    }

    fn is_gl_shared(&self) -> bool {
        self.texture.is_some()
    }

    fn raw_mem(&self) -> Option<cl_mem> {
        self.handle.raw()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("dims", &self.dims)
            .field("format", &self.format)
            .field("texture", &self.texture.map(|t| t.id))
            .field("mip_level", &self.mip_level)
            .finish()
    }
}
