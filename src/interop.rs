//! Graphics-surface collaborator types.
//!
//! The OpenGL side owns these objects. This crate only wraps their names, so
//! the caller must keep each GL object alive for as long as the memory object
//! sharing it exists. Textures allocated through a [`TextureAllocator`] go
//! back to it when the compute side cannot share them.

use crate::runtime::opencl::{ChannelOrder, ChannelType, ImageFormat};

pub const GL_TEXTURE_2D: u32 = 0x0DE1;
pub const GL_TEXTURE_3D: u32 = 0x806F;
pub const GL_TEXTURE_RECTANGLE: u32 = 0x84F5;

pub const GL_RGBA: u32 = 0x1908;
pub const GL_RGBA8: u32 = 0x8058;
pub const GL_RGBA16: u32 = 0x805B;
pub const GL_RGBA16F: u32 = 0x881A;
pub const GL_RGBA32F: u32 = 0x8814;
pub const GL_R8: u32 = 0x8229;
pub const GL_R16F: u32 = 0x822D;
pub const GL_R32F: u32 = 0x822E;
pub const GL_RG8: u32 = 0x822B;
pub const GL_RG32F: u32 = 0x8230;

/// An existing OpenGL buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlBuffer {
    /// Buffer object name.
    pub id: u32,
    /// Size of the data store in bytes.
    pub size: usize,
}

/// An existing OpenGL texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlTexture {
    /// Texture object name.
    pub id: u32,
    /// Texture target, e.g. [`GL_TEXTURE_2D`].
    pub target: u32,
    pub width: usize,
    pub height: usize,
    /// 1 for 2D targets.
    pub depth: usize,
    /// Sized internal format, e.g. [`GL_RGBA8`].
    pub internal_format: u32,
}

impl GlTexture {
    /// Describes a 2D texture.
    pub fn new_2d(id: u32, width: usize, height: usize, internal_format: u32) -> Self {
        GlTexture {
            id,
            target: GL_TEXTURE_2D,
            width,
            height,
            depth: 1,
            internal_format,
        }
    }

    /// Image format the compute side sees for this texture, if known.
    pub fn image_format(&self) -> Option<ImageFormat> {
        image_format_for_gl(self.internal_format)
    }
}

/// Allocates textures for images created together with their GL storage.
pub trait TextureAllocator {
    /// Allocates a texture of the given size and sized internal format.
    fn allocate(&mut self, width: usize, height: usize, internal_format: u32)
    -> Result<GlTexture, String>;

    /// Deletes a texture from [`allocate`](Self::allocate) that could not be
    /// shared with the compute side.
    fn release(&mut self, texture: GlTexture);
}

/// Maps a sized GL internal format onto the matching compute image format.
pub fn image_format_for_gl(internal_format: u32) -> Option<ImageFormat> {
    let (order, channel_type) = match internal_format {
        GL_RGBA | GL_RGBA8 => (ChannelOrder::Rgba, ChannelType::UnormInt8),
        GL_RGBA16 => (ChannelOrder::Rgba, ChannelType::UnormInt16),
        GL_RGBA16F => (ChannelOrder::Rgba, ChannelType::HalfFloat),
        GL_RGBA32F => (ChannelOrder::Rgba, ChannelType::Float),
        GL_R8 => (ChannelOrder::R, ChannelType::UnormInt8),
        GL_R16F => (ChannelOrder::R, ChannelType::HalfFloat),
        GL_R32F => (ChannelOrder::R, ChannelType::Float),
        GL_RG8 => (ChannelOrder::Rg, ChannelType::UnormInt8),
        GL_RG32F => (ChannelOrder::Rg, ChannelType::Float),
        _ => return None,
    };
    Some(ImageFormat::new(order, channel_type))
}

/// Maps a compute image format onto the sized GL internal format to allocate.
pub fn gl_format_for_image(format: ImageFormat) -> Option<u32> {
    let gl = match (format.order, format.channel_type) {
        (ChannelOrder::Rgba, ChannelType::UnormInt8) => GL_RGBA8,
        (ChannelOrder::Rgba, ChannelType::UnormInt16) => GL_RGBA16,
        (ChannelOrder::Rgba, ChannelType::HalfFloat) => GL_RGBA16F,
        (ChannelOrder::Rgba, ChannelType::Float) => GL_RGBA32F,
        (ChannelOrder::R, ChannelType::UnormInt8) => GL_R8,
        (ChannelOrder::R, ChannelType::HalfFloat) => GL_R16F,
        (ChannelOrder::R, ChannelType::Float) => GL_R32F,
        (ChannelOrder::Rg, ChannelType::UnormInt8) => GL_RG8,
        (ChannelOrder::Rg, ChannelType::Float) => GL_RG32F,
        _ => return None,
    };
    Some(gl)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(GL_RGBA8)]
    #[case(GL_RGBA16)]
    #[case(GL_RGBA16F)]
    #[case(GL_RGBA32F)]
    #[case(GL_R8)]
    #[case(GL_R16F)]
    #[case(GL_R32F)]
    #[case(GL_RG8)]
    #[case(GL_RG32F)]
    fn test_sized_formats_map_both_ways(#[case] gl: u32) {
        let format = image_format_for_gl(gl).unwrap();
        assert_eq!(gl_format_for_image(format), Some(gl));
    }

    #[test]
    fn test_unsized_rgba_maps_to_rgba8() {
        let format = image_format_for_gl(GL_RGBA).unwrap();
        assert_eq!(format.order, ChannelOrder::Rgba);
        assert_eq!(format.channel_type, ChannelType::UnormInt8);
    }

    #[test]
    fn test_unknown_format() {
        assert!(image_format_for_gl(0x1234).is_none());
        let format = ImageFormat::new(ChannelOrder::Bgra, ChannelType::SignedInt32);
        assert!(gl_format_for_image(format).is_none());
    }

    #[test]
    fn test_texture_2d_descriptor() {
        let texture = GlTexture::new_2d(7, 64, 32, GL_RGBA32F);
        assert_eq!(texture.target, GL_TEXTURE_2D);
        assert_eq!(texture.depth, 1);
        assert_eq!(texture.image_format().unwrap().bytes_per_pixel(), 16);
    }
}
