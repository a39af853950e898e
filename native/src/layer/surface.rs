//! BGRA pixel buffers and the normalized crop math used by the protocol.

use std::sync::Arc;

/// Bytes per BGRA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A 32-bit BGRA bitmap with a fixed size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    width: u32,
    height: u32,
    stride: usize,
    pixels: Vec<u8>,
}

impl Surface {
    /// Allocate a transparent surface with a tightly packed stride.
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize * BYTES_PER_PIXEL;
        Self {
            width,
            height,
            stride,
            pixels: vec![0; stride * height as usize],
        }
    }

    /// Wrap existing BGRA data. Returns `None` when the buffer does not match the size.
    pub fn from_bgra(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let stride = width as usize * BYTES_PER_PIXEL;
        if pixels.len() != stride * height as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            stride,
            pixels,
        })
    }

    /// Convert RGBA data (as produced by image decoders) to a BGRA surface.
    pub fn from_rgba(width: u32, height: u32, mut pixels: Vec<u8>) -> Option<Self> {
        for px in pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.swap(0, 2);
        }
        Self::from_bgra(width, height, pixels)
    }

    /// Copy out as RGBA for encoders.
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for row in self.rows() {
            for px in row.chunks_exact(BYTES_PER_PIXEL) {
                out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
            }
        }
        out
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.pixels[start..start + self.width as usize * BYTES_PER_PIXEL]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let len = self.width as usize * BYTES_PER_PIXEL;
        &mut self.pixels[start..start + len]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.height).map(move |y| self.row(y))
    }

    /// Rows of the given pixel region, each `rect.width * 4` bytes long.
    pub fn region_rows(&self, rect: PixelRect) -> impl Iterator<Item = &[u8]> + '_ {
        let start = rect.x as usize * BYTES_PER_PIXEL;
        let len = rect.width as usize * BYTES_PER_PIXEL;
        (rect.y..rect.y + rect.height).map(move |y| &self.row(y)[start..start + len])
    }

    /// Bytes needed to hold a full-width image of this size, `width * height * 4`.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * BYTES_PER_PIXEL as u64
    }

    pub fn full_rect(&self) -> PixelRect {
        PixelRect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }
}

/// Layer pixel storage. Either owned by the layer or observed from the editor.
#[derive(Debug, Clone)]
pub enum LayerPixels {
    Owned(Surface),
    Shared(Arc<Surface>),
}

/// One input image plane handed to the external process.
#[derive(Debug, Clone)]
pub struct Layer {
    pixels: LayerPixels,
    visible: bool,
}

impl Layer {
    /// Layer that owns its surface.
    pub fn owned(surface: Surface, visible: bool) -> Self {
        Self {
            pixels: LayerPixels::Owned(surface),
            visible,
        }
    }

    /// Layer that observes a surface still held by the editor.
    pub fn shared(surface: Arc<Surface>, visible: bool) -> Self {
        Self {
            pixels: LayerPixels::Shared(surface),
            visible,
        }
    }

    pub fn surface(&self) -> &Surface {
        match &self.pixels {
            LayerPixels::Owned(surface) => surface,
            LayerPixels::Shared(surface) => surface,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.pixels, LayerPixels::Owned(_))
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn width(&self) -> u32 {
        self.surface().width()
    }

    pub fn height(&self) -> u32 {
        self.surface().height()
    }

    /// Take the owned surface back, if this layer owns one.
    pub fn into_surface(self) -> Option<Surface> {
        match self.pixels {
            LayerPixels::Owned(surface) => Some(surface),
            LayerPixels::Shared(_) => None,
        }
    }
}

/// A pixel-aligned region of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A region expressed as fractions (0..=1) of the layer size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropRect {
    pub const FULL: CropRect = CropRect {
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    };

    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }

    /// Convert to pixels for a `width` x `height` layer.
    ///
    /// The size is over-allocated by one pixel to absorb rounding at the
    /// boundary and then clamped to the layer edge.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        if self.is_full() {
            return PixelRect {
                x: 0,
                y: 0,
                width,
                height,
            };
        }

        let w = f64::from(width);
        let h = f64::from(height);
        let crop_x = ((self.x * w).floor() as u32).min(width);
        let crop_y = ((self.y * h).floor() as u32).min(height);
        let crop_width = (width - crop_x).min((self.width * w).ceil() as u32 + 1);
        let crop_height = (height - crop_y).min((self.height * h).ceil() as u32 + 1);

        PixelRect {
            x: crop_x,
            y: crop_y,
            width: crop_width,
            height: crop_height,
        }
    }
}

/// Whether `width * height * 4` exceeds what a 32-bit `size_t` can address.
pub fn exceeds_32bit_size(width: u32, height: u32) -> bool {
    u64::from(width) * u64::from(height) * BYTES_PER_PIXEL as u64 > u64::from(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Surface {
        let mut surface = Surface::new(width, height);
        for y in 0..height {
            let row = surface.row_mut(y);
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                px.copy_from_slice(&[x as u8, y as u8, 0, 255]);
            }
        }
        surface
    }

    #[test]
    fn crop_is_clamped_to_layer_bounds() {
        let rect = CropRect {
            x: 0.5,
            y: 0.5,
            width: 0.6,
            height: 0.6,
        };
        assert_eq!(
            rect.to_pixels(100, 100),
            PixelRect {
                x: 50,
                y: 50,
                width: 50,
                height: 50
            }
        );
    }

    #[test]
    fn crop_over_allocates_by_one_pixel() {
        let rect = CropRect {
            x: 0.1,
            y: 0.2,
            width: 0.25,
            height: 0.25,
        };
        assert_eq!(
            rect.to_pixels(100, 100),
            PixelRect {
                x: 10,
                y: 20,
                width: 26,
                height: 26
            }
        );
    }

    #[test]
    fn full_rect_returns_whole_layer() {
        assert_eq!(CropRect::FULL.to_pixels(37, 11), gradient(37, 11).full_rect());
    }

    #[test]
    fn region_rows_slice_the_source() {
        let surface = gradient(8, 8);
        let rect = PixelRect {
            x: 2,
            y: 3,
            width: 2,
            height: 2,
        };
        let rows: Vec<&[u8]> = surface.region_rows(rect).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], &[2, 3, 0, 255, 3, 3, 0, 255]);
        assert_eq!(rows[1], &[2, 4, 0, 255, 3, 4, 0, 255]);
    }

    #[test]
    fn rgba_conversion_swaps_red_and_blue() {
        let surface = Surface::from_rgba(1, 1, vec![10, 20, 30, 40]).expect("size matches");
        assert_eq!(surface.pixels(), &[30, 20, 10, 40]);
        assert_eq!(surface.to_rgba(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn from_bgra_rejects_wrong_length() {
        assert!(Surface::from_bgra(2, 2, vec![0; 15]).is_none());
    }

    #[test]
    fn size_guard_boundary() {
        // 32768 * 32768 * 4 = 2^32, one byte past the limit.
        assert!(exceeds_32bit_size(32768, 32768));
        assert!(!exceeds_32bit_size(32768, 32767));
    }

    #[test]
    fn shared_layer_does_not_own_pixels() {
        let shared = Layer::shared(Arc::new(Surface::new(2, 2)), true);
        assert!(!shared.is_owned());
        assert!(shared.into_surface().is_none());
        assert!(Layer::owned(Surface::new(2, 2), false).is_owned());
    }
}
