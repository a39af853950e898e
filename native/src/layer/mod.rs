pub mod collection;
pub mod surface;

pub use collection::{InputMode, LayerCollection, LayerSource};
pub use surface::{exceeds_32bit_size, CropRect, Layer, LayerPixels, PixelRect, Surface};
