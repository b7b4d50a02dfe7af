//! Raster handling for the tilegate tile proxy.
//!
//! [`MapImage`] is the in-memory raster passed between sources, caches and
//! the tile manager: pixel data plus georeference (bbox and SRS) plus the
//! encoding options that apply to it. The transformer reprojects and
//! rescales, the merger composites layer stacks, and the format module
//! encodes to PNG/PNG8/JPEG/GeoTIFF/WebP including the `mixed` mode.

pub mod font;
pub mod format;
pub mod image;
pub mod merge;
pub mod quantize;
pub mod transform;
pub mod watermark;

pub use crate::format::{decode, encode, EncodedImage};
pub use crate::image::{ImageOpts, MapImage};
pub use crate::merge::{band_merge, merge_layers, BandSelect, MergeLayer};
pub use crate::transform::ImageTransformer;
pub use crate::watermark::apply_watermark;

pub use ::image::DynamicImage;
