//! Shared value types: bounding boxes, tile coordinates, formats and tiles.

mod map_bbox;
mod tile;
mod tile_coord;
mod tile_format;

pub use map_bbox::MapBBox;
pub use tile::{Tile, TileData};
pub use tile_coord::TileCoord;
pub use tile_format::TileFormat;
