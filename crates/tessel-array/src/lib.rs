//! Tile addressing for distributed arrays.
//!
//! A distributed array is cut into tiles; each tile is named by an
//! [`Extent`] in the global index space and carries its values in a
//! [`Tile`]. Overlapping writes are folded together with a [`ReduceOp`].
//! Nothing in this crate touches the network.

mod extent;
mod reduce;
mod tile;

pub use extent::{
    find_extent, is_partition, ravel, tile_extents, tile_extents_with_hint, unravel, Extent,
    ExtentError, Indices,
};
pub use reduce::ReduceOp;
pub use tile::{DType, Tile, TileData, TileError};
