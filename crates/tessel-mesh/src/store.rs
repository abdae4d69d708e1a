//! Worker-resident tile storage.

use std::collections::HashMap;

use parking_lot::RwLock;
use tessel_array::{DType, Extent, ReduceOp, Tile};
use tracing::debug;

use crate::array::ArrayId;
use crate::error::{Error, SchedulingError};

/// Tiles owned by one worker, keyed by array and tile extent.
///
/// A tile comes into existence on its first write, pre-filled with the
/// reducer's identity so that every write, first or not, is a combine.
#[derive(Default)]
pub struct TileStore {
    tiles: RwLock<HashMap<(ArrayId, Extent), Tile>>,
}

impl TileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of a whole tile. Never-written tiles read as zeros.
    pub fn read(&self, array: ArrayId, tile: &Extent, sparse: bool) -> Tile {
        let tiles = self.tiles.read();
        match tiles.get(&(array, tile.clone())) {
            Some(t) => t.clone(),
            None if sparse => Tile::sparse(tile.shape()),
            None => Tile::zeros(tile.shape()),
        }
    }

    /// Part of a tile; `region` is in global coordinates and must lie inside `tile`.
    pub fn read_region(
        &self,
        array: ArrayId,
        tile: &Extent,
        region: &Extent,
        sparse: bool,
    ) -> Result<Tile, Error> {
        check_inside(tile, region)?;
        let tiles = self.tiles.read();
        let offset = region.offset_in(tile);
        match tiles.get(&(array, tile.clone())) {
            Some(t) => Ok(t.slice(&offset, &region.shape())?),
            None if sparse => Ok(Tile::sparse(region.shape())),
            None => Ok(Tile::zeros(region.shape())),
        }
    }

    /// Combine `data` into `region` of `tile` with `reducer`.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        array: ArrayId,
        tile: &Extent,
        region: &Extent,
        data: &Tile,
        reducer: ReduceOp,
        dtype: DType,
        sparse: bool,
    ) -> Result<(), Error> {
        check_inside(tile, region)?;
        if data.shape() != region.shape().as_slice() {
            return Err(SchedulingError::ShapeMismatch {
                expected: region.shape(),
                got: data.shape().to_vec(),
            }
            .into());
        }
        let data = data.cast(dtype);
        let mut tiles = self.tiles.write();
        let entry = tiles.entry((array, tile.clone())).or_insert_with(|| {
            debug!(?array, %tile, "creating tile");
            if sparse {
                Tile::sparse(tile.shape())
            } else {
                Tile::filled(tile.shape(), reducer.identity())
            }
        });
        entry.combine_region(&region.offset_in(tile), &data, reducer)?;
        Ok(())
    }

    /// Drop every tile of `arrays`. Returns how many tiles were removed.
    pub fn destroy(&self, arrays: &[ArrayId]) -> usize {
        let mut tiles = self.tiles.write();
        let before = tiles.len();
        tiles.retain(|(array, _), _| !arrays.contains(array));
        before - tiles.len()
    }

    pub fn len(&self) -> usize {
        self.tiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.read().is_empty()
    }
}

fn check_inside(tile: &Extent, region: &Extent) -> Result<(), SchedulingError> {
    if region.array_shape() != tile.array_shape() || !tile.covers(region) {
        return Err(SchedulingError::InvalidRegion(format!(
            "{region} is not inside tile {tile}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(ul: usize, lr: usize) -> Extent {
        Extent::new(vec![ul], vec![lr], vec![10]).unwrap()
    }

    #[test]
    fn first_write_is_exact_and_later_writes_combine() {
        let store = TileStore::new();
        let tile = ext(0, 5);
        let data = Tile::from_slice(&[1.0, 2.0]);
        for reducer in [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Prod] {
            let id = ArrayId(reducer as u64);
            store
                .apply(id, &tile, &ext(1, 3), &data, reducer, DType::F64, false)
                .unwrap();
            let got = store.read_region(id, &tile, &ext(1, 3), false).unwrap();
            assert_eq!(got.values(), vec![1.0, 2.0], "{reducer:?}");
        }

        let id = ArrayId(0);
        store
            .apply(id, &tile, &ext(2, 4), &data, ReduceOp::Sum, DType::F64, false)
            .unwrap();
        assert_eq!(
            store.read(id, &tile, false).values(),
            vec![0.0, 1.0, 3.0, 2.0, 0.0]
        );
    }

    #[test]
    fn first_dense_write_to_sparse_tile_is_exact() {
        let store = TileStore::new();
        let tile = ext(0, 5);
        let data = Tile::from_slice(&[2.0, -3.0]);
        for reducer in [ReduceOp::Sum, ReduceOp::Prod, ReduceOp::Max, ReduceOp::Min] {
            let id = ArrayId(10 + reducer as u64);
            store
                .apply(id, &tile, &ext(1, 3), &data, reducer, DType::F64, true)
                .unwrap();
            let got = store.read_region(id, &tile, &ext(1, 3), true).unwrap();
            assert_eq!(got.values(), vec![2.0, -3.0], "{reducer:?}");
        }
    }

    #[test]
    fn unwritten_tiles_read_as_zeros() {
        let store = TileStore::new();
        let tile = ext(5, 10);
        assert_eq!(store.read(ArrayId(1), &tile, false), Tile::zeros(vec![5]));
        assert!(store.read(ArrayId(1), &tile, true).is_sparse());
        assert!(store.is_empty());
    }

    #[test]
    fn writes_are_cast_to_the_array_dtype() {
        let store = TileStore::new();
        let tile = ext(0, 2);
        store
            .apply(
                ArrayId(3),
                &tile,
                &tile,
                &Tile::from_slice(&[1.7, -2.2]),
                ReduceOp::Sum,
                DType::I64,
                false,
            )
            .unwrap();
        assert_eq!(store.read(ArrayId(3), &tile, false).values(), vec![1.0, -2.0]);
    }

    #[test]
    fn region_outside_tile_and_shape_mismatch_are_rejected() {
        let store = TileStore::new();
        let tile = ext(0, 5);
        let err = store
            .apply(ArrayId(1), &tile, &ext(4, 6), &Tile::zeros(vec![2]), ReduceOp::Sum, DType::F64, false)
            .unwrap_err();
        assert!(matches!(err, Error::Scheduling(SchedulingError::InvalidRegion(_))));
        let err = store
            .apply(ArrayId(1), &tile, &ext(0, 2), &Tile::zeros(vec![3]), ReduceOp::Sum, DType::F64, false)
            .unwrap_err();
        assert!(matches!(err, Error::Scheduling(SchedulingError::ShapeMismatch { .. })));
    }

    #[test]
    fn destroy_removes_only_named_arrays() {
        let store = TileStore::new();
        let tile = ext(0, 1);
        for id in [1, 2] {
            store
                .apply(ArrayId(id), &tile, &tile, &Tile::from_slice(&[1.0]), ReduceOp::Sum, DType::F64, false)
                .unwrap();
        }
        assert_eq!(store.destroy(&[ArrayId(1)]), 1);
        assert_eq!(store.len(), 1);
    }
}
