//! Distributed array descriptors.
//!
//! A [`DistArray`] is metadata only: shape, element type, reducer and the
//! tile-to-owner map. The map is fixed at creation, so the descriptor is
//! freely cloned into kernel tasks and read without locks. Tile data
//! lives in the owners' [`TileStore`](crate::store::TileStore)s.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tessel_array::{is_partition, DType, Extent, ReduceOp, Tile};

use crate::cluster::{Cluster, WorkerId};
use crate::error::{Error, SchedulingError};
use crate::peers::PeerSet;
use crate::protocol::{Request, Response};
use crate::rpc::{Future, FutureGroup};

/// Identifier of a distributed array, unique per coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArrayId(pub u64);

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array-{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistArray {
    pub id: ArrayId,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub sparse: bool,
    /// Combines overlapping writes.
    pub reducer: ReduceOp,
    pub tiles: BTreeMap<Extent, WorkerId>,
}

impl DistArray {
    /// Build a descriptor, checking that `tiles` partition `shape`.
    pub fn new(
        id: ArrayId,
        shape: Vec<usize>,
        dtype: DType,
        sparse: bool,
        reducer: ReduceOp,
        tiles: BTreeMap<Extent, WorkerId>,
    ) -> Result<Self, SchedulingError> {
        let array = Self {
            id,
            shape,
            dtype,
            sparse,
            reducer,
            tiles,
        };
        array.validate()?;
        Ok(array)
    }

    /// The tiles cover the array exactly once.
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if !is_partition(self.tiles.keys(), &self.shape) {
            return Err(SchedulingError::InvalidRegion(format!(
                "tiles of {} do not partition {:?}",
                self.id, self.shape
            )));
        }
        Ok(())
    }

    /// Every owner is a member of `cluster`.
    pub fn check_owners(&self, cluster: &Cluster) -> Result<(), SchedulingError> {
        match self.tiles.iter().find(|(_, w)| !cluster.contains(**w)) {
            Some((extent, worker)) => Err(SchedulingError::UnknownOwner {
                extent: extent.clone(),
                worker: *worker,
            }),
            None => Ok(()),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn full_extent(&self) -> Extent {
        Extent::full(self.shape.clone())
    }

    pub fn owner(&self, tile: &Extent) -> Option<WorkerId> {
        self.tiles.get(tile).copied()
    }

    pub fn owners(&self) -> BTreeSet<WorkerId> {
        self.tiles.values().copied().collect()
    }

    /// Tiles overlapping `region`, with their owner and the overlap.
    pub fn intersecting<'a>(
        &'a self,
        region: &'a Extent,
    ) -> impl Iterator<Item = (&'a Extent, WorkerId, Extent)> + 'a {
        self.tiles
            .iter()
            .filter_map(move |(tile, &owner)| tile.intersection(region).map(|o| (tile, owner, o)))
    }

    fn check_region(&self, region: &Extent) -> Result<(), SchedulingError> {
        if region.array_shape() != self.shape.as_slice() {
            return Err(SchedulingError::ShapeMismatch {
                expected: self.shape.clone(),
                got: region.array_shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Assemble `region` from every tile it overlaps.
    ///
    /// Locally owned tiles are read straight from the store; the rest are
    /// fetched from their owners concurrently.
    pub fn fetch(&self, peers: &PeerSet, region: &Extent) -> Result<Tile, Error> {
        self.check_region(region)?;
        let mut out = if self.sparse {
            Tile::sparse(region.shape())
        } else {
            Tile::zeros(region.shape())
        };

        let mut remote = FutureGroup::new();
        let mut remote_at = Vec::new();
        for (tile, owner, overlap) in self.intersecting(region) {
            let offset = overlap.offset_in(region);
            match peers.store() {
                Some(store) if peers.is_local(owner) => {
                    let piece = store.read_region(self.id, tile, &overlap, self.sparse)?;
                    out.combine_region(&offset, &piece, ReduceOp::Sum)?;
                }
                _ => {
                    let request = Request::Fetch {
                        array: self.id,
                        tile: tile.clone(),
                        region: overlap,
                        sparse: self.sparse,
                    };
                    remote.push(peers.client(owner)?.call_map(request, Response::into_tile));
                    remote_at.push(offset);
                }
            }
        }

        let pieces = remote.wait_all(peers.event_loop(), peers.rpc_timeout())?;
        for (offset, piece) in remote_at.iter().zip(&pieces) {
            out.combine_region(offset, piece, ReduceOp::Sum)?;
        }
        Ok(out)
    }

    /// Combine `data` into `region`, split across the tiles it overlaps.
    ///
    /// Local tiles are written immediately; each remote piece becomes one
    /// future in the returned group.
    pub fn update(
        &self,
        peers: &PeerSet,
        region: &Extent,
        data: &Tile,
    ) -> Result<FutureGroup<()>, Error> {
        self.check_region(region)?;
        if data.shape() != region.shape().as_slice() {
            return Err(SchedulingError::ShapeMismatch {
                expected: region.shape(),
                got: data.shape().to_vec(),
            }
            .into());
        }

        let mut group = FutureGroup::new();
        for (tile, owner, overlap) in self.intersecting(region) {
            let piece = data.slice(&overlap.offset_in(region), &overlap.shape())?;
            match peers.store() {
                Some(store) if peers.is_local(owner) => {
                    store.apply(
                        self.id,
                        tile,
                        &overlap,
                        &piece,
                        self.reducer,
                        self.dtype,
                        self.sparse,
                    )?;
                    group.push(Future::ready(()));
                }
                _ => {
                    let request = Request::Update {
                        array: self.id,
                        tile: tile.clone(),
                        region: overlap,
                        data: piece,
                        reducer: self.reducer,
                        dtype: self.dtype,
                        sparse: self.sparse,
                    };
                    group.push(peers.client(owner)?.call_map(request, Response::into_ack));
                }
            }
        }
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::RwLock;

    use crate::config::Config;
    use crate::peers::{Membership, SharedMembership};
    use crate::store::TileStore;

    fn halves() -> BTreeMap<Extent, WorkerId> {
        let mut tiles = BTreeMap::new();
        tiles.insert(Extent::new(vec![0], vec![5], vec![10]).unwrap(), WorkerId(0));
        tiles.insert(Extent::new(vec![5], vec![10], vec![10]).unwrap(), WorkerId(0));
        tiles
    }

    fn local_peers() -> PeerSet {
        let membership: SharedMembership = Arc::new(RwLock::new(Some(Membership {
            me: WorkerId(0),
            cluster: Cluster::builder().worker("127.0.0.1", 1, 1).build(),
        })));
        PeerSet::worker(membership, Arc::new(TileStore::new()), Config::default()).unwrap()
    }

    #[test]
    fn rejects_tilings_with_gaps() {
        let mut tiles = halves();
        tiles.remove(&Extent::new(vec![5], vec![10], vec![10]).unwrap());
        let err = DistArray::new(ArrayId(1), vec![10], DType::F64, false, ReduceOp::Sum, tiles)
            .unwrap_err();
        assert!(matches!(err, SchedulingError::InvalidRegion(_)));
    }

    #[test]
    fn unknown_owner_is_reported() {
        let mut tiles = halves();
        *tiles.values_mut().last().unwrap() = WorkerId(4);
        let array =
            DistArray::new(ArrayId(1), vec![10], DType::F64, false, ReduceOp::Sum, tiles).unwrap();
        let cluster = Cluster::builder().worker("h", 1, 1).build();
        assert!(matches!(
            array.check_owners(&cluster),
            Err(SchedulingError::UnknownOwner { worker: WorkerId(4), .. })
        ));
    }

    #[test]
    fn update_then_fetch_across_tile_boundary() {
        let peers = local_peers();
        let array =
            DistArray::new(ArrayId(2), vec![10], DType::F64, false, ReduceOp::Sum, halves()).unwrap();
        let region = Extent::new(vec![3], vec![7], vec![10]).unwrap();
        let data = Tile::from_slice(&[1.0, 2.0, 3.0, 4.0]);

        for _ in 0..2 {
            let group = array.update(&peers, &region, &data).unwrap();
            assert_eq!(group.len(), 2);
            group
                .wait_all(peers.event_loop(), peers.rpc_timeout())
                .unwrap();
        }
        let whole = array.fetch(&peers, &array.full_extent()).unwrap();
        assert_eq!(
            whole.values(),
            vec![0.0, 0.0, 0.0, 2.0, 4.0, 6.0, 8.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn wrong_shapes_are_scheduling_errors() {
        let peers = local_peers();
        let array =
            DistArray::new(ArrayId(3), vec![10], DType::F64, false, ReduceOp::Sum, halves()).unwrap();
        let region = Extent::new(vec![0], vec![2], vec![10]).unwrap();
        let err = array
            .update(&peers, &region, &Tile::zeros(vec![3]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Scheduling(SchedulingError::ShapeMismatch { .. })));

        let foreign = Extent::full(vec![4]);
        let err = array.fetch(&peers, &foreign).unwrap_err();
        assert!(matches!(err, Error::Scheduling(SchedulingError::ShapeMismatch { .. })));
    }
}
