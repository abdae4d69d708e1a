//! Placement: how a new array's tiles are cut and spread over workers.
//!
//! A plan is fixed when the array is created and never changes; there is
//! no runtime rebalancing.

use std::collections::BTreeMap;

use tessel_array::{tile_extents, tile_extents_with_hint, Extent};

use crate::cluster::{Cluster, WorkerId};
use crate::config::AssignMode;
use crate::error::SchedulingError;

/// Tile-to-owner assignment for one array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub tiles: BTreeMap<Extent, WorkerId>,
}

impl Placement {
    /// Cut `shape` into tiles and assign each to a worker.
    ///
    /// Without a hint, `ByCore` makes one tile per slot and `ByNode` one
    /// tile per worker. Consecutive tiles go to the same worker until its
    /// share of slots is used up, so neighbouring tiles stay together.
    pub fn plan(
        shape: &[usize],
        tile_hint: Option<&[usize]>,
        cluster: &Cluster,
        mode: AssignMode,
    ) -> Result<Self, SchedulingError> {
        if cluster.is_empty() {
            return Err(SchedulingError::NoWorkers);
        }

        let owners: Vec<WorkerId> = match mode {
            AssignMode::ByCore => cluster
                .iter()
                .flat_map(|(id, spec)| std::iter::repeat(id).take(spec.slots.max(1)))
                .collect(),
            AssignMode::ByNode => cluster.ids().collect(),
        };

        let extents = match tile_hint {
            Some(hint) => tile_extents_with_hint(shape, hint)?,
            None => tile_extents(shape, owners.len()),
        };

        let n = extents.len();
        let tiles = extents
            .into_iter()
            .enumerate()
            .map(|(i, extent)| (extent, owners[i * owners.len() / n]))
            .collect();
        Ok(Self { tiles })
    }

    /// Number of tiles owned by `worker`.
    pub fn count_for(&self, worker: WorkerId) -> usize {
        self.tiles.values().filter(|&&w| w == worker).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_array::is_partition;

    fn two_workers(slots: usize) -> Cluster {
        Cluster::builder()
            .worker("127.0.0.1", 7001, slots)
            .worker("127.0.0.1", 7002, slots)
            .build()
    }

    #[test]
    fn one_tile_per_node() {
        let plan = Placement::plan(&[10], None, &two_workers(1), AssignMode::ByNode).unwrap();
        let tiles: Vec<(String, WorkerId)> = plan
            .tiles
            .iter()
            .map(|(e, w)| (e.to_string(), *w))
            .collect();
        assert_eq!(
            tiles,
            vec![
                ("Extent(0:5 of [10])".to_string(), WorkerId(0)),
                ("Extent(5:10 of [10])".to_string(), WorkerId(1)),
            ]
        );
    }

    #[test]
    fn by_core_weights_by_slots() {
        let cluster = Cluster::builder()
            .worker("a", 1, 3)
            .worker("b", 1, 1)
            .build();
        let plan = Placement::plan(&[8, 4], None, &cluster, AssignMode::ByCore).unwrap();
        assert_eq!(plan.tiles.len(), 4);
        assert_eq!(plan.count_for(WorkerId(0)), 3);
        assert_eq!(plan.count_for(WorkerId(1)), 1);
        assert!(is_partition(plan.tiles.keys(), &[8, 4]));
    }

    #[test]
    fn hint_spreads_extra_tiles_in_runs() {
        let plan = Placement::plan(&[8], Some(&[2]), &two_workers(1), AssignMode::ByCore).unwrap();
        let owners: Vec<WorkerId> = plan.tiles.values().copied().collect();
        assert_eq!(
            owners,
            vec![WorkerId(0), WorkerId(0), WorkerId(1), WorkerId(1)]
        );
    }

    #[test]
    fn empty_cluster_is_an_error() {
        let err = Placement::plan(&[4], None, &Cluster::default(), AssignMode::ByCore).unwrap_err();
        assert_eq!(err, SchedulingError::NoWorkers);
    }
}
