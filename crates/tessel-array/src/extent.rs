//! Extents: where one tile sits inside a global array.
//!
//! An `Extent` is a half-open box `[ul, lr)` in global coordinates, tagged
//! with the shape of the array it belongs to and the axis the array is
//! currently partitioned along. Extents are the keys of a distributed
//! array's tile map, so they are immutable and totally ordered.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors raised while building extents or tilings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtentError {
    /// Corner vectors and array shape disagree on rank.
    RankMismatch { expected: usize, got: usize },
    /// A corner lies outside the array.
    OutOfBounds { axis: usize, value: usize, bound: usize },
    /// `ul > lr` along an axis.
    Inverted { axis: usize },
    /// A tile hint with a zero-length dimension.
    ZeroTile { axis: usize },
}

impl fmt::Display for ExtentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankMismatch { expected, got } => {
                write!(f, "rank mismatch: expected {expected} dims, got {got}")
            }
            Self::OutOfBounds { axis, value, bound } => {
                write!(f, "axis {axis}: {value} is outside [0, {bound}]")
            }
            Self::Inverted { axis } => write!(f, "axis {axis}: upper-left exceeds lower-right"),
            Self::ZeroTile { axis } => write!(f, "axis {axis}: tile hint has zero length"),
        }
    }
}

impl std::error::Error for ExtentError {}

/// A rectangular region of a global array.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Extent {
    ul: Vec<usize>,
    lr: Vec<usize>,
    array_shape: Vec<usize>,
    partition_axis: Option<usize>,
}

impl Extent {
    /// Build an extent from its corners.
    pub fn new(
        ul: Vec<usize>,
        lr: Vec<usize>,
        array_shape: Vec<usize>,
    ) -> Result<Self, ExtentError> {
        let ndim = array_shape.len();
        for v in [&ul, &lr] {
            if v.len() != ndim {
                return Err(ExtentError::RankMismatch {
                    expected: ndim,
                    got: v.len(),
                });
            }
        }
        for axis in 0..ndim {
            if lr[axis] > array_shape[axis] {
                return Err(ExtentError::OutOfBounds {
                    axis,
                    value: lr[axis],
                    bound: array_shape[axis],
                });
            }
            if ul[axis] > lr[axis] {
                return Err(ExtentError::Inverted { axis });
            }
        }
        Ok(Self {
            ul,
            lr,
            array_shape,
            partition_axis: None,
        })
    }

    /// Build an extent from an offset and a shape.
    pub fn from_offset(
        offset: &[usize],
        shape: &[usize],
        array_shape: Vec<usize>,
    ) -> Result<Self, ExtentError> {
        if offset.len() != shape.len() {
            return Err(ExtentError::RankMismatch {
                expected: offset.len(),
                got: shape.len(),
            });
        }
        let lr = offset.iter().zip(shape).map(|(o, s)| o + s).collect();
        Self::new(offset.to_vec(), lr, array_shape)
    }

    /// The extent covering a whole array.
    pub fn full(array_shape: Vec<usize>) -> Self {
        Self {
            ul: vec![0; array_shape.len()],
            lr: array_shape.clone(),
            array_shape,
            partition_axis: None,
        }
    }

    /// The single extent of a 0-d array.
    pub fn scalar() -> Self {
        Self::full(Vec::new())
    }

    /// Same region, tagged with a different partition axis.
    pub fn with_partition_axis(mut self, axis: Option<usize>) -> Self {
        self.partition_axis = axis;
        self
    }

    pub fn ul(&self) -> &[usize] {
        &self.ul
    }

    pub fn lr(&self) -> &[usize] {
        &self.lr
    }

    pub fn array_shape(&self) -> &[usize] {
        &self.array_shape
    }

    pub fn partition_axis(&self) -> Option<usize> {
        self.partition_axis
    }

    pub fn ndim(&self) -> usize {
        self.array_shape.len()
    }

    /// Per-axis length of the region.
    pub fn shape(&self) -> Vec<usize> {
        self.ul.iter().zip(&self.lr).map(|(u, l)| l - u).collect()
    }

    /// Number of elements covered. A 0-d extent covers one element.
    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether this extent spans its whole array.
    pub fn is_full(&self) -> bool {
        self.ul.iter().all(|&u| u == 0) && self.lr == self.array_shape
    }

    /// Whether a global index falls inside the region.
    pub fn contains(&self, index: &[usize]) -> bool {
        index.len() == self.ndim()
            && index
                .iter()
                .zip(self.ul.iter().zip(&self.lr))
                .all(|(&i, (&u, &l))| u <= i && i < l)
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn covers(&self, other: &Extent) -> bool {
        other.ndim() == self.ndim()
            && (0..self.ndim()).all(|a| self.ul[a] <= other.ul[a] && other.lr[a] <= self.lr[a])
    }

    /// Overlap of two extents of the same array, if non-empty.
    ///
    /// The result keeps `self`'s partition axis.
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        if self.array_shape != other.array_shape {
            return None;
        }
        let mut ul = Vec::with_capacity(self.ndim());
        let mut lr = Vec::with_capacity(self.ndim());
        for axis in 0..self.ndim() {
            let u = self.ul[axis].max(other.ul[axis]);
            let l = self.lr[axis].min(other.lr[axis]);
            if u >= l {
                return None;
            }
            ul.push(u);
            lr.push(l);
        }
        Some(Extent {
            ul,
            lr,
            array_shape: self.array_shape.clone(),
            partition_axis: self.partition_axis,
        })
    }

    /// Offset of this extent's corner relative to `outer`'s corner.
    ///
    /// `outer` must cover `self`.
    pub fn offset_in(&self, outer: &Extent) -> Vec<usize> {
        debug_assert!(outer.covers(self));
        self.ul.iter().zip(&outer.ul).map(|(s, o)| s - o).collect()
    }

    /// Remove `axis`, producing the extent of a reduction's output.
    pub fn drop_axis(&self, axis: usize) -> Extent {
        let strip = |v: &[usize]| -> Vec<usize> {
            v.iter()
                .enumerate()
                .filter(|&(i, _)| i != axis)
                .map(|(_, &x)| x)
                .collect()
        };
        let partition_axis = match self.partition_axis {
            Some(p) if p == axis => None,
            Some(p) if p > axis => Some(p - 1),
            other => other,
        };
        Extent {
            ul: strip(&self.ul),
            lr: strip(&self.lr),
            array_shape: strip(&self.array_shape),
            partition_axis,
        }
    }

    /// The axis along which this extent is narrower than its array.
    fn inferred_partition_axis(&self) -> Option<usize> {
        self.partition_axis.or_else(|| {
            (0..self.ndim()).find(|&a| self.ul[a] != 0 || self.lr[a] != self.array_shape[a])
        })
    }

    /// Re-express this tile as if the array were partitioned along `axis`.
    ///
    /// The tile's fractional position along its current partition axis is
    /// carried over to `axis`; every other axis spans the whole array. An
    /// `axis` past the last dimension yields the full array, so all tiles
    /// of a vector collapse onto one extent there. The result may be empty
    /// when `axis` is shorter than the number of tiles.
    pub fn change_partition_axis(&self, axis: usize) -> Extent {
        if axis >= self.ndim() {
            return Extent::full(self.array_shape.clone());
        }
        let Some(old) = self.inferred_partition_axis() else {
            return Extent::full(self.array_shape.clone()).with_partition_axis(Some(axis));
        };
        if old == axis {
            return self.clone().with_partition_axis(Some(axis));
        }

        let old_len = self.array_shape[old];
        let new_len = self.array_shape[axis];
        let scale = |x: usize| {
            if old_len == 0 {
                0
            } else {
                x * new_len / old_len
            }
        };

        let mut ul = vec![0; self.ndim()];
        let mut lr = self.array_shape.clone();
        ul[axis] = scale(self.ul[old]);
        lr[axis] = scale(self.lr[old]);
        Extent {
            ul,
            lr,
            array_shape: self.array_shape.clone(),
            partition_axis: Some(axis),
        }
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent(")?;
        for axis in 0..self.ndim() {
            if axis > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", self.ul[axis], self.lr[axis])?;
        }
        write!(f, " of {:?})", self.array_shape)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Row-major linear index of `index` within `shape`.
pub fn ravel(index: &[usize], shape: &[usize]) -> usize {
    index
        .iter()
        .zip(shape)
        .fold(0, |acc, (&i, &d)| acc * d + i)
}

/// Inverse of [`ravel`].
pub fn unravel(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for axis in (0..shape.len()).rev() {
        let d = shape[axis].max(1);
        index[axis] = linear % d;
        linear /= d;
    }
    index
}

/// Iterator over every multi-index of a shape, row-major.
pub struct Indices {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl Indices {
    pub fn new(shape: &[usize]) -> Self {
        let next = if shape.iter().any(|&d| d == 0) {
            None
        } else {
            Some(vec![0; shape.len()])
        };
        Self {
            shape: shape.to_vec(),
            next,
        }
    }
}

impl Iterator for Indices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;
        let mut idx = current.clone();
        for d in (0..self.shape.len()).rev() {
            idx[d] += 1;
            if idx[d] < self.shape[d] {
                self.next = Some(idx);
                return Some(current);
            }
            idx[d] = 0;
        }
        Some(current)
    }
}

/// Split `shape` into at most `n_tiles` slabs along one axis.
///
/// The first axis at least `n_tiles` long is chosen, falling back to the
/// longest axis. The slabs partition the array with no gaps or overlaps.
pub fn tile_extents(shape: &[usize], n_tiles: usize) -> Vec<Extent> {
    if shape.is_empty() {
        return vec![Extent::scalar()];
    }
    let axis = shape
        .iter()
        .position(|&d| d >= n_tiles)
        .unwrap_or_else(|| {
            (0..shape.len())
                .max_by_key(|&a| (shape[a], std::cmp::Reverse(a)))
                .unwrap_or(0)
        });
    let len = shape[axis];
    let n = n_tiles.min(len).max(1);

    (0..n)
        .map(|k| {
            let mut ul = vec![0; shape.len()];
            let mut lr = shape.to_vec();
            ul[axis] = k * len / n;
            lr[axis] = (k + 1) * len / n;
            Extent {
                ul,
                lr,
                array_shape: shape.to_vec(),
                partition_axis: Some(axis),
            }
        })
        .collect()
}

/// Grid tiling with tiles of (at most) `tile_shape`.
pub fn tile_extents_with_hint(
    shape: &[usize],
    tile_shape: &[usize],
) -> Result<Vec<Extent>, ExtentError> {
    if tile_shape.len() != shape.len() {
        return Err(ExtentError::RankMismatch {
            expected: shape.len(),
            got: tile_shape.len(),
        });
    }
    if let Some(axis) = tile_shape.iter().position(|&t| t == 0) {
        return Err(ExtentError::ZeroTile { axis });
    }
    if shape.is_empty() {
        return Ok(vec![Extent::scalar()]);
    }

    let counts: Vec<usize> = shape
        .iter()
        .zip(tile_shape)
        .map(|(&d, &t)| d.div_ceil(t).max(1))
        .collect();
    let partition_axis = counts.iter().position(|&c| c > 1).or(Some(0));

    Ok(Indices::new(&counts)
        .map(|grid| {
            let ul: Vec<usize> = grid.iter().zip(tile_shape).map(|(g, t)| g * t).collect();
            let lr = ul
                .iter()
                .zip(tile_shape.iter().zip(shape))
                .map(|(u, (t, d))| (u + t).min(*d))
                .collect();
            Extent {
                ul,
                lr,
                array_shape: shape.to_vec(),
                partition_axis,
            }
        })
        .collect())
}

/// The extent containing `index`, if any.
pub fn find_extent<'a>(extents: impl IntoIterator<Item = &'a Extent>, index: &[usize]) -> Option<&'a Extent> {
    extents.into_iter().find(|e| e.contains(index))
}

/// Whether `extents` cover `shape` exactly once.
pub fn is_partition<'a>(extents: impl IntoIterator<Item = &'a Extent>, shape: &[usize]) -> bool {
    let extents: Vec<&Extent> = extents.into_iter().collect();
    if extents.iter().any(|e| e.array_shape() != shape) {
        return false;
    }
    let covered: usize = extents.iter().map(|e| e.size()).sum();
    if covered != shape.iter().product::<usize>() {
        return false;
    }
    for (i, a) in extents.iter().enumerate() {
        for b in &extents[i + 1..] {
            if a.intersection(b).is_some() {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_basics() {
        let e = Extent::new(vec![2, 0], vec![5, 4], vec![10, 4]).unwrap();
        assert_eq!(e.ndim(), 2);
        assert_eq!(e.shape(), vec![3, 4]);
        assert_eq!(e.size(), 12);
        assert!(e.contains(&[2, 3]));
        assert!(!e.contains(&[5, 0]));
        assert!(!e.is_full());
        assert!(Extent::full(vec![10, 4]).is_full());
    }

    #[test]
    fn invalid_extents_rejected() {
        assert_eq!(
            Extent::new(vec![0], vec![11], vec![10]),
            Err(ExtentError::OutOfBounds { axis: 0, value: 11, bound: 10 })
        );
        assert_eq!(
            Extent::new(vec![4], vec![3], vec![10]),
            Err(ExtentError::Inverted { axis: 0 })
        );
        assert!(matches!(
            Extent::new(vec![0, 0], vec![1], vec![10]),
            Err(ExtentError::RankMismatch { .. })
        ));
    }

    #[test]
    fn intersection_and_offsets() {
        let a = Extent::new(vec![0, 0], vec![4, 4], vec![8, 8]).unwrap();
        let b = Extent::new(vec![2, 3], vec![6, 8], vec![8, 8]).unwrap();
        let i = a.intersection(&b).unwrap();
        assert_eq!(i.ul(), &[2, 3]);
        assert_eq!(i.lr(), &[4, 4]);
        assert_eq!(i.offset_in(&b), vec![0, 0]);
        assert_eq!(i.offset_in(&a), vec![2, 3]);

        let c = Extent::new(vec![4, 0], vec![8, 8], vec![8, 8]).unwrap();
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn slabs_partition_shape() {
        for (shape, n) in [(vec![10], 2), (vec![7, 3], 3), (vec![2, 9], 4), (vec![5], 8)] {
            let extents = tile_extents(&shape, n);
            assert!(is_partition(&extents, &shape), "{shape:?} / {n}");
            for idx in Indices::new(&shape) {
                let hits = extents.iter().filter(|e| e.contains(&idx)).count();
                assert_eq!(hits, 1, "index {idx:?}");
            }
        }
    }

    #[test]
    fn two_way_split_of_vector() {
        let extents = tile_extents(&[10], 2);
        assert_eq!(extents.len(), 2);
        assert_eq!((extents[0].ul()[0], extents[0].lr()[0]), (0, 5));
        assert_eq!((extents[1].ul()[0], extents[1].lr()[0]), (5, 10));
        assert_eq!(extents[0].partition_axis(), Some(0));
    }

    #[test]
    fn hinted_grid_partitions_shape() {
        let shape = [5, 7];
        let extents = tile_extents_with_hint(&shape, &[2, 3]).unwrap();
        assert_eq!(extents.len(), 9);
        assert!(is_partition(&extents, &shape));
        let e = find_extent(&extents, &[4, 6]).unwrap();
        assert_eq!(e.ul(), &[4, 6]);
        assert_eq!(e.lr(), &[5, 7]);

        assert_eq!(
            tile_extents_with_hint(&shape, &[2, 0]),
            Err(ExtentError::ZeroTile { axis: 1 })
        );
    }

    #[test]
    fn overlapping_extents_are_not_a_partition() {
        let a = Extent::new(vec![0], vec![6], vec![10]).unwrap();
        let b = Extent::new(vec![5], vec![10], vec![10]).unwrap();
        assert!(!is_partition([&a, &b], &[10]));
        let c = Extent::new(vec![6], vec![10], vec![10]).unwrap();
        assert!(is_partition([&a, &c], &[10]));
    }

    #[test]
    fn vector_collapses_past_last_axis() {
        let tiles = tile_extents(&[10], 2);
        let a = tiles[0].change_partition_axis(1);
        let b = tiles[1].change_partition_axis(1);
        assert_eq!(a, b);
        assert!(a.is_full());
    }

    #[test]
    fn change_to_same_axis_is_identity() {
        let tiles = tile_extents(&[10], 2);
        assert_eq!(tiles[1].change_partition_axis(0), tiles[1]);
    }

    #[test]
    fn change_axis_carries_fraction() {
        let tiles = tile_extents(&[8, 4], 2);
        let moved: Vec<Extent> = tiles.iter().map(|t| t.change_partition_axis(1)).collect();
        assert_eq!(moved[0].ul(), &[0, 0]);
        assert_eq!(moved[0].lr(), &[8, 2]);
        assert_eq!(moved[1].ul(), &[0, 2]);
        assert_eq!(moved[1].lr(), &[8, 4]);
        assert!(is_partition(&moved, &[8, 4]));
    }

    #[test]
    fn drop_axis_shifts_partition() {
        let e = Extent::new(vec![0, 2, 0], vec![3, 4, 5], vec![3, 6, 5])
            .unwrap()
            .with_partition_axis(Some(1));
        let d = e.drop_axis(0);
        assert_eq!(d.ul(), &[2, 0]);
        assert_eq!(d.array_shape(), &[6, 5]);
        assert_eq!(d.partition_axis(), Some(0));
        assert_eq!(e.drop_axis(1).partition_axis(), None);
    }

    #[test]
    fn ravel_roundtrip_and_indices() {
        let shape = [3, 4, 2];
        for (linear, idx) in Indices::new(&shape).enumerate() {
            assert_eq!(ravel(&idx, &shape), linear);
            assert_eq!(unravel(linear, &shape), idx);
        }
        assert_eq!(Indices::new(&shape).count(), 24);
        assert_eq!(Indices::new(&[]).count(), 1);
        assert_eq!(Indices::new(&[3, 0]).count(), 0);
    }
}
