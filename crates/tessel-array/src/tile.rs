use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::extent::{ravel, unravel, Indices};
use crate::reduce::ReduceOp;

/// Logical element type of an array.
///
/// Tile values travel as `f64`; `cast` narrows a value to what the
/// element type can hold when it is written into a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[default]
    F64,
    F32,
    I64,
}

impl DType {
    pub fn cast(self, v: f64) -> f64 {
        match self {
            DType::F64 => v,
            DType::F32 => v as f32 as f64,
            DType::I64 if v.is_finite() => v.trunc(),
            DType::I64 => v,
        }
    }
}

/// Errors from tile arithmetic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TileError {
    /// Data length does not match the shape.
    LengthMismatch { expected: usize, got: usize },
    /// Two tiles that must agree in shape do not.
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    /// A region does not fit inside the tile.
    RegionOutOfBounds { offset: Vec<usize>, shape: Vec<usize>, tile: Vec<usize> },
    /// Reduction axis past the tile's rank.
    AxisOutOfRange { axis: usize, ndim: usize },
}

impl fmt::Display for TileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch { expected, got } => {
                write!(f, "expected {expected} values, got {got}")
            }
            Self::ShapeMismatch { expected, got } => {
                write!(f, "shape mismatch: expected {expected:?}, got {got:?}")
            }
            Self::RegionOutOfBounds { offset, shape, tile } => {
                write!(f, "region {shape:?} at {offset:?} does not fit tile {tile:?}")
            }
            Self::AxisOutOfRange { axis, ndim } => {
                write!(f, "axis {axis} out of range for {ndim}-d tile")
            }
        }
    }
}

impl std::error::Error for TileError {}

/// Storage of a tile's values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TileData {
    /// Row-major values, one per element.
    Dense(Vec<f64>),
    /// Stored entries keyed by row-major local index; absent entries read as zero.
    Sparse(BTreeMap<u64, f64>),
}

/// A contiguous chunk of one array's data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    shape: Vec<usize>,
    data: TileData,
}

impl Tile {
    /// Dense tile from row-major values.
    pub fn from_vec(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, TileError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(TileError::LengthMismatch {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape,
            data: TileData::Dense(data),
        })
    }

    /// Dense tile with every element set to `value`.
    pub fn filled(shape: Vec<usize>, value: f64) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: TileData::Dense(vec![value; n]),
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::filled(shape, 0.0)
    }

    /// 0-d tile holding one value.
    pub fn scalar(value: f64) -> Self {
        Self::filled(Vec::new(), value)
    }

    /// 1-D dense tile from a slice.
    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            shape: vec![values.len()],
            data: TileData::Dense(values.to_vec()),
        }
    }

    /// Empty sparse tile.
    pub fn sparse(shape: Vec<usize>) -> Self {
        Self {
            shape,
            data: TileData::Sparse(BTreeMap::new()),
        }
    }

    /// Sparse tile from `(multi-index, value)` entries.
    pub fn sparse_from(
        shape: Vec<usize>,
        entries: impl IntoIterator<Item = (Vec<usize>, f64)>,
    ) -> Result<Self, TileError> {
        let mut map = BTreeMap::new();
        for (idx, v) in entries {
            if idx.len() != shape.len() || idx.iter().zip(&shape).any(|(i, d)| i >= d) {
                return Err(TileError::RegionOutOfBounds {
                    offset: idx,
                    shape: vec![1; shape.len()],
                    tile: shape,
                });
            }
            map.insert(ravel(&idx, &shape) as u64, v);
        }
        Ok(Self {
            shape,
            data: TileData::Sparse(map),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements (a 0-d tile has one).
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> &TileData {
        &self.data
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.data, TileData::Sparse(_))
    }

    /// Value at a local multi-index.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.ndim() || index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return None;
        }
        let linear = ravel(index, &self.shape);
        match &self.data {
            TileData::Dense(v) => v.get(linear).copied(),
            TileData::Sparse(m) => Some(m.get(&(linear as u64)).copied().unwrap_or(0.0)),
        }
    }

    /// Row-major values with absent sparse entries as zero.
    pub fn values(&self) -> Vec<f64> {
        self.values_or(0.0)
    }

    /// Row-major values with absent sparse entries read as `fill`.
    fn values_or(&self, fill: f64) -> Vec<f64> {
        match &self.data {
            TileData::Dense(v) => v.clone(),
            TileData::Sparse(m) => {
                let mut out = vec![fill; self.numel()];
                for (&k, &v) in m {
                    out[k as usize] = v;
                }
                out
            }
        }
    }

    pub fn to_dense(&self) -> Tile {
        Tile {
            shape: self.shape.clone(),
            data: TileData::Dense(self.values()),
        }
    }

    fn check_region(&self, offset: &[usize], shape: &[usize]) -> Result<(), TileError> {
        let fits = offset.len() == self.ndim()
            && shape.len() == self.ndim()
            && (0..self.ndim()).all(|a| offset[a] + shape[a] <= self.shape[a]);
        if fits {
            Ok(())
        } else {
            Err(TileError::RegionOutOfBounds {
                offset: offset.to_vec(),
                shape: shape.to_vec(),
                tile: self.shape.clone(),
            })
        }
    }

    /// Copy out the sub-region at `offset` with the given shape.
    pub fn slice(&self, offset: &[usize], shape: &[usize]) -> Result<Tile, TileError> {
        self.check_region(offset, shape)?;
        if offset.iter().all(|&o| o == 0) && shape == self.shape.as_slice() {
            return Ok(self.clone());
        }
        let data = match &self.data {
            TileData::Dense(v) => TileData::Dense(
                Indices::new(shape)
                    .map(|idx| v[self.linear_at(offset, &idx)])
                    .collect(),
            ),
            TileData::Sparse(m) => {
                let mut out = BTreeMap::new();
                for (&k, &v) in m {
                    let idx = unravel(k as usize, &self.shape);
                    let inside = (0..self.ndim())
                        .all(|a| idx[a] >= offset[a] && idx[a] < offset[a] + shape[a]);
                    if inside {
                        let local: Vec<usize> = idx.iter().zip(offset).map(|(i, o)| i - o).collect();
                        out.insert(ravel(&local, shape) as u64, v);
                    }
                }
                TileData::Sparse(out)
            }
        };
        Ok(Tile {
            shape: shape.to_vec(),
            data,
        })
    }

    fn linear_at(&self, offset: &[usize], local: &[usize]) -> usize {
        let global: Vec<usize> = local.iter().zip(offset).map(|(i, o)| i + o).collect();
        ravel(&global, &self.shape)
    }

    /// Combine `incoming` into the region starting at `offset`.
    ///
    /// Sparse targets treat absent entries as unwritten: the first
    /// contribution to an entry is stored as is. A dense contribution to a
    /// sparse target densifies it, with absent entries set to the identity
    /// of `op`.
    pub fn combine_region(
        &mut self,
        offset: &[usize],
        incoming: &Tile,
        op: ReduceOp,
    ) -> Result<(), TileError> {
        self.check_region(offset, &incoming.shape)?;

        if self.is_sparse() && !incoming.is_sparse() {
            self.data = TileData::Dense(self.values_or(op.identity()));
        }

        let shape = self.shape.clone();
        let target_linear = |local: &[usize]| -> usize {
            let global: Vec<usize> = local.iter().zip(offset).map(|(i, o)| i + o).collect();
            ravel(&global, &shape)
        };

        match (&mut self.data, &incoming.data) {
            (TileData::Dense(dst), TileData::Dense(src)) => {
                for (k, idx) in Indices::new(&incoming.shape).enumerate() {
                    let t = target_linear(&idx);
                    dst[t] = op.combine(dst[t], src[k]);
                }
            }
            (TileData::Dense(dst), TileData::Sparse(src)) => {
                for (&k, &v) in src {
                    let t = target_linear(&unravel(k as usize, &incoming.shape));
                    dst[t] = op.combine(dst[t], v);
                }
            }
            (TileData::Sparse(dst), TileData::Sparse(src)) => {
                for (&k, &v) in src {
                    let t = target_linear(&unravel(k as usize, &incoming.shape)) as u64;
                    dst.entry(t)
                        .and_modify(|cur| *cur = op.combine(*cur, v))
                        .or_insert(v);
                }
            }
            (TileData::Sparse(_), TileData::Dense(_)) => unreachable!("densified above"),
        }
        Ok(())
    }

    /// Apply `f` to every element; the result is dense.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tile {
        Tile {
            shape: self.shape.clone(),
            data: TileData::Dense(self.values().into_iter().map(f).collect()),
        }
    }

    /// Combine two equally shaped tiles element by element.
    pub fn zip_with(&self, other: &Tile, f: impl Fn(f64, f64) -> f64) -> Result<Tile, TileError> {
        if self.shape != other.shape {
            return Err(TileError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        let data = self
            .values()
            .into_iter()
            .zip(other.values())
            .map(|(a, b)| f(a, b))
            .collect();
        Ok(Tile {
            shape: self.shape.clone(),
            data: TileData::Dense(data),
        })
    }

    /// Narrow every value to `dtype`.
    pub fn cast(&self, dtype: DType) -> Tile {
        if dtype == DType::F64 {
            return self.clone();
        }
        let data = match &self.data {
            TileData::Dense(v) => TileData::Dense(v.iter().map(|&x| dtype.cast(x)).collect()),
            TileData::Sparse(m) => {
                TileData::Sparse(m.iter().map(|(&k, &x)| (k, dtype.cast(x))).collect())
            }
        };
        Tile {
            shape: self.shape.clone(),
            data,
        }
    }

    pub fn sum(&self) -> f64 {
        match &self.data {
            TileData::Dense(v) => v.iter().sum(),
            TileData::Sparse(m) => m.values().sum(),
        }
    }

    /// Reduce along `axis`, or over every element when `axis` is `None`.
    pub fn reduce_axis(&self, axis: Option<usize>, op: ReduceOp) -> Result<Tile, TileError> {
        let values = self.values();
        let Some(axis) = axis else {
            return Ok(Tile::scalar(op.fold(values)));
        };
        if axis >= self.ndim() {
            return Err(TileError::AxisOutOfRange {
                axis,
                ndim: self.ndim(),
            });
        }
        let out_shape: Vec<usize> = self
            .shape
            .iter()
            .enumerate()
            .filter(|&(a, _)| a != axis)
            .map(|(_, &d)| d)
            .collect();
        let mut out = vec![op.identity(); out_shape.iter().product()];
        for (k, idx) in Indices::new(&self.shape).enumerate() {
            let mut reduced = idx;
            reduced.remove(axis);
            let t = ravel(&reduced, &out_shape);
            out[t] = op.combine(out[t], values[k]);
        }
        Tile::from_vec(out_shape, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: usize, cols: usize) -> Tile {
        let data = (0..rows * cols).map(|i| i as f64).collect();
        Tile::from_vec(vec![rows, cols], data).unwrap()
    }

    #[test]
    fn from_vec_checks_length() {
        assert_eq!(
            Tile::from_vec(vec![2, 2], vec![1.0; 3]),
            Err(TileError::LengthMismatch { expected: 4, got: 3 })
        );
        assert_eq!(Tile::scalar(3.0).numel(), 1);
    }

    #[test]
    fn slice_dense_region() {
        let t = grid(3, 4);
        let s = t.slice(&[1, 1], &[2, 2]).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.values(), vec![5.0, 6.0, 9.0, 10.0]);
        assert!(t.slice(&[2, 3], &[2, 2]).is_err());
    }

    #[test]
    fn slice_sparse_region() {
        let t = Tile::sparse_from(vec![4, 4], [(vec![0, 0], 1.0), (vec![2, 3], 7.0)]).unwrap();
        let s = t.slice(&[2, 2], &[2, 2]).unwrap();
        assert!(s.is_sparse());
        assert_eq!(s.get(&[0, 1]), Some(7.0));
        assert_eq!(s.get(&[0, 0]), Some(0.0));
        assert_eq!(s.sum(), 7.0);
    }

    #[test]
    fn combine_region_accumulates() {
        let mut t = Tile::zeros(vec![3, 3]);
        let patch = Tile::filled(vec![2, 2], 1.5);
        t.combine_region(&[1, 1], &patch, ReduceOp::Sum).unwrap();
        t.combine_region(&[0, 0], &patch, ReduceOp::Sum).unwrap();
        assert_eq!(t.get(&[1, 1]), Some(3.0));
        assert_eq!(t.get(&[0, 0]), Some(1.5));
        assert_eq!(t.get(&[2, 2]), Some(1.5));
        assert_eq!(t.get(&[0, 2]), Some(0.0));
        assert!(t.combine_region(&[2, 2], &patch, ReduceOp::Sum).is_err());
    }

    #[test]
    fn combine_with_max_from_identity() {
        let mut t = Tile::filled(vec![2], ReduceOp::Max.identity());
        t.combine_region(&[0], &Tile::from_slice(&[-4.0, 2.0]), ReduceOp::Max).unwrap();
        t.combine_region(&[0], &Tile::from_slice(&[-5.0, 9.0]), ReduceOp::Max).unwrap();
        assert_eq!(t.values(), vec![-4.0, 9.0]);
    }

    #[test]
    fn sparse_into_sparse_keeps_sparsity() {
        let mut t = Tile::sparse(vec![5]);
        let a = Tile::sparse_from(vec![2], [(vec![1], 2.0)]).unwrap();
        t.combine_region(&[3], &a, ReduceOp::Sum).unwrap();
        t.combine_region(&[3], &a, ReduceOp::Sum).unwrap();
        assert!(t.is_sparse());
        assert_eq!(t.values(), vec![0.0, 0.0, 0.0, 0.0, 4.0]);

        t.combine_region(&[0], &Tile::from_slice(&[1.0]), ReduceOp::Sum).unwrap();
        assert!(!t.is_sparse());
        assert_eq!(t.values(), vec![1.0, 0.0, 0.0, 0.0, 4.0]);
    }

    #[test]
    fn densified_sparse_starts_from_identity() {
        let mut t = Tile::sparse(vec![3]);
        t.combine_region(&[1], &Tile::from_slice(&[-2.0, 5.0]), ReduceOp::Prod).unwrap();
        assert!(!t.is_sparse());
        assert_eq!(t.values(), vec![1.0, -2.0, 5.0]);

        let mut t = Tile::sparse_from(vec![2], [(vec![0], -7.0)]).unwrap();
        t.combine_region(&[0], &Tile::from_slice(&[-9.0, -1.0]), ReduceOp::Max).unwrap();
        assert_eq!(t.values(), vec![-7.0, -1.0]);
    }

    #[test]
    fn reduce_along_axes() {
        let t = grid(2, 3);
        assert_eq!(t.reduce_axis(Some(0), ReduceOp::Sum).unwrap().values(), vec![3.0, 5.0, 7.0]);
        assert_eq!(t.reduce_axis(Some(1), ReduceOp::Max).unwrap().values(), vec![2.0, 5.0]);
        let all = t.reduce_axis(None, ReduceOp::Sum).unwrap();
        assert_eq!(all.shape(), &[] as &[usize]);
        assert_eq!(all.values(), vec![15.0]);
        assert_eq!(
            t.reduce_axis(Some(2), ReduceOp::Sum),
            Err(TileError::AxisOutOfRange { axis: 2, ndim: 2 })
        );
    }

    #[test]
    fn zip_and_cast() {
        let a = Tile::from_slice(&[1.5, 2.5]);
        let b = Tile::from_slice(&[2.0, -1.0]);
        assert_eq!(a.zip_with(&b, |x, y| x * y).unwrap().values(), vec![3.0, -2.5]);
        assert!(a.zip_with(&Tile::from_slice(&[1.0]), |x, _| x).is_err());
        assert_eq!(a.cast(DType::I64).values(), vec![1.0, 2.0]);
        assert_eq!(DType::F32.cast(0.1), 0.1_f32 as f64);
    }
}
