//! Lazy array expressions.
//!
//! Nodes live in an [`ArrayGraph`] arena and refer to their operands by
//! [`ExprId`]. A builder only accepts ids that already exist, so every
//! edge points at an earlier node and the graph cannot contain a cycle.

use std::fmt;

use serde::{Deserialize, Serialize};
use tessel_array::{DType, ReduceOp, Tile};

use crate::error::SchedulingError;
use crate::kernel::Kwargs;

/// Handle to a node of an [`ArrayGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExprId(pub u32);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArrayExpr {
    /// Data supplied by the caller, scattered onto the cluster.
    Literal {
        data: Tile,
        dtype: DType,
        tile_hint: Option<Vec<usize>>,
        reducer: ReduceOp,
    },
    /// Element-wise kernel over same-shaped inputs, run per tile of the
    /// first input.
    Map {
        inputs: Vec<ExprId>,
        kernel: String,
        kw: Kwargs,
    },
    /// Pairwise kernel over every tile of `a` and every distinct tile of
    /// `b` re-partitioned along `axes.1`.
    Outer {
        a: ExprId,
        b: ExprId,
        axes: (usize, usize),
        kernel: String,
        kw: Kwargs,
        shape: Vec<usize>,
        tile_hint: Option<Vec<usize>>,
        reducer: ReduceOp,
    },
    /// Per-tile partial reduction, combined in the target by `reducer`.
    Reduce {
        input: ExprId,
        axis: Option<usize>,
        kernel: String,
        kw: Kwargs,
        reducer: ReduceOp,
    },
}

impl ArrayExpr {
    pub fn kind(&self) -> &'static str {
        match self {
            ArrayExpr::Literal { .. } => "literal",
            ArrayExpr::Map { .. } => "map",
            ArrayExpr::Outer { .. } => "outer",
            ArrayExpr::Reduce { .. } => "reduce",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ArrayGraph {
    nodes: Vec<ArrayExpr>,
}

impl ArrayGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: ExprId) -> Result<&ArrayExpr, SchedulingError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(SchedulingError::UnknownNode(id.0))
    }

    /// Operands of `id`, in argument order.
    pub fn children(&self, id: ExprId) -> Result<Vec<ExprId>, SchedulingError> {
        Ok(match self.node(id)? {
            ArrayExpr::Literal { .. } => Vec::new(),
            ArrayExpr::Map { inputs, .. } => inputs.clone(),
            ArrayExpr::Outer { a, b, .. } => vec![*a, *b],
            ArrayExpr::Reduce { input, .. } => vec![*input],
        })
    }

    fn push(&mut self, expr: ArrayExpr) -> Result<ExprId, SchedulingError> {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(expr);
        // Reject a node whose shape cannot be derived.
        if let Err(e) = self.compute_shape(id) {
            self.nodes.pop();
            return Err(e);
        }
        Ok(id)
    }

    fn check(&self, ids: &[ExprId]) -> Result<(), SchedulingError> {
        match ids.iter().find(|id| id.0 as usize >= self.nodes.len()) {
            Some(id) => Err(SchedulingError::UnknownNode(id.0)),
            None => Ok(()),
        }
    }

    /// A dense `f64` literal tiled by the default placement.
    pub fn literal(&mut self, data: Tile) -> ExprId {
        self.nodes.push(ArrayExpr::Literal {
            data,
            dtype: DType::F64,
            tile_hint: None,
            reducer: ReduceOp::Sum,
        });
        ExprId(self.nodes.len() as u32 - 1)
    }

    pub fn literal_with(
        &mut self,
        data: Tile,
        dtype: DType,
        tile_hint: Option<Vec<usize>>,
        reducer: ReduceOp,
    ) -> Result<ExprId, SchedulingError> {
        self.push(ArrayExpr::Literal {
            data,
            dtype,
            tile_hint,
            reducer,
        })
    }

    /// `start, start + step, ...` laid out row-major in `shape`.
    pub fn arange(&mut self, shape: &[usize], start: f64, step: f64) -> Result<ExprId, SchedulingError> {
        let n: usize = shape.iter().product();
        let values = (0..n).map(|i| start + step * i as f64).collect();
        let data = Tile::from_vec(shape.to_vec(), values)
            .map_err(|e| SchedulingError::InvalidRegion(e.to_string()))?;
        Ok(self.literal(data))
    }

    pub fn map(&mut self, inputs: &[ExprId], kernel: &str, kw: Kwargs) -> Result<ExprId, SchedulingError> {
        self.check(inputs)?;
        self.push(ArrayExpr::Map {
            inputs: inputs.to_vec(),
            kernel: kernel.to_string(),
            kw,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn outer(
        &mut self,
        a: ExprId,
        b: ExprId,
        axes: (usize, usize),
        kernel: &str,
        kw: Kwargs,
        shape: Vec<usize>,
        tile_hint: Option<Vec<usize>>,
        reducer: ReduceOp,
    ) -> Result<ExprId, SchedulingError> {
        self.check(&[a, b])?;
        self.push(ArrayExpr::Outer {
            a,
            b,
            axes,
            kernel: kernel.to_string(),
            kw,
            shape,
            tile_hint,
            reducer,
        })
    }

    pub fn reduce(
        &mut self,
        input: ExprId,
        axis: Option<usize>,
        kernel: &str,
        kw: Kwargs,
        reducer: ReduceOp,
    ) -> Result<ExprId, SchedulingError> {
        self.check(&[input])?;
        self.push(ArrayExpr::Reduce {
            input,
            axis,
            kernel: kernel.to_string(),
            kw,
            reducer,
        })
    }

    /// Output shape of `id`, derived from metadata only.
    pub fn compute_shape(&self, id: ExprId) -> Result<Vec<usize>, SchedulingError> {
        match self.node(id)? {
            ArrayExpr::Literal { data, .. } => Ok(data.shape().to_vec()),
            ArrayExpr::Map { inputs, .. } => {
                let (first, rest) = inputs.split_first().ok_or_else(|| {
                    SchedulingError::InvalidRegion(format!("{id}: map without inputs"))
                })?;
                let shape = self.compute_shape(*first)?;
                for input in rest {
                    let other = self.compute_shape(*input)?;
                    if other != shape {
                        return Err(SchedulingError::ShapeMismatch {
                            expected: shape,
                            got: other,
                        });
                    }
                }
                Ok(shape)
            }
            ArrayExpr::Outer { shape, .. } => Ok(shape.clone()),
            ArrayExpr::Reduce { input, axis, .. } => {
                let mut shape = self.compute_shape(*input)?;
                match axis {
                    None => Ok(Vec::new()),
                    Some(axis) if *axis < shape.len() => {
                        shape.remove(*axis);
                        Ok(shape)
                    }
                    Some(axis) => Err(SchedulingError::InvalidRegion(format!(
                        "{id}: axis {axis} out of range for {shape:?}"
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_follow_node_kinds() {
        let mut g = ArrayGraph::new();
        let x = g.arange(&[4, 3], 0.0, 1.0).unwrap();
        let y = g.map(&[x, x], "add", Kwargs::new()).unwrap();
        let r = g.reduce(y, Some(0), "sum", Kwargs::new(), ReduceOp::Sum).unwrap();
        let all = g.reduce(y, None, "sum", Kwargs::new(), ReduceOp::Sum).unwrap();
        let o = g
            .outer(x, x, (0, 0), "outer_dot", Kwargs::new(), vec![4, 3], None, ReduceOp::Sum)
            .unwrap();

        assert_eq!(g.compute_shape(y).unwrap(), vec![4, 3]);
        assert_eq!(g.compute_shape(r).unwrap(), vec![3]);
        assert_eq!(g.compute_shape(all).unwrap(), Vec::<usize>::new());
        assert_eq!(g.compute_shape(o).unwrap(), vec![4, 3]);
        assert_eq!(g.children(o).unwrap(), vec![x, x]);
        assert_eq!(g.len(), 5);
    }

    #[test]
    fn arange_fills_row_major() {
        let mut g = ArrayGraph::new();
        let x = g.arange(&[2, 2], 1.0, 0.5).unwrap();
        match g.node(x).unwrap() {
            ArrayExpr::Literal { data, .. } => assert_eq!(data.values(), vec![1.0, 1.5, 2.0, 2.5]),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn bad_nodes_are_rejected() {
        let mut g = ArrayGraph::new();
        let x = g.arange(&[4], 0.0, 1.0).unwrap();
        let y = g.arange(&[5], 0.0, 1.0).unwrap();

        assert!(matches!(
            g.map(&[x, ExprId(9)], "add", Kwargs::new()),
            Err(SchedulingError::UnknownNode(9))
        ));
        assert!(matches!(
            g.map(&[x, y], "add", Kwargs::new()),
            Err(SchedulingError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            g.reduce(x, Some(1), "sum", Kwargs::new(), ReduceOp::Sum),
            Err(SchedulingError::InvalidRegion(_))
        ));
        assert!(g.map(&[], "add", Kwargs::new()).is_err());
        assert_eq!(g.len(), 2);
    }
}
