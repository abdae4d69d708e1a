//! Reducers: how overlapping writes to one extent are combined.
//!
//! Every op here is associative and commutative and has an identity, so a
//! tile that receives contributions in any order ends up bit-identical as
//! long as the contributions themselves are exact.

use serde::{Deserialize, Serialize};

/// Combine function applied to partial writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Element-wise sum.
    #[default]
    Sum,
    /// Element-wise product.
    Prod,
    /// Element-wise maximum.
    Max,
    /// Element-wise minimum.
    Min,
}

impl ReduceOp {
    /// Value that leaves any other value unchanged under `combine`.
    pub fn identity(self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Prod => 1.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        }
    }

    /// Combine an existing value with an incoming one.
    #[inline]
    pub fn combine(self, current: f64, incoming: f64) -> f64 {
        match self {
            ReduceOp::Sum => current + incoming,
            ReduceOp::Prod => current * incoming,
            ReduceOp::Max => current.max(incoming),
            ReduceOp::Min => current.min(incoming),
        }
    }

    /// Fold a sequence of values, starting from the identity.
    pub fn fold(self, values: impl IntoIterator<Item = f64>) -> f64 {
        values
            .into_iter()
            .fold(self.identity(), |acc, v| self.combine(acc, v))
    }

    /// Combine `incoming` into `target` element by element.
    ///
    /// Both slices must have the same length.
    pub fn combine_into(self, target: &mut [f64], incoming: &[f64]) {
        debug_assert_eq!(target.len(), incoming.len());
        for (t, v) in target.iter_mut().zip(incoming) {
            *t = self.combine(*t, *v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_combine() {
        let mut acc = vec![1.0, 2.0, 3.0];
        ReduceOp::Sum.combine_into(&mut acc, &[3.0, 4.0, 5.0]);
        assert_eq!(acc, vec![4.0, 6.0, 8.0]);
    }

    #[test]
    fn identities_are_neutral() {
        for op in [ReduceOp::Sum, ReduceOp::Prod, ReduceOp::Max, ReduceOp::Min] {
            for v in [-3.5, 0.0, 2.0, 1e9] {
                assert_eq!(op.combine(op.identity(), v), v, "{op:?} {v}");
            }
        }
    }

    #[test]
    fn fold_is_order_independent_on_exact_values() {
        let values = [3.0, -1.0, 8.0, 2.0, 5.0];
        let mut reversed = values;
        reversed.reverse();
        for op in [ReduceOp::Sum, ReduceOp::Prod, ReduceOp::Max, ReduceOp::Min] {
            assert_eq!(op.fold(values), op.fold(reversed));
        }
        assert_eq!(ReduceOp::Max.fold(values), 8.0);
        assert_eq!(ReduceOp::Min.fold(values), -1.0);
        assert_eq!(ReduceOp::Sum.fold([]), 0.0);
    }
}
