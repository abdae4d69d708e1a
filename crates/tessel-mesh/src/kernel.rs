//! Tile-local kernels.
//!
//! Kernels are plain functions registered by name. The same registry is
//! installed on every worker, so a task only names its kernel and carries
//! keyword arguments as data.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tessel_array::{Extent, ReduceOp, Tile};

/// A keyword argument value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KwValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<i64> for KwValue {
    fn from(v: i64) -> Self {
        KwValue::Int(v)
    }
}

impl From<f64> for KwValue {
    fn from(v: f64) -> Self {
        KwValue::Float(v)
    }
}

impl From<&str> for KwValue {
    fn from(v: &str) -> Self {
        KwValue::Str(v.to_string())
    }
}

impl From<bool> for KwValue {
    fn from(v: bool) -> Self {
        KwValue::Bool(v)
    }
}

/// Keyword arguments passed through to a kernel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Kwargs(BTreeMap<String, KwValue>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<KwValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&KwValue> {
        self.0.get(key)
    }

    /// A numeric argument; integers are widened.
    pub fn float(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            KwValue::Float(v) => Some(*v),
            KwValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            KwValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            KwValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            KwValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Element-wise kernel: one input tile per operand, one output tile of the
/// same extent.
pub type MapKernel = fn(&Extent, &[Tile], &Kwargs) -> Result<Tile, String>;

/// Pairwise kernel over a tile of `a` and a tile of `b`. Returns writes to
/// the target as `(extent, value)` pairs.
pub type OuterKernel =
    fn(&Extent, &Tile, &Extent, &Tile, &Kwargs) -> Result<Vec<(Extent, Tile)>, String>;

/// Partial reduction of one tile along an axis, or over everything.
pub type ReduceKernel = fn(&Extent, &Tile, Option<usize>, &Kwargs) -> Result<Tile, String>;

/// Named kernels available to workers.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    map: HashMap<String, MapKernel>,
    outer: HashMap<String, OuterKernel>,
    reduce: HashMap<String, ReduceKernel>,
}

impl KernelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in kernels.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_map("add", builtin::add)
            .register_map("sub", builtin::sub)
            .register_map("mul", builtin::mul)
            .register_map("neg", builtin::neg)
            .register_map("square", builtin::square)
            .register_map("scale", builtin::scale)
            .register_outer("outer_dot", builtin::outer_dot)
            .register_outer("outer_product", builtin::outer_product)
            .register_reduce("sum", builtin::sum)
            .register_reduce("max", builtin::max)
            .register_reduce("min", builtin::min);
        registry
    }

    pub fn register_map(&mut self, name: &str, kernel: MapKernel) -> &mut Self {
        self.map.insert(name.to_string(), kernel);
        self
    }

    pub fn register_outer(&mut self, name: &str, kernel: OuterKernel) -> &mut Self {
        self.outer.insert(name.to_string(), kernel);
        self
    }

    pub fn register_reduce(&mut self, name: &str, kernel: ReduceKernel) -> &mut Self {
        self.reduce.insert(name.to_string(), kernel);
        self
    }

    pub fn map(&self, name: &str) -> Option<MapKernel> {
        self.map.get(name).copied()
    }

    pub fn outer(&self, name: &str) -> Option<OuterKernel> {
        self.outer.get(name).copied()
    }

    pub fn reduce(&self, name: &str) -> Option<ReduceKernel> {
        self.reduce.get(name).copied()
    }
}

/// Run a kernel, turning a panic into an error message.
pub fn run_guarded<T>(call: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(if let Some(s) = payload.downcast_ref::<&str>() {
            format!("kernel panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("kernel panicked: {s}")
        } else {
            "kernel panicked".to_string()
        }),
    }
}

/// Built-in kernels.
pub mod builtin {
    use super::*;

    fn binary<'a>(inputs: &'a [Tile]) -> Result<(&'a Tile, &'a Tile), String> {
        match inputs {
            [a, b] => Ok((a, b)),
            _ => Err(format!("expected 2 inputs, got {}", inputs.len())),
        }
    }

    fn unary(inputs: &[Tile]) -> Result<&Tile, String> {
        match inputs {
            [a] => Ok(a),
            _ => Err(format!("expected 1 input, got {}", inputs.len())),
        }
    }

    pub fn add(_: &Extent, inputs: &[Tile], _: &Kwargs) -> Result<Tile, String> {
        let (a, b) = binary(inputs)?;
        a.zip_with(b, |x, y| x + y).map_err(|e| e.to_string())
    }

    pub fn sub(_: &Extent, inputs: &[Tile], _: &Kwargs) -> Result<Tile, String> {
        let (a, b) = binary(inputs)?;
        a.zip_with(b, |x, y| x - y).map_err(|e| e.to_string())
    }

    pub fn mul(_: &Extent, inputs: &[Tile], _: &Kwargs) -> Result<Tile, String> {
        let (a, b) = binary(inputs)?;
        a.zip_with(b, |x, y| x * y).map_err(|e| e.to_string())
    }

    pub fn neg(_: &Extent, inputs: &[Tile], _: &Kwargs) -> Result<Tile, String> {
        Ok(unary(inputs)?.map(|x| -x))
    }

    pub fn square(_: &Extent, inputs: &[Tile], _: &Kwargs) -> Result<Tile, String> {
        Ok(unary(inputs)?.map(|x| x * x))
    }

    /// Multiply by the `factor` keyword argument.
    pub fn scale(_: &Extent, inputs: &[Tile], kw: &Kwargs) -> Result<Tile, String> {
        let factor = kw
            .float("factor")
            .ok_or_else(|| "missing numeric `factor`".to_string())?;
        Ok(unary(inputs)?.map(|x| x * factor))
    }

    /// Contributes `a[i] * sum(b)` at `a`'s extent.
    ///
    /// Summed over every tile of `b`, the target holds `a[i] * Σ_j b[j]`.
    pub fn outer_dot(
        a_ext: &Extent,
        a: &Tile,
        _: &Extent,
        b: &Tile,
        _: &Kwargs,
    ) -> Result<Vec<(Extent, Tile)>, String> {
        let total = b.sum();
        Ok(vec![(a_ext.clone(), a.map(|x| x * total))])
    }

    /// Block `a[i] * b[j]` of the 2-D outer product of two vectors.
    pub fn outer_product(
        a_ext: &Extent,
        a: &Tile,
        b_ext: &Extent,
        b: &Tile,
        _: &Kwargs,
    ) -> Result<Vec<(Extent, Tile)>, String> {
        if a_ext.ndim() != 1 || b_ext.ndim() != 1 {
            return Err("outer_product takes vectors".into());
        }
        let (av, bv) = (a.values(), b.values());
        let data = av
            .iter()
            .flat_map(|x| bv.iter().map(move |y| x * y))
            .collect();
        let target_shape = vec![a_ext.array_shape()[0], b_ext.array_shape()[0]];
        let extent = Extent::new(
            vec![a_ext.ul()[0], b_ext.ul()[0]],
            vec![a_ext.lr()[0], b_ext.lr()[0]],
            target_shape,
        )
        .map_err(|e| e.to_string())?;
        let tile = Tile::from_vec(vec![av.len(), bv.len()], data).map_err(|e| e.to_string())?;
        Ok(vec![(extent, tile)])
    }

    pub fn sum(_: &Extent, tile: &Tile, axis: Option<usize>, _: &Kwargs) -> Result<Tile, String> {
        tile.reduce_axis(axis, ReduceOp::Sum).map_err(|e| e.to_string())
    }

    pub fn max(_: &Extent, tile: &Tile, axis: Option<usize>, _: &Kwargs) -> Result<Tile, String> {
        tile.reduce_axis(axis, ReduceOp::Max).map_err(|e| e.to_string())
    }

    pub fn min(_: &Extent, tile: &Tile, axis: Option<usize>, _: &Kwargs) -> Result<Tile, String> {
        tile.reduce_axis(axis, ReduceOp::Min).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f64], ul: usize, len: usize) -> (Extent, Tile) {
        let ext = Extent::new(vec![ul], vec![ul + values.len()], vec![len]).unwrap();
        (ext, Tile::from_slice(values))
    }

    #[test]
    fn builtins_are_registered() {
        let registry = KernelRegistry::with_builtins();
        for name in ["add", "sub", "mul", "neg", "square", "scale"] {
            assert!(registry.map(name).is_some(), "{name}");
        }
        assert!(registry.outer("outer_dot").is_some());
        assert!(registry.reduce("max").is_some());
        assert!(registry.map("outer_dot").is_none());
    }

    #[test]
    fn scale_needs_factor() {
        let (ext, t) = vector(&[1.0, 2.0], 0, 2);
        let kw = Kwargs::new().with("factor", 3i64);
        assert_eq!(
            builtin::scale(&ext, &[t.clone()], &kw).unwrap().values(),
            vec![3.0, 6.0]
        );
        assert!(builtin::scale(&ext, &[t], &Kwargs::new()).is_err());
    }

    #[test]
    fn outer_product_block_lands_in_target_coordinates() {
        let (a_ext, a) = vector(&[1.0, 2.0], 2, 4);
        let (b_ext, b) = vector(&[10.0, 20.0, 30.0], 0, 3);
        let out = builtin::outer_product(&a_ext, &a, &b_ext, &b, &Kwargs::new()).unwrap();
        let (ext, tile) = &out[0];
        assert_eq!(ext.to_string(), "Extent(2:4, 0:3 of [4, 3])");
        assert_eq!(tile.values(), vec![10.0, 20.0, 30.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn panics_become_errors() {
        let err = run_guarded::<()>(|| panic!("bad tile")).unwrap_err();
        assert!(err.contains("bad tile"));
        assert_eq!(run_guarded(|| Ok(4)), Ok(4));
    }
}
