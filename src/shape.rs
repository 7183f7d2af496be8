use crate::{Error, Result};

#[derive(Clone, PartialEq, Eq)]
pub struct Shape(Vec<usize>);

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<&Shape> for Shape {
    fn from(shape: &Shape) -> Self {
        Self(shape.0.to_vec())
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Self(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d1: usize) -> Self {
        Self(vec![d1])
    }
}

impl From<(usize,)> for Shape {
    fn from((d1,): (usize,)) -> Self {
        Self(vec![d1])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d1, d2): (usize, usize)) -> Self {
        Self(vec![d1, d2])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d1, d2, d3): (usize, usize, usize)) -> Self {
        Self(vec![d1, d2, d3])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d1, d2, d3, d4): (usize, usize, usize, usize)) -> Self {
        Self(vec![d1, d2, d3, d4])
    }
}

impl From<(usize, usize, usize, usize, usize)> for Shape {
    fn from((d1, d2, d3, d4, d5): (usize, usize, usize, usize, usize)) -> Self {
        Self(vec![d1, d2, d3, d4, d5])
    }
}

impl From<(usize, usize, usize, usize, usize, usize)> for Shape {
    fn from((d1, d2, d3, d4, d5, d6): (usize, usize, usize, usize, usize, usize)) -> Self {
        Self(vec![d1, d2, d3, d4, d5, d6])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

macro_rules! extract_dims {
    ($fn_name:ident, $cnt:tt, $dims:expr, $out_type:ty) => {
        pub fn $fn_name(&self) -> Result<$out_type> {
            if self.0.len() != $cnt {
                Err(Error::UnexpectedNumberOfDims { expected: $cnt, shape: self.clone() }.bt())
            } else {
                Ok($dims(&self.0))
            }
        }
    };
}

impl Shape {
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.0
    }

    /// The total number of elements.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    pub fn dim(&self, dim: impl Dim) -> Result<usize> {
        let dim = dim.to_index(self, "dim")?;
        Ok(self.0[dim])
    }

    extract_dims!(dims0, 0, |_: &Vec<usize>| (), ());
    extract_dims!(dims1, 1, |d: &[usize]| d[0], usize);
    extract_dims!(dims2, 2, |d: &[usize]| (d[0], d[1]), (usize, usize));
    extract_dims!(dims3, 3, |d: &[usize]| (d[0], d[1], d[2]), (usize, usize, usize));
    extract_dims!(dims4, 4, |d: &[usize]| (d[0], d[1], d[2], d[3]), (usize, usize, usize, usize));
    extract_dims!(
        dims5,
        5,
        |d: &[usize]| (d[0], d[1], d[2], d[3], d[4]),
        (usize, usize, usize, usize, usize)
    );
    extract_dims!(
        dims6,
        6,
        |d: &[usize]| (d[0], d[1], d[2], d[3], d[4], d[5]),
        (usize, usize, usize, usize, usize, usize)
    );

    /// The strides of a contiguous row-major layout for this shape, in number
    /// of elements.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut stride: Vec<_> = self
            .0
            .iter()
            .rev()
            .scan(1, |prod, u| {
                let prod_pre_mult = *prod;
                *prod *= u;
                Some(prod_pre_mult)
            })
            .collect();
        stride.reverse();
        stride
    }

    /// Whether the given strides describe a contiguous row-major layout for
    /// this shape. Dimensions of size 1 are ignored as their stride is never
    /// used.
    pub fn is_contiguous(&self, strides: &[usize]) -> bool {
        if self.0.len() != strides.len() {
            return false;
        }
        let mut acc = 1;
        for (&stride, &dim) in strides.iter().zip(self.0.iter()).rev() {
            if dim > 1 && stride != acc {
                return false;
            }
            acc *= dim;
        }
        true
    }
}

/// A dimension index, supporting negative indexing from the end via `D`.
pub trait Dim {
    fn to_index(&self, shape: &Shape, op: &'static str) -> Result<usize>;
    fn to_index_plus_one(&self, shape: &Shape, op: &'static str) -> Result<usize>;
}

impl Dim for usize {
    fn to_index(&self, shape: &Shape, op: &'static str) -> Result<usize> {
        let dim = *self;
        if dim >= shape.rank() {
            Err(Error::DimOutOfRange { shape: shape.clone(), dim: dim as i64, op }.bt())
        } else {
            Ok(dim)
        }
    }

    fn to_index_plus_one(&self, shape: &Shape, op: &'static str) -> Result<usize> {
        let dim = *self;
        if dim > shape.rank() {
            Err(Error::DimOutOfRange { shape: shape.clone(), dim: dim as i64, op }.bt())
        } else {
            Ok(dim)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum D {
    Minus1,
    Minus2,
}

impl D {
    fn out_of_range(&self, shape: &Shape, op: &'static str) -> Error {
        let dim = match self {
            Self::Minus1 => -1,
            Self::Minus2 => -2,
        };
        Error::DimOutOfRange { shape: shape.clone(), dim, op }.bt()
    }
}

impl Dim for D {
    fn to_index(&self, shape: &Shape, op: &'static str) -> Result<usize> {
        let rank = shape.rank();
        match self {
            Self::Minus1 if rank >= 1 => Ok(rank - 1),
            Self::Minus2 if rank >= 2 => Ok(rank - 2),
            _ => Err(self.out_of_range(shape, op)),
        }
    }

    fn to_index_plus_one(&self, shape: &Shape, op: &'static str) -> Result<usize> {
        let rank = shape.rank();
        match self {
            Self::Minus1 if rank >= 1 => Ok(rank),
            Self::Minus2 if rank >= 2 => Ok(rank - 1),
            _ => Err(self.out_of_range(shape, op)),
        }
    }
}

/// A shape specification where at most one dimension is left as a `()` hole to
/// be inferred from the element count, e.g. `reshape((3, ()))`.
pub trait ShapeWithOneHole {
    fn into_shape(self, el_count: usize) -> Result<Shape>;
}

impl<S: Into<Shape>> ShapeWithOneHole for S {
    fn into_shape(self, _el_count: usize) -> Result<Shape> {
        Ok(self.into())
    }
}

fn hole_size(el_count: usize, prod_d: usize, s: &dyn std::fmt::Debug) -> Result<usize> {
    if prod_d == 0 {
        crate::bail!("cannot infer the missing dim size as the total is zero {s:?}")
    }
    let d = el_count / prod_d;
    if d * prod_d != el_count {
        crate::bail!("cannot infer the missing dim size, expected {el_count} elements for {s:?}")
    }
    Ok(d)
}

impl ShapeWithOneHole for ((),) {
    fn into_shape(self, el_count: usize) -> Result<Shape> {
        Ok(el_count.into())
    }
}

impl ShapeWithOneHole for ((), usize) {
    fn into_shape(self, el_count: usize) -> Result<Shape> {
        let ((), d1) = self;
        Ok((hole_size(el_count, d1, &self)?, d1).into())
    }
}

impl ShapeWithOneHole for (usize, ()) {
    fn into_shape(self, el_count: usize) -> Result<Shape> {
        let (d1, ()) = self;
        Ok((d1, hole_size(el_count, d1, &self)?).into())
    }
}

impl ShapeWithOneHole for ((), usize, usize) {
    fn into_shape(self, el_count: usize) -> Result<Shape> {
        let ((), d1, d2) = self;
        Ok((hole_size(el_count, d1 * d2, &self)?, d1, d2).into())
    }
}

impl ShapeWithOneHole for (usize, (), usize) {
    fn into_shape(self, el_count: usize) -> Result<Shape> {
        let (d1, (), d2) = self;
        Ok((d1, hole_size(el_count, d1 * d2, &self)?, d2).into())
    }
}

impl ShapeWithOneHole for (usize, usize, ()) {
    fn into_shape(self, el_count: usize) -> Result<Shape> {
        let (d1, d2, ()) = self;
        Ok((d1, d2, hole_size(el_count, d1 * d2, &self)?).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride() {
        let shape = Shape::from(());
        assert_eq!(shape.stride_contiguous(), Vec::<usize>::new());
        let shape = Shape::from(42);
        assert_eq!(shape.stride_contiguous(), [1]);
        let shape = Shape::from((42, 1337));
        assert_eq!(shape.stride_contiguous(), [1337, 1]);
        let shape = Shape::from((299, 792, 458));
        assert_eq!(shape.stride_contiguous(), [458 * 792, 458, 1]);
    }

    #[test]
    fn contiguous() {
        let shape = Shape::from((5, 4));
        assert!(shape.is_contiguous(&[4, 1]));
        assert!(!shape.is_contiguous(&[4, 2]));
        // Size-1 dims can carry any stride.
        let shape = Shape::from((5, 1, 4));
        assert!(shape.is_contiguous(&[4, 99, 1]));
    }
}
