use crate::{Backend, Error, Result, Shape, Tensor, WithDType};
use std::sync::{Arc, RwLock};

/// Compute the layout of a diagonal subtensor view over a contiguous tensor.
///
/// The view slices `axis_i` down to `dims[axis_i] - dims[axis_j] + 1` entries
/// and skews `axis_j` so that stepping along it also steps backwards along
/// `axis_i`. Element `(.., a, .., b, ..)` of the view (with `a` on `axis_i`
/// and `b` on `axis_j`) reads element `(.., a + dims[axis_j] - 1 - b, .., b, ..)`
/// of the source. The skew makes the stride of `axis_j` negative, which is why
/// strides are returned as `isize`.
///
/// Returns `(view_dims, signed_strides, start_offset)`.
fn diagonal_layout(
    dims: &[usize],
    axis_i: usize,
    axis_j: usize,
    op: &'static str,
) -> Result<(Vec<usize>, Vec<isize>, usize)> {
    let rank = dims.len();
    if axis_i >= rank || axis_j >= rank || axis_i == axis_j || dims[axis_i] < dims[axis_j] {
        return Err(Error::InvalidAxis {
            axis_i,
            axis_j,
            shape: Shape::from(dims),
            op,
        }
        .bt());
    }

    let strides = Shape::from(dims).stride_contiguous();
    let mut view_dims = dims.to_vec();
    view_dims[axis_i] = dims[axis_i] - dims[axis_j] + 1;

    let mut signed_strides: Vec<isize> = strides.iter().map(|&s| s as isize).collect();
    signed_strides[axis_j] = strides[axis_j] as isize - strides[axis_i] as isize;

    let start_offset = (dims[axis_j] - 1) * strides[axis_i];
    Ok((view_dims, signed_strides, start_offset))
}

/// A zero-copy diagonal subtensor view of a contiguous tensor.
///
/// Shares storage with the source tensor; materialize with `contiguous`.
pub struct DiagonalView<T: WithDType, B: Backend> {
    data: Arc<RwLock<B::Storage<T>>>,
    shape: Shape,
    device: B,
    strides: Vec<isize>,
    start_offset: usize,
}

impl<T: WithDType, B: Backend> Clone for DiagonalView<T, B> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            shape: self.shape.clone(),
            device: self.device.clone(),
            strides: self.strides.clone(),
            start_offset: self.start_offset,
        }
    }
}

impl<T: WithDType, B: Backend> DiagonalView<T, B> {
    /// Build the diagonal view of `tensor` over axes `axis_i` and `axis_j`.
    ///
    /// Requires `axis_i != axis_j`, both in range, and
    /// `dims[axis_i] >= dims[axis_j]`. The source tensor is not modified.
    pub fn new(tensor: &Tensor<T, B>, axis_i: usize, axis_j: usize) -> Result<Self> {
        let (view_dims, strides, start_offset) =
            diagonal_layout(tensor.dims(), axis_i, axis_j, "diagonal_view")?;
        Ok(Self {
            data: Arc::clone(&tensor.data),
            shape: Shape::from(view_dims),
            device: tensor.device().clone(),
            strides,
            start_offset,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    /// Materialize the view into a contiguous tensor.
    #[tracing::instrument(skip_all)]
    pub fn contiguous(&self) -> Result<Tensor<T, B>> {
        let result: Tensor<T, B> =
            unsafe { Tensor::alloc_uninit(self.shape.clone(), &self.device) }?;
        {
            let src_data = self.data.read().map_err(|e| {
                crate::Error::msg(format!("failed to borrow tensor storage immutably: {}", e))
            })?;
            let mut dst_data = result.storage_mut()?;
            B::gather_strided(
                &mut dst_data,
                &*src_data,
                self.start_offset,
                self.dims(),
                &self.strides,
            )?;
        }
        Ok(result)
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.contiguous()?.to_vec()
    }
}

/// Adjoint of the diagonal view: scatter `updates` back through the view
/// layout, summing into a zero-initialized tensor of shape `target_shape`.
///
/// `updates` must have the shape that `DiagonalView::new` would produce for a
/// tensor of `target_shape` and the same axes. Source cells addressed by
/// several view cells receive the sum of all their contributions.
#[tracing::instrument(skip_all)]
pub fn diagonal_accumulate<T: WithDType, B: Backend>(
    target_shape: impl Into<Shape>,
    axis_i: usize,
    axis_j: usize,
    updates: &Tensor<T, B>,
) -> Result<Tensor<T, B>> {
    let target_shape: Shape = target_shape.into();
    let (view_dims, strides, start_offset) =
        diagonal_layout(target_shape.dims(), axis_i, axis_j, "diagonal_accumulate")?;
    if updates.dims() != view_dims.as_slice() {
        return Err(Error::UnexpectedShape {
            msg: "diagonal_accumulate updates shape mismatch".to_string(),
            expected: Shape::from(view_dims),
            got: updates.shape().clone(),
        }
        .bt());
    }

    let result = Tensor::zeros(target_shape, updates.device())?;
    {
        let src_data = updates.storage()?;
        let mut dst_data = result.storage_mut()?;
        B::scatter_add_strided(&mut dst_data, &*src_data, start_offset, &view_dims, &strides)?;
    }
    Ok(result)
}
