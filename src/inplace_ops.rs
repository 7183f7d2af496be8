use crate::error::check_same_shape;
use crate::{Backend, Result, Tensor, WithDType, WithDTypeF};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }
}

macro_rules! binary_op {
    ($ipn:ident, $n_:ident, $bn_:ident, $v:ident) => {
        pub fn $ipn(&self, other: &Self) -> Result<()> {
            self.inplace_binary(other, BinaryOp::$v)
        }

        pub fn $n_(&self, lhs: &Self, rhs: &Self) -> Result<()> {
            self.binary_(lhs, rhs, BinaryOp::$v)
        }

        pub fn $bn_(&self, lhs: &Self, rhs: &Self) -> Result<()> {
            self.broadcast_binary_(lhs, rhs, BinaryOp::$v)
        }
    };
}

impl<T: WithDType, B: Backend> Tensor<T, B> {
    pub(crate) fn inplace_binary(&self, other: &Self, op: BinaryOp) -> Result<()> {
        check_same_shape(&self.shape, &other.shape, op.as_str())?;
        let len = self.elem_count();
        let mut dst = self.storage_mut()?;
        let src = other.storage()?;
        B::bin_assign(&mut *dst, &*src, len, op)?;
        Ok(())
    }

    pub fn binary_(&self, lhs: &Self, rhs: &Self, op: BinaryOp) -> Result<()> {
        check_same_shape(&lhs.shape, &rhs.shape, op.as_str())?;
        check_same_shape(&self.shape, &lhs.shape, op.as_str())?;
        let len = self.elem_count();
        let mut dst = self.storage_mut()?;
        let lhs_data = lhs.storage()?;
        let rhs_data = rhs.storage()?;
        B::binary(&mut *dst, &*lhs_data, &*rhs_data, len, op)?;
        Ok(())
    }

    pub fn broadcast_binary_(&self, lhs: &Self, rhs: &Self, op: BinaryOp) -> Result<()> {
        let dst_shape = self.dims();
        let (dst_shape, lhs_strides, rhs_strides) =
            compute_broadcast_strides(dst_shape, lhs.dims(), rhs.dims())?;
        let mut dst = self.storage_mut()?;
        let lhs_data = lhs.storage()?;
        let rhs_data = rhs.storage()?;
        B::broadcast_binary(
            &mut *dst,
            &*lhs_data,
            &*rhs_data,
            &dst_shape,
            &lhs_strides,
            &rhs_strides,
            op,
        )?;
        Ok(())
    }

    binary_op!(inplace_add, add_, broadcast_add_, Add);
    binary_op!(inplace_sub, sub_, broadcast_sub_, Sub);
    binary_op!(inplace_mul, mul_, broadcast_mul_, Mul);
    binary_op!(inplace_div, div_, broadcast_div_, Div);
    binary_op!(inplace_maximum, maximum_, broadcast_maximum_, Maximum);
    binary_op!(inplace_minimum, minimum_, broadcast_minimum_, Minimum);

    pub fn copy_(&self, src: &Self) -> Result<()> {
        check_same_shape(&self.shape, &src.shape, "copy_")?;
        let len = self.elem_count();
        let mut dst = self.storage_mut()?;
        let src_data = src.storage()?;
        B::copy(&mut *dst, &*src_data, len)?;
        Ok(())
    }

    pub fn fill_(&self, value: T) -> Result<()> {
        let len = self.elem_count();
        let mut dst = self.storage_mut()?;
        B::fill(&mut *dst, value, len)?;
        Ok(())
    }

    pub fn scale_(&self, src: &Self, m: T) -> Result<()> {
        self.scale_add_(src, m, T::zero())
    }

    pub fn add_scalar_(&self, src: &Self, a: T) -> Result<()> {
        self.scale_add_(src, T::one(), a)
    }

    pub fn scale_add_(&self, src: &Self, scale: T, add: T) -> Result<()> {
        check_same_shape(&self.shape, &src.shape, "scale_add_")?;
        let len = self.elem_count();
        let mut dst = self.storage_mut()?;
        let src_data = src.storage()?;
        B::scale_add(&mut *dst, &*src_data, scale, add, len)?;
        Ok(())
    }
}

impl<T: WithDTypeF, B: Backend> Tensor<T, B> {
    pub fn reduce_sum_(&self, src: &Self, dim: usize) -> Result<()> {
        let src_dims = src.dims();
        let dim_size = src_dims[dim];
        let outer_size: usize = src_dims[..dim].iter().product::<usize>().max(1);
        let inner_size: usize = src_dims[dim + 1..].iter().product::<usize>().max(1);
        let mut dst = self.storage_mut()?;
        let src_data = src.storage()?;
        B::reduce_sum(&mut *dst, &*src_data, dim_size, outer_size, inner_size)?;
        Ok(())
    }

    pub fn conv2d_(&self, src: &Self, kernel: &Self) -> Result<()> {
        let src_dims = src.dims();
        let kernel_dims = kernel.dims();
        if src_dims.len() != 4 {
            crate::bail!(
                "conv2d input must be 4D (batch, in_channels, h, w), got {:?}",
                src.shape()
            );
        }
        if kernel_dims.len() != 4 {
            crate::bail!(
                "conv2d kernel must be 4D (out_channels, in_channels, kh, kw), got {:?}",
                kernel.shape()
            );
        }

        let batch = src_dims[0];
        let in_channels = src_dims[1];
        let h = src_dims[2];
        let w = src_dims[3];
        let out_channels = kernel_dims[0];
        let kh = kernel_dims[2];
        let kw = kernel_dims[3];

        if kernel_dims[1] != in_channels {
            crate::bail!(
                "conv2d kernel in_channels mismatch: expected {in_channels}, got {}",
                kernel_dims[1]
            );
        }
        if kh > h || kw > w {
            crate::bail!(
                "conv2d kernel {:?} is larger than input {:?}",
                kernel.shape(),
                src.shape()
            );
        }

        let out_h = h - kh + 1;
        let out_w = w - kw + 1;

        let dst_dims = self.dims();
        if dst_dims != [batch, out_channels, out_h, out_w] {
            crate::bail!(
                "conv2d output shape mismatch: expected {:?}, got {:?}",
                [batch, out_channels, out_h, out_w],
                dst_dims
            );
        }

        let mut dst = self.storage_mut()?;
        let src_data = src.storage()?;
        let kernel_data = kernel.storage()?;
        B::conv2d(
            &mut *dst,
            &*src_data,
            &*kernel_data,
            batch,
            in_channels,
            out_channels,
            h,
            w,
            kh,
            kw,
        )
    }
}

/// Compute broadcast strides for lhs and rhs given the output shape.
/// Returns (lhs_strides, rhs_strides) where stride is 0 for broadcast dimensions.
fn compute_broadcast_strides(
    out_shape: &[usize],
    lhs_shape: &[usize],
    rhs_shape: &[usize],
) -> crate::Result<(Vec<usize>, Vec<usize>, Vec<usize>)> {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Broadcast {
        Lhs,
        Rhs,
        None,
    }
    let out_rank = out_shape.len();
    let lhs_rank = lhs_shape.len();
    let rhs_rank = rhs_shape.len();

    let mut lro = Vec::with_capacity(out_rank);
    for (i, out_dim) in out_shape.iter().enumerate() {
        let lhs_dim =
            if i >= out_rank - lhs_rank { lhs_shape[i - (out_rank - lhs_rank)] } else { 1 };
        let rhs_dim =
            if i >= out_rank - rhs_rank { rhs_shape[i - (out_rank - rhs_rank)] } else { 1 };
        if lhs_dim != *out_dim && lhs_dim != 1 {
            crate::bail!("broadcast mismatch: lhs dim {i} is {lhs_dim} but output is {out_dim}",);
        }
        if rhs_dim != *out_dim && rhs_dim != 1 {
            crate::bail!("broadcast mismatch: rhs dim {i} is {rhs_dim} but output is {out_dim}",);
        }
        let broadcast = match (lhs_dim == 1, rhs_dim == 1) {
            (true, false) => Broadcast::Lhs,
            (false, true) => Broadcast::Rhs,
            (false, false) => Broadcast::None,
            (true, true) => continue,
        };
        lro.push((broadcast, *out_dim))
    }

    let mut compact_lro: Vec<(Broadcast, usize)> = Vec::with_capacity(lro.len());
    for (b, dim) in lro {
        match compact_lro.last_mut() {
            Some((last_b, last_dim)) if *last_b == b => {
                *last_dim *= dim;
            }
            _ => compact_lro.push((b, dim)),
        }
    }

    let out_rank = compact_lro.len();
    let mut lhs_strides = vec![0; out_rank];
    let mut rhs_strides = vec![0; out_rank];
    let mut lhs_stride = 1;
    let mut rhs_stride = 1;
    for i in (0..out_rank).rev() {
        let (b, dim) = compact_lro[i];
        match b {
            Broadcast::Lhs => {
                rhs_strides[i] = rhs_stride;
                lhs_strides[i] = 0;
                rhs_stride *= dim;
            }
            Broadcast::Rhs => {
                lhs_strides[i] = lhs_stride;
                rhs_strides[i] = 0;
                lhs_stride *= dim;
            }
            Broadcast::None => {
                lhs_strides[i] = lhs_stride;
                rhs_strides[i] = rhs_stride;
                lhs_stride *= dim;
                rhs_stride *= dim;
            }
        }
    }
    let out_shape = compact_lro.iter().map(|(_, dim)| *dim).collect();
    Ok((out_shape, lhs_strides, rhs_strides))
}
