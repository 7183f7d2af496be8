pub mod backend;
pub mod conv3d;
pub mod cpu_backend;
pub mod diagonal;
pub mod dtype;
pub mod error;
pub mod inplace_ops;
pub mod ops;
pub mod shape;
pub mod tensor;
pub mod tensor_view;

pub use backend::Backend;
pub use conv3d::{BorderMode, conv3d, conv3d_backward};
pub use diagonal::{DiagonalView, diagonal_accumulate};
pub use dtype::{DType, WithDType, WithDTypeF};
pub use error::{Error, Result};
pub use shape::{D, Dim, Shape};
pub use tensor::Tensor;
pub use tensor_view::TensorView;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CpuDevice;
pub type CpuTensor<T> = Tensor<T, CpuDevice>;

pub const CPU: CpuDevice = CpuDevice;

pub(crate) use inplace_ops::BinaryOp;
