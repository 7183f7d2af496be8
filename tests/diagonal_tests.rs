use conv3d2d::{Backend, DiagonalView, Result, Tensor, diagonal_accumulate};

macro_rules! cpu_test {
    ($test_name:ident, $test_fn:ident) => {
        #[test]
        fn $test_name() -> Result<()> {
            $test_fn(&conv3d2d::CPU)
        }
    };
}

fn arange<B: Backend>(n: usize, shape: impl conv3d2d::shape::ShapeWithOneHole, dev: &B) -> Result<Tensor<f32, B>> {
    Tensor::from_vec((0..n).map(|x| x as f32).collect(), shape, dev)
}

// =============================================================================
// Diagonal view tests
// =============================================================================

fn test_diagonal_view_2d_impl<B: Backend>(dev: &B) -> Result<()> {
    let x = arange(20, (5, 4), dev)?;
    let v = DiagonalView::new(&x, 0, 1)?;
    assert_eq!(v.dims(), &[2, 4]);
    // Each row walks an anti-diagonal of the source: row a starts at
    // element (a + 3, 0) and moves up one row per step along axis 1.
    assert_eq!(v.to_vec()?, vec![12., 9., 6., 3., 16., 13., 10., 7.]);
    // The source is untouched.
    assert_eq!(x.to_vec()?, (0..20).map(|x| x as f32).collect::<Vec<_>>());
    Ok(())
}
cpu_test!(test_diagonal_view_2d, test_diagonal_view_2d_impl);

fn test_diagonal_view_3d_impl<B: Backend>(dev: &B) -> Result<()> {
    let x = arange(24, (4, 3, 2), dev)?;

    let v01 = DiagonalView::new(&x, 0, 1)?;
    assert_eq!(v01.dims(), &[2, 3, 2]);
    assert_eq!(
        v01.to_vec()?,
        vec![12., 13., 8., 9., 4., 5., 18., 19., 14., 15., 10., 11.]
    );

    let v02 = DiagonalView::new(&x, 0, 2)?;
    assert_eq!(v02.dims(), &[3, 3, 2]);
    assert_eq!(
        v02.to_vec()?,
        vec![6., 1., 8., 3., 10., 5., 12., 7., 14., 9., 16., 11., 18., 13., 20., 15., 22., 17.]
    );
    Ok(())
}
cpu_test!(test_diagonal_view_3d, test_diagonal_view_3d_impl);

fn test_diagonal_view_layout_impl<B: Backend>(dev: &B) -> Result<()> {
    let x = arange(20, (5, 4), dev)?;
    let v = DiagonalView::new(&x, 0, 1)?;
    // (5, 4) has contiguous strides (4, 1); the view starts at the bottom of
    // the first anti-diagonal and steps backwards along axis 0 when moving
    // along axis 1.
    assert_eq!(v.start_offset(), 12);
    assert_eq!(v.strides(), &[4, -3]);
    Ok(())
}
cpu_test!(test_diagonal_view_layout, test_diagonal_view_layout_impl);

/// Taking the diagonal view over the two trailing axes of a 3D tensor is the
/// same as taking the 2D diagonal view of each leading slice.
fn test_diagonal_view_slicewise_impl<B: Backend>(dev: &B) -> Result<()> {
    let x = arange(24, (4, 3, 2), dev)?;
    let v12 = DiagonalView::new(&x, 1, 2)?.contiguous()?;
    for i in 0..4 {
        let xi = x.narrow(0, i..i + 1)?.contiguous()?.reshape((3, 2))?;
        let vi = DiagonalView::new(&xi, 0, 1)?;
        let slice = v12.narrow(0, i..i + 1)?.contiguous()?;
        assert_eq!(slice.to_vec()?, vi.to_vec()?);
    }
    Ok(())
}
cpu_test!(test_diagonal_view_slicewise, test_diagonal_view_slicewise_impl);

fn test_diagonal_view_f16_impl<B: Backend>(dev: &B) -> Result<()> {
    let data: Vec<half::f16> = (0..20).map(|x| half::f16::from_f32(x as f32)).collect();
    let x: Tensor<half::f16, B> = Tensor::from_vec(data, (5, 4), dev)?;
    let v = DiagonalView::new(&x, 0, 1)?;
    let expected: Vec<half::f16> =
        [12., 9., 6., 3., 16., 13., 10., 7.].iter().map(|&x| half::f16::from_f32(x)).collect();
    assert_eq!(v.to_vec()?, expected);
    Ok(())
}
cpu_test!(test_diagonal_view_f16, test_diagonal_view_f16_impl);

fn test_diagonal_view_invalid_axes_impl<B: Backend>(dev: &B) -> Result<()> {
    let x = arange(20, (5, 4), dev)?;
    // Same axis twice.
    assert!(DiagonalView::new(&x, 1, 1).is_err());
    // Out of range.
    assert!(DiagonalView::new(&x, 0, 2).is_err());
    assert!(DiagonalView::new(&x, 2, 0).is_err());
    // Primary axis shorter than secondary axis.
    let y = arange(20, (4, 5), dev)?;
    assert!(DiagonalView::new(&y, 0, 1).is_err());
    Ok(())
}
cpu_test!(test_diagonal_view_invalid_axes, test_diagonal_view_invalid_axes_impl);

// =============================================================================
// Diagonal accumulate tests
// =============================================================================

fn test_diagonal_accumulate_shape_impl<B: Backend>(dev: &B) -> Result<()> {
    let u = Tensor::<f32, B>::full(1.0, (2, 4), dev)?;
    let acc = diagonal_accumulate((5, 4), 0, 1, &u)?;
    assert_eq!(acc.dims(), &[5, 4]);
    // Every view cell lands on a distinct source cell; the rest stay zero.
    assert_eq!(
        acc.to_vec()?,
        vec![
            0., 0., 0., 1., //
            0., 0., 1., 1., //
            0., 1., 1., 0., //
            1., 1., 0., 0., //
            1., 0., 0., 0., //
        ]
    );
    // Shape mismatch between updates and the expected view shape.
    let bad = Tensor::<f32, B>::full(1.0, (3, 4), dev)?;
    assert!(diagonal_accumulate((5, 4), 0, 1, &bad).is_err());
    Ok(())
}
cpu_test!(test_diagonal_accumulate_shape, test_diagonal_accumulate_shape_impl);

/// The accumulate operation is the adjoint of the view gather:
/// <view(x), u> == <x, accumulate(u)> for any x and u.
fn test_diagonal_accumulate_adjoint_impl<B: Backend>(dev: &B) -> Result<()> {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    let mut rng = StdRng::seed_from_u64(42);
    let x_data: Vec<f32> = (0..24).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let u_data: Vec<f32> = (0..12).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let x: Tensor<f32, B> = Tensor::from_vec(x_data, (4, 3, 2), dev)?;
    let u: Tensor<f32, B> = Tensor::from_vec(u_data, (2, 3, 2), dev)?;

    let vx = DiagonalView::new(&x, 0, 1)?.contiguous()?;
    let au = diagonal_accumulate((4, 3, 2), 0, 1, &u)?;

    let lhs: f64 =
        vx.to_vec()?.iter().zip(u.to_vec()?.iter()).map(|(&a, &b)| a as f64 * b as f64).sum();
    let rhs: f64 =
        x.to_vec()?.iter().zip(au.to_vec()?.iter()).map(|(&a, &b)| a as f64 * b as f64).sum();
    assert!((lhs - rhs).abs() < 1e-5, "adjoint mismatch: {lhs} vs {rhs}");
    Ok(())
}
cpu_test!(test_diagonal_accumulate_adjoint, test_diagonal_accumulate_adjoint_impl);
