use conv3d2d::{Backend, BorderMode, Result, Tensor, conv3d, conv3d_backward};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;

macro_rules! cpu_test {
    ($test_name:ident, $test_fn:ident) => {
        #[test]
        fn $test_name() -> Result<()> {
            $test_fn(&conv3d2d::CPU)
        }
    };
}

fn assert_allclose(got: &[f32], want: &[f32], atol: f32, rtol: f32) {
    assert_eq!(got.len(), want.len(), "length mismatch: {} vs {}", got.len(), want.len());
    for (i, (&a, &b)) in got.iter().zip(want.iter()).enumerate() {
        let tol = atol + rtol * b.abs();
        assert!(
            (a - b).abs() <= tol,
            "mismatch at {i}: got {a}, want {b} (tol {tol})"
        );
    }
}

fn rand_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Naive triple-loop 3D correlation used as a test oracle.
/// Signals `(Ns, Ts, C, Hs, Ws)`, filters `(Nf, Tf, C, Hf, Wf)`,
/// output `(Ns, To, Nf, Ho, Wo)`.
#[allow(clippy::too_many_arguments)]
fn reference_conv3d(
    signals: &[f32],
    (ns, ts, c, hs, ws): (usize, usize, usize, usize, usize),
    filters: &[f32],
    (nf, tf, hf, wf): (usize, usize, usize, usize),
    border_mode: BorderMode,
) -> (Vec<f32>, Vec<usize>) {
    // Full mode: zero-pad the signals on the depth and spatial axes, then run
    // the valid path on the padded data.
    let (signals, ts, hs, ws) = match border_mode {
        BorderMode::Valid => (signals.to_vec(), ts, hs, ws),
        BorderMode::Full => {
            let (tsp, hsp, wsp) = (ts + 2 * (tf - 1), hs + 2 * (hf - 1), ws + 2 * (wf - 1));
            let mut padded = vec![0f32; ns * tsp * c * hsp * wsp];
            for n in 0..ns {
                for t in 0..ts {
                    for ch in 0..c {
                        for y in 0..hs {
                            for x in 0..ws {
                                let src = (((n * ts + t) * c + ch) * hs + y) * ws + x;
                                let dst = (((n * tsp + t + tf - 1) * c + ch) * hsp + y + hf - 1)
                                    * wsp
                                    + x
                                    + wf - 1;
                                padded[dst] = signals[src];
                            }
                        }
                    }
                }
            }
            (padded, tsp, hsp, wsp)
        }
    };

    let to = ts - tf + 1;
    let oh = hs - hf + 1;
    let ow = ws - wf + 1;
    let mut out = vec![0f32; ns * to * nf * oh * ow];
    out.par_chunks_mut(nf * oh * ow).enumerate().for_each(|(idx, slab)| {
        let n = idx / to;
        let t0 = idx % to;
        for f in 0..nf {
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = 0f64;
                    for k in 0..tf {
                        for ch in 0..c {
                            for dy in 0..hf {
                                for dx in 0..wf {
                                    let s_idx = (((n * ts + t0 + k) * c + ch) * hs + y + dy) * ws
                                        + x
                                        + dx;
                                    let f_idx =
                                        (((f * tf + k) * c + ch) * hf + dy) * wf + dx;
                                    acc += signals[s_idx] as f64 * filters[f_idx] as f64;
                                }
                            }
                        }
                    }
                    slab[(f * oh + y) * ow + x] = acc as f32;
                }
            }
        }
    });
    (out, vec![ns, to, nf, oh, ow])
}

// =============================================================================
// Forward tests
// =============================================================================

fn test_conv3d_valid_impl<B: Backend>(dev: &B) -> Result<()> {
    let (ns, ts, c, hs, ws) = (3, 10, 3, 32, 32);
    let (nf, tf, hf, wf) = (32, 5, 5, 5);
    let mut rng = StdRng::seed_from_u64(280);
    let s_data = rand_vec(&mut rng, ns * ts * c * hs * ws);
    let f_data = rand_vec(&mut rng, nf * tf * c * hf * wf);

    let signals: Tensor<f32, B> = Tensor::from_vec(s_data.clone(), (ns, ts, c, hs, ws), dev)?;
    let filters: Tensor<f32, B> = Tensor::from_vec(f_data.clone(), (nf, tf, c, hf, wf), dev)?;
    let out = conv3d(&signals, &filters, BorderMode::Valid)?;

    let (want, want_dims) =
        reference_conv3d(&s_data, (ns, ts, c, hs, ws), &f_data, (nf, tf, hf, wf), BorderMode::Valid);
    assert_eq!(out.dims(), want_dims.as_slice());
    assert_allclose(&out.to_vec()?, &want, 1e-3, 1e-4);
    Ok(())
}
cpu_test!(test_conv3d_valid, test_conv3d_valid_impl);

fn test_conv3d_full_impl<B: Backend>(dev: &B) -> Result<()> {
    let (ns, ts, c, hs, ws) = (3, 10, 3, 32, 32);
    let (nf, tf, hf, wf) = (32, 5, 5, 5);
    let mut rng = StdRng::seed_from_u64(281);
    let s_data = rand_vec(&mut rng, ns * ts * c * hs * ws);
    let f_data = rand_vec(&mut rng, nf * tf * c * hf * wf);

    let signals: Tensor<f32, B> = Tensor::from_vec(s_data.clone(), (ns, ts, c, hs, ws), dev)?;
    let filters: Tensor<f32, B> = Tensor::from_vec(f_data.clone(), (nf, tf, c, hf, wf), dev)?;
    let out = conv3d(&signals, &filters, BorderMode::Full)?;

    let (want, want_dims) =
        reference_conv3d(&s_data, (ns, ts, c, hs, ws), &f_data, (nf, tf, hf, wf), BorderMode::Full);
    assert_eq!(out.dims(), want_dims.as_slice());
    assert_allclose(&out.to_vec()?, &want, 1e-3, 1e-4);
    Ok(())
}
cpu_test!(test_conv3d_full, test_conv3d_full_impl);

/// Single-frame filters skip the diagonal gather entirely; make sure that
/// fast path agrees with the oracle too.
fn test_conv3d_single_frame_filter_impl<B: Backend>(dev: &B) -> Result<()> {
    let (ns, ts, c, hs, ws) = (3, 10, 3, 32, 32);
    let (nf, tf, hf, wf) = (32, 1, 5, 5);
    let mut rng = StdRng::seed_from_u64(282);
    let s_data = rand_vec(&mut rng, ns * ts * c * hs * ws);
    let f_data = rand_vec(&mut rng, nf * tf * c * hf * wf);

    let signals: Tensor<f32, B> = Tensor::from_vec(s_data.clone(), (ns, ts, c, hs, ws), dev)?;
    let filters: Tensor<f32, B> = Tensor::from_vec(f_data.clone(), (nf, tf, c, hf, wf), dev)?;

    for border_mode in [BorderMode::Valid, BorderMode::Full] {
        let out = conv3d(&signals, &filters, border_mode)?;
        let (want, want_dims) =
            reference_conv3d(&s_data, (ns, ts, c, hs, ws), &f_data, (nf, tf, hf, wf), border_mode);
        assert_eq!(out.dims(), want_dims.as_slice());
        assert_allclose(&out.to_vec()?, &want, 1e-3, 1e-4);
    }
    Ok(())
}
cpu_test!(test_conv3d_single_frame_filter, test_conv3d_single_frame_filter_impl);

fn test_conv3d_channel_mismatch_impl<B: Backend>(dev: &B) -> Result<()> {
    let signals: Tensor<f32, B> = Tensor::zeros((2, 4, 3, 8, 8), dev)?;
    let filters: Tensor<f32, B> = Tensor::zeros((4, 2, 2, 3, 3), dev)?;
    assert!(conv3d(&signals, &filters, BorderMode::Valid).is_err());
    Ok(())
}
cpu_test!(test_conv3d_channel_mismatch, test_conv3d_channel_mismatch_impl);

fn test_conv3d_filter_too_large_impl<B: Backend>(dev: &B) -> Result<()> {
    let signals: Tensor<f32, B> = Tensor::zeros((2, 2, 3, 8, 8), dev)?;
    let filters: Tensor<f32, B> = Tensor::zeros((4, 3, 3, 3, 3), dev)?;
    assert!(conv3d(&signals, &filters, BorderMode::Valid).is_err());
    // Full mode pads, so the same filter fits.
    assert!(conv3d(&signals, &filters, BorderMode::Full).is_ok());
    Ok(())
}
cpu_test!(test_conv3d_filter_too_large, test_conv3d_filter_too_large_impl);

#[test]
fn test_border_mode_parse() -> Result<()> {
    assert_eq!("valid".parse::<BorderMode>()?, BorderMode::Valid);
    assert_eq!("full".parse::<BorderMode>()?, BorderMode::Full);
    assert!("same".parse::<BorderMode>().is_err());
    Ok(())
}

// =============================================================================
// Gradient tests
// =============================================================================

/// Check `conv3d_backward` against central finite differences of the scalar
/// loss `sum(conv3d(s, f) * w)` for a fixed random `w`. The convolution is
/// bilinear in its inputs so central differences are exact up to rounding.
fn finite_diff_check<B: Backend>(
    dev: &B,
    (ns, ts, c, hs, ws): (usize, usize, usize, usize, usize),
    (nf, tf, hf, wf): (usize, usize, usize, usize),
    border_mode: BorderMode,
    seed: u64,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let s_data = rand_vec(&mut rng, ns * ts * c * hs * ws);
    let f_data = rand_vec(&mut rng, nf * tf * c * hf * wf);

    let loss = |s_data: &[f32], f_data: &[f32]| -> Result<f64> {
        let signals: Tensor<f32, B> =
            Tensor::from_vec(s_data.to_vec(), (ns, ts, c, hs, ws), dev)?;
        let filters: Tensor<f32, B> = Tensor::from_vec(f_data.to_vec(), (nf, tf, c, hf, wf), dev)?;
        let out = conv3d(&signals, &filters, border_mode)?;
        // Weight each output element by a deterministic coefficient so every
        // gradient entry is exercised.
        let mut w_rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let w = rand_vec(&mut w_rng, out.elem_count());
        Ok(out.to_vec()?.iter().zip(w.iter()).map(|(&o, &wi)| o as f64 * wi as f64).sum())
    };

    let signals: Tensor<f32, B> = Tensor::from_vec(s_data.clone(), (ns, ts, c, hs, ws), dev)?;
    let filters: Tensor<f32, B> = Tensor::from_vec(f_data.clone(), (nf, tf, c, hf, wf), dev)?;
    let out = conv3d(&signals, &filters, border_mode)?;
    let mut w_rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let w = rand_vec(&mut w_rng, out.elem_count());
    let grad_output: Tensor<f32, B> = Tensor::from_vec(w, out.shape().clone(), dev)?;
    let (d_signals, d_filters) = conv3d_backward(&signals, &filters, &grad_output, border_mode)?;
    assert_eq!(d_signals.dims(), signals.dims());
    assert_eq!(d_filters.dims(), filters.dims());
    let d_signals = d_signals.to_vec()?;
    let d_filters = d_filters.to_vec()?;

    let eps = 0.1f32;
    for (wrt_signals, grads) in [(true, &d_signals), (false, &d_filters)] {
        let data = if wrt_signals { &s_data } else { &f_data };
        for i in 0..data.len() {
            let mut plus = data.clone();
            plus[i] += eps;
            let mut minus = data.clone();
            minus[i] -= eps;
            let (l_plus, l_minus) = if wrt_signals {
                (loss(&plus, &f_data)?, loss(&minus, &f_data)?)
            } else {
                (loss(&s_data, &plus)?, loss(&s_data, &minus)?)
            };
            let fd = ((l_plus - l_minus) / (2.0 * eps as f64)) as f32;
            let a = grads[i];
            assert!(
                (fd - a).abs() <= 1e-2 + 1e-2 * a.abs(),
                "gradient mismatch at {i}: finite diff {fd}, analytic {a}"
            );
        }
    }
    Ok(())
}

fn test_conv3d_grad_valid_impl<B: Backend>(dev: &B) -> Result<()> {
    finite_diff_check(dev, (3, 3, 3, 5, 5), (4, 2, 2, 2), BorderMode::Valid, 7)
}
cpu_test!(test_conv3d_grad_valid, test_conv3d_grad_valid_impl);

fn test_conv3d_grad_full_impl<B: Backend>(dev: &B) -> Result<()> {
    finite_diff_check(dev, (3, 3, 3, 5, 5), (4, 2, 2, 2), BorderMode::Full, 8)
}
cpu_test!(test_conv3d_grad_full, test_conv3d_grad_full_impl);

fn test_conv3d_grad_single_frame_impl<B: Backend>(dev: &B) -> Result<()> {
    finite_diff_check(dev, (2, 3, 2, 5, 5), (3, 1, 2, 2), BorderMode::Valid, 9)?;
    finite_diff_check(dev, (2, 3, 2, 5, 5), (3, 1, 2, 2), BorderMode::Full, 10)
}
cpu_test!(test_conv3d_grad_single_frame, test_conv3d_grad_single_frame_impl);
