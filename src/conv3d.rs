use crate::{Backend, DiagonalView, Error, Result, Tensor, WithDTypeF, diagonal_accumulate};

/// Border handling for the 3D convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BorderMode {
    /// Output covers only positions where the filter fits entirely inside the
    /// signal: `(Ts - Tf + 1, Hs - Hf + 1, Ws - Wf + 1)`.
    Valid,
    /// Signals are zero-padded by the filter size minus one on every side:
    /// `(Ts + Tf - 1, Hs + Hf - 1, Ws + Wf - 1)`.
    Full,
}

impl BorderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BorderMode::Valid => "valid",
            BorderMode::Full => "full",
        }
    }
}

impl std::str::FromStr for BorderMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "valid" => Ok(BorderMode::Valid),
            "full" => Ok(BorderMode::Full),
            _ => Err(Error::InvalidArgument {
                op: "border_mode",
                msg: format!("expected 'valid' or 'full', got '{s}'"),
            }
            .bt()),
        }
    }
}

fn check_conv3d_shapes<T: WithDTypeF, B: Backend>(
    signals: &Tensor<T, B>,
    filters: &Tensor<T, B>,
    op: &'static str,
) -> Result<(usize, usize, usize, usize, usize, usize, usize, usize, usize)> {
    let (ns, ts, cs, hs, ws) = signals.dims5()?;
    let (nf, tf, cf, hf, wf) = filters.dims5()?;
    if cs != cf {
        return Err(Error::ChannelMismatch {
            signals: signals.shape().clone(),
            filters: filters.shape().clone(),
            op,
        }
        .bt());
    }
    Ok((ns, ts, cs, hs, ws, nf, tf, hf, wf))
}

/// 3D convolution over video-like data, decomposed into batched 2D
/// convolutions.
///
/// Signals: `(Ns, Ts, C, Hs, Ws)`, filters: `(Nf, Tf, C, Hf, Wf)`, output:
/// `(Ns, To, Nf, Ho, Wo)`. Correlation convention on all three axes: the
/// filter is not flipped, `out[t] = sum_k conv2d(signal[t + k], filter[k])`.
///
/// The frame axes of signals and filters are flattened into the 2D batch and
/// output-channel axes, a single batched 2D convolution produces every
/// frame-pair response, and a diagonal subtensor view lines up the responses
/// that belong to the same output frame so that summing over the filter-frame
/// axis finishes the time convolution.
#[tracing::instrument(skip_all)]
pub fn conv3d<T: WithDTypeF, B: Backend>(
    signals: &Tensor<T, B>,
    filters: &Tensor<T, B>,
    border_mode: BorderMode,
) -> Result<Tensor<T, B>> {
    let (_ns, _ts, _cs, _hs, _ws, _nf, tf, hf, wf) =
        check_conv3d_shapes(signals, filters, "conv3d")?;

    let signals = match border_mode {
        BorderMode::Valid => signals.clone(),
        BorderMode::Full => signals
            .pad_with_zeros(1, tf - 1, tf - 1)?
            .pad_with_zeros(3, hf - 1, hf - 1)?
            .pad_with_zeros(4, wf - 1, wf - 1)?,
    };
    let (ns, ts, cs, hs, ws) = signals.dims5()?;
    let (nf, tf, _cf, hf, wf) = filters.dims5()?;
    if ts < tf || hs < hf || ws < wf {
        crate::bail!(
            "conv3d: filters {:?} do not fit in signals {:?} with {} border mode",
            filters.shape(),
            signals.shape(),
            border_mode.as_str()
        );
    }

    let oh = hs - hf + 1;
    let ow = ws - wf + 1;

    // Reversing the filter frames makes the skewed diagonal gather pick frame
    // t + k of the signal against frame k of the filter.
    let filters_rev = filters.flip(1)?;
    let s4 = signals.reshape((ns * ts, cs, hs, ws))?;
    let f4 = filters_rev.reshape((nf * tf, cs, hf, wf))?;
    let out4 = s4.conv2d(&f4)?;

    if tf == 1 {
        return out4.reshape((ns, ts, nf, oh, ow));
    }

    let out6 = out4.reshape((ns, ts, nf, tf, oh, ow))?;
    let view = DiagonalView::new(&out6, 1, 3)?;
    view.contiguous()?.sum(3)
}

/// Gradients of [`conv3d`] with respect to both inputs.
///
/// `grad_output` has the shape of the forward output; returns
/// `(d_signals, d_filters)` with the shapes of `signals` and `filters`.
#[tracing::instrument(skip_all)]
pub fn conv3d_backward<T: WithDTypeF, B: Backend>(
    signals: &Tensor<T, B>,
    filters: &Tensor<T, B>,
    grad_output: &Tensor<T, B>,
    border_mode: BorderMode,
) -> Result<(Tensor<T, B>, Tensor<T, B>)> {
    let (ns, ts, cs, hs, ws, nf, tf, hf, wf) =
        check_conv3d_shapes(signals, filters, "conv3d_backward")?;

    let padded = match border_mode {
        BorderMode::Valid => signals.clone(),
        BorderMode::Full => signals
            .pad_with_zeros(1, tf - 1, tf - 1)?
            .pad_with_zeros(3, hf - 1, hf - 1)?
            .pad_with_zeros(4, wf - 1, wf - 1)?,
    };
    let (_, tsp, _, hsp, wsp) = padded.dims5()?;
    if tsp < tf || hsp < hf || wsp < wf {
        crate::bail!(
            "conv3d_backward: filters {:?} do not fit in signals {:?} with {} border mode",
            filters.shape(),
            signals.shape(),
            border_mode.as_str()
        );
    }

    let to = tsp - tf + 1;
    let oh = hsp - hf + 1;
    let ow = wsp - wf + 1;
    let expected = crate::Shape::from((ns, to, nf, oh, ow));
    if grad_output.shape() != &expected {
        return Err(Error::UnexpectedShape {
            msg: "conv3d_backward grad_output shape mismatch".to_string(),
            expected,
            got: grad_output.shape().clone(),
        }
        .bt());
    }

    // Backprop through the diagonal gather and the filter-frame sum: the
    // gradient of each output frame is replicated over the filter-frame axis
    // and scattered back to the frame-pair grid it was gathered from.
    let g4 = if tf == 1 {
        grad_output.reshape((ns * tsp, nf, oh, ow))?
    } else {
        let g6 = grad_output
            .unsqueeze(3)?
            .broadcast_as((ns, to, nf, tf, oh, ow))?
            .contiguous()?;
        let g_pairs = diagonal_accumulate((ns, tsp, nf, tf, oh, ow), 1, 3, &g6)?;
        g_pairs.reshape((ns * tsp, nf * tf, oh, ow))?
    };

    let filters_rev = filters.flip(1)?;
    let f4 = filters_rev.reshape((nf * tf, cs, hf, wf))?;
    let s4 = padded.reshape((ns * tsp, cs, hsp, wsp))?;

    // d_signals: full-mode correlation of the output gradient with the
    // spatially reversed, channel-transposed kernel.
    let g4_padded = g4
        .pad_with_zeros(2, hf - 1, hf - 1)?
        .pad_with_zeros(3, wf - 1, wf - 1)?;
    let k2 = f4.flip(2)?.flip(3)?.transpose(0, 1)?.contiguous()?;
    let d_s4 = g4_padded.conv2d(&k2)?;
    let d_padded = d_s4.reshape((ns, tsp, cs, hsp, wsp))?;
    let d_signals = match border_mode {
        BorderMode::Valid => d_padded,
        BorderMode::Full => d_padded
            .narrow(1, tf - 1..tf - 1 + ts)?
            .narrow(3, hf - 1..hf - 1 + hs)?
            .narrow(4, wf - 1..wf - 1 + ws)?
            .contiguous()?,
    };

    // d_filters: correlate the signals with the output gradient, batching over
    // the 2D batch axis by moving it into the channel position.
    let s4_t = s4.transpose(0, 1)?.contiguous()?;
    let g4_t = g4.transpose(0, 1)?.contiguous()?;
    let d_f4_t = s4_t.conv2d(&g4_t)?;
    let d_f4 = d_f4_t.transpose(0, 1)?.contiguous()?;
    let d_filters = d_f4.reshape((nf, tf, cs, hf, wf))?.flip(1)?;

    Ok((d_signals, d_filters))
}
