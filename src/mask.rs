//! Spatial mask diffusion and the temporal logical-AND reduction.
//!
//! A relation heatmap is smoothed by scattering every cell's value through a
//! small per-step kernel, clipped at the grid borders, with the original map
//! added back after every pass. Iterating the pass grows the receptive field
//! of each relation step before the steps are collapsed into one mask.

use candle::{IndexOp, Result, Tensor};

/// Applies `steps` diffusion passes of `kernel` over `heat`.
///
/// `heat` is `(B, T, H, W)`, `kernel` is `(B, T, k, k)` with `k` odd. With
/// `stride > 1` only every `stride`-th row/column acts as a diffusion source;
/// destinations are always dense.
pub fn diffuse(heat: &Tensor, kernel: &Tensor, steps: usize, stride: usize) -> Result<Tensor> {
    if stride == 0 {
        candle::bail!("diffusion stride must be at least 1")
    }
    let mut heat = heat.clone();
    for _ in 0..steps {
        heat = diffuse_once(&heat, kernel, stride)?;
    }
    Ok(heat)
}

/// One diffusion pass.
///
/// Scattering `heat[i, j] * kernel` into a window clipped at the borders is
/// the same sum, seen from the destination cell, as a true convolution of the
/// heatmap with the flipped kernel under zero padding: sources outside the
/// grid contribute nothing, and border cells simply collect fewer terms.
/// candle's `conv2d` computes a cross-correlation, hence the explicit flip.
fn diffuse_once(heat: &Tensor, kernel: &Tensor, stride: usize) -> Result<Tensor> {
    let (b, t, h, w) = heat.dims4()?;
    let (kb, kt, kh, kw) = kernel.dims4()?;
    if kb != b || kt != t {
        candle::bail!("kernel batch/step dims ({kb}, {kt}) do not match heatmap ({b}, {t})")
    }
    if kh != kw || kh % 2 == 0 {
        candle::bail!("diffusion kernel must be square with an odd side, got {kh}x{kw}")
    }
    let r = kh / 2;
    let dev = heat.device();

    let src = if stride > 1 {
        heat.broadcast_mul(&source_mask(h, w, stride, dev)?)?
    } else {
        heat.clone()
    };

    let rev = Tensor::from_vec(
        (0..kh as u32).rev().collect::<Vec<u32>>(),
        kh,
        kernel.device(),
    )?;
    let kernel = kernel.index_select(&rev, 2)?.index_select(&rev, 3)?;

    let src = src.reshape((1, b * t, h, w))?;
    let kernel = kernel.reshape((b * t, 1, kh, kw))?.contiguous()?;
    let spread = src
        .conv2d(&kernel, r, 1, 1, b * t)?
        .reshape((b, t, h, w))?;
    spread + heat
}

fn source_mask(h: usize, w: usize, stride: usize, dev: &candle::Device) -> Result<Tensor> {
    let mut mask = vec![0f32; h * w];
    for i in (0..h).step_by(stride) {
        for j in (0..w).step_by(stride) {
            mask[i * w + j] = 1.0;
        }
    }
    Tensor::from_vec(mask, (1, 1, h, w), dev)
}

/// Collapses the `(B, T, H, W)` relation-step masks into `(B, H, W)` by
/// elementwise multiplication across steps, a soft logical AND for values in
/// `[0, 1]`.
pub fn logic_and(masks: &Tensor) -> Result<Tensor> {
    let (_b, t, _h, _w) = masks.dims4()?;
    if t == 0 {
        candle::bail!("logic_and needs at least one relation step")
    }
    let mut out = masks.i((.., 0))?;
    for step in 1..t {
        out = (out * masks.i((.., step))?)?;
    }
    Ok(out)
}
