//! Relation filter generation and the language-conditioned heatmap.
//!
//! The external soft parser decomposes a phrase into T sub-expression
//! vectors. Each step is projected into three channel-space filters, one per
//! visual scale, and into a small normalized spatial kernel used by the mask
//! diffusion engine.

use candle::{Result, Tensor};
use candle_nn::{linear, ops, Linear, Module, VarBuilder};

use crate::config::Config;

/// Per-step linear filters and the normalized relation kernel, valid for one
/// forward pass.
#[derive(Debug)]
pub struct RelationFilters {
    /// `(B, T, C, 1, 1)` each, broadcastable over a `(B, C, H, W)` map.
    pub f1: Tensor,
    pub f2: Tensor,
    pub f3: Tensor,
    /// `(B, T, k, k)`, softmax-normalized over the k*k cells of each step.
    pub kernel: Tensor,
}

#[derive(Debug)]
pub struct RelationGenerator {
    k1: Linear,
    k2: Linear,
    k3: Linear,
    kernel_fc1: Linear,
    kernel_fc2: Linear,
    img_dim: usize,
    kernel_size: usize,
    span: tracing::Span,
}

impl RelationGenerator {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let lang_dim = cfg.lang_dim();
        let kernel_size = cfg.rel_kernel_size()?;
        let k1 = linear(lang_dim, cfg.img_dim, vb.pp("k1"))?;
        let k2 = linear(lang_dim, cfg.img_dim, vb.pp("k2"))?;
        let k3 = linear(lang_dim, cfg.img_dim, vb.pp("k3"))?;
        let kernel_fc1 = linear(lang_dim, lang_dim / 2, vb.pp("kernel.0"))?;
        let kernel_fc2 = linear(lang_dim / 2, cfg.rel_kernel_dim, vb.pp("kernel.2"))?;
        let span = tracing::span!(tracing::Level::TRACE, "relation-filters");
        Ok(Self {
            k1,
            k2,
            k3,
            kernel_fc1,
            kernel_fc2,
            img_dim: cfg.img_dim,
            kernel_size,
            span,
        })
    }

    /// Derives the filters from `(B, T, D)` sub-expression vectors.
    pub fn forward(&self, sub_exp: &Tensor) -> Result<RelationFilters> {
        let _enter = self.span.enter();
        let (b, t, _d) = sub_exp.dims3()?;
        let spatial = |xs: Tensor| xs.reshape((b, t, self.img_dim, 1, 1));
        let f1 = spatial(self.k1.forward(sub_exp)?)?;
        let f2 = spatial(self.k2.forward(sub_exp)?)?;
        let f3 = spatial(self.k3.forward(sub_exp)?)?;
        let k = self.kernel_size;
        let kernel = ops::leaky_relu(&self.kernel_fc1.forward(sub_exp)?, 0.1)?;
        let kernel = ops::leaky_relu(&self.kernel_fc2.forward(&kernel)?, 0.1)?;
        let kernel = ops::softmax(&kernel, candle::D::Minus1)?.reshape((b, t, k, k))?;
        Ok(RelationFilters { f1, f2, f3, kernel })
    }
}

/// Combines three aligned visual maps `(B, C, H, W)` with the per-step
/// filters into a `(B, T, H, W)` heatmap: elementwise product, summed over
/// channels, summed over the three maps.
pub fn relation_heatmap(filters: &RelationFilters, visual: &[Tensor]) -> Result<Tensor> {
    if visual.len() != 3 {
        candle::bail!("the relation heatmap needs 3 visual maps, got {}", visual.len())
    }
    let shape = visual[0].dims4()?;
    let mut heat: Option<Tensor> = None;
    for (map, filter) in visual.iter().zip([&filters.f1, &filters.f2, &filters.f3]) {
        if map.dims4()? != shape {
            candle::bail!(
                "visual maps must share one shape, got {:?} and {:?}",
                shape,
                map.dims4()?
            )
        }
        // (B, 1, C, H, W) * (B, T, C, 1, 1), summed over the channel dim.
        let term = map.unsqueeze(1)?.broadcast_mul(filter)?.sum(2)?;
        heat = Some(match heat {
            None => term,
            Some(acc) => (acc + term)?,
        });
    }
    // visual.len() == 3 was checked above.
    match heat {
        Some(heat) => Ok(heat),
        None => candle::bail!("no visual maps"),
    }
}
