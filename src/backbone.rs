//! Backbone dispatch: three structurally different fusion pipelines behind
//! one interface, selected once at construction.

use candle::{Result, Tensor};

use crate::fusion::{CrossModalAttention, FeaturePyramid, FeatureSelection, VisualEncoder};
use crate::mask::{diffuse, logic_and};
use crate::relation::{relation_heatmap, RelationFilters};

type BoxedEncoder = Box<dyn VisualEncoder + Send + Sync>;
type BoxedSelection = Box<dyn FeatureSelection + Send + Sync>;
type BoxedAttention = Box<dyn CrossModalAttention + Send + Sync>;
type BoxedPyramid = Box<dyn FeaturePyramid + Send + Sync>;

/// Multi-scale pyramid: three scales, per-scale feature selection and
/// attention, then feature-pyramid fusion.
pub struct PyramidBackbone {
    encoder: BoxedEncoder,
    select: Vec<BoxedSelection>,
    attend: Vec<BoxedAttention>,
    pyramid: BoxedPyramid,
}

impl PyramidBackbone {
    pub fn new(
        encoder: BoxedEncoder,
        select: Vec<BoxedSelection>,
        attend: Vec<BoxedAttention>,
        pyramid: BoxedPyramid,
    ) -> Result<Self> {
        if select.len() != 3 || attend.len() != 3 {
            candle::bail!(
                "the pyramid backbone needs 3 selection and 3 attention stages, got {} and {}",
                select.len(),
                attend.len()
            )
        }
        Ok(Self {
            encoder,
            select,
            attend,
            pyramid,
        })
    }

    fn encode_feats(&self, image: &Tensor, phrase: &Tensor) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let maps = self.encoder.encode(image)?;
        if maps.len() != 3 {
            candle::bail!("the pyramid backbone expects 3 scales, got {}", maps.len())
        }
        let mut fused = Vec::with_capacity(3);
        let mut diags = Vec::with_capacity(3);
        for (select, attend) in self.select.iter().zip(self.attend.iter()) {
            let (selected, _) = select.select(phrase, &maps)?;
            let (attended, diag) = attend.attend(phrase, &selected, None)?;
            fused.push(attended);
            diags.push(diag);
        }
        let feats = self.pyramid.build_pyramid(&fused)?;
        Ok((feats, diags))
    }
}

/// Single-stage: the encoder already returns the fused map.
pub struct SingleStageBackbone {
    encoder: BoxedEncoder,
}

impl SingleStageBackbone {
    pub fn new(encoder: BoxedEncoder) -> Self {
        Self { encoder }
    }

    fn encode_feats(&self, image: &Tensor) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let maps = self.encoder.encode(image)?;
        if maps.len() != 1 {
            candle::bail!(
                "the single-stage backbone expects one fused map, got {}",
                maps.len()
            )
        }
        Ok((maps, vec![]))
    }
}

/// Filter-gated: one fused map whose cross-modal attention is gated by the
/// diffused relation mask.
pub struct FilterGatedBackbone {
    encoder: BoxedEncoder,
    select: BoxedSelection,
    attend: BoxedAttention,
    n_heads: usize,
    t_steps: usize,
}

impl FilterGatedBackbone {
    pub fn new(
        encoder: BoxedEncoder,
        select: BoxedSelection,
        attend: BoxedAttention,
        n_heads: usize,
        t_steps: usize,
    ) -> Self {
        Self {
            encoder,
            select,
            attend,
            n_heads,
            t_steps,
        }
    }

    fn encode_feats(
        &self,
        image: &Tensor,
        phrase: &Tensor,
        filters: Option<&RelationFilters>,
    ) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let filters = match filters {
            Some(filters) => filters,
            None => candle::bail!("the filter-gated backbone needs relation filters"),
        };
        let maps = self.encoder.encode(image)?;
        if maps.len() != 3 {
            candle::bail!(
                "the filter-gated backbone expects 3 scales, got {}",
                maps.len()
            )
        }
        let (fused, visual) = self.select.select(phrase, &maps)?;
        if visual.len() != 3 {
            candle::bail!(
                "feature selection must expose 3 visual maps, got {}",
                visual.len()
            )
        }
        let heat = relation_heatmap(filters, &visual)?;
        let masks = diffuse(&heat, &filters.kernel, self.t_steps, 1)?;
        let reduced = logic_and(&masks)?;
        let (b, h, w) = reduced.dims3()?;
        let mask = reduced
            .reshape((b, 1, h * w))?
            .broadcast_as((b, self.n_heads, h * w))?
            .contiguous()?
            .reshape((b * self.n_heads, 1, h * w))?;
        let (attended, diag) = self.attend.attend(phrase, &fused, Some(&mask))?;
        Ok((vec![attended], vec![diag]))
    }
}

/// The backbone strategy selected by the configuration.
pub enum Backbone {
    Pyramid(PyramidBackbone),
    SingleStage(SingleStageBackbone),
    FilterGated(FilterGatedBackbone),
}

impl Backbone {
    /// Runs the visual pipeline. `phrase` guides the fusion modules (a zero
    /// vector in the phrase-independent modes) and `filters` is only
    /// consulted by the filter-gated variant.
    pub fn encode_feats(
        &self,
        image: &Tensor,
        phrase: &Tensor,
        filters: Option<&RelationFilters>,
    ) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        match self {
            Self::Pyramid(bb) => bb.encode_feats(image, phrase),
            Self::SingleStage(bb) => bb.encode_feats(image),
            Self::FilterGated(bb) => bb.encode_feats(image, phrase, filters),
        }
    }
}

/// Normalized cell-center coordinates in `[-1, 1]`, shaped `(2, H, W)` with
/// the row coordinate first.
pub fn create_grid(h: usize, w: usize, dev: &candle::Device) -> Result<Tensor> {
    let mut grid = Vec::with_capacity(2 * h * w);
    for i in 0..h {
        for _ in 0..w {
            grid.push(2.0 * ((i as f32 + 0.5) / h as f32) - 1.0);
        }
    }
    for _ in 0..h {
        for j in 0..w {
            grid.push(2.0 * ((j as f32 + 0.5) / w as f32) - 1.0);
        }
    }
    Tensor::from_vec(grid, (2, h, w), dev)
}

/// L2-normalizes along `dim`, used on feature maps (channel dim) and phrase
/// vectors when `do_norm` is set. The norm is clamped from below so that
/// all-zero vectors come out as zeros rather than NaN.
pub fn l2_normalize(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(dim)?.sqrt()?.maximum(1e-12)?;
    xs.broadcast_div(&norm)
}
