//! Interfaces to the externally-owned fusion collaborators.
//!
//! The convolutional encoders, adaptive feature selection, cross-modal
//! attention, feature pyramid and the soft relation parser are trained and
//! owned outside this crate; the model only routes tensors through them.

use candle::{Result, Tensor};

/// A visual feature extractor. Returns one raw map per scale: three scales
/// for the pyramid and filter-gated backbones, one for the single-stage
/// backbone.
pub trait VisualEncoder {
    fn encode(&self, image: &Tensor) -> Result<Vec<Tensor>>;
}

/// Adaptive feature selection: fuses multi-scale maps under the guidance of
/// the phrase vector. The second element carries the per-scale raw visual
/// maps consumed by the relation heatmap; implementations that do not expose
/// them return an empty vec.
pub trait FeatureSelection {
    fn select(&self, phrase: &Tensor, maps: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)>;
}

/// Cross-modal attention over one fused map, optionally gated by a
/// `(B * n_heads, 1, H * W)` soft mask. Returns the attended map and an
/// attention diagnostic.
pub trait CrossModalAttention {
    fn attend(
        &self,
        phrase: &Tensor,
        map: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)>;
}

/// Feature pyramid fusion over per-scale maps.
pub trait FeaturePyramid {
    fn build_pyramid(&self, maps: &[Tensor]) -> Result<Vec<Tensor>>;
}

/// Soft relation parser: decomposes the phrase into `(B, T, D)`
/// sub-expression vectors from the per-token encoder outputs, the summary
/// vector and the validity mask. The first element is an auxiliary output
/// kept for parity with the external module's interface.
pub trait SoftParser {
    fn parse(&self, sequence: &Tensor, summary: &Tensor, mask: &Tensor)
        -> Result<(Tensor, Tensor)>;
}
