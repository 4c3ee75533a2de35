//! Top-level forward orchestration.

use candle::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::backbone::{create_grid, l2_normalize, Backbone};
use crate::config::{Config, ForwardMode};
use crate::fusion::SoftParser;
use crate::heads::DetectionHeads;
use crate::phrase::PhraseEncoder;
use crate::relation::{RelationFilters, RelationGenerator};

/// One forward invocation's inputs.
pub struct ModelInput {
    /// `(B, C, H, W)` image tensor.
    pub image: Tensor,
    /// `(B, L, emb_dim)` word embeddings, zero-padded past each phrase's
    /// valid length.
    pub embeddings: Tensor,
    /// `(B,)` integer per-example valid lengths.
    pub lengths: Tensor,
}

/// Batch-aligned output package.
pub struct ModelOutput {
    /// `(B, sum_anchors, 1)` objectness/attention logits.
    pub att_out: Tensor,
    /// `(B, sum_anchors, 4)` box-regression offsets.
    pub bbx_out: Tensor,
    /// Per-scale `(height, width)`, enough to reconstruct the anchor
    /// ordering downstream.
    pub feat_sizes: Vec<(usize, usize)>,
    /// Number of scales.
    pub num_f_out: usize,
    /// Per-scale attention diagnostics, empty when no attention ran.
    pub att_maps: Vec<Tensor>,
}

pub struct ZsgNet {
    backbone: Backbone,
    phrase: PhraseEncoder,
    relation: Option<RelationGenerator>,
    parser: Option<Box<dyn SoftParser + Send + Sync>>,
    heads: DetectionHeads,
    mode: ForwardMode,
    lang_dim: usize,
    do_norm: bool,
    relation_enabled: bool,
    span: tracing::Span,
}

impl ZsgNet {
    /// Builds the model. The backbone's collaborator modules and, when
    /// relation parsing is enabled, the soft parser are externally owned.
    pub fn new(
        cfg: &Config,
        backbone: Backbone,
        parser: Option<Box<dyn SoftParser + Send + Sync>>,
        vb: VarBuilder,
    ) -> Result<Self> {
        cfg.validate()?;
        if cfg.relation && parser.is_none() {
            candle::bail!("relation parsing is enabled but no soft parser was provided")
        }
        let phrase = PhraseEncoder::new(cfg, vb.pp("phrase"))?;
        let relation = if cfg.relation {
            Some(RelationGenerator::new(cfg, vb.pp("relation"))?)
        } else {
            None
        };
        let heads = DetectionHeads::new(cfg, vb.pp("heads"))?;
        let span = tracing::span!(tracing::Level::TRACE, "zsgnet");
        Ok(Self {
            backbone,
            phrase,
            relation,
            parser,
            heads,
            mode: cfg.forward_mode(),
            lang_dim: cfg.lang_dim(),
            do_norm: cfg.do_norm,
            relation_enabled: cfg.relation,
            span,
        })
    }

    pub fn forward_mode(&self) -> ForwardMode {
        self.mode
    }

    fn lengths_of(&self, input: &ModelInput) -> Result<Vec<usize>> {
        let lengths = input.lengths.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        Ok(lengths.into_iter().map(|len| len as usize).collect())
    }

    /// Runs the phrase encoder, the optional relation path, the backbone and
    /// the detection heads, and packages the output.
    pub fn forward(&self, input: &ModelInput) -> Result<ModelOutput> {
        let _enter = self.span.enter();
        let image = &input.image;
        let batch = image.dim(0)?;
        let dev = image.device();

        // Phrase vector and relation filters, per mode. Modes that do not
        // look at the phrase feed a zero vector to the fusion modules so
        // their output cannot depend on language content.
        let (phrase_vec, filters) = match self.mode {
            ForwardMode::Full => {
                let lengths = self.lengths_of(input)?;
                if self.relation_enabled {
                    let enc = self.phrase.encode_full(&input.embeddings, &lengths)?;
                    let filters = self.relation_filters(&enc.sequence, &enc.summary, &enc.mask)?;
                    (enc.summary, Some(filters))
                } else {
                    let summary = self.phrase.encode(&input.embeddings, &lengths)?;
                    (summary, None)
                }
            }
            ForwardMode::LanguageOnly => {
                let lengths = self.lengths_of(input)?;
                let summary = self.phrase.encode(&input.embeddings, &lengths)?;
                (summary, None)
            }
            ForwardMode::ImageOnly | ForwardMode::Blind => {
                let zeros = Tensor::zeros((batch, self.lang_dim), DType::F32, dev)?;
                (zeros, None)
            }
        };

        let (feats, att_maps) = self
            .backbone
            .encode_feats(image, &phrase_vec, filters.as_ref())?;

        let mut head_inputs = Vec::with_capacity(feats.len());
        for feat in feats.iter() {
            head_inputs.push(self.head_input(feat, &phrase_vec)?);
        }
        let (att_out, bbx_out, feat_sizes) = self.heads.forward(&head_inputs)?;

        Ok(ModelOutput {
            att_out,
            bbx_out,
            num_f_out: feats.len(),
            feat_sizes,
            att_maps,
        })
    }

    fn relation_filters(
        &self,
        sequence: &Tensor,
        summary: &Tensor,
        mask: &Tensor,
    ) -> Result<RelationFilters> {
        let (parser, relation) = match (&self.parser, &self.relation) {
            (Some(parser), Some(relation)) => (parser, relation),
            _ => candle::bail!("relation path invoked without a parser"),
        };
        let (_aux, sub_exp) = parser.parse(sequence, summary, mask)?;
        relation.forward(&sub_exp)
    }

    /// Builds the per-scale head input for the active mode: the fused map,
    /// the tiled phrase vector and the grid encoding in full fusion; subsets
    /// of those in the blind modes.
    fn head_input(&self, feat: &Tensor, phrase_vec: &Tensor) -> Result<Tensor> {
        let (b, _c, h, w) = feat.dims4()?;
        if self.mode == ForwardMode::ImageOnly {
            return if self.do_norm {
                l2_normalize(feat, 1)
            } else {
                Ok(feat.clone())
            };
        }
        let grid = create_grid(h, w, feat.device())?
            .unsqueeze(0)?
            .broadcast_as((b, 2, h, w))?;
        if self.mode == ForwardMode::Blind {
            return grid.contiguous();
        }
        let phrase_vec = if self.do_norm {
            l2_normalize(phrase_vec, 1)?
        } else {
            phrase_vec.clone()
        };
        let d = phrase_vec.dim(D::Minus1)?;
        let tiled = phrase_vec
            .reshape((b, d, 1, 1))?
            .broadcast_as((b, d, h, w))?;
        match self.mode {
            ForwardMode::LanguageOnly => tiled.contiguous(),
            _ => {
                let feat = if self.do_norm {
                    l2_normalize(feat, 1)?
                } else {
                    feat.clone()
                };
                Tensor::cat(&[&feat, &tiled.contiguous()?, &grid.contiguous()?], 1)
            }
        }
    }
}
