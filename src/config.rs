//! Static model configuration, resolved once at construction time.

use candle::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    /// Three scales, per-scale feature selection and attention, feature
    /// pyramid fusion.
    Pyramid,
    /// The encoder already returns a single fused map.
    SingleStage,
    /// Three scales, one fused map gated by the relation mask.
    FilterGated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RnnKind {
    Lstm,
    Gru,
}

/// The four forward modes, resolved from `(use_lang, use_img)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Language and image fused (the default).
    Full,
    /// Image-blind: the phrase vector is tiled in place of visual features.
    LanguageOnly,
    /// Language-blind: visual features only.
    ImageOnly,
    /// Neither: a position-encoding grid substitutes for features.
    Blind,
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_backbone() -> BackboneKind {
    BackboneKind::Pyramid
}
fn default_rnn() -> RnnKind {
    RnnKind::Lstm
}
fn default_emb_dim() -> usize {
    300
}
fn default_lstm_dim() -> usize {
    256
}
fn default_img_dim() -> usize {
    256
}
fn default_n_anchors() -> usize {
    9
}
fn default_t_obj() -> usize {
    3
}
fn default_rel_kernel_dim() -> usize {
    9
}
fn default_n_heads() -> usize {
    4
}
fn default_final_bias() -> f64 {
    -4.0
}
fn default_head_channels() -> usize {
    256
}
fn default_head_convs() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_backbone")]
    pub backbone: BackboneKind,
    #[serde(default = "default_true")]
    pub use_lang: bool,
    #[serde(default = "default_true")]
    pub use_img: bool,
    /// Shared attention/regression head, the configuration used in the paper.
    #[serde(default = "default_true")]
    pub use_same_atb: bool,
    /// Enables the soft parser and the relation filter/mask path.
    #[serde(default = "default_false")]
    pub relation: bool,
    #[serde(default = "default_rnn")]
    pub rnn: RnnKind,
    #[serde(default = "default_false")]
    pub use_bidirectional: bool,
    #[serde(default = "default_emb_dim")]
    pub emb_dim: usize,
    #[serde(default = "default_lstm_dim")]
    pub lstm_dim: usize,
    /// Channel count of the fused visual feature maps.
    #[serde(default = "default_img_dim")]
    pub img_dim: usize,
    /// Anchors per spatial cell, len(ratios) * len(scales).
    #[serde(default = "default_n_anchors")]
    pub n_anchors: usize,
    /// Number of relation steps T.
    #[serde(default = "default_t_obj")]
    pub t_obj: usize,
    /// Projected dimension of the relation kernel, must be a perfect square.
    #[serde(default = "default_rel_kernel_dim")]
    pub rel_kernel_dim: usize,
    /// Attention heads the reduced mask is expanded over.
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    /// L2-normalize feature maps and the phrase vector before fusion.
    #[serde(default = "default_false")]
    pub do_norm: bool,
    /// Initial objectness bias so that early training predicts "no object".
    #[serde(default = "default_final_bias")]
    pub final_bias: f64,
    #[serde(default = "default_head_channels")]
    pub head_channels: usize,
    #[serde(default = "default_head_convs")]
    pub head_convs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backbone: default_backbone(),
            use_lang: true,
            use_img: true,
            use_same_atb: true,
            relation: false,
            rnn: default_rnn(),
            use_bidirectional: false,
            emb_dim: default_emb_dim(),
            lstm_dim: default_lstm_dim(),
            img_dim: default_img_dim(),
            n_anchors: default_n_anchors(),
            t_obj: default_t_obj(),
            rel_kernel_dim: default_rel_kernel_dim(),
            n_heads: default_n_heads(),
            do_norm: false,
            final_bias: default_final_bias(),
            head_channels: default_head_channels(),
            head_convs: default_head_convs(),
        }
    }
}

impl Config {
    /// Parses and validates a configuration from its JSON form. Missing
    /// fields take their defaults; enum values are lowercase.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(candle::Error::wrap)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Output dimension of the phrase encoder.
    pub fn lang_dim(&self) -> usize {
        self.lstm_dim * if self.use_bidirectional { 2 } else { 1 }
    }

    pub fn forward_mode(&self) -> ForwardMode {
        match (self.use_lang, self.use_img) {
            (true, true) => ForwardMode::Full,
            (true, false) => ForwardMode::LanguageOnly,
            (false, true) => ForwardMode::ImageOnly,
            (false, false) => ForwardMode::Blind,
        }
    }

    /// Channel count the detection heads see, per forward mode. The grid
    /// position encoding contributes two channels.
    pub fn head_in_dim(&self) -> usize {
        match self.forward_mode() {
            ForwardMode::Full => self.lang_dim() + self.img_dim + 2,
            ForwardMode::LanguageOnly => self.lang_dim(),
            ForwardMode::ImageOnly => self.img_dim,
            ForwardMode::Blind => 2,
        }
    }

    /// Side of the relation kernel, the integer square root of
    /// `rel_kernel_dim`.
    pub fn rel_kernel_size(&self) -> Result<usize> {
        let k = (self.rel_kernel_dim as f64).sqrt() as usize;
        if k * k != self.rel_kernel_dim {
            candle::bail!(
                "rel_kernel_dim must be a perfect square, got {}",
                self.rel_kernel_dim
            )
        }
        Ok(k)
    }

    pub fn validate(&self) -> Result<()> {
        if self.emb_dim == 0 || self.lstm_dim == 0 || self.img_dim == 0 {
            candle::bail!("embedding, hidden and image dimensions must be non-zero")
        }
        if self.n_anchors == 0 {
            candle::bail!("n_anchors must be at least 1")
        }
        if self.head_channels == 0 {
            candle::bail!("head_channels must be non-zero")
        }
        if self.relation {
            self.rel_kernel_size()?;
            if self.t_obj == 0 {
                candle::bail!("t_obj must be at least 1 when relation parsing is enabled")
            }
            if self.forward_mode() != ForwardMode::Full {
                candle::bail!("relation parsing requires both use_lang and use_img")
            }
        }
        if self.backbone == BackboneKind::FilterGated {
            if !self.relation {
                candle::bail!("the filter-gated backbone requires relation parsing")
            }
            if self.n_heads == 0 {
                candle::bail!("n_heads must be at least 1 for the filter-gated backbone")
            }
        }
        Ok(())
    }
}
