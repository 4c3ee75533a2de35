//! Detection head assembly: per-scale convolutional heads whose outputs are
//! reordered to a spatial-major, anchor-flattened layout and concatenated
//! across scales.

use candle::{Result, Tensor};
use candle_nn::{init, Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::config::Config;

fn conv2d_3x3(c_in: usize, c_out: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    candle_nn::conv2d(c_in, c_out, 3, cfg, vb)
}

/// The final conv carries the objectness prior: when the builder holds no
/// pretrained bias, the given pattern is used so that early training
/// predicts "no object" everywhere.
fn final_conv(c_in: usize, bias: Vec<f32>, vb: VarBuilder) -> Result<Conv2d> {
    let c_out = bias.len();
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    let weight = vb.get_with_hints(
        (c_out, c_in, 3, 3),
        "weight",
        init::DEFAULT_KAIMING_UNIFORM,
    )?;
    let bias = if vb.contains_tensor("bias") {
        vb.get(c_out, "bias")?
    } else {
        Tensor::from_vec(bias, c_out, vb.device())?
    };
    Ok(Conv2d::new(weight, Some(bias), cfg))
}

#[derive(Debug)]
struct HeadSubnet {
    convs: Vec<Conv2d>,
    last: Conv2d,
    in_dim: usize,
}

impl HeadSubnet {
    fn new(in_dim: usize, chs: usize, n_conv: usize, bias: Vec<f32>, vb: VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(n_conv + 1);
        convs.push(conv2d_3x3(in_dim, chs, vb.pp(0))?);
        for i in 0..n_conv {
            convs.push(conv2d_3x3(chs, chs, vb.pp(i + 1))?);
        }
        let last = final_conv(chs, bias, vb.pp(n_conv + 1))?;
        Ok(Self {
            convs,
            last,
            in_dim,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let c_in = xs.dim(1)?;
        if c_in != self.in_dim {
            candle::bail!(
                "head expected {} input channels, feature map has {c_in}",
                self.in_dim
            )
        }
        let mut xs = xs.clone();
        for conv in self.convs.iter() {
            xs = conv.forward(&xs)?.relu()?;
        }
        self.last.forward(&xs)
    }
}

/// Reorders `(B, C, H, W)` to spatial-major and flattens the grid into the
/// anchor axis: `(B, H * W * n_anchors, out_per_anchor)`. The ordering is a
/// pure function of the scale's `(height, width)`, which downstream anchor
/// matching reconstructs from `feat_sizes`.
fn flatten_anchors(xs: &Tensor, out_per_anchor: usize) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    let anchors = h * w * c / out_per_anchor;
    xs.permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((b, anchors, out_per_anchor))
}

#[derive(Debug)]
pub struct DetectionHeads {
    shared: Option<HeadSubnet>,
    att: Option<HeadSubnet>,
    reg: Option<HeadSubnet>,
    span: tracing::Span,
}

impl DetectionHeads {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let in_dim = cfg.head_in_dim();
        let a = cfg.n_anchors;
        let span = tracing::span!(tracing::Level::TRACE, "detection-heads");
        if cfg.use_same_atb {
            // 4 box offsets then the objectness logit, per anchor.
            let mut bias = vec![0f32; 5 * a];
            for anchor in 0..a {
                bias[5 * anchor + 4] = cfg.final_bias as f32;
            }
            let shared = HeadSubnet::new(
                in_dim,
                cfg.head_channels,
                cfg.head_convs,
                bias,
                vb.pp("att_reg_box"),
            )?;
            Ok(Self {
                shared: Some(shared),
                att: None,
                reg: None,
                span,
            })
        } else {
            let att = HeadSubnet::new(
                in_dim,
                cfg.head_channels,
                cfg.head_convs,
                vec![cfg.final_bias as f32; a],
                vb.pp("att_box"),
            )?;
            let reg = HeadSubnet::new(
                in_dim,
                cfg.head_channels,
                cfg.head_convs,
                vec![0f32; 4 * a],
                vb.pp("reg_box"),
            )?;
            Ok(Self {
                shared: None,
                att: Some(att),
                reg: Some(reg),
                span,
            })
        }
    }

    /// Applies the heads to every scale and concatenates along the anchor
    /// axis. Returns `(att_out, bbx_out, feat_sizes)`.
    pub fn forward(&self, feats: &[Tensor]) -> Result<(Tensor, Tensor, Vec<(usize, usize)>)> {
        let _enter = self.span.enter();
        if feats.is_empty() {
            candle::bail!("the detection heads need at least one feature map")
        }
        let mut feat_sizes = Vec::with_capacity(feats.len());
        for feat in feats.iter() {
            let (_b, _c, h, w) = feat.dims4()?;
            feat_sizes.push((h, w));
        }
        let (att_out, bbx_out) = match (&self.shared, &self.att, &self.reg) {
            (Some(shared), _, _) => {
                let mut outs = Vec::with_capacity(feats.len());
                for feat in feats.iter() {
                    outs.push(flatten_anchors(&shared.forward(feat)?, 5)?);
                }
                let att_bbx = Tensor::cat(&outs, 1)?;
                let att = att_bbx.narrow(2, 4, 1)?;
                let bbx = att_bbx.narrow(2, 0, 4)?;
                (att, bbx)
            }
            (None, Some(att), Some(reg)) => {
                let mut att_outs = Vec::with_capacity(feats.len());
                let mut reg_outs = Vec::with_capacity(feats.len());
                for feat in feats.iter() {
                    att_outs.push(flatten_anchors(&att.forward(feat)?, 1)?);
                    reg_outs.push(flatten_anchors(&reg.forward(feat)?, 4)?);
                }
                (Tensor::cat(&att_outs, 1)?, Tensor::cat(&reg_outs, 1)?)
            }
            _ => candle::bail!("detection heads were built inconsistently"),
        };
        Ok((att_out, bbx_out, feat_sizes))
    }
}
