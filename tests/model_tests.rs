use candle::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_zsgnet::config::{BackboneKind, Config};
use candle_zsgnet::fusion::{
    CrossModalAttention, FeaturePyramid, FeatureSelection, SoftParser, VisualEncoder,
};
use candle_zsgnet::{
    Backbone, FilterGatedBackbone, ModelInput, PyramidBackbone, SingleStageBackbone, ZsgNet,
};

/// Pools the image to a 4x4 grid and doubles the channels, giving a fused
/// 6-channel map that depends only on the image.
struct PoolEncoder {
    scales: usize,
}

impl VisualEncoder for PoolEncoder {
    fn encode(&self, image: &Tensor) -> Result<Vec<Tensor>> {
        let pooled = image.avg_pool2d(16)?;
        let map = Tensor::cat(&[&pooled, &pooled], 1)?;
        (0..self.scales)
            .map(|s| map.affine(1.0 / (s + 1) as f64, 0.0))
            .collect()
    }
}

/// Averages the scale maps into the fused map and exposes the raw maps.
struct MeanSelection;

impl FeatureSelection for MeanSelection {
    fn select(&self, _phrase: &Tensor, maps: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        let mut fused = maps[0].clone();
        for map in &maps[1..] {
            fused = (fused + map)?;
        }
        let fused = fused.affine(1.0 / maps.len() as f64, 0.0)?;
        Ok((fused, maps.to_vec()))
    }
}

/// Gates the map with the head-expanded mask, averaged back over heads.
struct GateAttention {
    n_heads: usize,
}

impl CrossModalAttention for GateAttention {
    fn attend(
        &self,
        _phrase: &Tensor,
        map: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (b, _c, h, w) = map.dims4()?;
        let mask = match mask {
            Some(mask) => mask,
            None => candle::bail!("expected a relation mask"),
        };
        assert_eq!(mask.dims(), [b * self.n_heads, 1, h * w]);
        let gate = mask
            .reshape((b, self.n_heads, h * w))?
            .mean(1)?
            .reshape((b, 1, h, w))?;
        Ok((map.broadcast_mul(&gate)?, gate))
    }
}

/// Pass-through attention for the unmasked pyramid stages.
struct PassAttention;

impl CrossModalAttention for PassAttention {
    fn attend(
        &self,
        _phrase: &Tensor,
        map: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        assert!(mask.is_none());
        let (b, _c, h, w) = map.dims4()?;
        let diag = Tensor::ones((b, h * w), DType::F32, map.device())?;
        Ok((map.clone(), diag))
    }
}

/// Identity pyramid, returns the per-scale maps unchanged.
struct FlatPyramid;

impl FeaturePyramid for FlatPyramid {
    fn build_pyramid(&self, maps: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(maps.to_vec())
    }
}

/// Repeats the phrase summary for every relation step.
struct RepeatParser {
    t_obj: usize,
}

impl SoftParser for RepeatParser {
    fn parse(
        &self,
        _sequence: &Tensor,
        summary: &Tensor,
        mask: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (b, d) = summary.dims2()?;
        let sub_exp = summary
            .reshape((b, 1, d))?
            .broadcast_as((b, self.t_obj, d))?
            .contiguous()?;
        Ok((mask.clone(), sub_exp))
    }
}

fn base_cfg() -> Config {
    Config {
        backbone: BackboneKind::SingleStage,
        emb_dim: 3,
        lstm_dim: 4,
        img_dim: 6,
        n_anchors: 2,
        head_channels: 8,
        head_convs: 1,
        ..Default::default()
    }
}

fn single_stage() -> Backbone {
    Backbone::SingleStage(SingleStageBackbone::new(Box::new(PoolEncoder { scales: 1 })))
}

fn inputs(seed_scale: f64) -> Result<ModelInput> {
    let dev = &Device::Cpu;
    let image = Tensor::arange(0f32, (2 * 3 * 64 * 64) as f32, dev)?
        .cos()?
        .reshape((2, 3, 64, 64))?;
    let embeddings = Tensor::arange(0f32, (2 * 6 * 3) as f32, dev)?
        .sin()?
        .reshape((2, 6, 3))?
        .affine(seed_scale, 0.0)?;
    let lengths = Tensor::new(&[4u32, 6], dev)?;
    Ok(ModelInput {
        image,
        embeddings,
        lengths,
    })
}

fn build(cfg: &Config, backbone: Backbone) -> Result<ZsgNet> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let parser: Option<Box<dyn SoftParser + Send + Sync>> = if cfg.relation {
        Some(Box::new(RepeatParser { t_obj: cfg.t_obj }))
    } else {
        None
    };
    ZsgNet::new(cfg, backbone, parser, vb)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

#[test]
fn shared_head_output_shapes() -> Result<()> {
    // One 4x4 scale with 2 anchors per cell: 32 anchors in total.
    let model = build(&base_cfg(), single_stage())?;
    let out = model.forward(&inputs(1.0)?)?;
    assert_eq!(out.att_out.dims(), [2, 32, 1]);
    assert_eq!(out.bbx_out.dims(), [2, 32, 4]);
    assert_eq!(out.feat_sizes, [(4, 4)]);
    assert_eq!(out.num_f_out, 1);
    assert!(out.att_maps.is_empty());
    Ok(())
}

#[test]
fn split_head_output_shapes() -> Result<()> {
    let cfg = Config {
        use_same_atb: false,
        ..base_cfg()
    };
    let model = build(&cfg, single_stage())?;
    let out = model.forward(&inputs(1.0)?)?;
    assert_eq!(out.att_out.dims(), [2, 32, 1]);
    assert_eq!(out.bbx_out.dims(), [2, 32, 4]);
    Ok(())
}

#[test]
fn language_blind_ignores_phrase_content() -> Result<()> {
    let cfg = Config {
        use_lang: false,
        ..base_cfg()
    };
    let model = build(&cfg, single_stage())?;
    let a = model.forward(&inputs(1.0)?)?;
    let b = model.forward(&inputs(-17.5)?)?;
    assert_eq!(max_diff(&a.att_out, &b.att_out)?, 0.0);
    assert_eq!(max_diff(&a.bbx_out, &b.bbx_out)?, 0.0);
    Ok(())
}

#[test]
fn image_blind_and_fully_blind_shapes() -> Result<()> {
    let cfg = Config {
        use_img: false,
        ..base_cfg()
    };
    let model = build(&cfg, single_stage())?;
    let out = model.forward(&inputs(1.0)?)?;
    assert_eq!(out.att_out.dims(), [2, 32, 1]);

    let cfg = Config {
        use_lang: false,
        use_img: false,
        ..base_cfg()
    };
    let model = build(&cfg, single_stage())?;
    let out = model.forward(&inputs(1.0)?)?;
    assert_eq!(out.att_out.dims(), [2, 32, 1]);
    assert_eq!(out.bbx_out.dims(), [2, 32, 4]);
    Ok(())
}

#[test]
fn do_norm_makes_features_scale_invariant() -> Result<()> {
    // The pooling encoder is linear in the image, so channel-wise L2
    // normalization must erase a global rescaling of the input.
    let cfg = Config {
        use_lang: false,
        do_norm: true,
        ..base_cfg()
    };
    let model = build(&cfg, single_stage())?;
    let input = inputs(1.0)?;
    let scaled = ModelInput {
        image: input.image.affine(3.0, 0.0)?,
        embeddings: input.embeddings.clone(),
        lengths: input.lengths.clone(),
    };
    let a = model.forward(&input)?;
    let b = model.forward(&scaled)?;
    assert!(max_diff(&a.att_out, &b.att_out)? < 1e-5);
    assert!(max_diff(&a.bbx_out, &b.bbx_out)? < 1e-5);

    // Without normalization the rescaling reaches the heads.
    let model = build(&Config { do_norm: false, ..cfg }, single_stage())?;
    let a = model.forward(&input)?;
    let b = model.forward(&scaled)?;
    assert!(max_diff(&a.att_out, &b.att_out)? > 1e-6);
    Ok(())
}

#[test]
fn l2_normalize_zeroes_stay_finite() -> Result<()> {
    let xs = Tensor::new(&[[3f32, 4.], [0., 0.]], &Device::Cpu)?;
    let ys = candle_zsgnet::backbone::l2_normalize(&xs, 1)?;
    let rows = ys.to_vec2::<f32>()?;
    assert!((rows[0][0] - 0.6).abs() < 1e-6);
    assert!((rows[0][1] - 0.8).abs() < 1e-6);
    assert_eq!(rows[1], [0.0, 0.0]);
    Ok(())
}

fn pyramid() -> Result<Backbone> {
    let select: Vec<Box<dyn FeatureSelection + Send + Sync>> = vec![
        Box::new(MeanSelection),
        Box::new(MeanSelection),
        Box::new(MeanSelection),
    ];
    let attend: Vec<Box<dyn CrossModalAttention + Send + Sync>> = vec![
        Box::new(PassAttention),
        Box::new(PassAttention),
        Box::new(PassAttention),
    ];
    Ok(Backbone::Pyramid(PyramidBackbone::new(
        Box::new(PoolEncoder { scales: 3 }),
        select,
        attend,
        Box::new(FlatPyramid),
    )?))
}

#[test]
fn pyramid_concatenates_scales() -> Result<()> {
    // Three 4x4 scales with 2 anchors per cell: 96 anchors in total.
    let cfg = Config {
        backbone: BackboneKind::Pyramid,
        ..base_cfg()
    };
    let model = build(&cfg, pyramid()?)?;
    let out = model.forward(&inputs(1.0)?)?;
    assert_eq!(out.att_out.dims(), [2, 96, 1]);
    assert_eq!(out.bbx_out.dims(), [2, 96, 4]);
    assert_eq!(out.feat_sizes, [(4, 4), (4, 4), (4, 4)]);
    assert_eq!(out.num_f_out, 3);
    assert_eq!(out.att_maps.len(), 3);
    Ok(())
}

#[test]
fn pyramid_requires_three_stages() {
    let select: Vec<Box<dyn FeatureSelection + Send + Sync>> = vec![Box::new(MeanSelection)];
    let attend: Vec<Box<dyn CrossModalAttention + Send + Sync>> = vec![Box::new(PassAttention)];
    let res = PyramidBackbone::new(
        Box::new(PoolEncoder { scales: 3 }),
        select,
        attend,
        Box::new(FlatPyramid),
    );
    assert!(res.is_err());
}

fn filter_gated_cfg() -> Config {
    Config {
        backbone: BackboneKind::FilterGated,
        relation: true,
        t_obj: 2,
        rel_kernel_dim: 9,
        n_heads: 2,
        ..base_cfg()
    }
}

fn filter_gated(cfg: &Config) -> Backbone {
    Backbone::FilterGated(FilterGatedBackbone::new(
        Box::new(PoolEncoder { scales: 3 }),
        Box::new(MeanSelection),
        Box::new(GateAttention {
            n_heads: cfg.n_heads,
        }),
        cfg.n_heads,
        cfg.t_obj,
    ))
}

#[test]
fn filter_gated_relation_path() -> Result<()> {
    let cfg = filter_gated_cfg();
    let model = build(&cfg, filter_gated(&cfg))?;
    let out = model.forward(&inputs(1.0)?)?;
    assert_eq!(out.att_out.dims(), [2, 32, 1]);
    assert_eq!(out.bbx_out.dims(), [2, 32, 4]);
    assert_eq!(out.feat_sizes, [(4, 4)]);
    assert_eq!(out.num_f_out, 1);
    assert_eq!(out.att_maps.len(), 1);
    Ok(())
}

#[test]
fn construction_rejects_bad_configs() -> Result<()> {
    // Relation kernel dimension must be a perfect square.
    let cfg = Config {
        rel_kernel_dim: 8,
        ..filter_gated_cfg()
    };
    assert!(build(&cfg, filter_gated(&cfg)).is_err());

    // The filter-gated backbone requires relation parsing.
    let cfg = Config {
        relation: false,
        ..filter_gated_cfg()
    };
    assert!(build(&cfg, filter_gated(&cfg)).is_err());

    // Relation parsing requires full fusion.
    let cfg = Config {
        use_img: false,
        ..filter_gated_cfg()
    };
    assert!(build(&cfg, filter_gated(&cfg)).is_err());

    // A parser must be supplied when relation parsing is on.
    let cfg = filter_gated_cfg();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(ZsgNet::new(&cfg, filter_gated(&cfg), None, vb).is_err());
    Ok(())
}

#[test]
fn single_stage_rejects_multi_scale_encoders() -> Result<()> {
    let cfg = base_cfg();
    let backbone =
        Backbone::SingleStage(SingleStageBackbone::new(Box::new(PoolEncoder { scales: 3 })));
    let model = build(&cfg, backbone)?;
    assert!(model.forward(&inputs(1.0)?).is_err());
    Ok(())
}
