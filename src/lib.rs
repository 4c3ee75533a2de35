//! ZSGNet-style language-conditioned visual grounding.
//!
//! Given an image and a referring phrase, the model predicts an objectness
//! logit and a box-regression offset for every anchor of a multi-scale grid.
//! See "Zero-Shot Grounding of Objects from Natural Language Queries",
//! Sadhu et al. 2019, <https://arxiv.org/abs/1908.07129>.
//!
//! The convolutional encoders, adaptive feature selection, cross-modal
//! attention, feature pyramid, and the soft relation parser are externally
//! owned and plugged in through the traits in [`fusion`]. This crate provides
//! the phrase encoder, the relation filter generator with its mask diffusion
//! engine, the backbone dispatch, the detection heads, and the top-level
//! forward orchestration.

pub mod backbone;
pub mod config;
pub mod fusion;
pub mod heads;
pub mod mask;
pub mod model;
pub mod phrase;
pub mod relation;

pub use backbone::{Backbone, FilterGatedBackbone, PyramidBackbone, SingleStageBackbone};
pub use config::{BackboneKind, Config, ForwardMode, RnnKind};
pub use model::{ModelInput, ModelOutput, ZsgNet};
