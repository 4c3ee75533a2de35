//! Variable-length phrase encoding.
//!
//! A batch of padded word-embedding sequences is run through an LSTM or GRU
//! (optionally bidirectional) and summarized by each example's output at its
//! own final valid position. The batch is sorted by descending length before
//! the recurrence and un-sorted afterwards, mirroring packed execution;
//! padded positions never influence the summary because the recurrence is
//! causal and the summary is gathered at `length - 1`.

use candle::{DType, Result, Tensor, D};
use candle_nn::{gru, lstm, RNN, VarBuilder, GRU, LSTM};

use crate::config::{Config, RnnKind};

#[derive(Debug)]
enum Rnn {
    Lstm(LSTM),
    Gru(GRU),
}

impl Rnn {
    fn new(kind: RnnKind, in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        match kind {
            RnnKind::Lstm => Ok(Self::Lstm(lstm(in_dim, hidden_dim, Default::default(), vb)?)),
            RnnKind::Gru => Ok(Self::Gru(gru(in_dim, hidden_dim, Default::default(), vb)?)),
        }
    }

    /// Runs the recurrence over `(B, L, E)` with a zero initial state and
    /// stacks the per-step hidden states into `(B, L, H)`.
    fn seq_outputs(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Lstm(rnn) => {
                let states = rnn.seq(xs)?;
                let hs = states.iter().map(|s| s.h().clone()).collect::<Vec<_>>();
                Tensor::stack(&hs, 1)
            }
            Self::Gru(rnn) => {
                let states = rnn.seq(xs)?;
                let hs = states.iter().map(|s| s.h().clone()).collect::<Vec<_>>();
                Tensor::stack(&hs, 1)
            }
        }
    }
}

/// Full per-position encoder output, the per-example summary vector, and the
/// validity mask over positions.
#[derive(Debug)]
pub struct PhraseEncoding {
    /// `(B, Lm, H')` per-position outputs, original batch order.
    pub sequence: Tensor,
    /// `(B, H')` output at each example's `length - 1` position.
    pub summary: Tensor,
    /// `(B, Lm)` F32 mask, 1 where the position holds a real token.
    pub mask: Tensor,
}

#[derive(Debug)]
pub struct PhraseEncoder {
    fwd: Rnn,
    bwd: Option<Rnn>,
    out_dim: usize,
    span: tracing::Span,
}

impl PhraseEncoder {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let fwd = Rnn::new(cfg.rnn, cfg.emb_dim, cfg.lstm_dim, vb.pp("rnn_fwd"))?;
        let bwd = if cfg.use_bidirectional {
            Some(Rnn::new(cfg.rnn, cfg.emb_dim, cfg.lstm_dim, vb.pp("rnn_bwd"))?)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "phrase-encoder");
        Ok(Self {
            fwd,
            bwd,
            out_dim: cfg.lang_dim(),
            span,
        })
    }

    /// Dimension of the summary vector and of each per-position output.
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Encodes `(B, L, E)` embeddings and returns the summary vector alone.
    pub fn encode(&self, embs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        Ok(self.encode_full(embs, lengths)?.summary)
    }

    /// Encodes `(B, L, E)` embeddings with per-example valid `lengths`.
    pub fn encode_full(&self, embs: &Tensor, lengths: &[usize]) -> Result<PhraseEncoding> {
        let _enter = self.span.enter();
        let (b, l_pad, _emb_dim) = embs.dims3()?;
        if lengths.len() != b {
            candle::bail!(
                "got {} lengths for a batch of {b} phrases",
                lengths.len()
            )
        }
        // A zero length behaves as a single padding token, not as an error.
        let lengths = lengths
            .iter()
            .map(|&len| len.max(1))
            .collect::<Vec<usize>>();
        let max_len = lengths.iter().copied().max().unwrap_or(1);
        if max_len > l_pad {
            candle::bail!(
                "max valid length {max_len} exceeds the padded sequence capacity {l_pad}"
            )
        }
        let embs = embs.narrow(1, 0, max_len)?.contiguous()?;
        let dev = embs.device();

        // Sort by descending length, run the recurrence, un-sort at the end.
        let mut perm = (0..b).collect::<Vec<usize>>();
        perm.sort_by_key(|&i| std::cmp::Reverse(lengths[i]));
        let sorted_lengths = perm.iter().map(|&i| lengths[i]).collect::<Vec<usize>>();
        let perm_t = Tensor::from_vec(perm.iter().map(|&i| i as u32).collect::<Vec<u32>>(), b, dev)?;
        let sorted = embs.index_select(&perm_t, 0)?;

        let fwd_out = self.fwd.seq_outputs(&sorted)?;
        let outputs = match &self.bwd {
            None => fwd_out,
            Some(bwd) => {
                // The backward pass reads each example reversed within its
                // valid length; padding stays in place. The same involutive
                // index restores position order on the outputs.
                let rev = reverse_padded(&sorted, &sorted_lengths)?;
                let bwd_out = bwd.seq_outputs(&rev)?;
                let bwd_out = reverse_padded(&bwd_out, &sorted_lengths)?;
                Tensor::cat(&[&fwd_out, &bwd_out], D::Minus1)?
            }
        };

        // The true final output sits at (length - 1), not at the last padded
        // column.
        let out_dim = outputs.dim(D::Minus1)?;
        let last = sorted_lengths
            .iter()
            .map(|&len| (len - 1) as u32)
            .collect::<Vec<u32>>();
        let last = Tensor::from_vec(last, (b, 1, 1), dev)?
            .broadcast_as((b, 1, out_dim))?
            .contiguous()?;
        let summary = outputs.gather(&last, 1)?.squeeze(1)?;

        let mut inv = vec![0u32; b];
        for (rank, &i) in perm.iter().enumerate() {
            inv[i] = rank as u32;
        }
        let inv_t = Tensor::from_vec(inv, b, dev)?;
        let summary = summary.index_select(&inv_t, 0)?;
        let sequence = outputs.index_select(&inv_t, 0)?;

        let ids = Tensor::arange(0u32, max_len as u32, dev)?
            .unsqueeze(0)?
            .broadcast_as((b, max_len))?
            .contiguous()?;
        let lens = Tensor::from_vec(
            lengths.iter().map(|&len| len as u32).collect::<Vec<u32>>(),
            (b, 1),
            dev,
        )?
        .broadcast_as((b, max_len))?
        .contiguous()?;
        let mask = ids.lt(&lens)?.to_dtype(DType::F32)?;

        Ok(PhraseEncoding {
            sequence,
            summary,
            mask,
        })
    }
}

/// Reverses `(B, L, C)` along the time axis within each example's valid
/// length, leaving padded positions untouched. Applying it twice is the
/// identity.
fn reverse_padded(xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let (b, l, c) = xs.dims3()?;
    let mut idx = Vec::with_capacity(b * l);
    for &len in lengths.iter() {
        for t in 0..l {
            let src = if t < len { len - 1 - t } else { t };
            idx.push(src as u32);
        }
    }
    let idx = Tensor::from_vec(idx, (b, l, 1), xs.device())?
        .broadcast_as((b, l, c))?
        .contiguous()?;
    xs.gather(&idx, 1)
}
