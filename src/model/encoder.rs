//! Transformer encoder over token sequences.
//!
//! Token + learned positional embeddings feeding a stack of pre-norm
//! self-attention layers. Two output paths:
//! - [`TransformerEncoder::encode`] — the full sequence and its pad mask,
//!   used for the context
//! - [`TransformerEncoder::encode_reduced`] — one vector per sequence, used
//!   for candidates

use candle_core::{DType, IndexOp, Module, Tensor};
use candle_nn::{self as nn, Dropout, Init, VarBuilder};

use super::attention::MultiHeadAttention;
use crate::config::{CandidateReduction, PolyEncoderConfig};
use crate::{Error, Result};

/// Pre-norm transformer encoder layer: self-attention + ReLU feed-forward.
#[derive(Debug, Clone)]
struct EncoderLayer {
    self_attn: MultiHeadAttention,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    ffn1: nn::Linear,
    ffn2: nn::Linear,
    dropout: Dropout,
}

impl EncoderLayer {
    fn new(cfg: &PolyEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embedding_size;
        Ok(Self {
            self_attn: MultiHeadAttention::new(dim, cfg.n_heads, cfg.dropout, vb.pp("self_attn"))?,
            norm1: nn::layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            norm2: nn::layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            ffn1: nn::linear(dim, cfg.ffn_size, vb.pp("ffn1"))?,
            ffn2: nn::linear(cfg.ffn_size, dim, vb.pp("ffn2"))?,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    /// `hidden`: [B, T, D], `mask`: [B, T] (1=valid, 0=pad).
    fn forward(&self, hidden: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        // Self-attention with residual
        let residual = hidden;
        let h = self.norm1.forward(hidden)?;
        let h = self.self_attn.forward(&h, &h, &h, Some(mask), train)?;
        let h = (residual + self.dropout.forward(&h, train)?)?;

        // Feed-forward with residual
        let residual = &h;
        let x = self.norm2.forward(&h)?;
        let x = self.ffn2.forward(&self.ffn1.forward(&x)?.relu()?)?;
        (residual + self.dropout.forward(&x, train)?).map_err(Into::into)
    }
}

/// Transformer encoder producing per-token representations and a pad mask.
#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    embeddings: nn::Embedding,
    position_embeddings: nn::Embedding,
    layers: Vec<EncoderLayer>,
    dropout: Dropout,
    pad_idx: f64,
    n_positions: usize,
    embedding_size: usize,
    embeddings_scale: bool,
    reduction: CandidateReduction,
}

impl TransformerEncoder {
    pub fn new(cfg: &PolyEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embedding_size;
        // Token embeddings, normal(0, dim^-0.5) init.
        let embed_weight = vb.pp("embeddings").get_with_hints(
            (cfg.vocab_size, dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: (dim as f64).powf(-0.5),
            },
        )?;
        let embeddings = nn::Embedding::new(embed_weight, dim);

        let position_weight = vb.pp("position_embeddings").get_with_hints(
            (cfg.n_positions, dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: (dim as f64).powf(-0.5),
            },
        )?;
        let position_embeddings = nn::Embedding::new(position_weight, dim);

        let mut layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            layers.push(EncoderLayer::new(cfg, vb.pp(format!("layers.{i}")))?);
        }

        Ok(Self {
            embeddings,
            position_embeddings,
            layers,
            dropout: Dropout::new(cfg.dropout),
            pad_idx: cfg.pad_idx as f64,
            n_positions: cfg.n_positions,
            embedding_size: dim,
            embeddings_scale: cfg.embeddings_scale,
            reduction: cfg.candidate_reduction,
        })
    }

    /// Encode a token batch into per-position representations.
    ///
    /// Input: `tokens` [B, T] integer ids, padded with `pad_idx`.
    /// Output: (`hidden` [B, T, D], `mask` [B, T]) — padded positions are
    /// zeroed in `hidden` and 0.0 in `mask`.
    pub fn encode(&self, tokens: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (_b, t) = tokens.dims2().map_err(|_| {
            Error::Shape(format!(
                "tokens: expected rank 2 [batch, seq], got shape {:?}",
                tokens.dims()
            ))
        })?;
        if t > self.n_positions {
            return Err(Error::Shape(format!(
                "sequence length {t} exceeds n_positions {}",
                self.n_positions
            )));
        }

        let mask = tokens.ne(self.pad_idx)?.to_dtype(DType::F32)?;

        let mut h = self.embeddings.forward(tokens)?;
        if self.embeddings_scale {
            h = (h * (self.embedding_size as f64).sqrt())?;
        }

        let positions = Tensor::arange(0i64, t as i64, tokens.device())?.unsqueeze(0)?;
        let pos_emb = self.position_embeddings.forward(&positions)?; // [1, T, D]
        let mut h = h.broadcast_add(&pos_emb)?;
        h = self.dropout.forward(&h, train)?;

        for layer in &self.layers {
            h = layer.forward(&h, &mask, train)?;
        }

        // Zero out padded positions so downstream sums cannot pick them up.
        let h = h.broadcast_mul(&mask.unsqueeze(2)?)?;
        Ok((h, mask))
    }

    /// Encode a token batch and collapse each sequence to a single vector.
    ///
    /// Input: `tokens` [B, T]. Output: [B, D].
    pub fn encode_reduced(&self, tokens: &Tensor, train: bool) -> Result<Tensor> {
        let (hidden, mask) = self.encode(tokens, train)?;
        match self.reduction {
            CandidateReduction::First => hidden.i((.., 0, ..)).map_err(Into::into),
            CandidateReduction::Mean => {
                let summed = hidden.sum(1)?; // pads are zeroed already
                let lengths = mask.sum_keepdim(1)?.maximum(1.0)?; // [B, 1]
                summed.broadcast_div(&lengths).map_err(Into::into)
            }
        }
    }
}
