//! Attention primitives for the poly-encoder.
//!
//! Two realizations behind one dispatch type:
//! - [`BasicAttention`] — dot-product similarity + masked softmax, optionally
//!   scaled by `1/sqrt(dim)`; no learned parameters
//! - [`MultiHeadAttention`] — learned Q/K/V projections, scaled dot-product
//!   per head, learned output projection
//!
//! [`PolyAttention`] selects the realization once at construction and exposes
//! a single `attend(queries, keys, values, mask)` capability.

use candle_core::{Module, Tensor};
use candle_nn::{ops, Dropout, VarBuilder};

use crate::config::AttentionKind;
use crate::{Error, Result};

/// Additive key-mask bias: 0.0 on valid keys, -1e9 on masked keys.
///
/// Softmax renormalizes over the valid columns; the masked logits underflow
/// to exactly zero weight in f32.
fn key_mask_bias(mask: &Tensor) -> Result<Tensor> {
    ((mask - 1.0)? * 1e9).map_err(Into::into)
}

/// Dot-product attention over full embedding vectors.
///
/// No learned parameters. With `scaled` set, similarities are divided by
/// `sqrt(dim)`; otherwise raw dot products are used.
#[derive(Debug, Clone, Copy)]
pub struct BasicAttention {
    scaled: bool,
}

impl BasicAttention {
    pub fn new(scaled: bool) -> Self {
        Self { scaled }
    }

    /// Forward pass.
    ///
    /// - `queries`: `[B, n_q, D]`
    /// - `keys`: `[B, n_k, D]`
    /// - `values`: `[B, n_k, D]`
    /// - `mask`: optional `[B, n_k]` key validity (1=valid, 0=masked)
    ///
    /// Returns `[B, n_q, D]`, each row a convex combination of value rows.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (_b, _n_q, dim) = queries.dims3()?;

        // Similarities: [B, n_q, n_k]
        let mut scores = queries.matmul(&keys.t()?)?;
        if self.scaled {
            scores = (scores / (dim as f64).sqrt())?;
        }

        if let Some(mask) = mask {
            // mask: [B, n_k] → [B, 1, n_k]
            let bias = key_mask_bias(&mask.unsqueeze(1)?)?;
            scores = scores.broadcast_add(&bias)?;
        }

        let weights = ops::softmax_last_dim(&scores)?;
        weights.matmul(values).map_err(Into::into)
    }
}

/// Multi-head scaled dot-product attention with learned projections.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    to_q: candle_nn::Linear,
    to_k: candle_nn::Linear,
    to_v: candle_nn::Linear,
    to_out: candle_nn::Linear,
    attn_dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(Error::Config(format!(
                "attention dim {dim} not divisible by {num_heads} heads"
            )));
        }
        let to_q = candle_nn::linear(dim, dim, vb.pp("to_q"))?;
        let to_k = candle_nn::linear(dim, dim, vb.pp("to_k"))?;
        let to_v = candle_nn::linear(dim, dim, vb.pp("to_v"))?;
        let to_out = candle_nn::linear(dim, dim, vb.pp("to_out"))?;
        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            attn_dropout: Dropout::new(dropout),
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// Forward pass.
    ///
    /// - `queries`: `[B, n_q, D]`
    /// - `keys`: `[B, n_k, D]`
    /// - `values`: `[B, n_k, D]`
    /// - `mask`: optional `[B, n_k]` key validity (1=valid, 0=masked)
    ///
    /// Returns `[B, n_q, D]`.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, n_q, _dim) = queries.dims3()?;
        let (_, n_k, _) = keys.dims3()?;

        let q = self.to_q.forward(queries)?;
        let k = self.to_k.forward(keys)?;
        let v = self.to_v.forward(values)?;

        // Reshape to [B, H, S, head_dim]
        let q = q
            .reshape((batch, n_q, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, n_k, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, n_k, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.transpose(2, 3)?)? / scale)?; // [B, H, n_q, n_k]

        if let Some(mask) = mask {
            // mask: [B, n_k] → [B, 1, 1, n_k]
            let bias = key_mask_bias(&mask.unsqueeze(1)?.unsqueeze(2)?)?;
            scores = scores.broadcast_add(&bias)?;
        }

        let weights = ops::softmax_last_dim(&scores)?;
        let weights = self.attn_dropout.forward(&weights, train)?;
        let out = weights.matmul(&v)?; // [B, H, n_q, head_dim]

        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, n_q, self.num_heads * self.head_dim))?;
        self.to_out.forward(&out).map_err(Into::into)
    }
}

/// Attention realization selected once at construction.
#[derive(Debug, Clone)]
pub enum PolyAttention {
    Basic(BasicAttention),
    MultiHead(MultiHeadAttention),
}

impl PolyAttention {
    /// Build the realization named by `kind`. `num_heads` and `dropout` are
    /// only consulted for `multihead`; the basic variants consume no
    /// parameters from `vb`.
    pub fn new(
        kind: AttentionKind,
        dim: usize,
        num_heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        match kind {
            AttentionKind::Basic => Ok(Self::Basic(BasicAttention::new(false))),
            AttentionKind::Sqrt => Ok(Self::Basic(BasicAttention::new(true))),
            AttentionKind::Multihead => Ok(Self::MultiHead(MultiHeadAttention::new(
                dim, num_heads, dropout, vb,
            )?)),
        }
    }

    /// Attend `queries` over `values`, with `keys` defaulting to `values`
    /// when `None`.
    ///
    /// The output is always rank-3 `[B, n_q, D]`: a realization that drops
    /// the query dimension for `n_q == 1` has it restored before returning.
    pub fn attend(
        &self,
        queries: &Tensor,
        keys: Option<&Tensor>,
        values: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let keys = keys.unwrap_or(values);
        let out = match self {
            Self::Basic(attn) => attn.forward(queries, keys, values, mask)?,
            Self::MultiHead(attn) => attn.forward(queries, keys, values, mask, train)?,
        };
        if out.dims().len() == 2 {
            out.unsqueeze(1).map_err(Into::into)
        } else {
            Ok(out)
        }
    }
}
