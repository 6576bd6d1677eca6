//! Context reduction to a fixed number of vectors.
//!
//! Maps a variable-length encoded context `[B, T, D]` + mask to exactly
//! `n_codes` vectors per example, either by attending a bank of learned code
//! vectors over the context (`codes`) or by truncating/zero-padding the raw
//! sequence (`n_first`).

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};

use super::attention::PolyAttention;
use crate::config::{PolyEncoderConfig, ReductionKind};
use crate::Result;

/// Reduction strategy, selected once at construction.
#[derive(Debug, Clone)]
pub enum ContextReducer {
    /// Learned code vectors attend over the full context.
    Codes {
        /// Code bank `[n_codes, D]`, uniform(0, 1) init, trained with the model.
        codes: Tensor,
        attention: PolyAttention,
        n_codes: usize,
    },
    /// Keep the first `n_codes` positions verbatim, zero-padding short
    /// contexts on the right.
    NFirst { n_codes: usize },
}

impl ContextReducer {
    pub fn new(cfg: &PolyEncoderConfig, vb: VarBuilder) -> Result<Self> {
        match cfg.reduction {
            ReductionKind::Codes => {
                let codes = vb.get_with_hints(
                    (cfg.n_codes, cfg.embedding_size),
                    "codes",
                    Init::Uniform { lo: 0.0, up: 1.0 },
                )?;
                let attention = PolyAttention::new(
                    cfg.codes_attention,
                    cfg.embedding_size,
                    cfg.codes_attention_heads,
                    cfg.dropout,
                    vb.pp("code_attention"),
                )?;
                Ok(Self::Codes {
                    codes,
                    attention,
                    n_codes: cfg.n_codes,
                })
            }
            ReductionKind::NFirst => Ok(Self::NFirst { n_codes: cfg.n_codes }),
        }
    }

    pub fn n_codes(&self) -> usize {
        match self {
            Self::Codes { n_codes, .. } | Self::NFirst { n_codes } => *n_codes,
        }
    }

    /// Reduce an encoded context to exactly `n_codes` vectors.
    ///
    /// Input: `ctxt_out` [B, T, D], `ctxt_mask` [B, T].
    /// Output: (rep [B, n_codes, D], mask [B, n_codes]).
    ///
    /// In `codes` mode the output mask is all-ones: the attention has already
    /// absorbed the padding information, so every code vector is valid. In
    /// `n_first` mode the mask marks the synthetic zero rows introduced when
    /// `T < n_codes`.
    pub fn reduce(
        &self,
        ctxt_out: &Tensor,
        ctxt_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Codes {
                codes,
                attention,
                n_codes,
            } => {
                let (batch, _t, dim) = ctxt_out.dims3()?;
                let queries = codes
                    .unsqueeze(0)?
                    .expand((batch, *n_codes, dim))?
                    .contiguous()?;
                let rep = attention.attend(&queries, None, ctxt_out, Some(ctxt_mask), train)?;
                let mask = Tensor::ones((batch, *n_codes), DType::F32, ctxt_out.device())?;
                Ok((rep, mask))
            }
            Self::NFirst { n_codes } => {
                let (batch, t, dim) = ctxt_out.dims3()?;
                if t >= *n_codes {
                    Ok((
                        ctxt_out.narrow(1, 0, *n_codes)?,
                        ctxt_mask.narrow(1, 0, *n_codes)?,
                    ))
                } else {
                    let missing = *n_codes - t;
                    let pad_rep =
                        Tensor::zeros((batch, missing, dim), ctxt_out.dtype(), ctxt_out.device())?;
                    let rep = Tensor::cat(&[ctxt_out, &pad_rep], 1)?;
                    let pad_mask =
                        Tensor::zeros((batch, missing), ctxt_mask.dtype(), ctxt_mask.device())?;
                    let mask = Tensor::cat(&[ctxt_mask, &pad_mask], 1)?;
                    Ok((rep, mask))
                }
            }
        }
    }
}
