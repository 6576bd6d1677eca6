//! The poly-encoder scoring model.
//!
//! Combines the context encoder (optionally image-fused), the candidate
//! encoder, the context reducer, and the final candidate-as-query attention
//! into the two operations consumed by a ranking harness:
//!
//! - [`PolyEncoder::encode`] — tokens/images → reduced context + candidate reps
//! - [`PolyEncoder::score`] — reduced context + candidate reps → scores
//!
//! Also provides safetensors checkpoint save/load with back-fill of the code
//! bank when restoring an older checkpoint that predates it.

use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use super::attention::PolyAttention;
use super::encoder::TransformerEncoder;
use super::image::ContextWithImageEncoder;
use super::reducer::ContextReducer;
use crate::config::PolyEncoderConfig;
use crate::{Error, Result};

/// Name of the learned code bank parameter in checkpoints.
pub const CODE_BANK_PARAM: &str = "codes";

/// Output of [`PolyEncoder::encode`]. Fields are present for whichever
/// inputs were supplied.
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Reduced context representation `[B, n_codes, D]`.
    pub context_rep: Option<Tensor>,
    /// Validity mask for the reduced context `[B, n_codes]`.
    pub context_mask: Option<Tensor>,
    /// One vector per candidate `[B, C, D]`.
    pub candidate_rep: Option<Tensor>,
}

/// Poly-encoder model: independent context/candidate encoding, learned
/// context reduction, and candidate-conditioned scoring.
#[derive(Debug, Clone)]
pub struct PolyEncoder {
    encoder_ctxt: ContextWithImageEncoder,
    encoder_cand: TransformerEncoder,
    reducer: ContextReducer,
    attention: PolyAttention,
}

impl PolyEncoder {
    /// Build the model. All configuration errors surface here, never during
    /// a forward pass.
    pub fn new(cfg: &PolyEncoderConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        tracing::debug!(
            reduction = ?cfg.reduction,
            n_codes = cfg.n_codes,
            scorer = ?cfg.scorer_attention,
            "building poly-encoder"
        );
        let encoder_ctxt = ContextWithImageEncoder::new(cfg, vb.pp("encoder_ctxt"))?;
        let encoder_cand = TransformerEncoder::new(cfg, vb.pp("encoder_cand"))?;
        let reducer = ContextReducer::new(cfg, vb.clone())?;
        let attention = PolyAttention::new(
            cfg.scorer_attention,
            cfg.embedding_size,
            cfg.scorer_attention_heads,
            cfg.dropout,
            vb.pp("attention"),
        )?;
        Ok(Self {
            encoder_ctxt,
            encoder_cand,
            reducer,
            attention,
        })
    }

    /// Number of vectors the context is reduced to.
    pub fn n_codes(&self) -> usize {
        self.reducer.n_codes()
    }

    /// Encode context and/or candidates.
    ///
    /// - `ctxt_tokens`: optional [B, T] token ids
    /// - `ctxt_images`: optional per-example image features, each
    ///   [image_features_dim]
    /// - `cand_tokens`: optional [B, C, T] token ids
    ///
    /// Any subset of inputs may be absent, but at least one must be present.
    pub fn encode(
        &self,
        ctxt_tokens: Option<&Tensor>,
        ctxt_images: Option<&[Option<Tensor>]>,
        cand_tokens: Option<&Tensor>,
        train: bool,
    ) -> Result<Encoded> {
        if ctxt_tokens.is_none() && ctxt_images.is_none() && cand_tokens.is_none() {
            return Err(Error::Usage(
                "encode called with no inputs: provide context tokens, image features, \
                 or candidate tokens"
                    .into(),
            ));
        }

        let candidate_rep = match cand_tokens {
            Some(cand_tokens) => Some(self.encode_candidates(cand_tokens, train)?),
            None => None,
        };

        let (context_rep, context_mask) = if ctxt_tokens.is_some() || ctxt_images.is_some() {
            let (ctxt_out, ctxt_mask) = self.encoder_ctxt.forward(ctxt_tokens, ctxt_images, train)?;
            let (rep, mask) = self.reducer.reduce(&ctxt_out, &ctxt_mask, train)?;
            (Some(rep), Some(mask))
        } else {
            (None, None)
        };

        Ok(Encoded {
            context_rep,
            context_mask,
            candidate_rep,
        })
    }

    /// Encode batch-local candidates [B, C, T] into [B, C, D].
    ///
    /// The candidate axis is flattened into the batch for encoding and
    /// restored afterwards; candidate `i` of example `b` occupies flat row
    /// `b·C + i`, so the round trip is lossless and order-preserving.
    fn encode_candidates(&self, cand_tokens: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, num_cands, seq_len) = cand_tokens.dims3().map_err(|_| {
            Error::Shape(format!(
                "candidate tokens: expected rank 3 [batch, cands, seq], got shape {:?}",
                cand_tokens.dims()
            ))
        })?;
        let flat = cand_tokens.reshape((batch * num_cands, seq_len))?;
        let rep = self.encoder_cand.encode_reduced(&flat, train)?; // [B·C, D]
        let dim = rep.dim(1)?;
        rep.reshape((batch, num_cands, dim)).map_err(Into::into)
    }

    /// Encode a candidate pool [C, T] shared across a batch into [1, C, D].
    ///
    /// The result can be cached by the harness and re-used across calls via
    /// [`PolyEncoder::expand_candidate_pool`].
    pub fn encode_candidate_pool(&self, cand_tokens: &Tensor, train: bool) -> Result<Tensor> {
        if cand_tokens.dims().len() != 2 {
            return Err(Error::Shape(format!(
                "candidate pool tokens: expected rank 2 [cands, seq], got shape {:?}",
                cand_tokens.dims()
            )));
        }
        let rep = self.encoder_cand.encode_reduced(cand_tokens, train)?; // [C, D]
        rep.unsqueeze(0).map_err(Into::into)
    }

    /// Expand a cached candidate pool [1, C, D] to a batch [B, C, D].
    ///
    /// For `batch == 1` the pool is returned unmodified; otherwise every
    /// batch row is the pool representation.
    pub fn expand_candidate_pool(&self, pool: &Tensor, batch: usize) -> Result<Tensor> {
        let (one, num_cands, dim) = pool.dims3().map_err(|_| {
            Error::Shape(format!(
                "candidate pool: expected rank 3 [1, cands, dim], got shape {:?}",
                pool.dims()
            ))
        })?;
        if one != 1 {
            return Err(Error::Shape(format!(
                "candidate pool: expected leading dim 1, got {one}"
            )));
        }
        if batch == 0 {
            return Err(Error::Usage("batch size must be at least 1".into()));
        }
        if batch == 1 {
            return Ok(pool.clone());
        }
        pool.expand((batch, num_cands, dim))?
            .contiguous()
            .map_err(Into::into)
    }

    /// Score candidates against the reduced context.
    ///
    /// - `ctxt_rep`: [B, n_codes, D]
    /// - `ctxt_rep_mask`: [B, n_codes]
    /// - `cand_rep`: [B, C, D]
    ///
    /// Each candidate vector queries the reduced context; the score is the
    /// dot product of the attended context vector with the candidate vector.
    /// Returns raw scores [B, C]; normalization is the loss function's job.
    pub fn score(
        &self,
        ctxt_rep: &Tensor,
        ctxt_rep_mask: &Tensor,
        cand_rep: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (ctxt_batch, _n, _d) = ctxt_rep.dims3().map_err(|_| {
            Error::Shape(format!(
                "context rep: expected rank 3 [batch, n_codes, dim], got shape {:?}",
                ctxt_rep.dims()
            ))
        })?;
        let (cand_batch, _c, _d2) = cand_rep.dims3().map_err(|_| {
            Error::Shape(format!(
                "candidate rep: expected rank 3 [batch, cands, dim], got shape {:?}",
                cand_rep.dims()
            ))
        })?;
        if ctxt_batch != cand_batch {
            return Err(Error::Shape(format!(
                "context batch {ctxt_batch} != candidate batch {cand_batch}"
            )));
        }

        let ctxt_final =
            self.attention
                .attend(cand_rep, None, ctxt_rep, Some(ctxt_rep_mask), train)?;
        (ctxt_final * cand_rep)?.sum(2).map_err(Into::into)
    }
}

fn is_code_bank(name: &str) -> bool {
    name == CODE_BANK_PARAM || name.ends_with(".codes")
}

/// Write every model parameter (code bank included) to a safetensors file.
pub fn save_checkpoint<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<()> {
    varmap.save(path.as_ref()).map_err(Into::into)
}

/// Restore model parameters from a safetensors file.
///
/// A checkpoint that predates the code bank parameter is accepted: the code
/// bank keeps its in-memory initialization. Any other missing parameter is a
/// [`Error::WeightLoad`].
pub fn load_checkpoint<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<()> {
    let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        match tensors.get(name) {
            Some(tensor) => {
                var.set(&tensor.to_device(var.as_tensor().device())?)?;
            }
            None if is_code_bank(name) => {
                tracing::warn!(
                    "checkpoint missing `{name}`; keeping in-memory initialization"
                );
            }
            None => {
                return Err(Error::WeightLoad(format!("missing tensor `{name}`")));
            }
        }
    }
    Ok(())
}
