//! Configuration for the poly-encoder model.
//!
//! Everything here is fixed for the lifetime of a model instance. Closed
//! option sets are enums so an unrecognized value fails when the config is
//! parsed, and [`PolyEncoderConfig::validate`] rejects inconsistent settings
//! at construction time rather than mid-forward.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How the encoded context is reduced to a fixed number of vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionKind {
    /// Attend a bank of learned code vectors over the context.
    Codes,
    /// Truncate or zero-pad the raw context sequence to `n_codes` positions.
    NFirst,
}

/// Attention realization used for code reduction and final scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Unscaled dot-product attention, no learned parameters.
    Basic,
    /// Dot-product attention scaled by `1/sqrt(dim)`, no learned parameters.
    Sqrt,
    /// Multi-head attention with learned projections.
    Multihead,
}

/// How a per-example image pseudo-token is fused with the token context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCombinationMode {
    /// Broadcast-add the image vector to every context position.
    Add,
    /// Append the image pseudo-token after the context sequence.
    Postpend,
    /// Insert the image pseudo-token before the context sequence.
    Prepend,
}

/// How the candidate encoder collapses a sequence to a single vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateReduction {
    /// Take the encoding of the first position.
    First,
    /// Mask-weighted mean over valid positions.
    Mean,
}

/// Top-level model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolyEncoderConfig {
    // --- Token encoders ---
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub ffn_size: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub n_positions: usize,
    pub pad_idx: u32,
    pub dropout: f32,
    /// Scale token embeddings by `sqrt(embedding_size)` before the layers.
    pub embeddings_scale: bool,
    pub candidate_reduction: CandidateReduction,

    // --- Context reduction ---
    pub reduction: ReductionKind,
    /// Number of vectors the context is reduced to. In `n_first` mode this is
    /// the number of positions kept.
    pub n_codes: usize,
    pub codes_attention: AttentionKind,
    pub codes_attention_heads: usize,

    // --- Final scorer ---
    pub scorer_attention: AttentionKind,
    pub scorer_attention_heads: usize,

    // --- Image fusion ---
    /// Number of linear layers in the image feature encoder. 0 disables the
    /// image path entirely.
    pub image_encoder_layers: usize,
    pub image_features_dim: usize,
    pub image_combination: ImageCombinationMode,
}

impl Default for PolyEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            embedding_size: 768,
            ffn_size: 3072,
            n_heads: 12,
            n_layers: 12,
            n_positions: 1024,
            pad_idx: 0,
            dropout: 0.1,
            embeddings_scale: true,
            candidate_reduction: CandidateReduction::Mean,
            reduction: ReductionKind::Codes,
            n_codes: 64,
            codes_attention: AttentionKind::Basic,
            codes_attention_heads: 4,
            scorer_attention: AttentionKind::Basic,
            scorer_attention_heads: 4,
            image_encoder_layers: 0,
            image_features_dim: 2048,
            image_combination: ImageCombinationMode::Postpend,
        }
    }
}

impl PolyEncoderConfig {
    /// Whether the context encoder carries the image fusion path.
    pub fn use_image_features(&self) -> bool {
        self.image_encoder_layers > 0
    }

    /// Reject inconsistent settings. Called by the model constructor so a bad
    /// config never reaches a forward pass.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_size == 0 {
            return Err(Error::Config("embedding_size must be non-zero".into()));
        }
        if self.n_heads == 0 || self.embedding_size % self.n_heads != 0 {
            return Err(Error::Config(format!(
                "embedding_size {} not divisible by n_heads {}",
                self.embedding_size, self.n_heads
            )));
        }
        if self.codes_attention == AttentionKind::Multihead
            && (self.codes_attention_heads == 0
                || self.embedding_size % self.codes_attention_heads != 0)
        {
            return Err(Error::Config(format!(
                "embedding_size {} not divisible by codes_attention_heads {}",
                self.embedding_size, self.codes_attention_heads
            )));
        }
        if self.scorer_attention == AttentionKind::Multihead
            && (self.scorer_attention_heads == 0
                || self.embedding_size % self.scorer_attention_heads != 0)
        {
            return Err(Error::Config(format!(
                "embedding_size {} not divisible by scorer_attention_heads {}",
                self.embedding_size, self.scorer_attention_heads
            )));
        }
        if self.n_codes == 0 {
            return Err(Error::Config("n_codes must be at least 1".into()));
        }
        if self.n_positions == 0 {
            return Err(Error::Config("n_positions must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        if self.use_image_features() && self.image_features_dim == 0 {
            return Err(Error::Config(
                "image fusion enabled but image_features_dim is 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        PolyEncoderConfig::default().validate().unwrap();
    }

    #[test]
    fn deserialize_from_partial_json() {
        let json = r#"{"reduction": "n_first", "n_codes": 16}"#;
        let config: PolyEncoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.reduction, ReductionKind::NFirst);
        assert_eq!(config.n_codes, 16);
        // Unspecified fields should use defaults.
        assert_eq!(config.embedding_size, 768);
        assert_eq!(config.scorer_attention, AttentionKind::Basic);
    }

    #[test]
    fn unknown_attention_kind_fails_to_parse() {
        let json = r#"{"scorer_attention": "fancy"}"#;
        assert!(serde_json::from_str::<PolyEncoderConfig>(json).is_err());
    }

    #[test]
    fn serde_round_trip() {
        let config = PolyEncoderConfig {
            reduction: ReductionKind::NFirst,
            codes_attention: AttentionKind::Multihead,
            image_combination: ImageCombinationMode::Prepend,
            ..PolyEncoderConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"n_first\""));
        assert!(json.contains("\"multihead\""));
        assert!(json.contains("\"prepend\""));
        let back: PolyEncoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reduction, ReductionKind::NFirst);
        assert_eq!(back.codes_attention, AttentionKind::Multihead);
    }

    #[test]
    fn indivisible_heads_rejected() {
        let config = PolyEncoderConfig {
            embedding_size: 10,
            n_heads: 3,
            ..PolyEncoderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn multihead_scorer_heads_checked() {
        let config = PolyEncoderConfig {
            embedding_size: 16,
            n_heads: 2,
            scorer_attention: AttentionKind::Multihead,
            scorer_attention_heads: 3,
            ..PolyEncoderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_codes_rejected() {
        let config = PolyEncoderConfig {
            n_codes: 0,
            ..PolyEncoderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
