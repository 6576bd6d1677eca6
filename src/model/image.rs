//! Image feature encoding and context/image fusion.
//!
//! A small feed-forward stack maps a fixed-dimension image feature vector
//! into embedding space, producing one pseudo-token per example. The
//! pseudo-token is fused with the token-context sequence by addition,
//! prepending, or postpending along the sequence axis.

use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{self as nn, Dropout, VarBuilder};

use super::encoder::TransformerEncoder;
use crate::config::{ImageCombinationMode, PolyEncoderConfig};
use crate::{Error, Result};

/// Feed-forward image feature encoder: `image_features_dim → D`, with
/// `(ReLU, Dropout, Linear(D, D))` per extra layer.
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    input: nn::Linear,
    hidden: Vec<nn::Linear>,
    dropout: Dropout,
}

impl ImageEncoder {
    pub fn new(cfg: &PolyEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embedding_size;
        let input = nn::linear(cfg.image_features_dim, dim, vb.pp("layers.0"))?;
        let mut hidden = Vec::with_capacity(cfg.image_encoder_layers.saturating_sub(1));
        for i in 1..cfg.image_encoder_layers {
            hidden.push(nn::linear(dim, dim, vb.pp(format!("layers.{i}")))?);
        }
        Ok(Self {
            input,
            hidden,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    /// `features`: [N, image_features_dim] → [N, D].
    pub fn forward(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = self.input.forward(features)?;
        for layer in &self.hidden {
            h = layer.forward(&self.dropout.forward(&h.relu()?, train)?)?;
        }
        Ok(h)
    }
}

/// Context encoder with an optional image fusion path.
///
/// Wraps the token encoder; when image fusion is enabled, per-example image
/// features are encoded into a single pseudo-token and combined with the
/// token sequence per the configured [`ImageCombinationMode`].
#[derive(Debug, Clone)]
pub struct ContextWithImageEncoder {
    tokens: TransformerEncoder,
    image_encoder: Option<ImageEncoder>,
    combination: ImageCombinationMode,
    embedding_size: usize,
}

impl ContextWithImageEncoder {
    pub fn new(cfg: &PolyEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let tokens = TransformerEncoder::new(cfg, vb.pp("tokens"))?;
        let image_encoder = if cfg.use_image_features() {
            if cfg.image_combination == ImageCombinationMode::Add {
                tracing::warn!(
                    "image combination mode `add` is experimental; the image vector is \
                     summed into every context position"
                );
            }
            Some(ImageEncoder::new(cfg, vb.pp("image_encoder"))?)
        } else {
            None
        };
        Ok(Self {
            tokens,
            image_encoder,
            combination: cfg.image_combination,
            embedding_size: cfg.embedding_size,
        })
    }

    /// Encode the present images of a batch.
    ///
    /// `images` holds one entry per example; absent entries become a zero
    /// vector with an invalid mask flag. Present entries are encoded in one
    /// batched forward over the valid subset and scattered back into batch
    /// order. Returns `None` when every entry is absent.
    fn encode_images(
        &self,
        encoder: &ImageEncoder,
        images: &[Option<Tensor>],
        train: bool,
    ) -> Result<Option<(Tensor, Tensor)>> {
        let valid: Vec<&Tensor> = images.iter().flatten().collect();
        if valid.is_empty() {
            return Ok(None);
        }
        let stacked = Tensor::stack(&valid, 0)?; // [N_valid, img_dim]
        let encoded = encoder.forward(&stacked, train)?; // [N_valid, D]
        let device = encoded.device();
        let dtype = encoded.dtype();

        let mut rows = Vec::with_capacity(images.len());
        let mut mask_vals = Vec::with_capacity(images.len());
        let mut next = 0;
        for image in images {
            if image.is_some() {
                rows.push(encoded.i(next)?);
                mask_vals.push(1.0f32);
                next += 1;
            } else {
                rows.push(Tensor::zeros(self.embedding_size, dtype, device)?);
                mask_vals.push(0.0f32);
            }
        }

        let image_enc = Tensor::stack(&rows, 0)?.unsqueeze(1)?; // [B, 1, D]
        let image_mask =
            Tensor::new(mask_vals.as_slice(), device)?.reshape((images.len(), 1))?;
        Ok(Some((image_enc, image_mask)))
    }

    /// Encode tokens and/or images into a single (sequence, mask) pair.
    ///
    /// - `tokens`: optional [B, T] token ids
    /// - `images`: optional per-example image features, each [image_features_dim]
    ///
    /// At least one of the two must be present. When both are, the image
    /// pseudo-token is fused per the combination mode; when only one is, that
    /// half is returned as-is.
    pub fn forward(
        &self,
        tokens: Option<&Tensor>,
        images: Option<&[Option<Tensor>]>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        if images.is_some() && self.image_encoder.is_none() {
            return Err(Error::Usage(
                "image features provided but image fusion is disabled \
                 (image_encoder_layers is 0)"
                    .into(),
            ));
        }

        let context = match tokens {
            Some(tokens) => Some(self.tokens.encode(tokens, train)?),
            None => None,
        };
        let image = match (images, &self.image_encoder) {
            (Some(images), Some(encoder)) => {
                if let Some(tokens) = tokens {
                    let batch = tokens.dim(0)?;
                    if images.len() != batch {
                        return Err(Error::Shape(format!(
                            "got {} image entries for a batch of {batch}",
                            images.len()
                        )));
                    }
                }
                self.encode_images(encoder, images, train)?
            }
            _ => None,
        };

        match (context, image) {
            (None, None) => Err(Error::Usage(
                "no input: provide context tokens, image features, or both".into(),
            )),
            (Some((enc, mask)), None) => Ok((enc, mask)),
            (None, Some((image_enc, image_mask))) => Ok((image_enc, image_mask)),
            (Some((enc, mask)), Some((image_enc, image_mask))) => match self.combination {
                ImageCombinationMode::Add => {
                    // Image vector broadcast over every position; mask unchanged.
                    let fused = enc.broadcast_add(&image_enc)?;
                    Ok((fused, mask))
                }
                ImageCombinationMode::Postpend => {
                    let fused = Tensor::cat(&[&enc, &image_enc], 1)?;
                    let fused_mask = Tensor::cat(&[&mask, &image_mask], 1)?;
                    Ok((fused, fused_mask))
                }
                ImageCombinationMode::Prepend => {
                    let fused = Tensor::cat(&[&image_enc, &enc], 1)?;
                    let fused_mask = Tensor::cat(&[&image_mask, &mask], 1)?;
                    Ok((fused, fused_mask))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    const IMG_DIM: usize = 6;

    fn small_cfg(mode: ImageCombinationMode) -> PolyEncoderConfig {
        PolyEncoderConfig {
            vocab_size: 50,
            embedding_size: 16,
            ffn_size: 32,
            n_heads: 2,
            n_layers: 2,
            n_positions: 32,
            dropout: 0.0,
            image_encoder_layers: 2,
            image_features_dim: IMG_DIM,
            image_combination: mode,
            ..PolyEncoderConfig::default()
        }
    }

    fn make_encoder(
        cfg: &PolyEncoderConfig,
        device: &Device,
    ) -> (VarMap, ContextWithImageEncoder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let enc = ContextWithImageEncoder::new(cfg, vb.pp("ctxt")).unwrap();
        (varmap, enc)
    }

    fn tensors_close(a: &Tensor, b: &Tensor) -> bool {
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        diff < 1e-5
    }

    #[test]
    fn postpend_appends_pseudo_token() {
        let device = Device::Cpu;
        let cfg = small_cfg(ImageCombinationMode::Postpend);
        let (_varmap, enc) = make_encoder(&cfg, &device);
        let tokens = Tensor::new(&[[3i64, 7, 0, 0], [4, 9, 11, 0]], &device).unwrap();
        let images = vec![
            Some(Tensor::randn(0.0_f32, 1.0, IMG_DIM, &device).unwrap()),
            None,
        ];
        let (fused, mask) = enc.forward(Some(&tokens), Some(&images), false).unwrap();
        assert_eq!(fused.dims(), &[2, 5, 16]);
        assert_eq!(mask.dims(), &[2, 5]);
        let mask_vals: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        // Image slot valid for example 0, invalid for image-less example 1.
        assert_eq!(mask_vals[0][4], 1.0);
        assert_eq!(mask_vals[1][4], 0.0);
    }

    #[test]
    fn prepend_puts_image_first() {
        let device = Device::Cpu;
        let cfg = small_cfg(ImageCombinationMode::Prepend);
        let (_varmap, enc) = make_encoder(&cfg, &device);
        let tokens = Tensor::new(&[[3i64, 7, 12]], &device).unwrap();
        let images = vec![Some(Tensor::randn(0.0_f32, 1.0, IMG_DIM, &device).unwrap())];
        let (fused, mask) = enc.forward(Some(&tokens), Some(&images), false).unwrap();
        assert_eq!(fused.dims(), &[1, 4, 16]);
        let mask_vals: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(mask_vals[0][0], 1.0);
        // The token part must be unchanged by prepending.
        let (plain, _plain_mask) = enc.forward(Some(&tokens), None, false).unwrap();
        assert!(tensors_close(&fused.narrow(1, 1, 3).unwrap(), &plain));
    }

    #[test]
    fn add_broadcasts_image_over_positions() {
        let device = Device::Cpu;
        let cfg = small_cfg(ImageCombinationMode::Add);
        let (_varmap, enc) = make_encoder(&cfg, &device);
        let tokens = Tensor::new(&[[3i64, 7, 12]], &device).unwrap();
        let images = vec![Some(Tensor::randn(0.0_f32, 1.0, IMG_DIM, &device).unwrap())];
        let (fused, mask) = enc.forward(Some(&tokens), Some(&images), false).unwrap();
        let (plain, plain_mask) = enc.forward(Some(&tokens), None, false).unwrap();
        // Sequence length and mask unchanged; every position shifted by the
        // same image vector.
        assert_eq!(fused.dims(), plain.dims());
        assert!(tensors_close(&mask, &plain_mask));
        let delta = (&fused - &plain).unwrap();
        let row0 = delta.narrow(1, 0, 1).unwrap();
        let row2 = delta.narrow(1, 2, 1).unwrap();
        assert!(tensors_close(&row0, &row2));
    }

    #[test]
    fn all_absent_images_fall_back_to_token_path() {
        let device = Device::Cpu;
        for mode in [
            ImageCombinationMode::Add,
            ImageCombinationMode::Postpend,
            ImageCombinationMode::Prepend,
        ] {
            let cfg = small_cfg(mode);
            let (_varmap, enc) = make_encoder(&cfg, &device);
            let tokens = Tensor::new(&[[3i64, 7, 0], [4, 0, 0]], &device).unwrap();
            let images: Vec<Option<Tensor>> = vec![None, None];
            let (fused, mask) = enc.forward(Some(&tokens), Some(&images), false).unwrap();
            let (plain, plain_mask) = enc.forward(Some(&tokens), None, false).unwrap();
            assert!(tensors_close(&fused, &plain));
            assert!(tensors_close(&mask, &plain_mask));
        }
    }

    #[test]
    fn image_only_context() {
        let device = Device::Cpu;
        let cfg = small_cfg(ImageCombinationMode::Postpend);
        let (_varmap, enc) = make_encoder(&cfg, &device);
        let images = vec![
            Some(Tensor::randn(0.0_f32, 1.0, IMG_DIM, &device).unwrap()),
            None,
        ];
        let (fused, mask) = enc.forward(None, Some(&images), false).unwrap();
        assert_eq!(fused.dims(), &[2, 1, 16]);
        let mask_vals: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(mask_vals[0], vec![1.0]);
        assert_eq!(mask_vals[1], vec![0.0]);
    }

    #[test]
    fn no_input_is_a_usage_error() {
        let device = Device::Cpu;
        let cfg = small_cfg(ImageCombinationMode::Postpend);
        let (_varmap, enc) = make_encoder(&cfg, &device);
        assert!(matches!(
            enc.forward(None, None, false),
            Err(Error::Usage(_))
        ));
        // All-absent images with no tokens is just as empty.
        let images: Vec<Option<Tensor>> = vec![None];
        assert!(matches!(
            enc.forward(None, Some(&images), false),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn images_with_fusion_disabled_rejected() {
        let device = Device::Cpu;
        let cfg = PolyEncoderConfig {
            image_encoder_layers: 0,
            ..small_cfg(ImageCombinationMode::Postpend)
        };
        let (_varmap, enc) = make_encoder(&cfg, &device);
        let tokens = Tensor::new(&[[3i64, 7]], &device).unwrap();
        let images = vec![Some(Tensor::randn(0.0_f32, 1.0, IMG_DIM, &device).unwrap())];
        assert!(matches!(
            enc.forward(Some(&tokens), Some(&images), false),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn mismatched_image_count_rejected() {
        let device = Device::Cpu;
        let cfg = small_cfg(ImageCombinationMode::Postpend);
        let (_varmap, enc) = make_encoder(&cfg, &device);
        let tokens = Tensor::new(&[[3i64, 7], [4, 9]], &device).unwrap();
        let images = vec![Some(Tensor::randn(0.0_f32, 1.0, IMG_DIM, &device).unwrap())];
        assert!(matches!(
            enc.forward(Some(&tokens), Some(&images), false),
            Err(Error::Shape(_))
        ));
    }
}
