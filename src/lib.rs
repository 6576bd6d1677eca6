//! Poly-encoder candidate ranking in pure Rust.
//!
//! A candle-based implementation of the poly-encoder architecture for scoring
//! candidate responses against a conversational context. The context and each
//! candidate are encoded independently; the context encoding is reduced to a
//! fixed set of vectors which are then fused against every candidate through
//! a second attention pass, yielding one scalar score per candidate.
//!
//! ## Architecture
//!
//! ```text
//! context tokens ─→ transformer encoder ──┐
//!                                          ├→ (sequence, mask)
//! image features ─→ image encoder ────────┘
//!                       ↓
//!            context reducer (codes | n_first)
//!                       ↓
//!          reduced context [B, n_codes, D] + mask
//!                       ↓
//! candidates ─→ encoder ─→ [B, C, D] ─→ candidate-as-query attention
//!                       ↓
//!                scores [B, C]
//! ```
//!
//! ## Modules
//!
//! - [`config`] — model configuration (reduction mode, attention kinds, image fusion)
//! - [`model`] — attention primitives, encoders, reducer, and the scoring model

pub mod config;
pub mod model;

mod error;

pub use error::{Error, Result};
