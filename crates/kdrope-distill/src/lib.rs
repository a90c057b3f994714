//! # kdrope-distill
//!
//! Token-weighted knowledge-distillation loss for student training.
//!
//! One scalar loss per step is built from:
//!
//! 1. **Masked cross-entropy** against ground-truth targets, as a true
//!    weighted mean over the loss mask (padding ids never count).
//! 2. **Soft distillation**: `T² · KL(teacher ‖ student)` over
//!    temperature-scaled distributions, restricted to unit-weight positions.
//! 3. An optional **auxiliary** scalar supplied by the model.
//!
//! For black-box distillation from reasoning teachers, the positions of
//! structural delimiter tokens (`<think>`, `</think>`, ...) can be given an
//! amplified cross-entropy weight.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kdrope_core::load_config;
//! use kdrope_distill::{DistillationLossEngine, LossInputs};
//!
//! let engine = DistillationLossEngine::from_engine_config(&load_config(None)?)?;
//! let out = engine.step(&LossInputs {
//!     student_logits: &student_logits,
//!     teacher_logits: Some(&teacher_logits),
//!     targets: &targets,
//!     mask: &mask,
//!     aux_loss: None,
//! })?;
//! let loss = (out.total / grad_accum_steps as f64)?;
//! ```

pub mod engine;
pub mod losses;
pub mod structural;


pub use engine::{compute_total_loss, DistillationLossEngine, LossInputs, LossOutput};
pub use losses::{masked_cross_entropy, soft_distillation_loss, truncate_teacher_vocab};
pub use structural::{
    upweight_in_place, upweight_structural_tokens, StructuralTokens, DEFAULT_MARKERS,
};
