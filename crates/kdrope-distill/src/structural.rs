//! Structural-token upweighting.
//!
//! Reasoning teachers wrap their chain-of-thought and final answer in
//! delimiter tokens (`<think>`, `</think>`, `<answer>`, `</answer>`).  They
//! are rare in a completion yet mark where reasoning stops and the answer
//! begins, so their positions get an amplified loss weight.
//!
//! ## Mask ownership
//!
//! [`upweight_structural_tokens`] never touches the caller's mask: it returns
//! a fresh tensor, so the original can still be used to select rows for the
//! distillation term in the same step.  [`upweight_in_place`] is the
//! slice-level variant for callers that own a mutable host buffer.

use std::collections::HashSet;

use candle_core::Tensor;
use tracing::warn;

use kdrope_core::{CoreError, CoreResult};

use crate::losses::{host_ids, host_weights};

/// Delimiters emitted by reasoning-capable teachers.
pub const DEFAULT_MARKERS: [&str; 4] = ["<think>", "</think>", "<answer>", "</answer>"];

/// The set of target ids whose mask weight is overridden.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralTokens {
    ids: HashSet<u32>,
}

impl StructuralTokens {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Resolve marker strings through a tokenizer lookup (for example
    /// `|m| tokenizer.token_to_id(m)`).  Markers the vocabulary does not know
    /// are skipped with a warning.
    pub fn from_markers<F>(markers: &[&str], lookup: F) -> Self
    where
        F: Fn(&str) -> Option<u32>,
    {
        let ids = markers
            .iter()
            .filter_map(|&marker| {
                let id = lookup(marker);
                if id.is_none() {
                    warn!(marker, "Structural marker not found in vocabulary; skipping");
                }
                id
            })
            .collect();
        Self { ids }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }
}

impl FromIterator<u32> for StructuralTokens {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Overwrite `mask[i]` with `weight` wherever `targets[i]` is structural.
///
/// The previous weight is replaced, not scaled, including zero weights.
/// Returns the number of positions changed.
pub fn upweight_in_place(
    targets: &[u32],
    mask: &mut [f32],
    tokens: &StructuralTokens,
    weight: f32,
) -> CoreResult<usize> {
    check_weight(weight as f64)?;
    if targets.len() != mask.len() {
        return Err(CoreError::ShapeMismatch(format!(
            "targets has {} positions, mask has {}",
            targets.len(),
            mask.len()
        )));
    }

    let mut hits = 0;
    for (w, &id) in mask.iter_mut().zip(targets) {
        if tokens.contains(id) {
            *w = weight;
            hits += 1;
        }
    }
    Ok(hits)
}

/// Tensor form of [`upweight_in_place`]: returns a new mask with the same
/// shape and device; `targets` and `mask` are left as they were.
pub fn upweight_structural_tokens(
    targets: &Tensor,
    mask: &Tensor,
    tokens: &StructuralTokens,
    weight: f64,
) -> CoreResult<Tensor> {
    check_weight(weight)?;
    if targets.dims() != mask.dims() {
        return Err(CoreError::ShapeMismatch(format!(
            "targets {:?} vs mask {:?}",
            targets.dims(),
            mask.dims()
        )));
    }

    let ids = host_ids(targets)?;
    let mut weights = host_weights(mask)?;
    upweight_in_place(&ids, &mut weights, tokens, weight as f32)?;

    Ok(Tensor::from_vec(weights, mask.dims(), mask.device())?)
}

fn check_weight(weight: f64) -> CoreResult<()> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(CoreError::invalid(
            "structural_weight",
            format!("must be finite and non-negative, got {weight}"),
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
