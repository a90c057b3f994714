//! Total-loss composition and the per-step engine.
//!
//! ```text
//! no teacher:  total = CE(mask) + aux
//! teacher:     total = α·CE(mask) + (1−α)·T²·KL(teacher ‖ student)[rows] + aux
//! ```
//!
//! `rows` are the positions with mask weight exactly 1 whose target is not
//! the padding id (`ignore_index`).
//!
//! Division by the gradient-accumulation factor is left to the training loop.

use candle_core::{DType, Tensor, D};
use tracing::debug;

use kdrope_core::config::validate_alpha;
use kdrope_core::{CoreError, CoreResult, EngineConfig, LossConfig};

use crate::losses::{
    distillation_rows, masked_cross_entropy, select_rows, soft_distillation_loss,
    truncate_teacher_vocab,
};
use crate::structural::{upweight_structural_tokens, StructuralTokens};

// ── Inputs / outputs ──────────────────────────────────────────────────────────

/// Per-step tensors handed over by the forward pass and the data loader.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// `[batch, seq, vocab]`
    pub student_logits: &'a Tensor,
    /// `[batch, seq, teacher_vocab]`; only the leading columns are compared.
    pub teacher_logits: Option<&'a Tensor>,
    /// `[batch, seq]` integer ids.
    pub targets: &'a Tensor,
    /// `[batch, seq]` non-negative weights.
    pub mask: &'a Tensor,
    /// Opaque additive scalar (e.g. MoE load-balancing penalty).
    pub aux_loss: Option<&'a Tensor>,
}

/// Loss for one step.  `total` keeps the autograd graph; the other fields are
/// host copies for logging.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub total: Tensor,
    pub cross_entropy: f32,
    pub distillation: Option<f32>,
    pub aux: Option<f32>,
}

// ── Free-standing composition ─────────────────────────────────────────────────

/// Blend cross-entropy, soft distillation and the auxiliary loss into one
/// scalar tensor.
///
/// The teacher's vocabulary must already match the student's (see
/// [`truncate_teacher_vocab`]).  Only positions whose mask weight is exactly 1
/// and whose target is not `ignore_index` enter the distillation term.
pub fn compute_total_loss(
    inputs: &LossInputs<'_>,
    alpha: f64,
    temperature: f64,
    ignore_index: Option<u32>,
) -> CoreResult<Tensor> {
    Ok(blend(inputs, inputs.mask, inputs.mask, alpha, temperature, ignore_index)?.total)
}

/// `ce_mask` weights the cross-entropy term; `selection_mask` picks the
/// distillation rows.  They differ when structural upweighting produced a
/// fresh CE mask from the caller's original.
fn blend(
    inputs: &LossInputs<'_>,
    ce_mask: &Tensor,
    selection_mask: &Tensor,
    alpha: f64,
    temperature: f64,
    ignore_index: Option<u32>,
) -> CoreResult<LossOutput> {
    validate_alpha(alpha)?;

    let ce = masked_cross_entropy(inputs.student_logits, inputs.targets, ce_mask, ignore_index)?;
    let ce_value = ce.to_scalar::<f32>()?;

    let (mut total, distillation) = match inputs.teacher_logits {
        None => (ce, None),
        Some(teacher) => {
            if teacher.dims() != inputs.student_logits.dims() {
                return Err(CoreError::ShapeMismatch(format!(
                    "student logits {:?} vs teacher logits {:?}",
                    inputs.student_logits.dims(),
                    teacher.dims()
                )));
            }
            let rows = distillation_rows(selection_mask, inputs.targets, ignore_index)?;
            if rows.is_empty() {
                return Err(CoreError::EmptyBatch);
            }
            let kd = soft_distillation_loss(
                &select_rows(inputs.student_logits, &rows)?,
                &select_rows(teacher, &rows)?,
                temperature,
            )?;
            let kd_value = kd.to_scalar::<f32>()?;
            let blended = ce.affine(alpha, 0.0)?.add(&kd.affine(1.0 - alpha, 0.0)?)?;
            (blended, Some(kd_value))
        }
    };

    let aux = match inputs.aux_loss {
        None => None,
        Some(aux) => {
            if aux.elem_count() != 1 {
                return Err(CoreError::ShapeMismatch(format!(
                    "auxiliary loss must be a scalar, got shape {:?}",
                    aux.dims()
                )));
            }
            let aux = aux.to_dtype(DType::F32)?.reshape(())?;
            let value = aux.to_scalar::<f32>()?;
            total = total.add(&aux)?;
            Some(value)
        }
    };

    Ok(LossOutput {
        total,
        cross_entropy: ce_value,
        distillation,
        aux,
    })
}

// ── DistillationLossEngine ────────────────────────────────────────────────────

/// Validated loss policy applied once per training step.
///
/// Per step the engine:
/// 1. narrows a wider teacher vocabulary (when `truncate_teacher_vocab` is set),
/// 2. builds a fresh CE mask with structural positions overwritten,
/// 3. selects distillation rows from the caller's original mask,
/// 4. blends the terms with [`compute_total_loss`]'s formula.
#[derive(Debug, Clone)]
pub struct DistillationLossEngine {
    config: LossConfig,
    structural: StructuralTokens,
}

impl DistillationLossEngine {
    pub fn new(config: LossConfig) -> CoreResult<Self> {
        config.validate()?;
        let structural = config.structural_token_ids.iter().copied().collect();
        Ok(Self { config, structural })
    }

    pub fn from_engine_config(config: &EngineConfig) -> CoreResult<Self> {
        Self::new(config.loss.clone())
    }

    /// Replace the structural id set, e.g. with one resolved from marker
    /// strings via [`StructuralTokens::from_markers`].
    pub fn with_structural_tokens(mut self, tokens: StructuralTokens) -> Self {
        self.config.structural_token_ids = tokens.iter().collect();
        self.structural = tokens;
        self
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn structural_tokens(&self) -> &StructuralTokens {
        &self.structural
    }

    pub fn step(&self, inputs: &LossInputs<'_>) -> CoreResult<LossOutput> {
        let teacher = match inputs.teacher_logits {
            Some(teacher) if self.config.truncate_teacher_vocab => {
                let student_vocab = inputs.student_logits.dim(D::Minus1)?;
                Some(truncate_teacher_vocab(teacher, student_vocab)?)
            }
            Some(teacher) => Some(teacher.clone()),
            None => None,
        };

        let ce_mask = if self.structural.is_empty() {
            inputs.mask.clone()
        } else {
            upweight_structural_tokens(
                inputs.targets,
                inputs.mask,
                &self.structural,
                self.config.structural_weight,
            )?
        };

        let resolved = LossInputs {
            teacher_logits: teacher.as_ref(),
            ..*inputs
        };
        let output = blend(
            &resolved,
            &ce_mask,
            inputs.mask,
            self.config.alpha,
            self.config.temperature,
            self.config.ignore_index,
        )?;

        debug!(
            cross_entropy = output.cross_entropy,
            distillation = ?output.distillation,
            aux = ?output.aux,
            "Loss step"
        );
        Ok(output)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
