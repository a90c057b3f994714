//! Loss primitives: temperature-scaled soft-target KL and masked
//! cross-entropy.
//!
//! All softmax work happens in F32 regardless of the logits dtype.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;
use tracing::debug;

use kdrope_core::config::validate_temperature;
use kdrope_core::{CoreError, CoreResult};

// ── Soft-target distillation ──────────────────────────────────────────────────

/// `T² · KL(teacher ‖ student)` over temperature-scaled distributions,
/// summed over every row and vocabulary entry and divided by the number of
/// rows.
///
/// Logits may be `[rows, vocab]` or `[batch, seq, vocab]`; every leading
/// index counts as one row.  The teacher distribution is computed from a
/// detached copy of `teacher_logits`, so no gradient ever reaches the
/// teacher.
pub fn soft_distillation_loss(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    temperature: f64,
) -> CoreResult<Tensor> {
    validate_temperature(temperature)?;
    if student_logits.dims() != teacher_logits.dims() {
        return Err(CoreError::ShapeMismatch(format!(
            "student logits {:?} vs teacher logits {:?}",
            student_logits.dims(),
            teacher_logits.dims()
        )));
    }

    let student = flatten_rows(&to_f32(student_logits)?)?;
    let teacher = flatten_rows(&to_f32(teacher_logits)?)?.detach();
    let rows = student.dim(0)?;
    if rows == 0 {
        return Err(CoreError::EmptyBatch);
    }

    let inv_t = 1.0 / temperature;
    let teacher_log_probs = log_softmax(&teacher.affine(inv_t, 0.0)?, D::Minus1)?;
    let teacher_probs = teacher_log_probs.exp()?;
    let student_log_probs = log_softmax(&student.affine(inv_t, 0.0)?, D::Minus1)?;

    // p · (log p − log q), taken as 0 where p == 0 (a -inf teacher logit
    // would otherwise give 0 · -inf = NaN).
    let terms = teacher_probs.mul(&teacher_log_probs.sub(&student_log_probs)?)?;
    let kl = teacher_probs
        .eq(0f32)?
        .where_cond(&terms.zeros_like()?, &terms)?
        .sum_all()?;

    Ok(kl.affine(temperature * temperature / rows as f64, 0.0)?)
}

/// Keep the leading `student_vocab` columns of a wider teacher.
///
/// Equal widths pass through untouched; a teacher narrower than the student
/// cannot be reconciled and is a [`CoreError::ShapeMismatch`].
pub fn truncate_teacher_vocab(teacher_logits: &Tensor, student_vocab: usize) -> CoreResult<Tensor> {
    let teacher_vocab = teacher_logits.dim(D::Minus1)?;
    match teacher_vocab.cmp(&student_vocab) {
        std::cmp::Ordering::Equal => Ok(teacher_logits.clone()),
        std::cmp::Ordering::Greater => {
            debug!(teacher_vocab, student_vocab, "Truncating teacher vocabulary");
            Ok(teacher_logits.narrow(D::Minus1, 0, student_vocab)?)
        }
        std::cmp::Ordering::Less => Err(CoreError::ShapeMismatch(format!(
            "teacher vocabulary ({teacher_vocab}) is narrower than the student's ({student_vocab})"
        ))),
    }
}

// ── Masked cross-entropy ──────────────────────────────────────────────────────

/// Weighted mean of per-position cross-entropy.
///
/// * `student_logits`: `[batch, seq, vocab]`
/// * `targets`: `[batch, seq]` integer ids
/// * `mask`: `[batch, seq]` non-negative weights
///
/// Positions whose target equals `ignore_index` get weight 0 whatever the
/// mask says.  The result is `Σ wᵢ·CEᵢ / Σ wᵢ`; a zero denominator is
/// [`CoreError::EmptyBatch`].
pub fn masked_cross_entropy(
    student_logits: &Tensor,
    targets: &Tensor,
    mask: &Tensor,
    ignore_index: Option<u32>,
) -> CoreResult<Tensor> {
    let (batch, seq_len, vocab) = student_logits.dims3()?;
    check_token_grid("targets", targets, batch, seq_len)?;
    check_token_grid("mask", mask, batch, seq_len)?;

    let rows = batch * seq_len;
    let target_ids = host_ids(targets)?;
    let mut weights = host_weights(mask)?;

    if let Some(ignore) = ignore_index {
        for (w, &id) in weights.iter_mut().zip(&target_ids) {
            if id == ignore {
                *w = 0.0;
            }
        }
    }

    let total_weight: f64 = weights.iter().map(|&w| w as f64).sum();
    if total_weight <= 0.0 {
        return Err(CoreError::EmptyBatch);
    }

    // Zero-weight rows gather column 0 so padding ids never index past vocab.
    let mut gather_ids = Vec::with_capacity(rows);
    for (row, (&id, &w)) in target_ids.iter().zip(&weights).enumerate() {
        if w == 0.0 {
            gather_ids.push(0u32);
        } else if (id as usize) < vocab {
            gather_ids.push(id);
        } else {
            return Err(CoreError::ShapeMismatch(format!(
                "target id {id} at row {row} is outside the vocabulary ({vocab})"
            )));
        }
    }

    let device = student_logits.device();
    let logits = to_f32(student_logits)?.reshape((rows, vocab))?;
    let gather_ids = Tensor::from_vec(gather_ids, (rows, 1), device)?;
    let weights = Tensor::from_vec(weights, rows, device)?;

    let log_probs = log_softmax(&logits, D::Minus1)?;
    let nll = log_probs.gather(&gather_ids, 1)?.squeeze(1)?.neg()?;
    let weighted = nll.mul(&weights)?.sum_all()?;

    Ok(weighted.affine(1.0 / total_weight, 0.0)?)
}

// ── Row selection ─────────────────────────────────────────────────────────────

/// Flat row indices whose mask weight is exactly 1.
pub fn unit_weight_rows(mask: &Tensor) -> CoreResult<Vec<u32>> {
    Ok(host_weights(mask)?
        .iter()
        .enumerate()
        .filter(|&(_, &w)| w == 1.0)
        .map(|(i, _)| i as u32)
        .collect())
}

/// Rows that feed the distillation term: mask weight exactly 1 and, when
/// `ignore_index` is set, a target other than the padding id.
pub fn distillation_rows(
    mask: &Tensor,
    targets: &Tensor,
    ignore_index: Option<u32>,
) -> CoreResult<Vec<u32>> {
    let rows = unit_weight_rows(mask)?;
    let Some(ignore) = ignore_index else {
        return Ok(rows);
    };
    let ids = host_ids(targets)?;
    if ids.len() != mask.elem_count() {
        return Err(CoreError::ShapeMismatch(format!(
            "targets {:?} vs mask {:?}",
            targets.dims(),
            mask.dims()
        )));
    }
    Ok(rows.into_iter().filter(|&row| ids[row as usize] != ignore).collect())
}

/// Gather `rows` (flat `batch * seq` indices) from `[batch, seq, vocab]`
/// logits into a `[rows.len(), vocab]` tensor.  Gradients flow through.
pub fn select_rows(logits: &Tensor, rows: &[u32]) -> CoreResult<Tensor> {
    let flat = flatten_rows(logits)?;
    let index = Tensor::from_slice(rows, rows.len(), logits.device())?;
    Ok(flat.index_select(&index, 0)?)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Cast `t` to F32 if it is not already; no-op if already F32.
///
/// Softmax over large vocabularies overflows in BF16/F16.
pub(crate) fn to_f32(t: &Tensor) -> CoreResult<Tensor> {
    if t.dtype() == DType::F32 {
        Ok(t.clone())
    } else {
        Ok(t.to_dtype(DType::F32)?)
    }
}

/// `[.., vocab]` → `[rows, vocab]`.
fn flatten_rows(logits: &Tensor) -> CoreResult<Tensor> {
    let vocab = logits.dim(D::Minus1)?;
    if vocab == 0 {
        return Err(CoreError::ShapeMismatch("logits have an empty vocabulary axis".to_string()));
    }
    let rows = logits.elem_count() / vocab;
    Ok(logits.reshape((rows, vocab))?)
}

fn check_token_grid(name: &str, t: &Tensor, batch: usize, seq_len: usize) -> CoreResult<()> {
    if t.dims() != [batch, seq_len] {
        return Err(CoreError::ShapeMismatch(format!(
            "{name} has shape {:?}, logits expect [{batch}, {seq_len}]",
            t.dims()
        )));
    }
    Ok(())
}

pub(crate) fn host_ids(targets: &Tensor) -> CoreResult<Vec<u32>> {
    Ok(targets.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?)
}

/// Mask weights on the host; negative or non-finite weights are rejected.
pub(crate) fn host_weights(mask: &Tensor) -> CoreResult<Vec<f32>> {
    let weights = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(CoreError::invalid(
            "mask",
            format!("weights must be finite and non-negative, found {bad}"),
        ));
    }
    Ok(weights)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn logits3(values: &[f32], shape: (usize, usize, usize)) -> Tensor {
        Tensor::from_slice(values, shape, &Device::Cpu).unwrap()
    }

    fn ids(values: &[u32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(values, shape, &Device::Cpu).unwrap()
    }

    fn weights(values: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(values, shape, &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    /// Reference cross-entropy of one row, computed in f64.
    fn row_ce(row: &[f32], target: usize) -> f64 {
        let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)) as f64;
        let lse = row.iter().map(|&v| (v as f64 - max).exp()).sum::<f64>().ln() + max;
        lse - row[target] as f64
    }

    const LOGITS: [f32; 20] = [
        0.1, 0.2, 0.3, 0.4, 0.5, //
        1.0, -1.0, 0.5, 0.0, 2.0, //
        0.3, 0.3, 0.3, 0.3, 0.3, //
        -0.5, 0.25, 1.5, 0.75, 0.0,
    ];

    // ── soft_distillation_loss ────────────────────────────────────────────────

    #[test]
    fn kl_is_zero_for_identical_logits() {
        let x = Tensor::randn(0f32, 3f32, (2, 3, 11), &Device::Cpu).unwrap();
        for t in [0.5, 1.0, 2.0, 4.0] {
            let loss = scalar(&soft_distillation_loss(&x, &x, t).unwrap());
            assert!(loss.abs() < 1e-5, "T={t}: {loss}");
        }
    }

    #[test]
    fn kl_is_non_negative() {
        for _ in 0..8 {
            let a = Tensor::randn(0f32, 2f32, (4, 9), &Device::Cpu).unwrap();
            let b = Tensor::randn(0f32, 2f32, (4, 9), &Device::Cpu).unwrap();
            for t in [1.0, 3.0] {
                assert!(scalar(&soft_distillation_loss(&a, &b, t).unwrap()) >= -1e-6);
            }
        }
    }

    #[test]
    fn kl_matches_hand_computed_value() {
        // teacher p = [0.75, 0.25], student q = [0.5, 0.5]
        let teacher = Tensor::new(&[[3f32.ln(), 0.0]], &Device::Cpu).unwrap();
        let student = Tensor::new(&[[0f32, 0.0]], &Device::Cpu).unwrap();

        let t1 = scalar(&soft_distillation_loss(&student, &teacher, 1.0).unwrap());
        assert!((t1 - 0.130_812).abs() < 1e-5, "{t1}");

        // softened to T=2 and scaled back by T² = 4
        let t2 = scalar(&soft_distillation_loss(&student, &teacher, 2.0).unwrap());
        assert!((t2 - 0.145_363).abs() < 1e-5, "{t2}");
    }

    #[test]
    fn kl_averages_over_rows_not_elements() {
        let teacher = Tensor::new(&[[3f32.ln(), 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let student = Tensor::new(&[[0f32, 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let loss = scalar(&soft_distillation_loss(&student, &teacher, 1.0).unwrap());
        assert!((loss - 0.130_812 / 2.0).abs() < 1e-5, "{loss}");
    }

    #[test]
    fn temperature_keeps_sign_and_scale() {
        let a = Tensor::new(&[[1.0f32, 0.9, 1.1, 1.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1.05f32, 0.95, 1.0, 1.0]], &Device::Cpu).unwrap();
        let l1 = scalar(&soft_distillation_loss(&a, &b, 1.0).unwrap());
        let l2 = scalar(&soft_distillation_loss(&a, &b, 2.0).unwrap());
        assert!(l1 >= 0.0 && l2 >= 0.0);
        // near-identical distributions: T² keeps both values in the same range
        assert!((l2 / l1) > 0.5 && (l2 / l1) < 2.0, "{l1} vs {l2}");
    }

    #[test]
    fn non_positive_temperature_rejected() {
        let x = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        for t in [0.0, -1.0] {
            let err = soft_distillation_loss(&x, &x, t).unwrap_err();
            assert!(matches!(err, CoreError::InvalidArgument { .. }));
        }
    }

    #[test]
    fn mismatched_vocab_rejected() {
        let s = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(soft_distillation_loss(&s, &t, 1.0), Err(CoreError::ShapeMismatch(_))));
    }

    #[test]
    fn no_gradient_reaches_teacher() {
        let student = Var::randn(0f32, 1f32, (3, 6), &Device::Cpu).unwrap();
        let teacher = Var::randn(0f32, 1f32, (3, 6), &Device::Cpu).unwrap();
        let loss = soft_distillation_loss(student.as_tensor(), teacher.as_tensor(), 2.0).unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(student.as_tensor()).is_some());
        assert!(grads.get(teacher.as_tensor()).is_none());
    }

    #[test]
    fn masked_teacher_vocab_entries_contribute_zero() {
        // teacher p = [1, 0], student q = [0.5, 0.5]: KL = ln 2
        let teacher = Tensor::new(&[[0f32, f32::NEG_INFINITY]], &Device::Cpu).unwrap();
        let student = Var::new(&[[0f32, 0.0]], &Device::Cpu).unwrap();

        let loss = soft_distillation_loss(student.as_tensor(), &teacher, 1.0).unwrap();
        let value = scalar(&loss);
        assert!((value - std::f32::consts::LN_2).abs() < 1e-5, "{value}");

        let grads = loss.backward().unwrap();
        let grad = grads.get(student.as_tensor()).unwrap().flatten_all().unwrap();
        assert!(grad.to_vec1::<f32>().unwrap().iter().all(|g| g.is_finite()));
    }

    // ── truncate_teacher_vocab ────────────────────────────────────────────────

    #[test]
    fn truncation_keeps_leading_columns() {
        let teacher = Tensor::arange(0f32, 12.0, &Device::Cpu).unwrap().reshape((1, 2, 6)).unwrap();
        let cut = truncate_teacher_vocab(&teacher, 4).unwrap();
        assert_eq!(cut.dims(), &[1, 2, 4]);
        assert_eq!(
            cut.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 1.0, 2.0, 3.0, 6.0, 7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn truncation_rejects_narrow_teacher() {
        let teacher = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(truncate_teacher_vocab(&teacher, 4), Err(CoreError::ShapeMismatch(_))));
        assert_eq!(truncate_teacher_vocab(&teacher, 3).unwrap().dims(), &[1, 2, 3]);
    }

    // ── masked_cross_entropy ──────────────────────────────────────────────────

    #[test]
    fn masked_mean_over_selected_positions() {
        let logits = logits3(&LOGITS, (1, 4, 5));
        let targets = ids(&[2, 1, 4, 3], (1, 4));
        let mask = weights(&[1.0, 0.0, 1.0, 1.0], (1, 4));
        let loss = scalar(&masked_cross_entropy(&logits, &targets, &mask, None).unwrap());

        let rows: Vec<&[f32]> = LOGITS.chunks(5).collect();
        let expected = (row_ce(rows[0], 2) + row_ce(rows[2], 4) + row_ce(rows[3], 3)) / 3.0;
        assert!((loss as f64 - expected).abs() < 1e-5, "{loss} vs {expected}");
    }

    #[test]
    fn weights_form_a_true_weighted_mean() {
        let logits = logits3(&LOGITS, (2, 2, 5));
        let targets = ids(&[2, 1, 4, 3], (2, 2));
        let mask = weights(&[10.0, 1.0, 0.0, 1.0], (2, 2));
        let loss = scalar(&masked_cross_entropy(&logits, &targets, &mask, None).unwrap());

        let rows: Vec<&[f32]> = LOGITS.chunks(5).collect();
        let expected = (10.0 * row_ce(rows[0], 2) + row_ce(rows[1], 1) + row_ce(rows[3], 3)) / 12.0;
        assert!((loss as f64 - expected).abs() < 1e-5, "{loss} vs {expected}");
    }

    #[test]
    fn ignore_index_overrides_mask() {
        let logits = logits3(&LOGITS, (1, 4, 5));
        let targets = ids(&[2, 1, 0, 3], (1, 4));
        let all = weights(&[1.0, 1.0, 1.0, 1.0], (1, 4));
        let holed = weights(&[1.0, 1.0, 0.0, 1.0], (1, 4));

        let a = scalar(&masked_cross_entropy(&logits, &targets, &all, Some(0)).unwrap());
        let b = scalar(&masked_cross_entropy(&logits, &targets, &holed, Some(0)).unwrap());
        assert!((a - b).abs() < 1e-7);
    }

    #[test]
    fn all_zero_weight_is_empty_batch() {
        let logits = logits3(&LOGITS, (1, 4, 5));
        let targets = ids(&[2, 1, 0, 3], (1, 4));
        let mask = weights(&[0.0; 4], (1, 4));
        let err = masked_cross_entropy(&logits, &targets, &mask, None).unwrap_err();
        assert!(matches!(err, CoreError::EmptyBatch));

        // only ignored positions carry weight
        let pads = ids(&[0, 0, 0, 0], (1, 4));
        let ones = weights(&[1.0; 4], (1, 4));
        let err = masked_cross_entropy(&logits, &pads, &ones, Some(0)).unwrap_err();
        assert!(matches!(err, CoreError::EmptyBatch));
    }

    #[test]
    fn padding_ids_outside_vocab_are_harmless_when_masked() {
        let logits = logits3(&LOGITS, (1, 4, 5));
        let targets = ids(&[2, 1, 99, 3], (1, 4));
        let mask = weights(&[1.0, 1.0, 0.0, 1.0], (1, 4));
        assert!(masked_cross_entropy(&logits, &targets, &mask, None).is_ok());

        let ones = weights(&[1.0; 4], (1, 4));
        let err = masked_cross_entropy(&logits, &targets, &ones, None).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch(_)));
    }

    #[test]
    fn grid_shape_mismatch_rejected() {
        let logits = logits3(&LOGITS, (1, 4, 5));
        let targets = ids(&[2, 1, 0], (1, 3));
        let mask = weights(&[1.0; 4], (1, 4));
        let err = masked_cross_entropy(&logits, &targets, &mask, None).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch(_)));
    }

    #[test]
    fn negative_mask_rejected() {
        let logits = logits3(&LOGITS, (1, 4, 5));
        let targets = ids(&[2, 1, 0, 3], (1, 4));
        let mask = weights(&[1.0, -1.0, 1.0, 1.0], (1, 4));
        assert!(matches!(
            masked_cross_entropy(&logits, &targets, &mask, None),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    // ── row selection ─────────────────────────────────────────────────────────

    #[test]
    fn unit_rows_skip_zero_and_upweighted_positions() {
        let mask = weights(&[1.0, 0.0, 10.0, 1.0], (2, 2));
        assert_eq!(unit_weight_rows(&mask).unwrap(), vec![0, 3]);
    }

    #[test]
    fn distillation_rows_drop_ignored_targets() {
        let mask = weights(&[1.0, 1.0, 10.0, 1.0], (2, 2));
        let targets = ids(&[2, 0, 0, 3], (2, 2));
        assert_eq!(distillation_rows(&mask, &targets, None).unwrap(), vec![0, 1, 3]);
        assert_eq!(distillation_rows(&mask, &targets, Some(0)).unwrap(), vec![0, 3]);

        let short = ids(&[2, 0, 0], (1, 3));
        let err = distillation_rows(&mask, &short, Some(0)).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch(_)));
    }

    #[test]
    fn select_rows_gathers_flat_positions() {
        let logits = logits3(&LOGITS, (2, 2, 5));
        let picked = select_rows(&logits, &[1, 3]).unwrap();
        assert_eq!(picked.dims(), &[2, 5]);
        assert_eq!(picked.get(1).unwrap().to_vec1::<f32>().unwrap(), LOGITS[15..].to_vec());
    }
}
