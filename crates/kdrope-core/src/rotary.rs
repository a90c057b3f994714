//! Rotary positional encoding (RoPE).
//!
//! Each feature vector of even width `D` is rotated by position-dependent
//! angles so that the dot product of a rotated query at position `m` and a
//! rotated key at position `n` only depends on their contents and `n - m`.
//!
//! ## Tables
//!
//! ```text
//! freq[i]       = base^(-2i/D)                 i in [0, D/2)
//! angle[p][i]   = p * freq[i]                  p in [0, max_len)
//! cos[p]        = cos(angle[p]) ++ cos(angle[p])   -> [max_len, D]
//! sin[p]        = sin(angle[p]) ++ sin(angle[p])   -> [max_len, D]
//! ```
//!
//! Feature `i` is paired with feature `i + D/2` (split-half layout, the one
//! used by Llama/Qwen checkpoints), not with its neighbour.
//!
//! ## Caching
//!
//! Host tables are computed once per `(D, base, max_len)` and published as an
//! `Arc` in a process-wide map.  Entries are never mutated after insertion,
//! so any number of threads may share them once the first caller has filled
//! the slot.
//!
//! The map is not bounded: each distinct configuration keeps its tables until
//! the process exits or [`evict_tables`] drops the entry.  Encoders already
//! built from an evicted entry keep their own device tensors.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use candle_core::{Device, Tensor, D};
use tracing::{debug, info};

use crate::config::RopeConfig;
use crate::error::{CoreError, CoreResult};

// ── Host tables ───────────────────────────────────────────────────────────────

/// Row-major `[max_len, dim]` cosine / sine tables held on the host.
#[derive(Debug)]
pub struct RotaryTables {
    pub dim: usize,
    pub max_len: usize,
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
}

impl RotaryTables {
    fn compute(dim: usize, base: f64, max_len: usize) -> Self {
        let half = dim / 2;
        let freqs = frequency_schedule(dim, base);

        let mut cos = Vec::with_capacity(max_len * dim);
        let mut sin = Vec::with_capacity(max_len * dim);
        for pos in 0..max_len {
            let row = cos.len();
            for &freq in &freqs {
                // f64 angles: positions in the thousands times freq[0] = 1
                // lose too much in f32 before the trig call.
                let angle = pos as f64 * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
            cos.extend_from_within(row..row + half);
            sin.extend_from_within(row..row + half);
        }

        Self {
            dim,
            max_len,
            cos,
            sin,
        }
    }

    /// Upload both tables to `device` as `[max_len, dim]` F32 tensors.
    pub fn to_tensors(&self, device: &Device) -> CoreResult<(Tensor, Tensor)> {
        let shape = (self.max_len, self.dim);
        let cos = Tensor::from_slice(self.cos.as_slice(), shape, device)?;
        let sin = Tensor::from_slice(self.sin.as_slice(), shape, device)?;
        Ok((cos, sin))
    }
}

/// `freq[i] = base^(-2i/D)` for `i in [0, D/2)`.  `freq[0]` is exactly 1 and
/// the sequence never increases.
pub fn frequency_schedule(dim: usize, base: f64) -> Vec<f64> {
    (0..dim / 2)
        .map(|i| base.powf(-2.0 * i as f64 / dim as f64))
        .collect()
}

// ── Process-wide memo ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableKey {
    dim: usize,
    base_bits: u64,
    max_len: usize,
}

impl From<&RopeConfig> for TableKey {
    fn from(cfg: &RopeConfig) -> Self {
        Self {
            dim: cfg.dim,
            base_bits: cfg.base.to_bits(),
            max_len: cfg.max_len,
        }
    }
}

type TableMap = RwLock<HashMap<TableKey, Arc<RotaryTables>>>;

fn table_cache() -> &'static TableMap {
    static CACHE: OnceLock<TableMap> = OnceLock::new();
    CACHE.get_or_init(TableMap::default)
}

/// Return the host tables for `config`, computing them on first use.
///
/// The write lock is held while computing, so concurrent first callers for
/// the same key compute exactly once and all receive the same `Arc`.
pub fn cached_tables(config: &RopeConfig) -> CoreResult<Arc<RotaryTables>> {
    config.validate()?;
    let key = TableKey::from(config);

    // Entries are inserted fully built, so a poisoned lock still guards a
    // consistent map.
    if let Some(tables) = table_cache()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        debug!(dim = config.dim, max_len = config.max_len, "Rotary tables cache hit");
        return Ok(Arc::clone(tables));
    }

    let mut map = table_cache().write().unwrap_or_else(PoisonError::into_inner);
    let tables = map.entry(key).or_insert_with(|| {
        info!(
            dim = config.dim,
            base = config.base,
            max_len = config.max_len,
            "Precomputing rotary tables"
        );
        Arc::new(RotaryTables::compute(config.dim, config.base, config.max_len))
    });
    Ok(Arc::clone(tables))
}

/// Drop the memoized tables for `config`.  Returns `true` if an entry was
/// removed; the next [`cached_tables`] call for that key recomputes.
pub fn evict_tables(config: &RopeConfig) -> bool {
    let key = TableKey::from(config);
    let removed = table_cache()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&key)
        .is_some();
    if removed {
        debug!(dim = config.dim, max_len = config.max_len, "Evicted rotary tables");
    }
    removed
}

/// Build the `[max_len, dim]` cosine and sine tables on `device`.
///
/// Every entry satisfies `cos² + sin² = 1`.
pub fn precompute(
    dim: usize,
    base: f64,
    max_len: usize,
    device: &Device,
) -> CoreResult<(Tensor, Tensor)> {
    cached_tables(&RopeConfig { dim, base, max_len })?.to_tensors(device)
}

// ── Rotation kernels ──────────────────────────────────────────────────────────

/// `[H1, H2] -> [-H2, H1]` along the last dimension.
pub fn rotate_half(x: &Tensor) -> CoreResult<Tensor> {
    let width = x.dim(D::Minus1)?;
    if width % 2 != 0 {
        return Err(CoreError::invalid(
            "dim",
            format!("feature width must be even, got {width}"),
        ));
    }
    let half = width / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

/// `x * cos + rotate_half(x) * sin`, elementwise over the last dimension.
///
/// `cos` / `sin` broadcast against `x` from the right, so a single `[D]` row
/// rotates one vector and a `[seq, D]` slice rotates a `[.., seq, D]` tensor.
/// The tables are cast to `x`'s dtype.
pub fn apply_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> CoreResult<Tensor> {
    let width = x.dim(D::Minus1)?;
    let table_width = cos.dim(D::Minus1)?;
    if width != table_width || sin.dim(D::Minus1)? != table_width {
        return Err(CoreError::ShapeMismatch(format!(
            "rotation tables have width {table_width}, vector has width {width}"
        )));
    }
    let cos = cos.to_dtype(x.dtype())?;
    let sin = sin.to_dtype(x.dtype())?;

    let x_cos = x.broadcast_mul(&cos)?;
    let x_sin = rotate_half(x)?.broadcast_mul(&sin)?;
    Ok(x_cos.add(&x_sin)?)
}

// ── RotaryEncoder ─────────────────────────────────────────────────────────────

/// Device-resident rotary tables for one `(D, base, max_len)` configuration.
///
/// Cloning is cheap: candle tensors are reference counted.
#[derive(Debug, Clone)]
pub struct RotaryEncoder {
    config: RopeConfig,
    /// `[max_len, dim]`
    cos: Tensor,
    /// `[max_len, dim]`
    sin: Tensor,
}

impl RotaryEncoder {
    pub fn new(config: &RopeConfig, device: &Device) -> CoreResult<Self> {
        let (cos, sin) = cached_tables(config)?.to_tensors(device)?;
        Ok(Self {
            config: *config,
            cos,
            sin,
        })
    }

    pub fn dim(&self) -> usize {
        self.config.dim
    }

    pub fn max_len(&self) -> usize {
        self.config.max_len
    }

    pub fn base(&self) -> f64 {
        self.config.base
    }

    pub fn cos_table(&self) -> &Tensor {
        &self.cos
    }

    pub fn sin_table(&self) -> &Tensor {
        &self.sin
    }

    /// The `[D]` cosine and sine rows for `position`.
    pub fn rows(&self, position: usize) -> CoreResult<(Tensor, Tensor)> {
        self.check_position(position)?;
        Ok((self.cos.get(position)?, self.sin.get(position)?))
    }

    /// Rotate a single `[D]` vector located at `position`.
    pub fn apply_at(&self, vec: &Tensor, position: usize) -> CoreResult<Tensor> {
        let (cos, sin) = self.rows(position)?;
        apply_rotation(vec, &cos, &sin)
    }

    /// Rotate a `[batch, heads, seq, head_dim]` tensor whose first sequence
    /// slot sits at absolute position `start_pos`.
    pub fn apply(&self, x: &Tensor, start_pos: usize) -> CoreResult<Tensor> {
        let (_batch, _heads, seq_len, head_dim) = x.dims4()?;
        if head_dim != self.config.dim {
            return Err(CoreError::ShapeMismatch(format!(
                "head_dim {head_dim} does not match rotary dim {}",
                self.config.dim
            )));
        }
        if seq_len == 0 {
            return Ok(x.clone());
        }
        self.check_position(start_pos + seq_len - 1)?;

        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        apply_rotation(x, &cos, &sin)
    }

    /// Rotate query and key tensors that share the same positions.
    pub fn apply_qk(
        &self,
        q: &Tensor,
        k: &Tensor,
        start_pos: usize,
    ) -> CoreResult<(Tensor, Tensor)> {
        Ok((self.apply(q, start_pos)?, self.apply(k, start_pos)?))
    }

    fn check_position(&self, position: usize) -> CoreResult<()> {
        if position >= self.config.max_len {
            return Err(CoreError::OutOfRange {
                position,
                max_len: self.config.max_len,
            });
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
