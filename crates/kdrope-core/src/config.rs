use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// Full engine configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    pub rope: RopeConfig,
    pub loss: LossConfig,
}

/// Rotary table geometry.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RopeConfig {
    /// Feature width `D` of each rotated vector (must be even).
    pub dim: usize,
    /// Base of the frequency schedule, `freq[i] = base^(-2i/D)`.
    pub base: f64,
    /// Number of cached positions.
    pub max_len: usize,
}

/// Loss blending and token-weighting policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LossConfig {
    /// Weight of the cross-entropy term; `1 - alpha` goes to distillation.
    pub alpha: f64,
    /// Softmax temperature for the soft-target term.
    pub temperature: f64,
    /// Target ids whose mask weight is overwritten with `structural_weight`.
    #[serde(default)]
    pub structural_token_ids: Vec<u32>,
    pub structural_weight: f64,
    /// Padding id: positions with this target contribute no loss and no weight.
    #[serde(default)]
    pub ignore_index: Option<u32>,
    /// Narrow a wider teacher vocabulary to its leading columns.
    pub truncate_teacher_vocab: bool,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            dim: 128,
            base: 1_000_000.0,
            max_len: 4096,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            temperature: 2.0,
            structural_token_ids: Vec::new(),
            structural_weight: 10.0,
            ignore_index: None,
            truncate_teacher_vocab: true,
        }
    }
}

impl RopeConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.dim == 0 || self.dim % 2 != 0 {
            return Err(CoreError::invalid(
                "rope.dim",
                format!("must be even and positive, got {}", self.dim),
            ));
        }
        if !self.base.is_finite() || self.base <= 1.0 {
            return Err(CoreError::invalid(
                "rope.base",
                format!("must be a finite value > 1, got {}", self.base),
            ));
        }
        if self.max_len == 0 {
            return Err(CoreError::invalid("rope.max_len", "must be positive"));
        }
        Ok(())
    }
}

impl LossConfig {
    pub fn validate(&self) -> CoreResult<()> {
        validate_alpha(self.alpha)?;
        validate_temperature(self.temperature)?;
        if !self.structural_weight.is_finite() || self.structural_weight < 0.0 {
            return Err(CoreError::invalid(
                "loss.structural_weight",
                format!("must be finite and non-negative, got {}", self.structural_weight),
            ));
        }
        Ok(())
    }
}

impl EngineConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.rope.validate()?;
        self.loss.validate()
    }
}

/// Reject blend weights outside `[0, 1]`; nothing is clamped.
pub fn validate_alpha(alpha: f64) -> CoreResult<()> {
    if (0.0..=1.0).contains(&alpha) {
        Ok(())
    } else {
        Err(CoreError::invalid("alpha", format!("must lie in [0, 1], got {alpha}")))
    }
}

pub fn validate_temperature(temperature: f64) -> CoreResult<()> {
    if temperature > 0.0 && temperature.is_finite() {
        Ok(())
    } else {
        Err(CoreError::invalid("temperature", format!("must be > 0, got {temperature}")))
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `KDROPE_` (`KDROPE_LOSS__ALPHA`, ...)
///
/// The result is validated before it is returned.
pub fn load_config(config_file: Option<&Path>) -> CoreResult<EngineConfig> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("rope.dim", 128_i64)?
        .set_default("rope.base", 1_000_000.0)?
        .set_default("rope.max_len", 4096_i64)?
        .set_default("loss.alpha", 0.5)?
        .set_default("loss.temperature", 2.0)?
        .set_default("loss.structural_token_ids", Vec::<i64>::new())?
        .set_default("loss.structural_weight", 10.0)?
        .set_default("loss.truncate_teacher_vocab", true)?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    // Layer 4: environment variables
    builder = builder.add_source(
        Environment::with_prefix("KDROPE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("loss.structural_token_ids"),
    );

    let cfg: EngineConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;

    info!(
        dim = cfg.rope.dim,
        base = cfg.rope.base,
        max_len = cfg.rope.max_len,
        alpha = cfg.loss.alpha,
        temperature = cfg.loss.temperature,
        structural_ids = cfg.loss.structural_token_ids.len(),
        "Engine configuration loaded"
    );
    Ok(cfg)
}
