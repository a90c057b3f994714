//! # kdrope-core
//!
//! Shared foundations for the kdrope training components:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`rotary`] | Rotary positional encoding tables and the [`RotaryEncoder`] |
//! | [`config`] | Layered TOML + env configuration ([`EngineConfig`]) |
//! | [`error`]  | The [`CoreError`] taxonomy shared by every kdrope crate |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod config;
pub mod error;
pub mod rotary;

pub use crate::config::{load_config, EngineConfig, LossConfig, RopeConfig};
pub use crate::error::{CoreError, CoreResult};
pub use crate::rotary::{apply_rotation, evict_tables, precompute, rotate_half, RotaryEncoder};
