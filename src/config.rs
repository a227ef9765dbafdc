use crate::error::FactorError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// All work runs inline on the walking thread; no lanes are opened.
    #[default]
    Sequential,
    /// Shared nodes get their own execution lane.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    F32,
    #[default]
    F64,
}

impl Precision {
    #[inline]
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::F32 => value as f32 as f64,
            Self::F64 => value,
        }
    }
}

/// Run-scoped settings threaded through `pre_compute`/`compute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub device: Device,
    pub precision: Precision,
    /// Scales the rolling memory estimate; larger values give smaller chunks.
    pub rolling_split_multiplier: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device: Device::Sequential,
            precision: Precision::F64,
            rolling_split_multiplier: 1.0,
        }
    }
}

impl RunConfig {
    pub fn parallel() -> Self {
        Self {
            device: Device::Parallel,
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, FactorError> {
        let config: Self = toml::from_str(raw).map_err(|err| FactorError::Config {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FactorError> {
        if !self.rolling_split_multiplier.is_finite() || self.rolling_split_multiplier <= 0.0 {
            return Err(FactorError::Config {
                reason: format!(
                    "rolling_split_multiplier must be a positive number, got {}",
                    self.rolling_split_multiplier
                ),
            });
        }
        Ok(())
    }
}
