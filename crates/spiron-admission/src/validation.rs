//! Structural validation of broadcast payloads.

use regex::Regex;
use thiserror::Error;

use crate::error::{Error as SetupError, Result};

/// Id pattern used when none is configured.
pub const DEFAULT_ID_PATTERN: &str = "^[a-zA-Z0-9_-]{1,128}$";

/// Upper bound on the configurable vector dimension.
pub const MAX_DIMENSIONS: usize = 8192;

/// Shape a broadcast must have.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationConfig {
    pub dimensions: usize,
    pub id_pattern: String,
    pub min_energy: f64,
    pub max_energy: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            dimensions: 128,
            id_pattern: DEFAULT_ID_PATTERN.to_string(),
            min_energy: 0.0,
            max_energy: 1000.0,
        }
    }
}

impl ValidationConfig {
    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[must_use]
    pub fn with_id_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.id_pattern = pattern.into();
        self
    }

    #[must_use]
    pub fn with_energy_range(mut self, min: f64, max: f64) -> Self {
        self.min_energy = min;
        self.max_energy = max;
        self
    }
}

/// Why a broadcast was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("id is empty")]
    IdEmpty,

    #[error("id {0:?} does not match the configured pattern")]
    IdInvalidFormat(String),

    #[error("vector has {actual} components, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector component {index} is not finite")]
    VectorInvalidValue { index: usize },

    #[error("energy is not finite")]
    EnergyInvalidValue,

    #[error("energy {energy} is below {min}")]
    EnergyTooLow { energy: f64, min: f64 },

    #[error("energy {energy} is above {max}")]
    EnergyTooHigh { energy: f64, max: f64 },
}

impl ValidationError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::IdEmpty => "ID_EMPTY",
            Self::IdInvalidFormat(_) => "ID_INVALID_FORMAT",
            Self::DimensionMismatch { .. } => "VECTOR_DIMENSION_MISMATCH",
            Self::VectorInvalidValue { .. } => "VECTOR_INVALID_VALUE",
            Self::EnergyInvalidValue => "ENERGY_INVALID_VALUE",
            Self::EnergyTooLow { .. } => "ENERGY_TOO_LOW",
            Self::EnergyTooHigh { .. } => "ENERGY_TOO_HIGH",
        }
    }
}

/// Checks id, vector and energy against a [`ValidationConfig`].
#[derive(Debug, Clone)]
pub struct BroadcastValidator {
    config: ValidationConfig,
    id_pattern: Regex,
}

impl BroadcastValidator {
    pub fn new(config: ValidationConfig) -> Result<Self> {
        if config.dimensions == 0 || config.dimensions > MAX_DIMENSIONS {
            return Err(SetupError::InvalidConfig(format!(
                "vector dimensions must be in 1..={MAX_DIMENSIONS}, got {}",
                config.dimensions
            )));
        }
        if config.min_energy.is_nan() || config.max_energy.is_nan() || config.min_energy > config.max_energy {
            return Err(SetupError::InvalidConfig(format!(
                "energy range [{}, {}] is empty",
                config.min_energy, config.max_energy
            )));
        }
        let id_pattern = Regex::new(&config.id_pattern).map_err(|source| SetupError::InvalidPattern {
            pattern: config.id_pattern.clone(),
            source,
        })?;
        Ok(Self { config, id_pattern })
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// First problem found, checking id, then vector, then energy.
    pub fn validate(&self, id: &str, vector: &[f64], energy: f64) -> std::result::Result<(), ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::IdEmpty);
        }
        if !self.id_pattern.is_match(id) {
            return Err(ValidationError::IdInvalidFormat(id.to_string()));
        }

        if vector.len() != self.config.dimensions {
            return Err(ValidationError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        if let Some(index) = vector.iter().position(|x| !x.is_finite()) {
            return Err(ValidationError::VectorInvalidValue { index });
        }

        if !energy.is_finite() {
            return Err(ValidationError::EnergyInvalidValue);
        }
        if energy < self.config.min_energy {
            return Err(ValidationError::EnergyTooLow {
                energy,
                min: self.config.min_energy,
            });
        }
        if energy > self.config.max_energy {
            return Err(ValidationError::EnergyTooHigh {
                energy,
                max: self.config.max_energy,
            });
        }
        Ok(())
    }
}
