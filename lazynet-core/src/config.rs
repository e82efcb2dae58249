use std::str::FromStr;

use crate::{Error, LossType, Result};

/// Knobs of the pipelined batch executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Batches allowed to have outstanding device work at once.
    pub max_in_flight: usize,
    /// Abort a run after this many device errors in a row. `None` logs every
    /// failure and keeps going.
    pub max_consecutive_device_errors: Option<usize>,
    /// Loss attached to outputs that are not sigmoid or softmax activations
    /// when a model has no loss of its own.
    pub default_loss: LossType,
    pub default_batch_size: usize,
    pub default_epochs: f32,
    /// Record non-loss exported tensors in each batch history.
    pub record_intermediates: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 2,
            max_consecutive_device_errors: None,
            default_loss: LossType::MeanSquaredError,
            default_batch_size: 32,
            default_epochs: 10.0,
            record_intermediates: true,
        }
    }
}

pub const MAX_IN_FLIGHT_VAR: &str = "LAZYNET_MAX_IN_FLIGHT";
pub const MAX_DEVICE_ERRORS_VAR: &str = "LAZYNET_MAX_DEVICE_ERRORS";
pub const BATCH_SIZE_VAR: &str = "LAZYNET_BATCH_SIZE";
pub const EPOCHS_VAR: &str = "LAZYNET_EPOCHS";

impl ExecutorConfig {
    /// Defaults overridden by `LAZYNET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_var::<usize>(&lookup, MAX_IN_FLIGHT_VAR)? {
            config.max_in_flight = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, MAX_DEVICE_ERRORS_VAR)? {
            config.max_consecutive_device_errors = Some(v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, BATCH_SIZE_VAR)? {
            config.default_batch_size = v;
        }
        if let Some(v) = parse_var::<f32>(&lookup, EPOCHS_VAR)? {
            config.default_epochs = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::config("max_in_flight must be at least 1"));
        }
        if self.max_consecutive_device_errors == Some(0) {
            return Err(Error::config(
                "max_consecutive_device_errors must be at least 1 when set",
            ));
        }
        if self.default_batch_size == 0 {
            return Err(Error::config("default batch size must be at least 1"));
        }
        if !(self.default_epochs > 0.0) {
            return Err(Error::config(format!(
                "default epochs must be positive, got {}",
                self.default_epochs
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("invalid value `{raw}` for {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides() {
        let config = ExecutorConfig::from_lookup(|key| match key {
            MAX_IN_FLIGHT_VAR => Some("3".into()),
            MAX_DEVICE_ERRORS_VAR => Some("5".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_in_flight, 3);
        assert_eq!(config.max_consecutive_device_errors, Some(5));
        assert_eq!(config.default_batch_size, 32);
    }

    #[test]
    fn rejects_bad_values() {
        let err = ExecutorConfig::from_lookup(|key| {
            (key == MAX_IN_FLIGHT_VAR).then(|| "zero".to_string())
        })
        .unwrap_err();
        assert!(err.is_configuration());
        let err = ExecutorConfig::from_lookup(|key| {
            (key == MAX_IN_FLIGHT_VAR).then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.is_configuration());
    }
}
