use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_TEMPERATURE, MODEL_OPTIONS, TEMPERATURE_MAX, TEMPERATURE_MIN};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("temperature {0} is outside 0.0..=1.2")]
    TemperatureOutOfRange(f32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Model {
    #[default]
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    #[serde(rename = "gpt-4.1-mini")]
    Gpt41Mini,
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl Model {
    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Gpt4oMini => MODEL_OPTIONS[0],
            Model::Gpt41Mini => MODEL_OPTIONS[1],
            Model::Gpt35Turbo => MODEL_OPTIONS[2],
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Model {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpt-4o-mini" => Ok(Model::Gpt4oMini),
            "gpt-4.1-mini" => Ok(Model::Gpt41Mini),
            "gpt-3.5-turbo" => Ok(Model::Gpt35Turbo),
            other => Err(ConfigError::UnknownModel(other.to_string())),
        }
    }
}

/// Model and sampling settings for outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RequestConfig {
    model: Model,
    temperature: f32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            model: Model::default(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl RequestConfig {
    pub fn model(&self) -> Model {
        self.model
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn set_model(&mut self, model: &str) -> Result<(), ConfigError> {
        self.model = model.parse()?;
        Ok(())
    }

    /// Accepts values in range and snaps them to the 0.1 grid of the slider.
    pub fn set_temperature(&mut self, temperature: f32) -> Result<(), ConfigError> {
        if !(TEMPERATURE_MIN..=TEMPERATURE_MAX).contains(&temperature) {
            return Err(ConfigError::TemperatureOutOfRange(temperature));
        }
        self.temperature = (temperature * 10.0).round() / 10.0;
        Ok(())
    }
}

/// API key held for one session. Never printed; empty means "not supplied".
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Credential {
    fn from(key: String) -> Self {
        Credential::new(key)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential(***)")
        }
    }
}
