//! Layered settings: compiled defaults < secret store < process environment.

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::types::*;
use crate::secret::SecretStore;
use crate::transfer::{self, RetryPolicy};
use figment::providers::{Env, Serialized};
use figment::value::{Dict, Map, Value};
use figment::{Figment, Metadata, Profile, Provider};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Raw setting values after layering. Every field is kept as text so a bad
/// number surfaces as a validation message instead of a load failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub api_id: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub api_hash: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub additional_bot_tokens: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub chunk_threshold: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub api_port: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub api_host: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(deserialize_with = "text", skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl Settings {
    /// The compiled defaults layer.
    pub fn defaults() -> Self {
        Self {
            chunk_size: Some(DEFAULT_CHUNK_SIZE.to_string()),
            chunk_threshold: Some(DEFAULT_CHUNK_THRESHOLD.to_string()),
            max_retries: Some(DEFAULT_MAX_RETRIES.to_string()),
            api_port: Some(DEFAULT_API_PORT.to_string()),
            api_host: Some(DEFAULT_API_HOST.to_string()),
            db_path: Some(DEFAULT_DB_PATH.to_string()),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            ..Self::default()
        }
    }

    fn field(&self, name: &str) -> Option<&String> {
        match name {
            API_ID => self.api_id.as_ref(),
            API_HASH => self.api_hash.as_ref(),
            BOT_TOKEN => self.bot_token.as_ref(),
            CHANNEL_ID => self.channel_id.as_ref(),
            ADDITIONAL_BOT_TOKENS => self.additional_bot_tokens.as_ref(),
            CHUNK_SIZE => self.chunk_size.as_ref(),
            CHUNK_THRESHOLD => self.chunk_threshold.as_ref(),
            MAX_RETRIES => self.max_retries.as_ref(),
            API_PORT => self.api_port.as_ref(),
            API_HOST => self.api_host.as_ref(),
            DB_PATH => self.db_path.as_ref(),
            LOG_LEVEL => self.log_level.as_ref(),
            LOG_PATH => self.log_path.as_ref(),
            _ => None,
        }
    }
}

/// Accept any scalar as text. Environment values arrive parsed (`8080` is a
/// number, `-100555` an integer), the store's as strings. Blank means unset.
fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    struct Text;

    impl<'de> Visitor<'de> for Text {
        type Value = Option<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string, number or boolean")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let v = v.trim();
            Ok((!v.is_empty()).then(|| v.to_string()))
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_char<E: de::Error>(self, v: char) -> Result<Self::Value, E> {
            self.visit_str(v.encode_utf8(&mut [0; 4]))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_any(self)
        }
    }

    deserializer.deserialize_any(Text)
}

/// The secret store as a figment layer. Only known settings with a non-blank
/// value are emitted.
struct SecretStoreLayer {
    values: Dict,
}

impl SecretStoreLayer {
    fn new(secrets: &SecretStore) -> Self {
        let values = SETTINGS
            .iter()
            .filter_map(|&name| {
                let value = secrets.get(name)?;
                let value = value.trim();
                (!value.is_empty())
                    .then(|| (name.to_ascii_lowercase(), Value::from(value.to_string())))
            })
            .collect();
        Self { values }
    }
}

impl Provider for SecretStoreLayer {
    fn metadata(&self) -> Metadata {
        Metadata::named("secret store")
    }

    fn data(&self) -> figment::Result<Map<Profile, Dict>> {
        Ok(Profile::Default.collect(self.values.clone()))
    }
}

pub struct ConfigResolver<'a> {
    secrets: &'a SecretStore,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(secrets: &'a SecretStore) -> Self {
        Self { secrets }
    }

    /// The layered figment, lowest precedence first. Blank environment
    /// variables are skipped so they do not hide a stored value.
    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::defaults()))
            .merge(SecretStoreLayer::new(self.secrets))
            .merge(
                Env::raw().only(SETTINGS).filter(|key| {
                    std::env::var(key.as_str()).is_ok_and(|v| !v.trim().is_empty())
                }),
            )
    }

    /// Merge all layers.
    pub fn resolve(&self) -> ConfigResult<ResolvedConfig> {
        let figment = self.figment();
        let settings: Settings = figment.extract().map_err(Box::new)?;

        for &name in SETTINGS {
            if let Some(meta) = figment.find_metadata(&name.to_ascii_lowercase()) {
                debug!(setting = name, source = %meta.name, "Resolved setting");
            }
        }
        Ok(ResolvedConfig { settings })
    }
}

/// Merged settings. Typed getters fall back to the compiled default when a
/// value does not parse; check [`is_valid`](Self::is_valid) before use.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    settings: Settings,
}

impl ResolvedConfig {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Look a setting up by its environment name, e.g. `BOT_TOKEN`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.settings.field(name).map(String::as_str)
    }

    pub fn api_id(&self) -> Option<&str> {
        self.get(API_ID)
    }

    pub fn api_hash(&self) -> Option<&str> {
        self.get(API_HASH)
    }

    pub fn bot_token(&self) -> Option<&str> {
        self.get(BOT_TOKEN)
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.get(CHANNEL_ID)
    }

    pub fn additional_bot_tokens(&self) -> Vec<String> {
        self.get(ADDITIONAL_BOT_TOKENS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Primary token first, then the additional ones in configured order.
    /// Round-robin chunk assignment indexes into this list.
    pub fn all_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.bot_token().map(String::from).into_iter().collect();
        tokens.extend(self.additional_bot_tokens());
        tokens
    }

    pub fn token_for_chunk(&self, chunk_number: u32) -> Option<String> {
        transfer::token_for_chunk(&self.all_tokens(), chunk_number).map(String::from)
    }

    pub fn chunk_size(&self) -> u64 {
        parse_positive(self.get(CHUNK_SIZE)).unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    pub fn chunk_threshold(&self) -> u64 {
        parse_positive(self.get(CHUNK_THRESHOLD)).unwrap_or(DEFAULT_CHUNK_THRESHOLD)
    }

    pub fn max_retries(&self) -> u32 {
        self.get(MAX_RETRIES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries())
    }

    pub fn api_port(&self) -> u16 {
        parse_port(self.get(API_PORT)).unwrap_or(DEFAULT_API_PORT)
    }

    pub fn api_host(&self) -> &str {
        self.get(API_HOST).unwrap_or(DEFAULT_API_HOST)
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(self.get(DB_PATH).unwrap_or(DEFAULT_DB_PATH))
    }

    pub fn log_level(&self) -> &str {
        self.get(LOG_LEVEL).unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.get(LOG_PATH).map(PathBuf::from)
    }

    pub fn should_chunk(&self, file_size: u64) -> bool {
        file_size >= self.chunk_threshold()
    }

    /// Every problem, in a fixed order.
    pub fn validation_errors(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.bot_token().is_none() {
            errors.push(ConfigError::required(BOT_TOKEN));
        }
        if self.channel_id().is_none() {
            errors.push(ConfigError::required(CHANNEL_ID));
        }
        if parse_positive(self.get(CHUNK_SIZE)).is_none() {
            errors.push(ConfigError::invalid(CHUNK_SIZE));
        }
        if parse_positive(self.get(CHUNK_THRESHOLD)).is_none() {
            errors.push(ConfigError::invalid(CHUNK_THRESHOLD));
        }
        if self.get(MAX_RETRIES).and_then(|v| v.parse::<u32>().ok()).is_none() {
            errors.push(ConfigError::invalid(MAX_RETRIES));
        }
        if parse_port(self.get(API_PORT)).is_none() {
            errors.push(ConfigError::invalid(API_PORT));
        }
        errors
    }

    /// The first problem, if any.
    pub fn validate(&self) -> ConfigResult<()> {
        match self.validation_errors().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validation_errors().is_empty()
    }
}

fn parse_positive(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse::<u64>().ok()).filter(|&v| v > 0)
}

fn parse_port(value: Option<&str>) -> Option<u16> {
    value.and_then(|v| v.parse::<u16>().ok()).filter(|&v| v != 0)
}
