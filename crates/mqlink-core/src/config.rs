//! Configuration settings
//!
//! Wraps the layered `config` crate sources (an optional `config/default`
//! file plus environment variables) behind the typed getters this crate
//! consumes. A missing key with no default fails with
//! [`Error::NotConfigured`]; a malformed value always fails.

use config::{Config, ConfigError, Environment, File};

use mqlink_transport::ConnectParams;
use mqlink_types::{Error, Result};

/// Application id stamped on published messages when none is configured
const DEFAULT_APP_ID: &str = "Unknown";

/// Prefetch used for clients that don't set their own
const DEFAULT_PREFETCH: u16 = 1;

fn config_err(err: ConfigError) -> Error {
    Error::Config(err.to_string())
}

fn lookup_err(key: &str, err: ConfigError) -> Error {
    match err {
        ConfigError::NotFound(_) => Error::NotConfigured(key.to_string()),
        other => Error::Config(other.to_string()),
    }
}

/// Typed access to the application's configuration
#[derive(Clone)]
pub struct Settings {
    config: Config,
}

impl Settings {
    /// Load from `config/default.*` (optional) and environment variables,
    /// where `BROKER_HOST` maps to the key `broker.host`. Environment
    /// values win over file values.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::default().separator("_"))
            .build()
            .map_err(config_err)?;

        Ok(Self { config })
    }

    /// Build settings from explicit key/value overrides (tests, embedding)
    pub fn from_overrides<I, K>(overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, config::Value)>,
        K: AsRef<str>,
    {
        let mut builder = Config::builder();
        for (key, value) in overrides {
            builder = builder.set_override(key.as_ref(), value).map_err(config_err)?;
        }

        Ok(Self {
            config: builder.build().map_err(config_err)?,
        })
    }

    // ==================== Typed getters ====================

    /// Required string value
    pub fn string(&self, key: &str) -> Result<String> {
        self.config.get_string(key).map_err(|err| lookup_err(key, err))
    }

    /// String value with a fallback for missing keys
    pub fn string_or(&self, key: &str, default: &str) -> Result<String> {
        match self.config.get_string(key) {
            Ok(value) => Ok(value),
            Err(ConfigError::NotFound(_)) => Ok(default.to_string()),
            Err(err) => Err(config_err(err)),
        }
    }

    /// Required integer value
    pub fn int(&self, key: &str) -> Result<i64> {
        self.config.get_int(key).map_err(|err| lookup_err(key, err))
    }

    /// Integer value with a fallback for missing keys
    pub fn int_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.config.get_int(key) {
            Ok(value) => Ok(value),
            Err(ConfigError::NotFound(_)) => Ok(default),
            Err(err) => Err(config_err(err)),
        }
    }

    /// Required boolean value
    pub fn bool(&self, key: &str) -> Result<bool> {
        self.config.get_bool(key).map_err(|err| lookup_err(key, err))
    }

    /// Boolean value with a fallback for missing keys
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.config.get_bool(key) {
            Ok(value) => Ok(value),
            Err(ConfigError::NotFound(_)) => Ok(default),
            Err(err) => Err(config_err(err)),
        }
    }

    /// Required float value
    pub fn float(&self, key: &str) -> Result<f64> {
        self.config.get_float(key).map_err(|err| lookup_err(key, err))
    }

    /// Float value with a fallback for missing keys
    pub fn float_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.config.get_float(key) {
            Ok(value) => Ok(value),
            Err(ConfigError::NotFound(_)) => Ok(default),
            Err(err) => Err(config_err(err)),
        }
    }

    // ==================== Broker settings ====================

    /// Broker endpoint and credentials
    pub fn connect_params(&self) -> Result<ConnectParams> {
        let port = self.int("broker.port")?;
        let port = u16::try_from(port)
            .map_err(|_| Error::Config(format!("broker.port out of range: {port}")))?;

        Ok(ConnectParams {
            host: self.string("broker.host")?,
            port,
            username: self.string("broker.username")?,
            password: self.string("broker.password")?,
            virtual_host: self.string_or("broker.virtual_host", "/")?,
        })
    }

    /// Application id stamped on published messages
    pub fn app_id(&self) -> Result<String> {
        self.string_or("app.id", DEFAULT_APP_ID)
    }

    /// Prefetch applied to clients that don't set their own
    pub fn default_prefetch(&self) -> Result<u16> {
        let prefetch = self.int_or("broker.prefetch", i64::from(DEFAULT_PREFETCH))?;
        u16::try_from(prefetch)
            .map_err(|_| Error::Config(format!("broker.prefetch out of range: {prefetch}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(overrides: Vec<(&str, config::Value)>) -> Settings {
        Settings::from_overrides(overrides).unwrap()
    }

    #[test]
    fn test_missing_key_without_default_fails() {
        let settings = settings(vec![]);
        assert!(matches!(
            settings.string("broker.host"),
            Err(Error::NotConfigured(key)) if key == "broker.host"
        ));
    }

    #[test]
    fn test_default_used_for_missing_key() {
        let settings = settings(vec![]);
        assert_eq!(settings.string_or("app.id", "Unknown").unwrap(), "Unknown");
        assert_eq!(settings.int_or("broker.prefetch", 1).unwrap(), 1);
        assert!(!settings.bool_or("broker.tls", false).unwrap());
        assert_eq!(settings.float_or("broker.backoff", 0.5).unwrap(), 0.5);
    }

    #[test]
    fn test_configured_value_wins_over_default() {
        let settings = settings(vec![("app.id", "billing".into())]);
        assert_eq!(settings.app_id().unwrap(), "billing");
    }

    #[test]
    fn test_malformed_value_fails_even_with_default() {
        let settings = settings(vec![("broker.prefetch", "lots".into())]);
        assert!(matches!(
            settings.default_prefetch(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_connect_params_resolution() {
        let settings = settings(vec![
            ("broker.host", "localhost".into()),
            ("broker.port", 5672i64.into()),
            ("broker.username", "guest".into()),
            ("broker.password", "guest".into()),
        ]);

        let params = settings.connect_params().unwrap();
        assert_eq!(params.host, "localhost");
        assert_eq!(params.port, 5672);
        assert_eq!(params.virtual_host, "/");
    }

    #[test]
    fn test_port_out_of_range_fails() {
        let settings = settings(vec![
            ("broker.host", "localhost".into()),
            ("broker.port", 70000i64.into()),
            ("broker.username", "guest".into()),
            ("broker.password", "guest".into()),
        ]);

        assert!(matches!(settings.connect_params(), Err(Error::Config(_))));
    }
}
