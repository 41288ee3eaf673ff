//! Submission server configuration.

use core::fmt::{self, Debug, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SMTP host is not configured")]
    MissingHost,

    #[error("SMTP port must be non-zero")]
    InvalidPort,

    #[error("SMTP credentials are not configured (username and password are required)")]
    MissingCredentials,

    #[error("Invalid sender address '{0}'")]
    InvalidSender(String),

    #[error("Invalid value for {variable}: '{value}'")]
    InvalidEnvironment { variable: &'static str, value: String },
}

/// How the connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// Upgrade with STARTTLS after the first EHLO; failure aborts the send.
    #[default]
    StartTls,
    /// Plaintext for the whole session. Only for local relays and tests.
    None,
}

/// SMTP operation timeouts
///
/// Every step of a send is bounded so a stalled server can't pin a dispatcher
/// slot indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// TCP connect
    ///
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Each command/reply exchange, the greeting and the TLS handshake
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    /// Transmitting the message body and waiting for the server's verdict
    ///
    /// Default: 120 seconds
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    /// QUIT
    ///
    /// Default: 10 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl SmtpTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    #[must_use]
    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            command_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

const fn default_port() -> u16 {
    587
}

fn default_helo_domain() -> String {
    "localhost".to_string()
}

/// Where and as whom mail is submitted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,

    /// Default: 587 (submission)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Envelope sender and `From` address
    pub from_email: String,

    /// Display name for the `From` header
    #[serde(default)]
    pub from_name: Option<String>,

    /// Name announced in EHLO
    ///
    /// Default: "localhost"
    #[serde(default = "default_helo_domain")]
    pub helo_domain: String,

    #[serde(default)]
    pub tls: TlsMode,

    /// Accept invalid TLS certificates (testing only)
    ///
    /// **SECURITY WARNING**: never enable this against a real relay.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

impl Debug for SmtpConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from_email", &self.from_email)
            .field("from_name", &self.from_name)
            .field("helo_domain", &self.helo_domain)
            .field("tls", &self.tls)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, from_email: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: None,
            password: None,
            from_email: from_email.into(),
            from_name: None,
            helo_domain: default_helo_domain(),
            tls: TlsMode::default(),
            accept_invalid_certs: false,
            timeouts: SmtpTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port`, as passed to the TCP connector.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Overrides settings from `COURIER_SMTP_HOST`, `COURIER_SMTP_PORT`,
    /// `COURIER_SMTP_USERNAME` and `COURIER_SMTP_PASSWORD`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::apply_env`] with an injectable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("COURIER_SMTP_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("COURIER_SMTP_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidEnvironment {
                    variable: "COURIER_SMTP_PORT",
                    value: port.clone(),
                })?;
        }

        if let Some(username) = lookup("COURIER_SMTP_USERNAME") {
            self.username = Some(username);
        }

        if let Some(password) = lookup("COURIER_SMTP_PASSWORD") {
            self.password = Some(password);
        }

        Ok(())
    }

    /// Checks the settings needed before the first send is attempted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let has_value = |value: Option<&String>| value.is_some_and(|v| !v.is_empty());
        if !has_value(self.username.as_ref()) || !has_value(self.password.as_ref()) {
            return Err(ConfigError::MissingCredentials);
        }

        match self.from_email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(ConfigError::InvalidSender(self.from_email.clone())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn valid() -> SmtpConfig {
        SmtpConfig::new("smtp.example.com", "noreply@example.com").with_credentials("user", "pass")
    }

    #[test]
    fn test_defaults() {
        let config = SmtpConfig::new("smtp.example.com", "noreply@example.com");
        assert_eq!(config.port, 587);
        assert_eq!(config.tls, TlsMode::StartTls);
        assert_eq!(config.timeouts.connect(), Duration::from_secs(30));
        assert_eq!(config.timeouts.data(), Duration::from_secs(120));
        assert_eq!(config.address(), "smtp.example.com:587");
    }

    #[test]
    fn test_validate() {
        assert_eq!(valid().validate(), Ok(()));

        let mut config = valid();
        config.password = None;
        assert_eq!(config.validate(), Err(ConfigError::MissingCredentials));

        let mut config = valid();
        config.username = Some(String::new());
        assert_eq!(config.validate(), Err(ConfigError::MissingCredentials));

        let mut config = valid();
        config.host = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::MissingHost));

        let mut config = valid();
        config.from_email = "noreply".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSender("noreply".to_string()))
        );
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("COURIER_SMTP_HOST", "relay.internal"),
            ("COURIER_SMTP_PORT", "2525"),
            ("COURIER_SMTP_PASSWORD", "from-env"),
        ]);

        let mut config = valid();
        config
            .apply_env_from(|key| env.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.host, "relay.internal");
        assert_eq!(config.port, 2525);
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.password.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_env_invalid_port() {
        let mut config = valid();
        let result = config.apply_env_from(|key| {
            (key == "COURIER_SMTP_PORT").then(|| "submission".to_string())
        });

        assert_eq!(
            result,
            Err(ConfigError::InvalidEnvironment {
                variable: "COURIER_SMTP_PORT",
                value: "submission".to_string()
            })
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", valid());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("\"pass\""));
    }
}
