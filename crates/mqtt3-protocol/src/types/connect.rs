use super::WillMessage;
use crate::error::{MqttError, Result};
use crate::time::Duration;
use serde::{Deserialize, Serialize};

/// Lower bound applied to the retry interval so a tiny setting cannot busy-retry.
pub const DEFAULT_MIN_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Per-session settings: what goes into CONNECT plus the engine's timing knobs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub client_id: String,
    pub keep_alive: Duration,
    /// Zero disables retries for the session.
    pub retry_interval: Duration,
    pub min_retry_interval: Duration,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<WillMessage>,
}

impl core::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("retry_interval", &self.retry_interval)
            .field("min_retry_interval", &self.min_retry_interval)
            .field("clean_session", &self.clean_session)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("will", &self.will)
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            keep_alive: Duration::from_secs(60),
            retry_interval: Duration::from_secs(20),
            min_retry_interval: DEFAULT_MIN_RETRY_INTERVAL,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = duration;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, duration: Duration) -> Self {
        self.retry_interval = duration;
        self
    }

    #[must_use]
    pub fn with_min_retry_interval(mut self, duration: Duration) -> Self {
        self.min_retry_interval = duration;
        self
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    /// Keep-alive as carried in CONNECT: whole seconds, saturating at `u16::MAX`.
    #[must_use]
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }

    /// Checks the settings that would otherwise only fail once on the wire.
    pub fn validate(&self) -> Result<()> {
        crate::validation::validate_client_id(&self.client_id)?;
        if self.password.is_some() && self.username.is_none() {
            return Err(MqttError::Configuration(
                "password set without username".to_string(),
            ));
        }
        if let Some(will) = &self.will {
            crate::validation::validate_topic_name(&will.topic)?;
        }
        Ok(())
    }
}

/// CONNACK return codes defined by MQTT 3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUsernameOrPassword),
            5 => Ok(Self::NotAuthorized),
            other => Err(MqttError::MalformedPacket(format!(
                "Invalid CONNACK return code: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("sensor-1");
        assert_eq!(config.client_id, "sensor-1");
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert_eq!(config.min_retry_interval, DEFAULT_MIN_RETRY_INTERVAL);
        assert!(config.clean_session);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SessionConfig::new("c").with_credentials("user", "hunter2");
        let rendered = format!("{config:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_keep_alive_secs_saturates() {
        let config = SessionConfig::new("c").with_keep_alive(Duration::from_secs(100_000));
        assert_eq!(config.keep_alive_secs(), u16::MAX);
    }

    #[test]
    fn test_validate_rejects_bad_client_id() {
        let config = SessionConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wildcard_will_topic() {
        let config = SessionConfig::new("c").with_will(WillMessage::new("a/+", "x"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"client_id":"json-client","clean_session":false}"#).unwrap();
        assert_eq!(config.client_id, "json-client");
        assert!(!config.clean_session);
        assert_eq!(config.keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn test_return_code_conversion() {
        assert_eq!(
            ConnectReturnCode::try_from(0).unwrap(),
            ConnectReturnCode::Accepted
        );
        assert_eq!(
            ConnectReturnCode::try_from(5).unwrap(),
            ConnectReturnCode::NotAuthorized
        );
        assert!(ConnectReturnCode::try_from(6).is_err());
        assert!(ConnectReturnCode::Accepted.is_accepted());
    }
}
