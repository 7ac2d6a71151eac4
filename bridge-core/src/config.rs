//! Static configuration of the bridge.
//!
//! Loading from disk and the environment lives in the platform crate; this
//! module only describes the shape and what makes it valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::identity::Template;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("at least one Matrix user template must be configured")]
    NoUserTemplate,
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserTemplateConfig {
    pub template: String,
}

/// Delivers carrier calls for `remote` to the chat user `user`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    pub remote: String,
    pub user: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub domain: String,
    pub users: Vec<UserTemplateConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeserverConfig {
    /// Base URL of the client-server API, e.g. `https://matrix.example.org`.
    pub host: String,
    pub as_token: String,
    pub hs_token: String,
    /// Localpart of the application service bot user.
    pub localpart: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VertoConfig {
    pub url: String,
    pub login: String,
    pub password: String,
    pub login_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for VertoConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            login: String::new(),
            password: String::new(),
            login_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl VertoConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Quiet period after the last ICE candidate before an SDP is sent.
    pub candidate_delay_ms: u64,
    /// Lifetime given to invites that arrive from the carrier.
    pub invite_lifetime_ms: i64,
    pub transaction_history: usize,
    pub routes: Vec<RouteConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            candidate_delay_ms: 2_000,
            invite_lifetime_ms: 60_000,
            transaction_history: 64,
            routes: Vec::new(),
        }
    }
}

impl CallConfig {
    pub fn candidate_delay(&self) -> Duration {
        Duration::from_millis(self.candidate_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppServiceConfig {
    pub bind: String,
}

impl Default for AppServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8091".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub matrix: MatrixConfig,
    pub homeserver: HomeserverConfig,
    pub verto: VertoConfig,
    pub call: CallConfig,
    pub appservice: AppServiceConfig,
}

fn require(value: &str, name: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(name))
    } else {
        Ok(())
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.matrix.domain, "matrix.domain")?;
        require(&self.homeserver.host, "homeserver.host")?;
        require(&self.homeserver.as_token, "homeserver.as_token")?;
        require(&self.homeserver.hs_token, "homeserver.hs_token")?;
        require(&self.homeserver.localpart, "homeserver.localpart")?;
        require(&self.verto.url, "verto.url")?;
        require(&self.verto.login, "verto.login")?;
        require(&self.appservice.bind, "appservice.bind")?;

        if self.matrix.users.is_empty() {
            return Err(ConfigError::NoUserTemplate);
        }
        for user in &self.matrix.users {
            let template = Template::parse(&user.template)
                .map_err(|e| ConfigError::InvalidTemplate(e.to_string()))?;
            if !template.has_placeholder() {
                return Err(ConfigError::InvalidTemplate(format!(
                    "user template {} has no placeholder",
                    user.template
                )));
            }
        }
        for route in &self.call.routes {
            Template::parse(&route.remote)
                .and_then(|_| Template::parse(&route.user))
                .map_err(|e| ConfigError::InvalidTemplate(e.to_string()))?;
        }

        if self.call.invite_lifetime_ms <= 0 {
            return Err(ConfigError::NotPositive("call.invite_lifetime_ms"));
        }
        if self.verto.request_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("verto.request_timeout_ms"));
        }
        if self.verto.login_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("verto.login_timeout_ms"));
        }
        Ok(())
    }

    pub fn bot_user_id(&self) -> String {
        format!("@{}:{}", self.homeserver.localpart, self.matrix.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid() -> BridgeConfig {
        BridgeConfig {
            matrix: MatrixConfig {
                domain: "example.org".into(),
                users: vec![UserTemplateConfig {
                    template: "_voip_%REMOTE_ID%".into(),
                }],
            },
            homeserver: HomeserverConfig {
                host: "http://localhost:8008".into(),
                as_token: "as".into(),
                hs_token: "hs".into(),
                localpart: "voip".into(),
            },
            verto: VertoConfig {
                url: "wss://fs.example.org:8082".into(),
                login: "1000@fs.example.org".into(),
                password: "secret".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn accepts_complete_config() {
        let cfg = valid();
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.bot_user_id(), "@voip:example.org");
        assert_eq!(cfg.call.candidate_delay(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_missing_essentials() {
        let mut cfg = valid();
        cfg.matrix.domain.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::Missing("matrix.domain")));

        let mut cfg = valid();
        cfg.homeserver.hs_token = "  ".into();
        assert_eq!(cfg.validate(), Err(ConfigError::Missing("homeserver.hs_token")));

        let mut cfg = valid();
        cfg.matrix.users.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::NoUserTemplate));

        let mut cfg = valid();
        cfg.matrix.users[0].template = "voip".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTemplate(_))));
    }
}
