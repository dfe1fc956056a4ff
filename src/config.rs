use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::hook::{PrepareRequest, PrepareRequestParams, RequestOutcome};
use crate::server::ServerOptions;

/// File configuration for the standalone binary. Everything the library
/// needs beyond this (hooks, event listeners) is programmatic.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: Option<AuthSection>,
    #[serde(default)]
    pub upstream: Option<UpstreamSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_auth_realm")]
    pub auth_realm: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: None,
            auth_realm: default_auth_realm(),
            verbose: false,
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Require clients to authenticate with these credentials.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthSection {
    pub username: String,
    pub password: String,
}

/// Route every request through this upstream proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamSection {
    pub url: String,
    #[serde(default)]
    pub ignore_certificate: bool,
}

fn default_port() -> u16 {
    8000
}

fn default_auth_realm() -> String {
    "ProxyChain".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    60
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path))
    }

    /// Load the given path, or fall back to `./config.toml`, or run on
    /// defaults when neither exists.
    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                if fs::metadata("config.toml").is_ok() {
                    Self::load("config.toml")
                } else {
                    info!("no config file found, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Turn the file configuration into server options, installing a hook
    /// when authentication or a static upstream is configured.
    pub fn into_server_options(self) -> ServerOptions {
        let rules = ConfigRules {
            auth: self.auth.map(|a| (a.username, a.password)),
            upstream: self.upstream.map(|u| (u.url, u.ignore_certificate)),
        };
        let prepare_request: Option<Arc<dyn PrepareRequest>> =
            if rules.auth.is_some() || rules.upstream.is_some() {
                Some(Arc::new(rules))
            } else {
                None
            };
        ServerOptions {
            port: self.server.port,
            host: self.server.host,
            auth_realm: self.server.auth_realm,
            verbose: self.server.verbose,
            idle_timeout_secs: self.server.idle_timeout_secs,
            prepare_request,
        }
    }
}

// Static routing rules derived from the config file.
struct ConfigRules {
    auth: Option<(String, String)>,
    upstream: Option<(String, bool)>,
}

impl ConfigRules {
    fn decide(&self, username: Option<&str>, password: Option<&str>) -> RequestOutcome {
        if let Some((expected_user, expected_pass)) = &self.auth {
            let ok = username == Some(expected_user.as_str())
                && password == Some(expected_pass.as_str());
            if !ok {
                return RequestOutcome::authenticate(None);
            }
        }
        match &self.upstream {
            Some((url, ignore_certificate)) => {
                let mut outcome = RequestOutcome::via_upstream(url.clone());
                outcome.ignore_upstream_proxy_certificate = *ignore_certificate;
                outcome
            }
            None => RequestOutcome::direct(),
        }
    }
}

#[async_trait]
impl PrepareRequest for ConfigRules {
    async fn prepare_request(
        &self,
        params: PrepareRequestParams<'_>,
    ) -> anyhow::Result<RequestOutcome> {
        Ok(self.decide(params.username.as_deref(), params.password.as_deref()))
    }
}
