use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = "flowswitch";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub auth: AuthConfig,
    pub http: HttpConfig,
    pub call: CallConfig,
}

/// Credentials used to sign outgoing webhooks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub header_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
    pub default_method: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CallConfig {
    pub default_answer_url: Option<String>,
    pub default_hangup_url: Option<String>,
    /// Channel variables copied verbatim into every outward payload.
    pub extra_channel_vars: Vec<String>,
    pub event_timeout_secs: u64,
    pub max_digits_timeout_secs: u64,
    pub max_loop: u32,
    pub record_path: String,
    pub schedule_grace_secs: u64,
    pub conference_join_window_secs: u64,
    pub conference_profile: String,
    pub speech_engine: String,
    pub tts_engine: String,
    pub tts_voice: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            header_prefix: "FLOWSWITCH".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            user_agent: Some(USER_AGENT.to_string()),
            default_method: "POST".to_string(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            default_answer_url: None,
            default_hangup_url: None,
            extra_channel_vars: Vec::new(),
            event_timeout_secs: 3600,
            max_digits_timeout_secs: 60,
            max_loop: 10000,
            #[cfg(target_os = "windows")]
            record_path: "./recordings".to_string(),
            #[cfg(not(target_os = "windows"))]
            record_path: "/tmp/recordings".to_string(),
            schedule_grace_secs: 10,
            conference_join_window_secs: 30,
            conference_profile: "default".to_string(),
            speech_engine: "pocketsphinx".to_string(),
            tts_engine: "flite".to_string(),
            tts_voice: "slt".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            auth: AuthConfig::default(),
            http: HttpConfig::default(),
            call: CallConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    pub fn schedule_grace(&self) -> Duration {
        Duration::from_secs(self.schedule_grace_secs)
    }

    pub fn conference_join_window(&self) -> Duration {
        Duration::from_secs(self.conference_join_window_secs)
    }
}

impl AuthConfig {
    pub fn signature_header(&self) -> String {
        format!("X-{}-SIGNATURE", self.header_prefix.to_uppercase())
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for url in [&self.call.default_answer_url, &self.call.default_hangup_url]
            .into_iter()
            .flatten()
        {
            let parsed = url::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("invalid callback url {}: {}", url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("callback url must be http(s): {}", url);
            }
        }
        match self.http.default_method.as_str() {
            "GET" | "POST" => {}
            other => anyhow::bail!("unsupported http.default_method {}", other),
        }
        if self.call.max_loop == 0 {
            anyhow::bail!("call.max_loop must be positive");
        }
        Ok(())
    }
}
