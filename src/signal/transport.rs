use super::signature;
use crate::config::Config;
use crate::error::FlowError;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A form-encoded webhook call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub params: BTreeMap<String, String>,
}

impl WebhookRequest {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Outbound HTTP used for call-flow documents and callbacks.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Perform the request and return the response body.
    async fn fetch(&self, request: &WebhookRequest) -> Result<String>;

    /// Perform the request, discarding the body.
    async fn notify(&self, request: &WebhookRequest) -> Result<()> {
        self.fetch(request).await.map(|_| ())
    }
}

/// `reqwest`-backed transport that signs every request.
pub struct HttpTransport {
    client: Client,
    signature_header: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.http.timeout_secs));
        builder = match config.http.user_agent {
            Some(ref ua) => {
                builder.user_agent(format!("{} {}", ua, crate::version::get_short_version()))
            }
            None => builder.user_agent(crate::version::get_useragent()),
        };
        let auth_token = match (&config.auth.account_sid, &config.auth.auth_token) {
            (Some(_), Some(token)) => Some(token.clone()),
            _ => None,
        };
        Ok(Self {
            client: builder.build()?,
            signature_header: config.auth.signature_header(),
            auth_token,
        })
    }

    pub fn signature(&self, request: &WebhookRequest) -> String {
        signature::sign(
            self.auth_token.as_deref(),
            &request.url,
            request
                .params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn fetch(&self, request: &WebhookRequest) -> Result<String> {
        let start_time = Instant::now();
        let signature = self.signature(request);
        let builder = match request.method.to_uppercase().as_str() {
            "GET" => self.client.get(&request.url).query(&request.params),
            _ => self.client.post(&request.url).form(&request.params),
        };
        let response = builder
            .header(self.signature_header.as_str(), signature)
            .send()
            .await
            .map_err(|e| FlowError::Transport(format!("{} {}: {}", request.method, request.url, e)))?;

        let status = response.status();
        info!(
            url = %request.url,
            method = %request.method,
            elapsed = start_time.elapsed().as_millis(),
            status = ?status,
            "webhook"
        );
        if !status.is_success() {
            return Err(FlowError::Transport(format!(
                "{} {} returned {}",
                request.method, request.url, status
            ))
            .into());
        }
        let body = response
            .text()
            .await
            .map_err(|e| FlowError::Transport(e.to_string()))?;
        debug!(url = %request.url, len = body.len(), "webhook response");
        Ok(body)
    }
}
