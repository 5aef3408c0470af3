use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;
use webnode_proto::{
    ApiEnvelope, LOGIN_PATH, LoginData, LoginRequest, REFRESH_PATH, REGISTER_PATH, RefreshData,
    RefreshRequest, RegisterRequest, SUCCESS_CODE,
};

use crate::config::{ConfigError, NodeConfig};
use crate::identity::ClientMetadata;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid endpoint path '{path}': {reason}")]
    Endpoint { path: &'static str, reason: String },
}

impl GateError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            GateError::Status { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

/// HTTP client for the task service API. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TaskGateClient {
    client: Client,
    api_base: Url,
    login_timeout: Duration,
    api_timeout: Duration,
}

impl TaskGateClient {
    pub fn new(config: &NodeConfig, metadata: &ClientMetadata) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let agent = HeaderValue::from_str(&metadata.user_agent)
            .map_err(|err| ConfigError::HttpClient(format!("invalid user agent: {err}")))?;
        headers.insert(USER_AGENT, agent);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.login_timeout.max(config.api_timeout))
            .build()
            .map_err(|err| ConfigError::HttpClient(err.to_string()))?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            login_timeout: config.login_timeout,
            api_timeout: config.api_timeout,
        })
    }

    fn url(&self, path: &'static str) -> Result<Url, GateError> {
        self.api_base
            .join(path)
            .map_err(|err| GateError::Endpoint {
                path,
                reason: err.to_string(),
            })
    }

    pub async fn login(
        &self,
        user_id: &str,
        password: &str,
    ) -> Result<ApiEnvelope<LoginData>, GateError> {
        let body = LoginRequest {
            user_id: user_id.to_string(),
            password: password.to_string(),
        };
        let text = self.post(LOGIN_PATH, &body, self.login_timeout, None).await?;
        decode(&text)
    }

    pub async fn refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<ApiEnvelope<RefreshData>, GateError> {
        let body = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        let text = self.post(REFRESH_PATH, &body, self.api_timeout, None).await?;
        decode(&text)
    }

    /// Returns the response envelope when the body is one; plain 2xx bodies yield `None`.
    pub async fn register(
        &self,
        access_token: &str,
        request: &RegisterRequest,
    ) -> Result<Option<ApiEnvelope<serde_json::Value>>, GateError> {
        let text = self
            .post(REGISTER_PATH, request, self.api_timeout, Some(access_token))
            .await?;
        Ok(serde_json::from_str(&text).ok())
    }

    async fn post<B: Serialize>(
        &self,
        path: &'static str,
        body: &B,
        timeout: Duration,
        bearer: Option<&str>,
    ) -> Result<String, GateError> {
        let url = self.url(path)?;
        let mut request = self.client.post(url).json(body).timeout(timeout);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(target: "webnode::gate", path, %status, bytes = text.len(), "api response");

        if !status.is_success() {
            return Err(GateError::Status { status, body: text });
        }
        Ok(text)
    }
}

/// Payloads of rejected envelopes are dropped rather than decoded.
fn decode<T: DeserializeOwned>(text: &str) -> Result<ApiEnvelope<T>, GateError> {
    let raw: ApiEnvelope<serde_json::Value> =
        serde_json::from_str(text).map_err(|err| GateError::Decode(err.to_string()))?;
    let data = match raw.data {
        Some(value) if raw.code == SUCCESS_CODE && !value.is_null() => Some(
            serde_json::from_value(value).map_err(|err| GateError::Decode(err.to_string()))?,
        ),
        _ => None,
    };
    Ok(ApiEnvelope {
        code: raw.code,
        data,
        msg: raw.msg,
    })
}
