use crate::auth::AuthSession;
use crate::error::{ApiError, RefreshError};
use crate::refresh::{RefreshCoordinator, TokenRefresher};
use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh";

/// A replayable outbound request. Bodies are JSON values so the request can
/// be sent a second time after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Login and refresh calls must never trigger a refresh themselves.
    pub fn is_auth_handshake(&self) -> bool {
        let path = format!("/{}", self.path.trim_start_matches('/'));
        path.contains(LOGIN_PATH) || path.contains(REFRESH_PATH)
    }
}

pub(crate) fn endpoint(base_url: &Url, path: &str) -> Result<Url, ApiError> {
    base_url
        .join(path.trim_start_matches('/'))
        .map_err(|err| ApiError::InvalidUrl(format!("{path}: {err}")))
}

/// Sends requests with the session's bearer token and recovers from an
/// expired token with one refresh-and-replay.
#[derive(Clone)]
pub struct RequestGateway {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    session: AuthSession,
    refresh: RefreshCoordinator,
}

impl RequestGateway {
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        timeout: Duration,
        refresh: RefreshCoordinator,
    ) -> Self {
        Self {
            http,
            base_url,
            timeout,
            session: refresh.session().clone(),
            refresh,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Dispatch `request`. Responses other than a recoverable 401 come back
    /// untouched, whatever their status.
    pub async fn send(&self, mut request: ApiRequest) -> Result<Response, ApiError> {
        let request_id = Uuid::new_v4();
        let token = self.session.token();
        let response = self.dispatch(&request, token.as_deref(), request_id).await?;

        if response.status() != StatusCode::UNAUTHORIZED
            || request.retried
            || request.is_auth_handshake()
        {
            return Ok(response);
        }

        request.retried = true;
        let token = match self.session.token() {
            // Another refresh or a login already replaced the token this
            // request was sent with.
            Some(current) if token.as_deref() != Some(current.as_str()) => {
                debug!(%request_id, "token changed while request was in flight");
                current
            }
            // Logged out while the request was in flight.
            None if token.is_some() => return Err(RefreshError::SessionEnded.into()),
            _ => {
                info!(%request_id, path = %request.path, "authorization expired, refreshing session");
                self.refresh.request_refresh().await?
            }
        };
        debug!(%request_id, "replaying request with refreshed token");
        self.dispatch(&request, Some(&token), request_id).await
    }

    /// Send and decode a JSON body, mapping non-success statuses to errors.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        decode_json(response).await
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
        request_id: Uuid,
    ) -> Result<Response, ApiError> {
        let url = endpoint(&self.base_url, &request.path)?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .timeout(self.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        debug!(
            %request_id,
            method = %request.method,
            path = %request.path,
            status = response.status().as_u16(),
            retried = request.retried,
            "request completed"
        );
        Ok(response)
    }
}

pub async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::AuthExpired);
    }
    if !status.is_success() {
        let body = read_body(response).await;
        return Err(ApiError::Status { status, body });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode(err.to_string()))
}

/// Body text of an error response. A body that cannot be read comes back
/// empty.
pub(crate) async fn read_body(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => body,
        Err(err) => {
            debug!(%status, %err, "failed to read response body");
            String::new()
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub token: String,
}

/// `POST /auth/refresh`, authenticated by the cookie the login response set
/// on the shared client.
pub struct HttpTokenRefresher {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpTokenRefresher {
    pub fn new(http: reqwest::Client, base_url: &Url, timeout: Duration) -> Result<Self, ApiError> {
        Ok(Self {
            http,
            url: endpoint(base_url, REFRESH_PATH)?,
            timeout,
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self) -> Result<String, RefreshError> {
        let response = self
            .http
            .post(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| RefreshError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| RefreshError::MalformedResponse(err.to_string()))?;
        Ok(body.token)
    }
}
