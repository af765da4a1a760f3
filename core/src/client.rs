use crate::auth::{AuthSession, UserIdentity};
use crate::config::ClientSettings;
use crate::error::ApiError;
use crate::gateway::{
    decode_json, read_body, ApiRequest, HttpTokenRefresher, RequestGateway, TokenResponse,
    LOGIN_PATH,
};
use crate::refresh::RefreshCoordinator;
use crate::stats::{SystemInfo, SystemStats};
use crate::stream::{HttpStreamConnector, StreamOptions, StreamingClient, TokioClock};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub const LOGOUT_PATH: &str = "/auth/logout";
pub const ME_PATH: &str = "/auth/me";

/// Entry point for talking to the management API: one session, one refresh
/// coordinator and one gateway sharing a cookie-aware HTTP client.
#[derive(Clone)]
pub struct ApiClient {
    settings: ClientSettings,
    http: reqwest::Client,
    session: AuthSession,
    refresh: RefreshCoordinator,
    gateway: RequestGateway,
}

impl ApiClient {
    pub fn new(settings: ClientSettings) -> Result<Self, ApiError> {
        // The refresh endpoint authenticates with the cookie set at login.
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        let session = AuthSession::new();
        let refresher = HttpTokenRefresher::new(
            http.clone(),
            &settings.base_url,
            settings.request_timeout,
        )?;
        let refresh = RefreshCoordinator::new(session.clone(), Arc::new(refresher));
        let gateway = RequestGateway::new(
            http.clone(),
            settings.base_url.clone(),
            settings.request_timeout,
            refresh.clone(),
        );
        Ok(Self {
            settings,
            http,
            session,
            refresh,
            gateway,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    /// Exchange credentials for a token, then load the user it belongs to.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserIdentity, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH).json(json!({
            "username": username,
            "password": password,
        }));
        let response = self.gateway.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await;
            warn!(%status, "login rejected");
            return Err(ApiError::LoginFailed(login_failure_message(status, &body)));
        }
        let TokenResponse { token } = response
            .json()
            .await
            .map_err(|err| ApiError::LoginFailed(format!("malformed login response: {err}")))?;
        self.session.set_token(token);

        let user = self.fetch_user().await.inspect_err(|_| self.session.clear())?;
        info!(username = %user.username, "logged in");
        Ok(user)
    }

    /// Tell the server to end the session, then forget it locally no matter
    /// what the server said.
    pub async fn logout(&self) {
        if self.session.is_authenticated() {
            match self.gateway.send(ApiRequest::post(LOGOUT_PATH)).await {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = %response.status(), "server-side logout failed");
                }
                Err(err) => warn!(%err, "server-side logout failed"),
                Ok(_) => {}
            }
        }
        self.session.clear();
        info!("logged out");
    }

    /// Silent session restore at startup. Returns whether a session exists
    /// afterwards.
    pub async fn initialize(&self) -> bool {
        if !self.session.initialize(&self.refresh).await {
            return false;
        }
        if self.session.user().is_none() {
            if let Err(err) = self.fetch_user().await {
                warn!(%err, "restored session has no usable identity");
                self.session.clear();
                return false;
            }
        }
        true
    }

    pub async fn fetch_user(&self) -> Result<UserIdentity, ApiError> {
        let user: UserIdentity = self.gateway.send_json(ApiRequest::get(ME_PATH)).await?;
        self.session.set_user(user.clone());
        Ok(user)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.gateway.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.gateway
            .send_json(ApiRequest::post(path).json(body))
            .await
    }

    /// Send an arbitrary request and decode its JSON body.
    pub async fn send(&self, request: ApiRequest) -> Result<Value, ApiError> {
        let response = self.gateway.send(request).await?;
        decode_json(response).await
    }

    pub async fn system_info(&self) -> Result<SystemInfo, ApiError> {
        self.get_json("/system/info").await
    }

    pub async fn system_stats(&self) -> Result<SystemStats, ApiError> {
        self.get_json("/system/stats").await
    }

    /// Build a subscriber for the live stats channel. Not started.
    pub fn stats_stream(&self) -> Result<StreamingClient, ApiError> {
        let connector =
            HttpStreamConnector::new(self.http.clone(), &self.settings.base_url, self.session.clone())?;
        Ok(StreamingClient::new(
            Arc::new(connector),
            Arc::new(TokioClock),
            StreamOptions::from(&self.settings),
        ))
    }
}

fn login_failure_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("server answered {status}"))
}
