// Authentication backend calls (token refresh and password login)

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

use super::types::{
    LoginGrant, LoginRequest, LoginResponse, RefreshRequest, RefreshResponse, TokenGrant,
};
use crate::error::AuthError;

/// Authentication backend seam
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange a refresh token for a new access token
    async fn refresh(&self, refresh_token: &str) -> crate::error::Result<TokenGrant>;

    /// Exchange user credentials for a fresh credential pair
    async fn login(&self, email: &str, password: &str) -> crate::error::Result<LoginGrant>;
}

/// HTTP authentication backend
pub struct HttpAuthBackend {
    client: Client,
    refresh_url: Url,
    login_url: Url,
}

impl HttpAuthBackend {
    pub fn new(refresh_url: Url, login_url: Url, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, refresh_url, login_url))
    }

    pub fn with_client(client: Client, refresh_url: Url, login_url: Url) -> Self {
        Self {
            client,
            refresh_url,
            login_url,
        }
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn refresh(&self, refresh_token: &str) -> crate::error::Result<TokenGrant> {
        tracing::info!("Refreshing access token...");

        let response = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, url = %self.refresh_url, "Failed to send refresh request");
                AuthError::RefreshFailed(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %error_text, "Token refresh rejected");

            // DRF-style {"detail": ..., "code": ...} bodies carry the reason
            if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(&error_text) {
                if let Some(detail) = error_json.get("detail").and_then(|v| v.as_str()) {
                    tracing::debug!(
                        detail = detail,
                        code = error_json.get("code").and_then(|v| v.as_str()).unwrap_or(""),
                        "Refresh rejection details"
                    );
                }
            }

            return Err(AuthError::RefreshRejected(format!(
                "{} - {}",
                status, error_text
            )));
        }

        let data: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("invalid refresh response: {}", e)))?;

        if data.access.is_empty() {
            return Err(AuthError::RefreshRejected(
                "refresh response does not contain an access token".to_string(),
            ));
        }

        tracing::info!(
            rotated = data.refresh.is_some(),
            "Access token refreshed"
        );

        Ok(TokenGrant {
            access_token: data.access,
            refresh_token: data.refresh,
        })
    }

    async fn login(&self, email: &str, password: &str) -> crate::error::Result<LoginGrant> {
        tracing::info!(email = email, "Logging in...");

        let response = self
            .client
            .post(self.login_url.clone())
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| AuthError::LoginFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %error_text, "Login rejected");
            return Err(AuthError::LoginFailed(format!("{} - {}", status, error_text)));
        }

        let data: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::LoginFailed(format!("invalid login response: {}", e)))?;

        Ok(LoginGrant {
            access_token: data.access,
            refresh_token: data.refresh,
            identity: data.user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(server: &mockito::ServerGuard) -> HttpAuthBackend {
        let base = Url::parse(&server.url()).unwrap();
        HttpAuthBackend::new(
            base.join("/api/token/refresh/").unwrap(),
            base.join("/user/login/").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/token/refresh/")
            .match_body(mockito::Matcher::Json(serde_json::json!({"refresh": "R1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access": "A2"}"#)
            .expect(1)
            .create_async()
            .await;

        let grant = backend(&server).refresh("R1").await.unwrap();
        assert_eq!(grant.access_token, "A2");
        assert!(grant.refresh_token.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_with_rotation() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token/refresh/")
            .with_status(200)
            .with_body(r#"{"access": "A2", "refresh": "R2"}"#)
            .create_async()
            .await;

        let grant = backend(&server).refresh("R1").await.unwrap();
        assert_eq!(grant.refresh_token.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token/refresh/")
            .with_status(401)
            .with_body(r#"{"detail": "Token is invalid or expired", "code": "token_not_valid"}"#)
            .create_async()
            .await;

        let err = backend(&server).refresh("R1").await.unwrap_err();
        match err {
            AuthError::RefreshRejected(msg) => assert!(msg.contains("401")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_empty_access_token_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token/refresh/")
            .with_status(200)
            .with_body(r#"{"access": ""}"#)
            .create_async()
            .await;

        let err = backend(&server).refresh("R1").await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshRejected(_)));
    }

    #[tokio::test]
    async fn test_refresh_malformed_body_is_a_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token/refresh/")
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let err = backend(&server).refresh("R1").await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
    }

    #[tokio::test]
    async fn test_login() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/user/login/")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "email": "admin@example.com",
                "password": "hunter2"
            })))
            .with_status(200)
            .with_body(
                r#"{"access": "A1", "refresh": "R1", "user": {"role": "admin", "email": "admin@example.com"}}"#,
            )
            .create_async()
            .await;

        let grant = backend(&server)
            .login("admin@example.com", "hunter2")
            .await
            .unwrap();
        assert_eq!(grant.access_token, "A1");
        assert_eq!(grant.refresh_token, "R1");
        assert_eq!(grant.identity.role, "admin");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/user/login/")
            .with_status(400)
            .with_body(r#"{"detail": "Invalid credentials"}"#)
            .create_async()
            .await;

        let err = backend(&server)
            .login("admin@example.com", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::LoginFailed(_)));
    }
}
