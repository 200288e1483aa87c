use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::AuthSettings;
use crate::domain::event::RefreshOutcome;
use crate::error::AuthError;

/// 鉴权身份 / Authenticated identity
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub user_id: String,
    pub device_id: Option<String>,
}

/// 令牌校验与刷新 / Token validation and refresh
///
/// 留作接缝便于测试替换 / A seam so tests can substitute implementations.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// `Ok(None)` 表示令牌无效 / `Ok(None)` means the token is invalid
    async fn validate(&self, token: &str) -> Result<Option<AuthIdentity>, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> RefreshOutcome;
}

/// 开发模式校验器:非空令牌即用户ID / Dev validator: a non-empty token is
/// taken as the user id
pub struct DevTokenValidator;

#[async_trait]
impl TokenValidator for DevTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<AuthIdentity>, AuthError> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(AuthIdentity {
            user_id: token.to_string(),
            device_id: None,
        }))
    }

    async fn refresh(&self, refresh_token: &str) -> RefreshOutcome {
        if refresh_token.is_empty() {
            return RefreshOutcome::Error {
                code: "invalid_refresh_token".to_string(),
                message: "empty refresh token".to_string(),
            };
        }
        RefreshOutcome::Tokens {
            access_token: format!("{}-access", refresh_token),
            refresh_token: format!("{}-next", refresh_token),
            expires_in: 3600,
        }
    }
}

#[derive(Deserialize)]
struct CenterValidateResponse {
    user_id: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct CenterRefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

/// 鉴权中心HTTP校验器 / HTTP validator against the auth center
pub struct HttpTokenValidator {
    center_url: String,
    client: reqwest::Client,
}

impl HttpTokenValidator {
    pub fn new(settings: &AuthSettings) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        Ok(Self {
            center_url: settings.center_url.clone(),
            client,
        })
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, token: &str) -> Result<Option<AuthIdentity>, AuthError> {
        if token.is_empty() {
            return Ok(None);
        }
        let resp = self
            .client
            .get(format!("{}/v1/session/auth", self.center_url))
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: CenterValidateResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        Ok(Some(AuthIdentity {
            user_id: body.user_id,
            device_id: body.device_id,
        }))
    }

    async fn refresh(&self, refresh_token: &str) -> RefreshOutcome {
        let resp = self
            .client
            .post(format!("{}/v1/session/refresh", self.center_url))
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!("⚠️  auth center unreachable for refresh: {}", e);
                return RefreshOutcome::Error {
                    code: "auth_center_unreachable".to_string(),
                    message: e.to_string(),
                };
            }
        };
        if !resp.status().is_success() {
            return RefreshOutcome::Error {
                code: "refresh_rejected".to_string(),
                message: format!("auth center returned {}", resp.status()),
            };
        }
        match resp.json::<CenterRefreshResponse>().await {
            Ok(body) => RefreshOutcome::Tokens {
                access_token: body.access_token,
                refresh_token: body.refresh_token,
                expires_in: body.expires_in,
            },
            Err(e) => RefreshOutcome::Error {
                code: "malformed_response".to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_validator_rejects_empty_token() {
        let v = DevTokenValidator;
        assert!(v.validate("").await.unwrap().is_none());
        let id = v.validate("u42").await.unwrap().unwrap();
        assert_eq!(id.user_id, "u42");
    }

    #[tokio::test]
    async fn dev_validator_refresh_rotates_tokens() {
        let v = DevTokenValidator;
        match v.refresh("rt1").await {
            RefreshOutcome::Tokens { refresh_token, .. } => {
                assert_eq!(refresh_token, "rt1-next")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
