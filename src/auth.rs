//! Bearer-token provider. The long-lived refresh token is exchanged for
//! short-lived access tokens on demand; tokens are cached until shortly
//! before expiry and can be invalidated after an unauthorized response.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

/// Refresh this long before the server-reported expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenProvider {
    api_url: String,
    app_key: String,
    app_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(api_url: &str, app_key: &str, app_secret: &str, refresh_token: &str) -> Self {
        TokenProvider {
            api_url: api_url.trim_end_matches('/').to_string(),
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            refresh_token: refresh_token.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// A valid bearer token, refreshed if the cached one is missing or
    /// about to expire. A refresh failure means expired credentials and is
    /// fatal to the current pass only.
    pub async fn bearer_token(&self, http: &reqwest::Client) -> Result<String> {
        {
            let cached = self.cached.lock().await;
            if let Some(c) = cached.as_ref() {
                if c.expires_at - Utc::now() > Duration::seconds(EXPIRY_MARGIN_SECS) {
                    return Ok(c.access_token.clone());
                }
            }
        }

        let fresh = self.refresh(http).await?;
        let token = fresh.access_token.clone();
        *self.cached.lock().await = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token so the next call fetches a fresh one. Used
    /// after an unauthorized response to a request carrying a token that
    /// looked valid.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn refresh(&self, http: &reqwest::Client) -> Result<CachedToken> {
        if self.refresh_token.is_empty() || self.app_key.is_empty() {
            anyhow::bail!("missing credentials: app_key and refresh_token are required");
        }
        let url = format!("{}/oauth2/token", self.api_url);
        let resp = http
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
                ("client_id", self.app_key.as_str()),
                ("client_secret", self.app_secret.as_str()),
            ])
            .send()
            .await
            .context("token refresh request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("token refresh failed: {status} {text}");
        }
        let body = resp
            .json::<TokenResponse>()
            .await
            .context("parse token response")?;

        let ttl = body.expires_in.unwrap_or(4 * 60 * 60);
        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: Utc::now() + Duration::seconds(ttl),
        })
    }
}
