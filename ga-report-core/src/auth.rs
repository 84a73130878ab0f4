//! OAuth token handling for the analytics provider
//!
//! The interactive consent flow happens elsewhere; it yields a credentials
//! file holding a client id/secret and a refresh token. From that we:
//! - verify the credentials with a refresh-token grant and write a token
//!   file (`get-auth-token`)
//! - load the token file before each load, refreshing an expired access
//!   token in place

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Access tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Client credentials produced by the external consent flow.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Overrides the configured token endpoint
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::AuthNotConfigured(format!(
                "cannot read credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::AuthNotConfigured(format!(
                "invalid credentials file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Persisted session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenFile {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_uri: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenFile {
    /// Load a token file; any problem means auth is not configured.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::AuthNotConfigured(format!(
                "cannot read token file {} (run get-auth-token first): {}",
                path.display(),
                e
            ))
        })?;
        let token: TokenFile = serde_json::from_str(&content).map_err(|e| {
            Error::AuthNotConfigured(format!("invalid token file {}: {}", path.display(), e))
        })?;
        if token.access_token.is_empty() && token.refresh_token.is_empty() {
            return Err(Error::AuthNotConfigured(format!(
                "token file {} holds no token",
                path.display()
            )));
        }
        Ok(token)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Whether the access token must be refreshed before use.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) <= now,
            None => false,
        }
    }

    fn apply(&mut self, grant: TokenResponse, now: DateTime<Utc>) {
        self.access_token = grant.access_token;
        self.expires_at = grant.expires_in.map(|secs| now + Duration::seconds(secs));
        if let Some(refresh_token) = grant.refresh_token {
            self.refresh_token = refresh_token;
        }
    }
}

/// Response from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Exchange the refresh token for a fresh access token.
pub async fn refresh(http: &reqwest::Client, token: &mut TokenFile) -> Result<()> {
    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", token.client_id.as_str()),
        ("client_secret", token.client_secret.as_str()),
        ("refresh_token", token.refresh_token.as_str()),
    ];

    let response = http
        .post(&token.token_uri)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Provider {
            status: 0,
            message: format!("token request failed: {}", e),
            transient: true,
        })?;

    let status = response.status();
    if status.is_success() {
        let grant: TokenResponse = response.json().await.map_err(|e| {
            Error::AuthNotConfigured(format!("unexpected token endpoint response: {}", e))
        })?;
        token.apply(grant, Utc::now());
        tracing::info!(expires_at = ?token.expires_at, "Refreshed access token");
        Ok(())
    } else if status.is_server_error() {
        Err(Error::Provider {
            status: status.as_u16(),
            message: "token endpoint unavailable".to_string(),
            transient: true,
        })
    } else {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(Error::AuthNotConfigured(format!(
            "token refresh rejected ({}): {}",
            status, body
        )))
    }
}

/// Verify `credentials_path` with a refresh grant and write `token_path`.
pub fn exchange_credentials(
    credentials_path: &Path,
    token_path: &Path,
    default_token_uri: &str,
    timeout: std::time::Duration,
) -> Result<TokenFile> {
    let credentials = Credentials::load(credentials_path)?;
    let mut token = TokenFile {
        access_token: String::new(),
        refresh_token: credentials.refresh_token,
        client_id: credentials.client_id,
        client_secret: credentials.client_secret,
        token_uri: credentials
            .token_uri
            .unwrap_or_else(|| default_token_uri.to_string()),
        expires_at: None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to create runtime: {}", e)))?;
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

    runtime.block_on(refresh(&http, &mut token))?;
    token.save(token_path)?;
    tracing::info!(path = %token_path.display(), "Wrote token file");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn token(expires_at: Option<DateTime<Utc>>) -> TokenFile {
        TokenFile {
            access_token: "ya29.token".to_string(),
            refresh_token: "1//refresh".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            token_uri: "https://oauth2.example.com/token".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_token_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/token.json");
        let original = token(Some(Utc::now()));

        original.save(&path).unwrap();
        assert_eq!(TokenFile::load(&path).unwrap(), original);
    }

    #[test]
    fn test_missing_token_file_is_auth_not_configured() {
        let dir = TempDir::new().unwrap();
        let err = TokenFile::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::AuthNotConfigured(_)));
    }

    #[test]
    fn test_garbage_token_file_is_auth_not_configured() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.dat");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            TokenFile::load(&path),
            Err(Error::AuthNotConfigured(_))
        ));
    }

    #[test]
    fn test_needs_refresh() {
        let now = Utc::now();
        assert!(!token(None).needs_refresh(now));
        assert!(!token(Some(now + Duration::hours(1))).needs_refresh(now));
        assert!(token(Some(now + Duration::seconds(30))).needs_refresh(now));
        assert!(token(Some(now - Duration::hours(1))).needs_refresh(now));

        let mut empty = token(None);
        empty.access_token.clear();
        assert!(empty.needs_refresh(now));
    }

    #[test]
    fn test_apply_grant_keeps_refresh_token_when_absent() {
        let now = Utc::now();
        let mut t = token(None);
        t.apply(
            TokenResponse {
                access_token: "new".to_string(),
                expires_in: Some(3600),
                refresh_token: None,
            },
            now,
        );
        assert_eq!(t.access_token, "new");
        assert_eq!(t.refresh_token, "1//refresh");
        assert_eq!(t.expires_at, Some(now + Duration::seconds(3600)));
    }

    #[test]
    fn test_credentials_require_refresh_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"client_id": "a", "client_secret": "b"}"#).unwrap();
        assert!(matches!(
            Credentials::load(&path),
            Err(Error::AuthNotConfigured(_))
        ));
    }
}
