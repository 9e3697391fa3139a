use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use drivesync_core::{OAuthClient, OAuthToken};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("oauth client id and secret are required to refresh the access token")]
    MissingOAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("no credentials: set DRIVESYNC_ACCESS_TOKEN or run --authenticate")]
    NoCredentials,
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] drivesync_core::OAuthError),
    #[error("token file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("token file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl OAuthState {
    pub fn from_oauth_token(token: &OAuthToken) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now_unix().saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))),
            scope: token.scope.clone(),
            token_type: Some(token.token_type.clone()),
        }
    }

    /// State that only knows a refresh token and must be refreshed before use.
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: Some(refresh_token.into()),
            expires_at: Some(0),
            scope: None,
            token_type: None,
        }
    }
}

/// JSON file holding the persisted [`OAuthState`].
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<OAuthState>, TokenError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, state: &OAuthState) -> Result<(), TokenError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        // mode() only applies on creation; tighten files written by older versions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents.as_bytes())?;
        debug!(path = %self.path.display(), "token file saved");
        Ok(())
    }
}

pub struct TokenProvider {
    state: OAuthState,
    oauth_client: Option<OAuthClient>,
    store: Option<TokenFile>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(state: OAuthState, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state,
            oauth_client,
            store: None,
            refresh_skew_secs: 60,
        }
    }

    /// Persists every refreshed state to `store`.
    pub fn with_store(mut self, store: TokenFile) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn valid_access_token(&mut self) -> Result<String, TokenError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        Ok(self.state.access_token.clone())
    }

    pub fn state(&self) -> &OAuthState {
        &self.state
    }

    pub async fn refresh_now(&mut self) -> Result<String, TokenError> {
        self.refresh().await?;
        Ok(self.state.access_token.clone())
    }

    fn should_refresh(&self) -> bool {
        if self.state.access_token.is_empty() {
            return true;
        }
        let Some(expires_at) = self.state.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&mut self) -> Result<(), TokenError> {
        let refresh_token = self
            .state
            .refresh_token
            .clone()
            .ok_or(TokenError::MissingRefreshToken)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(TokenError::MissingOAuthClient)?;
        let token = client.refresh_token(&refresh_token).await?;
        let mut refreshed = OAuthState::from_oauth_token(&token);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        if refreshed.scope.is_none() {
            refreshed.scope = self.state.scope.clone();
        }
        self.state = refreshed;
        info!(expires_at = ?self.state.expires_at, "access token refreshed");
        if let Some(store) = &self.store {
            store.save(&self.state)?;
        }
        Ok(())
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state(expires_at: Option<i64>, refresh_token: Option<&str>) -> OAuthState {
        OAuthState {
            access_token: "old-token".into(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at,
            scope: Some("https://www.googleapis.com/auth/drive.file".into()),
            token_type: Some("Bearer".into()),
        }
    }

    #[tokio::test]
    async fn returns_current_token_when_not_expired() {
        let mut provider = TokenProvider::new(state(Some(i64::MAX), Some("refresh-1")), None);

        let token = provider.valid_access_token().await.unwrap();

        assert_eq!(token, "old-token");
    }

    #[tokio::test]
    async fn refreshes_and_persists_expired_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-token",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().unwrap();
        let token_file = TokenFile::new(dir.path().join("auth").join("token.json"));
        let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
        let mut provider =
            TokenProvider::new(state(Some(0), Some("refresh-1")), Some(client))
                .with_store(token_file.clone());

        let token = provider.valid_access_token().await.unwrap();

        assert_eq!(token, "new-token");
        let saved = token_file.load().unwrap().unwrap();
        assert_eq!(saved.access_token, "new-token");
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-1"));
        assert!(saved.expires_at.unwrap() > now_unix());
        assert_eq!(saved.scope, provider.state().scope);
    }

    #[tokio::test]
    async fn refresh_only_state_is_refreshed_before_use() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
        let mut provider =
            TokenProvider::new(OAuthState::from_refresh_token("refresh-1"), Some(client));

        assert_eq!(provider.valid_access_token().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn expired_without_refresh_token_fails() {
        let mut provider = TokenProvider::new(state(Some(0), None), None);

        let err = provider.valid_access_token().await.unwrap_err();

        assert!(matches!(err, TokenError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn expired_without_oauth_client_fails() {
        let mut provider = TokenProvider::new(state(Some(0), Some("refresh-1")), None);

        let err = provider.valid_access_token().await.unwrap_err();

        assert!(matches!(err, TokenError::MissingOAuthClient));
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_private_to_owner() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let file = TokenFile::new(&path);

        file.save(&state(Some(10), Some("refresh-1"))).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(file.load().unwrap().unwrap().access_token, "old-token");
    }

    #[test]
    fn missing_token_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("token.json"));

        assert_eq!(file.load().unwrap(), None);
    }

    #[test]
    fn corrupt_token_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            TokenFile::new(path).load(),
            Err(TokenError::Json(_))
        ));
    }
}
