use anyhow::Context;
use drivesync_core::{DriveClient, OAuthClient};
use tracing::{info, warn};

use crate::auth::{OAuthState, TokenError, TokenFile, TokenProvider};
use crate::config::SyncConfig;
use crate::sync::engine::{SyncEngine, SyncOptions, SyncReport};
use crate::sync::gateway::{DriveGateway, RemoteGateway};
use crate::sync::scanner::scan;
use crate::sync::state::{MemoryStateStore, SqliteStateStore};
use crate::sync::verify::{Verifier, VerifyReport};

const REMOTE_ROOT_ID: &str = "root";
const TEST_FOLDER_NAME: &str = "DriveSync Test Folder";
const TEST_LISTING_LIMIT: usize = 5;

/// Runs the command-line actions against one loaded configuration.
pub struct App {
    config: SyncConfig,
}

impl App {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Exchanges the configured refresh token for an access token and saves both.
    pub async fn authenticate(&self) -> anyhow::Result<()> {
        let token_file = TokenFile::new(&self.config.token_file);
        let state = match &self.config.refresh_token {
            Some(refresh_token) => OAuthState::from_refresh_token(refresh_token.clone()),
            None => token_file
                .load()?
                .context("no refresh token: set DRIVESYNC_REFRESH_TOKEN")?,
        };
        let mut provider =
            TokenProvider::new(state, Some(self.oauth_client()?)).with_store(token_file.clone());
        provider
            .refresh_now()
            .await
            .context("failed to refresh access token")?;
        info!(token_file = %token_file.path().display(), "authenticated, token saved");
        Ok(())
    }

    /// Logs every entry under the source folder and returns how many there were.
    pub fn list_local(&self) -> anyhow::Result<usize> {
        let source = self.config.require_source_folder()?;
        let mut count = 0;
        for entry in scan(source)? {
            info!(
                kind = entry.kind.as_str(),
                path = %entry.relative_path,
                size = entry.size,
                "local entry"
            );
            count += 1;
        }
        if count == 0 {
            info!(source = %source.display(), "no items found");
        } else {
            info!(source = %source.display(), count, "local listing finished");
        }
        Ok(count)
    }

    /// Creates (or finds) a scratch folder and lists the remote root.
    pub async fn test_remote_ops(&self) -> anyhow::Result<()> {
        let gateway = self.gateway().await?;
        let folder_id = gateway
            .find_or_create_folder(REMOTE_ROOT_ID, TEST_FOLDER_NAME)
            .await?;
        info!(name = TEST_FOLDER_NAME, folder_id = %folder_id, "test folder ready");

        let children = gateway.list_children(REMOTE_ROOT_ID).await?;
        info!(count = children.len(), "remote root listed");
        for child in children.values().take(TEST_LISTING_LIMIT) {
            info!(name = %child.name, id = %child.id, kind = child.kind.as_str(), "remote child");
        }
        Ok(())
    }

    pub async fn sync(&self, dry_run: bool) -> anyhow::Result<SyncReport> {
        let source = self.config.require_source_folder()?.to_path_buf();
        let gateway = self.gateway().await?;
        let options = SyncOptions {
            source_root: source,
            target_folder_id: self.config.target_folder_id.clone(),
            dry_run,
        };

        let report = if dry_run && !self.config.state_db.exists() {
            // nothing recorded yet, and a dry run must not create the database
            let state = MemoryStateStore::new();
            SyncEngine::new(&gateway, &state, options).run().await?
        } else {
            let state = self.open_state().await?;
            let report = SyncEngine::new(&gateway, &state, options).run().await;
            state.close().await;
            report?
        };

        info!("{report}");
        if report.failed() > 0 {
            warn!(failed = report.failed(), "some entries were not synced");
        }
        Ok(report)
    }

    pub async fn verify(&self) -> anyhow::Result<VerifyReport> {
        let source = self.config.require_source_folder()?.to_path_buf();
        let gateway = self.gateway().await?;
        let report = if !self.config.state_db.exists() {
            // nothing was ever synced; verifying must not leave a database behind
            let state = MemoryStateStore::new();
            Verifier::new(&gateway, &state, source).run().await?
        } else {
            let state = self.open_state().await?;
            let report = Verifier::new(&gateway, &state, source).run().await;
            state.close().await;
            report?
        };
        Ok(report)
    }

    fn oauth_client(&self) -> Result<OAuthClient, TokenError> {
        let (Some(client_id), Some(client_secret)) =
            (&self.config.client_id, &self.config.client_secret)
        else {
            return Err(TokenError::MissingOAuthClient);
        };
        Ok(OAuthClient::with_base_url(
            &self.config.oauth_base_url,
            client_id.clone(),
            client_secret.clone(),
        )?)
    }

    async fn access_token(&self) -> Result<String, TokenError> {
        if let Some(token) = &self.config.access_token {
            return Ok(token.clone());
        }
        let token_file = TokenFile::new(&self.config.token_file);
        let state = token_file.load()?.ok_or(TokenError::NoCredentials)?;
        let mut provider =
            TokenProvider::new(state, self.oauth_client().ok()).with_store(token_file);
        provider.valid_access_token().await
    }

    async fn gateway(&self) -> anyhow::Result<DriveGateway> {
        let token = self
            .access_token()
            .await
            .context("failed to obtain an access token")?;
        let client = DriveClient::with_base_url(&self.config.api_base_url, token)
            .context("failed to build API client")?;
        Ok(DriveGateway::new(
            client,
            self.config.retry,
            self.config.upload_chunk_bytes,
        ))
    }

    async fn open_state(&self) -> anyhow::Result<SqliteStateStore> {
        SqliteStateStore::open(&self.config.state_db)
            .await
            .with_context(|| format!("failed to open state database {:?}", self.config.state_db))
    }
}
