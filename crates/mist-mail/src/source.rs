//! Mail source connection state machine.
//!
//! A [`MailSource`] walks Disconnected -> Connecting -> Connected, optionally
//! selects its folder, then hands out messages in folder order. Only the
//! authentication step differs between password and OAuth2 sources.

use std::path::PathBuf;
use std::sync::Arc;

use mist_core::{MessageRecord, SourceError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::{OAuth2Auth, PasswordAuth, SourceAuth};
use crate::credentials::CredentialStore;
use crate::parse;
use crate::transport::{Connector, MailTransport, TransportConfig};

pub const DEFAULT_IMAPS_PORT: u16 = 993;
pub const DEFAULT_FOLDER: &str = "INBOX";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Generic,
    Gmail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub folder: String,
    pub add_existing_history: bool,
    pub client_secrets: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            kind: SourceKind::Generic,
            host: None,
            port: DEFAULT_IMAPS_PORT,
            username: String::new(),
            password: None,
            folder: DEFAULT_FOLDER.to_string(),
            add_existing_history: true,
            client_secrets: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    None,
    Selected,
}

pub struct MailSource {
    config: SourceConfig,
    auth: Box<dyn SourceAuth>,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn MailTransport>>,
    connection: ConnectionState,
    folder: FolderState,
    cursor: u32,
    total: u32,
}

impl MailSource {
    pub fn new(config: SourceConfig, auth: Box<dyn SourceAuth>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            auth,
            connector,
            transport: None,
            connection: ConnectionState::Disconnected,
            folder: FolderState::None,
            cursor: 0,
            total: 0,
        }
    }

    /// Picks the authentication variant from `config.kind`.
    pub fn from_config(
        config: SourceConfig,
        connector: Arc<dyn Connector>,
        credential_store: CredentialStore,
    ) -> Self {
        let auth: Box<dyn SourceAuth> = match config.kind {
            SourceKind::Generic => Box::new(PasswordAuth),
            SourceKind::Gmail => Box::new(OAuth2Auth::with_store(credential_store)),
        };
        Self::new(config, auth, connector)
    }

    pub fn id(&self) -> i64 {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection
    }

    pub fn folder_state(&self) -> FolderState {
        self.folder
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn transport_config(&self) -> Result<TransportConfig, SourceError> {
        let host = self
            .config
            .host
            .clone()
            .filter(|host| !host.trim().is_empty())
            .or_else(|| self.auth.default_host().map(str::to_string))
            .ok_or_else(|| SourceError::Connection {
                source_id: self.config.id,
                reason: "no host configured".to_string(),
            })?;
        Ok(TransportConfig {
            host,
            port: self.config.port,
            mechanism: self.auth.mechanism(),
        })
    }

    /// Opens the session and, when `select_folder` is set, the folder.
    ///
    /// On failure the source is left Disconnected with nothing held open.
    pub fn connect(&mut self, select_folder: bool) -> Result<(), SourceError> {
        self.disconnect();
        self.connection = ConnectionState::Connecting;
        match self.open_session() {
            Ok(transport) => {
                self.transport = Some(transport);
                self.connection = ConnectionState::Connected;
            }
            Err(err) => {
                self.connection = ConnectionState::Disconnected;
                return Err(err);
            }
        }
        info!(source_id = self.config.id, source = %self.config.name, "Mail source connected");

        if select_folder {
            if let Err(err) = self.select_folder() {
                self.disconnect();
                return Err(err);
            }
        }
        Ok(())
    }

    fn open_session(&self) -> Result<Box<dyn MailTransport>, SourceError> {
        let transport_config = self.transport_config()?;
        let credentials = self.auth.authenticate(&self.config)?;
        self.connector
            .connect(&transport_config, &credentials)
            .map_err(|err| SourceError::Connection {
                source_id: self.config.id,
                reason: format!("{:#}", err),
            })
    }

    fn select_folder(&mut self) -> Result<(), SourceError> {
        let source_id = self.config.id;
        let transport = self.transport.as_mut().ok_or_else(|| SourceError::NotReady {
            source_id,
            reason: "not connected".to_string(),
        })?;
        let total = transport
            .open_folder(&self.config.folder)
            .map_err(|err| SourceError::Folder {
                source_id,
                folder: self.config.folder.clone(),
                reason: format!("{:#}", err),
            })?;
        self.folder = FolderState::Selected;
        self.cursor = 0;
        self.total = total;
        info!(source_id, folder = %self.config.folder, total, "Folder selected");
        Ok(())
    }

    /// Closes the folder and the session. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if self.folder == FolderState::Selected {
                if let Err(err) = transport.close_folder() {
                    debug!(source_id = self.config.id, "folder close failed: {:#}", err);
                }
            }
            if let Err(err) = transport.logout() {
                debug!(source_id = self.config.id, "logout failed: {:#}", err);
            }
            info!(source_id = self.config.id, "Mail source disconnected");
        }
        self.connection = ConnectionState::Disconnected;
        self.folder = FolderState::None;
        self.cursor = 0;
        self.total = 0;
    }

    /// The next message in folder order, or `None` once all are read.
    pub fn next_message(&mut self) -> Result<Option<MessageRecord>, SourceError> {
        let source_id = self.config.id;
        let transport = match (&mut self.transport, self.connection, self.folder) {
            (Some(transport), ConnectionState::Connected, FolderState::Selected) => transport,
            _ => {
                return Err(SourceError::NotReady {
                    source_id,
                    reason: "no folder selected".to_string(),
                });
            }
        };
        if self.cursor >= self.total {
            return Ok(None);
        }
        let position = self.cursor + 1;
        let raw = transport.fetch(position).map_err(|err| SourceError::Fetch {
            source_id,
            position,
            reason: format!("{:#}", err),
        })?;
        self.cursor = position;
        debug!(source_id, position, bytes = raw.len(), "message fetched");
        parse::message_record(&raw, &self.config, position).map(Some)
    }
}

impl Drop for MailSource {
    fn drop(&mut self) {
        self.disconnect();
    }
}
