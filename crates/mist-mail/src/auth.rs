use mist_core::SourceError;

use crate::credentials::CredentialStore;
use crate::oauth::{ClientSecrets, HttpTokenExchange, OAuthClient, OAuthError, SystemBrowser};
use crate::source::SourceConfig;
use crate::transport::{AuthMechanism, Credentials};

pub const GMAIL_IMAP_HOST: &str = "imap.gmail.com";

/// The authentication step of a mail source; everything else is shared.
pub trait SourceAuth: Send {
    fn mechanism(&self) -> AuthMechanism;

    /// Host used when the source configuration names none.
    fn default_host(&self) -> Option<&'static str> {
        None
    }

    fn authenticate(&self, config: &SourceConfig) -> Result<Credentials, SourceError>;
}

/// Username and password from the source configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct PasswordAuth;

impl SourceAuth for PasswordAuth {
    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::Login
    }

    fn authenticate(&self, config: &SourceConfig) -> Result<Credentials, SourceError> {
        let password = config
            .password
            .clone()
            .ok_or_else(|| SourceError::Connection {
                source_id: config.id,
                reason: "no password configured".to_string(),
            })?;
        Ok(Credentials {
            username: config.username.clone(),
            secret: password,
        })
    }
}

/// Bearer access token obtained through OAuth2, for Gmail-style accounts.
pub struct OAuth2Auth {
    client: OAuthClient,
}

impl OAuth2Auth {
    pub fn new(client: OAuthClient) -> Self {
        Self { client }
    }

    /// Real token endpoint and the system browser.
    pub fn with_store(store: CredentialStore) -> Self {
        Self::new(OAuthClient::new(
            store,
            Box::new(HttpTokenExchange),
            Box::new(SystemBrowser),
        ))
    }
}

impl SourceAuth for OAuth2Auth {
    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::XOAuth2
    }

    fn default_host(&self) -> Option<&'static str> {
        Some(GMAIL_IMAP_HOST)
    }

    fn authenticate(&self, config: &SourceConfig) -> Result<Credentials, SourceError> {
        let token_error = |reason: String| SourceError::Token {
            source_id: config.id,
            reason,
        };
        let path = config
            .client_secrets
            .as_deref()
            .ok_or_else(|| token_error("no client_secrets file configured".to_string()))?;
        let access_token = ClientSecrets::load(path)
            .and_then(|secrets| self.client.access_token(&secrets, &config.username))
            .map_err(|err: OAuthError| token_error(err.to_string()))?;
        Ok(Credentials {
            username: config.username.clone(),
            secret: access_token,
        })
    }
}
