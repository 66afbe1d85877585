pub mod auth;
pub mod credentials;
pub mod oauth;
pub mod parse;
pub mod source;
pub mod transport;

pub use auth::{OAuth2Auth, PasswordAuth, SourceAuth};
pub use credentials::{CredentialStore, StoredToken};
pub use oauth::{OAuthClient, OAuthError};
pub use source::{ConnectionState, FolderState, MailSource, SourceConfig, SourceKind};
pub use transport::{AuthMechanism, Connector, Credentials, ImapConnector, MailTransport, TransportConfig};
