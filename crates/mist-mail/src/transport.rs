use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use native_tls::{TlsConnector, TlsStream};
use tracing::debug;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// Plain username and password.
    Login,
    /// SASL XOAUTH2 with a bearer access token.
    XOAuth2,
}

/// Where and how to reach a mailbox. Encryption is always implicit TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub mechanism: AuthMechanism,
}

/// A username plus either a password or an access token, per mechanism.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An authenticated mailbox session.
pub trait MailTransport: Send {
    /// Opens `name` read-only and returns its message count.
    fn open_folder(&mut self, name: &str) -> Result<u32>;
    /// Raw RFC 822 bytes of the message at 1-based sequence number `seq`.
    fn fetch(&mut self, seq: u32) -> Result<Vec<u8>>;
    fn close_folder(&mut self) -> Result<()>;
    fn logout(&mut self) -> Result<()>;
}

pub trait Connector: Send + Sync {
    fn connect(
        &self,
        config: &TransportConfig,
        credentials: &Credentials,
    ) -> Result<Box<dyn MailTransport>>;
}

/// Implicit-TLS IMAP. Every socket operation is bounded by `io_timeout`
/// so a stalled server cannot hold a worker thread forever.
#[derive(Debug, Clone, Copy)]
pub struct ImapConnector {
    io_timeout: Duration,
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl ImapConnector {
    pub fn with_io_timeout(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    fn open_stream(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let mut last_err = None;
        let mut tcp = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.io_timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let tcp = match (tcp, last_err) {
            (Some(tcp), _) => tcp,
            (None, Some(err)) => return Err(err).with_context(|| format!("connecting to {}:{}", host, port)),
            (None, None) => return Err(anyhow!("{} did not resolve to an address", host)),
        };
        tcp.set_read_timeout(Some(self.io_timeout))?;
        tcp.set_write_timeout(Some(self.io_timeout))?;
        debug!("imap tcp connected");
        TlsConnector::new()?
            .connect(host, tcp)
            .map_err(|err| anyhow!("TLS handshake with {} failed: {}", host, err))
    }
}

impl Connector for ImapConnector {
    fn connect(
        &self,
        config: &TransportConfig,
        credentials: &Credentials,
    ) -> Result<Box<dyn MailTransport>> {
        debug!(host = %config.host, port = config.port, "imap connect start");
        let tls = self.open_stream(&config.host, config.port)?;
        let mut client = imap::Client::new(tls);
        client.read_greeting()?;
        let session = match config.mechanism {
            AuthMechanism::Login => client
                .login(&credentials.username, &credentials.secret)
                .map_err(|e| e.0)?,
            AuthMechanism::XOAuth2 => {
                let auth = XOAuth2 {
                    user: credentials.username.clone(),
                    access_token: credentials.secret.clone(),
                };
                client.authenticate("XOAUTH2", &auth).map_err(|e| e.0)?
            }
        };
        debug!(mechanism = ?config.mechanism, "imap login ok");
        Ok(Box::new(ImapTransport { session }))
    }
}

struct XOAuth2 {
    user: String,
    access_token: String,
}

impl imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

struct ImapTransport {
    session: imap::Session<TlsStream<TcpStream>>,
}

impl MailTransport for ImapTransport {
    fn open_folder(&mut self, name: &str) -> Result<u32> {
        let mailbox = self.session.examine(name)?;
        debug!(folder = name, exists = mailbox.exists, "imap examine");
        Ok(mailbox.exists)
    }

    fn fetch(&mut self, seq: u32) -> Result<Vec<u8>> {
        let fetches = self.session.fetch(seq.to_string(), "RFC822")?;
        fetches
            .iter()
            .find_map(|f| f.body().map(|b| b.to_vec()))
            .ok_or_else(|| anyhow!("No body found for message {}", seq))
    }

    fn close_folder(&mut self) -> Result<()> {
        self.session.close()?;
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout()?;
        Ok(())
    }
}
