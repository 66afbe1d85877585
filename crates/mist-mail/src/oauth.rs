//! OAuth2 authorization-code flow with PKCE and a loopback redirect.
//!
//! Access tokens are cached in the [`CredentialStore`]. A fresh cached token
//! is reused, a stale one is refreshed, and when nothing usable is cached the
//! user is sent through the consent page in their browser.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::RngCore;
use reqwest::Url;
use serde::Deserialize;
use mist_core::CredentialError;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialStore, StoredToken};

pub const GMAIL_SCOPE: &str = "https://mail.google.com/";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);
const CALLBACK_POLL: Duration = Duration::from_millis(50);

const CALLBACK_PAGE: &str = "<html><body><p>Authorization received. \
You can close this window and return to MIST.</p></body></html>";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("client secrets: {0}")]
    Secrets(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("malformed redirect request: {0}")]
    MalformedRedirect(String),

    #[error("state parameter mismatch")]
    StateMismatch,

    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("timed out waiting for the authorization redirect")]
    Timeout,

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// OAuth client registration, read from a Google-style `client_secrets.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self, OAuthError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| OAuthError::Secrets(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&data).map_err(|e| OAuthError::Secrets(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(data: &str) -> Result<Self, OAuthError> {
        let file: ClientSecretsFile =
            serde_json::from_str(data).map_err(|e| OAuthError::Secrets(e.to_string()))?;
        file.installed
            .or(file.web)
            .ok_or_else(|| OAuthError::Secrets("no 'installed' or 'web' client block".to_string()))
    }
}

/// Token endpoint answer, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

pub trait TokenExchange: Send {
    fn exchange_code(
        &self,
        secrets: &ClientSecrets,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, OAuthError>;

    fn refresh(&self, secrets: &ClientSecrets, refresh_token: &str) -> Result<TokenGrant, OAuthError>;
}

/// Token endpoint client over blocking HTTP form posts.
///
/// The HTTP client is built per request because a blocking client must not
/// be created or dropped on an async worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTokenExchange;

impl HttpTokenExchange {
    fn post(&self, secrets: &ClientSecrets, params: &[(&str, &str)]) -> Result<TokenGrant, OAuthError> {
        let mut params: Vec<(&str, &str)> = params.to_vec();
        if let Some(secret) = secrets.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        let response = reqwest::blocking::Client::new()
            .post(&secrets.token_uri)
            .form(&params)
            .send()?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            warn!("Token endpoint returned {}: {}", status, error_text);
            return Err(OAuthError::Endpoint {
                status: status.as_u16(),
                body: error_text,
            });
        }
        Ok(response.json::<TokenGrant>()?)
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange_code(
        &self,
        secrets: &ClientSecrets,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, OAuthError> {
        debug!("Exchanging authorization code for tokens");
        self.post(
            secrets,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", &secrets.client_id),
                ("code_verifier", code_verifier),
            ],
        )
    }

    fn refresh(&self, secrets: &ClientSecrets, refresh_token: &str) -> Result<TokenGrant, OAuthError> {
        debug!("Refreshing access token");
        self.post(
            secrets,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &secrets.client_id),
            ],
        )
    }
}

/// Shows the consent page to the user.
pub trait Browser: Send {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// Loopback listener receiving the authorization redirect.
///
/// Dropping it closes the socket.
pub struct CallbackListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl CallbackListener {
    pub fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Waits for the redirect and returns its authorization code.
    pub fn wait_for_code(&self, expected_state: &str, timeout: Duration) -> Result<String, OAuthError> {
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match self.listener.accept() {
                Ok((stream, _)) => break stream,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(OAuthError::Timeout);
                    }
                    std::thread::sleep(CALLBACK_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        };
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;

        let mut request_line = String::new();
        BufReader::new(&stream).read_line(&mut request_line)?;
        let result = parse_redirect(&request_line, expected_state);
        respond(&mut stream, result.is_ok());
        result
    }
}

fn parse_redirect(request_line: &str, expected_state: &str) -> Result<String, OAuthError> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| OAuthError::MalformedRedirect(request_line.trim().to_string()))?;
    let url = Url::parse(&format!("http://localhost{}", target))
        .map_err(|e| OAuthError::MalformedRedirect(e.to_string()))?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }
    if let Some(error) = error {
        return Err(OAuthError::Denied(error));
    }
    if state.as_deref() != Some(expected_state) {
        return Err(OAuthError::StateMismatch);
    }
    code.ok_or_else(|| OAuthError::MalformedRedirect("no authorization code".to_string()))
}

fn respond(stream: &mut TcpStream, ok: bool) {
    let (status, body) = if ok {
        ("200 OK", CALLBACK_PAGE)
    } else {
        ("400 Bad Request", "<html><body><p>Authorization failed.</p></body></html>")
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if let Err(err) = stream.write_all(response.as_bytes()) {
        debug!("callback response not delivered: {}", err);
    }
}

struct Pkce {
    verifier: String,
    challenge: String,
}

impl Pkce {
    fn new() -> Self {
        let verifier = random_token();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn authorization_url(
    secrets: &ClientSecrets,
    redirect_uri: &str,
    login_hint: &str,
    state: &str,
    challenge: &str,
) -> Result<Url, OAuthError> {
    Url::parse_with_params(
        &secrets.auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", GMAIL_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("login_hint", login_hint),
            ("state", state),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
        ],
    )
    .map_err(|e| OAuthError::InvalidUrl(format!("auth_uri: {}", e)))
}

/// Produces access tokens for one OAuth client registration.
pub struct OAuthClient {
    store: CredentialStore,
    exchange: Box<dyn TokenExchange>,
    browser: Box<dyn Browser>,
    callback_timeout: Duration,
}

impl OAuthClient {
    pub fn new(
        store: CredentialStore,
        exchange: Box<dyn TokenExchange>,
        browser: Box<dyn Browser>,
    ) -> Self {
        Self {
            store,
            exchange,
            browser,
            callback_timeout: CALLBACK_TIMEOUT,
        }
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// A usable access token for `account`, cached, refreshed or newly granted.
    pub fn access_token(&self, secrets: &ClientSecrets, account: &str) -> Result<String, OAuthError> {
        let cached = self.store.load(account)?;
        let token = match cached {
            Some(token) if token.is_fresh() => {
                debug!(account, "using cached access token");
                return Ok(token.access_token);
            }
            Some(StoredToken {
                refresh_token: Some(refresh_token),
                ..
            }) => {
                info!(account, "Refreshing OAuth access token");
                let grant = self.exchange.refresh(secrets, &refresh_token)?;
                stored_token(grant, Some(refresh_token))
            }
            _ => self.authorize(secrets, account)?,
        };
        self.store.save(account, &token)?;
        Ok(token.access_token)
    }

    fn authorize(&self, secrets: &ClientSecrets, account: &str) -> Result<StoredToken, OAuthError> {
        let listener = CallbackListener::bind()?;
        let redirect_uri = listener.redirect_uri();
        let pkce = Pkce::new();
        let state = random_token();
        let url = authorization_url(secrets, &redirect_uri, account, &state, &pkce.challenge)?;

        info!(account, "Open this URL to authorize MIST: {}", url);
        if let Err(err) = self.browser.open(url.as_str()) {
            warn!("could not open a browser: {}", err);
        }

        let code = listener.wait_for_code(&state, self.callback_timeout)?;
        let grant = self
            .exchange
            .exchange_code(secrets, &code, &pkce.verifier, &redirect_uri)?;
        info!(account, "OAuth authorization granted");
        Ok(stored_token(grant, None))
    }
}

fn stored_token(grant: TokenGrant, previous_refresh: Option<String>) -> StoredToken {
    StoredToken {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token.or(previous_refresh),
        expires_at: grant
            .expires_in
            .map(|secs| Utc::now().timestamp() + secs as i64),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    use super::*;

    pub(crate) fn secrets() -> ClientSecrets {
        ClientSecrets {
            client_id: "mist-client".into(),
            client_secret: Some("shh".into()),
            auth_uri: DEFAULT_AUTH_URI.into(),
            token_uri: DEFAULT_TOKEN_URI.into(),
        }
    }

    #[derive(Default, Clone)]
    pub(crate) struct FakeExchange {
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl TokenExchange for FakeExchange {
        fn exchange_code(
            &self,
            _secrets: &ClientSecrets,
            code: &str,
            code_verifier: &str,
            _redirect_uri: &str,
        ) -> Result<TokenGrant, OAuthError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("code:{}:{}", code, !code_verifier.is_empty()));
            Ok(TokenGrant {
                access_token: "granted-access".into(),
                refresh_token: Some("granted-refresh".into()),
                expires_in: Some(3600),
            })
        }

        fn refresh(&self, _secrets: &ClientSecrets, refresh_token: &str) -> Result<TokenGrant, OAuthError> {
            self.calls.lock().unwrap().push(format!("refresh:{}", refresh_token));
            if refresh_token == "revoked" {
                return Err(OAuthError::Endpoint {
                    status: 400,
                    body: r#"{"error":"invalid_grant"}"#.into(),
                });
            }
            Ok(TokenGrant {
                access_token: "refreshed-access".into(),
                refresh_token: None,
                expires_in: Some(3600),
            })
        }
    }

    /// Follows the consent URL by calling the redirect straight back.
    pub(crate) struct ApprovingBrowser;

    impl Browser for ApprovingBrowser {
        fn open(&self, url: &str) -> std::io::Result<()> {
            let url = Url::parse(url).map_err(std::io::Error::other)?;
            let param = |name: &str| {
                url.query_pairs()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default()
            };
            let redirect = Url::parse(&param("redirect_uri")).map_err(std::io::Error::other)?;
            let state = param("state");
            let addr = format!(
                "{}:{}",
                redirect.host_str().unwrap_or("127.0.0.1"),
                redirect.port().unwrap_or(80)
            );
            std::thread::spawn(move || {
                if let Ok(mut stream) = TcpStream::connect(addr) {
                    let _ = write!(
                        stream,
                        "GET /?state={}&code=the-code HTTP/1.1\r\nHost: localhost\r\n\r\n",
                        state
                    );
                    let mut reply = String::new();
                    let _ = stream.read_to_string(&mut reply);
                }
            });
            Ok(())
        }
    }

    struct UnusedBrowser;

    impl Browser for UnusedBrowser {
        fn open(&self, _url: &str) -> std::io::Result<()> {
            Err(std::io::Error::other("browser should not be needed"))
        }
    }

    #[test]
    fn client_secrets_accept_installed_and_web_blocks() -> anyhow::Result<()> {
        let installed = ClientSecrets::parse(
            r#"{"installed":{"client_id":"abc","client_secret":"xyz","token_uri":"https://t.example/token"}}"#,
        )?;
        assert_eq!(installed.client_id, "abc");
        assert_eq!(installed.token_uri, "https://t.example/token");
        assert_eq!(installed.auth_uri, DEFAULT_AUTH_URI);

        let web = ClientSecrets::parse(r#"{"web":{"client_id":"web-id"}}"#)?;
        assert_eq!(web.client_id, "web-id");
        assert_eq!(web.client_secret, None);

        assert!(matches!(
            ClientSecrets::parse(r#"{"other":{}}"#),
            Err(OAuthError::Secrets(_))
        ));
        assert!(matches!(
            ClientSecrets::load(Path::new("/nonexistent/client_secrets.json")),
            Err(OAuthError::Secrets(_))
        ));
        Ok(())
    }

    #[test]
    fn authorization_url_carries_pkce_and_offline_access() -> anyhow::Result<()> {
        let url = authorization_url(
            &secrets(),
            "http://127.0.0.1:4000/",
            "bambi@toontown.example",
            "st",
            "ch",
        )?;
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let has = |k: &str, v: &str| pairs.iter().any(|(pk, pv)| pk == k && pv == v);
        assert!(has("scope", GMAIL_SCOPE));
        assert!(has("access_type", "offline"));
        assert!(has("prompt", "consent"));
        assert!(has("login_hint", "bambi@toontown.example"));
        assert!(has("code_challenge_method", "S256"));
        assert!(has("redirect_uri", "http://127.0.0.1:4000/"));
        Ok(())
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let pkce = Pkce::new();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
        assert_eq!(pkce.verifier.len(), 43);
    }

    #[test]
    fn redirect_parsing_checks_state() {
        assert_eq!(
            parse_redirect("GET /?code=abc&state=s1 HTTP/1.1\r\n", "s1").ok().as_deref(),
            Some("abc")
        );
        assert!(matches!(
            parse_redirect("GET /?code=abc&state=other HTTP/1.1", "s1"),
            Err(OAuthError::StateMismatch)
        ));
        assert!(matches!(
            parse_redirect("GET /?error=access_denied&state=s1 HTTP/1.1", "s1"),
            Err(OAuthError::Denied(reason)) if reason == "access_denied"
        ));
        assert!(matches!(
            parse_redirect("GET /?state=s1 HTTP/1.1", "s1"),
            Err(OAuthError::MalformedRedirect(_))
        ));
        assert!(matches!(parse_redirect("garbage", "s1"), Err(OAuthError::MalformedRedirect(_))));
    }

    #[test]
    fn callback_listener_answers_the_browser() -> anyhow::Result<()> {
        let listener = CallbackListener::bind()?;
        let addr = listener.addr;
        let client = std::thread::spawn(move || -> std::io::Result<String> {
            let mut stream = TcpStream::connect(addr)?;
            write!(stream, "GET /?code=xyz&state=s HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
            let mut reply = String::new();
            stream.read_to_string(&mut reply)?;
            Ok(reply)
        });
        let code = listener.wait_for_code("s", Duration::from_secs(5))?;
        assert_eq!(code, "xyz");
        let reply = client.join().map_err(|_| anyhow::anyhow!("client panicked"))??;
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        Ok(())
    }

    #[test]
    fn callback_listener_times_out() -> anyhow::Result<()> {
        let listener = CallbackListener::bind()?;
        let err = listener
            .wait_for_code("s", Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, OAuthError::Timeout));
        Ok(())
    }

    #[test]
    fn fresh_cached_token_is_reused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        store.save(
            "bambi",
            &StoredToken {
                access_token: "cached".into(),
                refresh_token: Some("r".into()),
                expires_at: Some(Utc::now().timestamp() + 3600),
            },
        )?;
        let exchange = FakeExchange::default();
        let client = OAuthClient::new(store, Box::new(exchange.clone()), Box::new(UnusedBrowser));

        let token = client.access_token(&secrets(), "bambi")?;
        assert_eq!(token, "cached");
        assert!(exchange.calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn stale_token_is_refreshed_and_saved() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        store.save(
            "bambi",
            &StoredToken {
                access_token: "old".into(),
                refresh_token: Some("keep-me".into()),
                expires_at: Some(Utc::now().timestamp() - 10),
            },
        )?;
        let exchange = FakeExchange::default();
        let client = OAuthClient::new(store.clone(), Box::new(exchange.clone()), Box::new(UnusedBrowser));

        let token = client.access_token(&secrets(), "bambi")?;
        assert_eq!(token, "refreshed-access");
        let saved = store.load("bambi")?.ok_or_else(|| anyhow::anyhow!("token not saved"))?;
        assert_eq!(saved.access_token, "refreshed-access");
        assert_eq!(saved.refresh_token.as_deref(), Some("keep-me"));
        assert!(saved.is_fresh());
        Ok(())
    }

    #[test]
    fn refresh_failure_is_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        store.save(
            "bambi",
            &StoredToken {
                access_token: "old".into(),
                refresh_token: Some("revoked".into()),
                expires_at: None,
            },
        )?;
        let client = OAuthClient::new(store, Box::new(FakeExchange::default()), Box::new(UnusedBrowser));
        let err = client.access_token(&secrets(), "bambi").unwrap_err();
        assert!(
            matches!(&err, OAuthError::Endpoint { status: 400, body } if body.contains("invalid_grant")),
            "{}",
            err
        );
        Ok(())
    }

    #[test]
    fn missing_token_runs_the_consent_flow() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        let exchange = FakeExchange::default();
        let client = OAuthClient::new(store.clone(), Box::new(exchange.clone()), Box::new(ApprovingBrowser))
            .with_callback_timeout(Duration::from_secs(10));

        let token = client.access_token(&secrets(), "bambi")?;
        assert_eq!(token, "granted-access");
        let calls = exchange.calls.lock().unwrap().clone();
        assert_eq!(calls, ["code:the-code:true"]);
        let saved = store.load("bambi")?.ok_or_else(|| anyhow::anyhow!("token not saved"))?;
        assert_eq!(saved.refresh_token.as_deref(), Some("granted-refresh"));
        Ok(())
    }
}
