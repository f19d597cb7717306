//! In-process fake upstream IMAP server
//!
//! Binds `127.0.0.1:0` so the OS picks a free port, optionally wraps
//! accepted connections in TLS with a self-signed `rcgen` certificate
//! (upstream TLS is implicit, first byte on the wire is the
//! handshake), then speaks enough IMAP for the proxy: greeting,
//! `AUTHENTICATE`, and the post-relay commands the tests issue.

use super::handlers::{handle_authenticate, handle_capability, handle_list, handle_logout};
use super::io::write_line;
use mailgate::sasl::Mechanism;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// The credentials the fake server accepts, and over which mechanism.
pub struct AuthPolicy {
    pub mechanism: Mechanism,
    pub username: String,
    pub secret: String,
}

/// A fake upstream IMAP server on an OS-assigned port.
pub struct FakeUpstream {
    addr: String,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeUpstream {
    pub fn builder() -> FakeUpstreamBuilder {
        FakeUpstreamBuilder {
            mechanism: Mechanism::Plain,
            username: "username".to_string(),
            secret: "password".to_string(),
            tls: false,
        }
    }

    /// The host:port the server is listening on.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Builder for the fake server: pick the accepted mechanism and
/// credentials, and whether the listener speaks TLS.
pub struct FakeUpstreamBuilder {
    mechanism: Mechanism,
    username: String,
    secret: String,
    tls: bool,
}

impl FakeUpstreamBuilder {
    /// Accept `AUTHENTICATE PLAIN` with this username and password.
    pub fn plain(mut self, username: &str, password: &str) -> Self {
        self.mechanism = Mechanism::Plain;
        self.username = username.to_string();
        self.secret = password.to_string();
        self
    }

    /// Accept `AUTHENTICATE XOAUTH2` with this username and token.
    pub fn xoauth2(mut self, username: &str, token: &str) -> Self {
        self.mechanism = Mechanism::Xoauth2;
        self.username = username.to_string();
        self.secret = token.to_string();
        self
    }

    /// Serve implicit TLS with a self-signed certificate.
    pub fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    pub async fn start(self) -> FakeUpstream {
        // Multiple tests may race to install the provider; ignore the
        // error if it is already set.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let addr = listener.local_addr().unwrap().to_string();

        let acceptor = if self.tls {
            let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
                .expect("generate self-signed cert");
            let cert_der = cert.cert.der().clone();
            let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der.into())
                .expect("build server TLS config");
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            None
        };

        let policy = Arc::new(AuthPolicy {
            mechanism: self.mechanism,
            username: self.username,
            secret: self.secret,
        });

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let policy = policy.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            if let Ok(tls) = acceptor.accept(stream).await {
                                run_session(tls, &policy).await;
                            }
                        }
                        None => run_session(stream, &policy).await,
                    }
                });
            }
        });

        FakeUpstream {
            addr,
            _handle: handle,
        }
    }
}

/// Run the IMAP command loop over an established stream.
async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(stream: S, policy: &AuthPolicy) {
    let mut reader = BufReader::new(stream);

    if write_line(&mut reader, "* OK IMAP4rev1 Service Ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let tag = parts[0];
        let command = parts[1].to_uppercase();

        match command.as_str() {
            "AUTHENTICATE" => {
                handle_authenticate(tag, &parts[2..], policy, &mut reader).await;
            }
            "CAPABILITY" => handle_capability(tag, &mut reader).await,
            "LIST" => handle_list(tag, &mut reader).await,
            "NOOP" => {
                if write_line(&mut reader, &format!("{tag} OK NOOP completed\r\n"))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            "LOGOUT" => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
