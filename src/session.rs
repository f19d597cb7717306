//! Downstream session state machine
//!
//! One session per accepted connection, driven through
//! `Greeting -> AwaitingAuth -> Authenticated -> Relaying`. The
//! pre-auth loop answers CAPABILITY, LOGIN, and AUTHENTICATE PLAIN,
//! gives the client a bounded number of attempts, and closes silently
//! when that allowance is spent. Authentication hands off to the upstream
//! driver; from then on the session is a byte relay.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::codec::{DataResponse, Field, ImapStream, StatusKind, StatusResponse};
use crate::config::{Config, ConnLog};
use crate::error::{Error, Result};
use crate::relay;
use crate::sasl::{self, PlainCredentials, PlainServer, ServerMechanism, ServerStep};
use crate::tap::{Tap, TapSink, TapStream};
use crate::upstream;

/// Fixed capability set advertised before authentication. The
/// upstream's real capabilities are never probed pre-auth.
const CAPABILITIES: [&str; 4] = ["IMAP4rev1", "AUTH=PLAIN", "LITERAL+", "SASL-IR"];

/// Pre-auth command cap. Bounds password guessing per
/// TCP session; exhausting it closes the connection without a reply.
const MAX_AUTH_COMMANDS: usize = 10;

/// Longest info text echoed back to a client.
const MAX_INFO_LEN: usize = 128;

/// Connection state, advancing in one direction only.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Greeting,
    AwaitingAuth,
    Authenticated(String),
    Relaying,
    Closed,
}

impl SessionState {
    /// The authenticated username, once past `AwaitingAuth`.
    fn authenticated_user(&self) -> Option<&str> {
        match self {
            Self::Authenticated(username) => Some(username),
            _ => None,
        }
    }
}

/// One downstream connection, from accept to close.
pub struct Session {
    cid: u64,
    config: Arc<Config>,
    tap: Option<Tap>,
}

impl Session {
    pub fn new(cid: u64, config: Arc<Config>, tap_sink: &TapSink) -> Self {
        let tap = match config.imap.conn_log {
            ConnLog::Off => None,
            ConnLog::On | ConnLog::Handshake => Some(Tap::new(Arc::clone(tap_sink))),
        };
        Self { cid, config, tap }
    }

    /// Drive the session to completion.
    ///
    /// Returns `Ok(())` on any orderly close: client EOF, the
    /// pre-auth command cap running out, or the relay finishing.
    pub async fn serve<S>(self, socket: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cid = self.cid;
        let tapped = match &self.tap {
            Some(tap) => TapStream::new(socket, tap.clone(), "c> ", "c< "),
            None => TapStream::passthrough(socket),
        };
        let mut io = ImapStream::server(tapped);
        let mut state = SessionState::Greeting;

        io.write_status(&greeting()).await?;
        self.transition(&mut state, SessionState::AwaitingAuth);

        let next = match self.await_authentication(&mut io).await? {
            Some(username) => SessionState::Authenticated(username),
            None => SessionState::Closed,
        };
        self.transition(&mut state, next);

        let Some(username) = state.authenticated_user().map(str::to_owned) else {
            return Ok(());
        };

        let Some(user) = self.config.imap.users.get(&username) else {
            return Err(Error::Config(format!("unknown user {username}")));
        };

        match upstream::connect(cid, &user.upstream, self.tap.clone()).await {
            Ok((upstream_socket, upstream_pending)) => {
                if self.config.imap.conn_log == ConnLog::Handshake {
                    if let Some(tap) = &self.tap {
                        tap.disable();
                    }
                }
                self.transition(&mut state, SessionState::Relaying);
                info!("conn({cid}) relay");
                let (client_socket, client_pending) = io.into_parts();
                relay::run(client_socket, client_pending, upstream_socket, upstream_pending)
                    .await?;
                self.transition(&mut state, SessionState::Closed);
                Ok(())
            }
            Err(e) => {
                warn!("conn({cid}) upstream handshake failed: {e}");
                let bye = StatusResponse::bye(bounded_info(&e.to_string()));
                let _ = io.write_status(&bye).await;
                self.transition(&mut state, SessionState::Closed);
                Err(e)
            }
        }
    }

    /// Advance the connection state. Transitions are one-way.
    fn transition(&self, state: &mut SessionState, next: SessionState) {
        debug!("conn({}) state {state:?} -> {next:?}", self.cid);
        *state = next;
    }

    /// The pre-auth command loop. Returns the authenticated username,
    /// or `None` when the session should close silently.
    async fn await_authentication<S>(
        &self,
        io: &mut ImapStream<TapStream<S>>,
    ) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for _ in 0..MAX_AUTH_COMMANDS {
            let fields = match io.read_line().await {
                Ok(Some(fields)) => fields,
                Ok(None) => return Ok(None),
                Err(Error::Parse(detail)) => {
                    let bad = StatusResponse::untagged(StatusKind::Bad, bounded_info(&detail));
                    io.write_status(&bad).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some((tag, name, args)) = split_command(fields) else {
                let bad = StatusResponse::untagged(StatusKind::Bad, "malformed command");
                io.write_status(&bad).await?;
                continue;
            };

            match name.as_str() {
                "CAPABILITY" => {
                    io.write_data(&DataResponse::new("CAPABILITY", capability_list()))
                        .await?;
                    io.write_status(&StatusResponse::tagged(
                        tag.as_str(),
                        StatusKind::Ok,
                        "CAPABILITY completed",
                    ))
                    .await?;
                }
                "LOGIN" => {
                    if let Some(username) = self.login(io, &tag, &args).await? {
                        return Ok(Some(username));
                    }
                }
                "AUTHENTICATE" => {
                    if let Some(username) = self.authenticate(io, &tag, &args).await? {
                        return Ok(Some(username));
                    }
                }
                _ => {
                    debug!("conn({}) unsupported command {name}", self.cid);
                    let info = bounded_info(&format!("unsupported command {name}"));
                    io.write_status(&StatusResponse::tagged(tag.as_str(), StatusKind::Bad, info))
                        .await?;
                }
            }
        }

        debug!(
            "conn({}) too many commands before authentication",
            self.cid
        );
        Ok(None)
    }

    async fn login<S>(
        &self,
        io: &mut ImapStream<TapStream<S>>,
        tag: &str,
        args: &[Field],
    ) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (Some(username), Some(password)) = (
            args.first().and_then(Field::as_text),
            args.get(1).and_then(Field::as_text),
        ) else {
            let bad =
                StatusResponse::tagged(tag, StatusKind::Bad, "LOGIN expects username and password");
            io.write_status(&bad).await?;
            return Ok(None);
        };

        if !self.verify_password(username, password) {
            let no = StatusResponse::tagged(tag, StatusKind::No, "bad username or password");
            io.write_status(&no).await?;
            return Ok(None);
        }

        let username = username.to_string();
        info!("conn({}) authenticated as {username}", self.cid);
        io.write_status(&StatusResponse::tagged(tag, StatusKind::Ok, "LOGIN completed"))
            .await?;
        Ok(Some(username))
    }

    async fn authenticate<S>(
        &self,
        io: &mut ImapStream<TapStream<S>>,
        tag: &str,
        args: &[Field],
    ) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(mechanism) = args.first().and_then(Field::as_text) else {
            let bad =
                StatusResponse::tagged(tag, StatusKind::Bad, "AUTHENTICATE expects a mechanism");
            io.write_status(&bad).await?;
            return Ok(None);
        };

        if !mechanism.eq_ignore_ascii_case(sasl::PLAIN) {
            let info = bounded_info(&format!("unsupported authentication mechanism {mechanism}"));
            io.write_status(&StatusResponse::tagged(tag, StatusKind::Bad, info))
                .await?;
            return Ok(None);
        }

        // SASL-IR: the initial response may arrive inline, with `=`
        // meaning an empty one. Otherwise ask for it.
        let response = match args.get(1).and_then(Field::as_text) {
            Some("=") => Vec::new(),
            Some(encoded) => match BASE64.decode(encoded) {
                Ok(decoded) => decoded,
                Err(_) => {
                    let no = StatusResponse::tagged(tag, StatusKind::No, "invalid base64 response");
                    io.write_status(&no).await?;
                    return Ok(None);
                }
            },
            None => {
                io.write_continuation("").await?;
                let Some(line) = io.read_auth_line().await? else {
                    return Ok(None);
                };
                if line == b"*" {
                    let bad =
                        StatusResponse::tagged(tag, StatusKind::Bad, "authentication aborted");
                    io.write_status(&bad).await?;
                    return Ok(None);
                }
                match BASE64.decode(&line) {
                    Ok(decoded) => decoded,
                    Err(_) => {
                        let no =
                            StatusResponse::tagged(tag, StatusKind::No, "invalid base64 response");
                        io.write_status(&no).await?;
                        return Ok(None);
                    }
                }
            }
        };

        let mut authenticated = None;
        let outcome = {
            let mut server = PlainServer::new(|creds: &PlainCredentials| {
                if self.verify_password(&creds.username, &creds.password) {
                    authenticated = Some(creds.username.clone());
                    Ok(())
                } else {
                    Err(Error::Auth("bad username or password".into()))
                }
            });
            server.step(Some(&response))
        };

        match outcome {
            Ok(ServerStep::Done) => match authenticated {
                Some(username) => {
                    info!("conn({}) authenticated as {username}", self.cid);
                    io.write_status(&StatusResponse::tagged(
                        tag,
                        StatusKind::Ok,
                        "AUTHENTICATE completed",
                    ))
                    .await?;
                    Ok(Some(username))
                }
                None => {
                    let no = StatusResponse::tagged(tag, StatusKind::No, "authentication failed");
                    io.write_status(&no).await?;
                    Ok(None)
                }
            },
            Ok(ServerStep::Challenge(_)) => {
                let no = StatusResponse::tagged(tag, StatusKind::No, "authentication failed");
                io.write_status(&no).await?;
                Ok(None)
            }
            Err(Error::Auth(detail) | Error::Parse(detail)) => {
                let no = StatusResponse::tagged(tag, StatusKind::No, bounded_info(&detail));
                io.write_status(&no).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Constant-time password check. Unknown usernames still pay for a
    /// comparison so the timing does not reveal which names exist.
    fn verify_password(&self, username: &str, password: &str) -> bool {
        const DUMMY: &[u8] = b"mailgate.no-such-user";
        match self.config.imap.users.get(username) {
            Some(user) => user.password.as_bytes().ct_eq(password.as_bytes()).into(),
            None => {
                let _ = DUMMY.ct_eq(password.as_bytes());
                false
            }
        }
    }
}

fn greeting() -> StatusResponse {
    StatusResponse::untagged(StatusKind::Ok, "IMAP4rev1 Service Ready")
        .with_code("CAPABILITY", capability_list())
}

fn capability_list() -> Vec<String> {
    CAPABILITIES.iter().map(ToString::to_string).collect()
}

/// Split a command line into tag, uppercased name, and arguments.
fn split_command(fields: Vec<Field>) -> Option<(String, String, Vec<Field>)> {
    let mut fields = fields.into_iter();
    let Field::Atom(tag) = fields.next()? else {
        return None;
    };
    if tag == "*" || tag == "+" {
        return None;
    }
    let Field::Atom(name) = fields.next()? else {
        return None;
    };
    Some((tag, name.to_ascii_uppercase(), fields.collect()))
}

/// Clip info text echoed to clients: printable, bounded, no internals.
fn bounded_info(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .take(MAX_INFO_LEN)
        .collect()
}
