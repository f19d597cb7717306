//! SASL mechanisms
//!
//! PLAIN (RFC 4616) and XOAUTH2 (the bearer-token mechanism used by
//! Gmail and Outlook), each in both roles: the proxy is a SASL server
//! toward downstream clients and a SASL client toward the upstream.
//!
//! Client role: [`PlainClient`] and [`Xoauth2Client`] produce the
//! mechanism name and initial response for `AUTHENTICATE` with SASL-IR.
//! Server role: [`PlainServer`] and [`Xoauth2Server`] implement the
//! challenge/response shape of RFC 4422 via [`ServerMechanism::step`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const PLAIN: &str = "PLAIN";
pub const XOAUTH2: &str = "XOAUTH2";

/// The closed set of supported mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Xoauth2,
}

impl Mechanism {
    /// Map a config `auth.type` value.
    #[must_use]
    pub fn from_config(name: &str) -> Option<Self> {
        match name {
            "plain" => Some(Self::Plain),
            "xoauth2" => Some(Self::Xoauth2),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => PLAIN,
            Self::Xoauth2 => XOAUTH2,
        }
    }
}

/// Outcome of one server-side authentication step.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerStep {
    /// Send this challenge and feed the next client response in.
    Challenge(Vec<u8>),
    /// Authentication succeeded.
    Done,
}

/// Server side of a SASL exchange.
///
/// `step(None)` asks for the first challenge when the client supplied
/// no initial response; `step(Some(..))` feeds a client response in.
pub trait ServerMechanism {
    fn step(&mut self, response: Option<&[u8]>) -> Result<ServerStep>;
}

// ── PLAIN ──────────────────────────────────────────────────────────

/// PLAIN client: `authzid \0 authcid \0 passwd`.
pub struct PlainClient {
    username: String,
    password: String,
}

impl PlainClient {
    /// The username is used as both authzid and authcid.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn start(&self) -> (&'static str, Vec<u8>) {
        let ir = format!("{}\0{}\0{}", self.username, self.username, self.password);
        (PLAIN, ir.into_bytes())
    }
}

/// Credentials carried by a PLAIN response.
#[derive(Debug, PartialEq, Eq)]
pub struct PlainCredentials {
    pub username: String,
    pub password: String,
}

/// Split a PLAIN response into credentials.
///
/// A non-empty authzid that differs from the authcid is rejected.
pub fn parse_plain_response(response: &[u8]) -> Result<PlainCredentials> {
    let parts: Vec<&[u8]> = response.splitn(3, |&b| b == 0).collect();
    if parts.len() != 3 {
        return Err(Error::Parse("malformed PLAIN response".into()));
    }

    let authzid = std::str::from_utf8(parts[0])
        .map_err(|_| Error::Parse("PLAIN response is not UTF-8".into()))?;
    let username = std::str::from_utf8(parts[1])
        .map_err(|_| Error::Parse("PLAIN response is not UTF-8".into()))?;
    let password = std::str::from_utf8(parts[2])
        .map_err(|_| Error::Parse("PLAIN response is not UTF-8".into()))?;

    if !authzid.is_empty() && authzid != username {
        return Err(Error::Auth("identities not supported".into()));
    }

    Ok(PlainCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// PLAIN server: one response, one verdict from the authenticator.
pub struct PlainServer<A> {
    authenticate: A,
    done: bool,
}

impl<A> PlainServer<A>
where
    A: FnMut(&PlainCredentials) -> Result<()>,
{
    pub fn new(authenticate: A) -> Self {
        Self {
            authenticate,
            done: false,
        }
    }
}

impl<A> ServerMechanism for PlainServer<A>
where
    A: FnMut(&PlainCredentials) -> Result<()>,
{
    fn step(&mut self, response: Option<&[u8]>) -> Result<ServerStep> {
        let Some(response) = response else {
            return Ok(ServerStep::Challenge(Vec::new()));
        };
        if self.done {
            return Err(Error::Protocol("unexpected client response".into()));
        }
        self.done = true;

        let credentials = parse_plain_response(response)?;
        (self.authenticate)(&credentials)?;
        Ok(ServerStep::Done)
    }
}

// ── XOAUTH2 ────────────────────────────────────────────────────────

/// The JSON error blob XOAUTH2 servers send as a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Xoauth2Error {
    pub status: String,
    pub schemes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// XOAUTH2 client.
pub struct Xoauth2Client {
    username: String,
    token: String,
}

impl Xoauth2Client {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    /// Initial response: `user=<U>\x01auth=Bearer <T>\x01\x01`.
    #[must_use]
    pub fn start(&self) -> (&'static str, Vec<u8>) {
        let ir = format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.username, self.token
        );
        (XOAUTH2, ir.into_bytes())
    }

    /// A challenge from the server is always an error report; decode
    /// the JSON payload and surface it.
    #[must_use]
    pub fn decode_challenge(challenge: &[u8]) -> Error {
        match serde_json::from_slice::<Xoauth2Error>(challenge) {
            Ok(err) => Error::Auth(format!("XOAUTH2 authentication error ({})", err.status)),
            Err(e) => Error::Parse(format!("bad XOAUTH2 challenge: {e}")),
        }
    }
}

/// Identity asserted by an XOAUTH2 response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Xoauth2Identity {
    pub username: String,
    pub token: String,
}

/// XOAUTH2 server.
///
/// Failure is a two-step dance: the server answers a bad response with
/// a JSON error challenge and arms `fail_pending`; the client must then
/// send a lone `0x01`, after which the stored error is surfaced. Any
/// other follow-up is a protocol violation.
pub struct Xoauth2Server<A> {
    authenticate: A,
    done: bool,
    fail_pending: Option<Error>,
}

impl<A> Xoauth2Server<A>
where
    A: FnMut(&Xoauth2Identity) -> Result<()>,
{
    pub fn new(authenticate: A) -> Self {
        Self {
            authenticate,
            done: false,
            fail_pending: None,
        }
    }

    fn fail(&mut self, error: Error) -> Result<ServerStep> {
        let blob = serde_json::to_vec(&Xoauth2Error {
            status: "invalid_request".to_string(),
            schemes: "bearer".to_string(),
            scope: None,
        })
        .map_err(|e| Error::Protocol(format!("encode XOAUTH2 error: {e}")))?;
        self.fail_pending = Some(error);
        Ok(ServerStep::Challenge(blob))
    }

    fn parse_response(response: &[u8]) -> std::result::Result<Xoauth2Identity, String> {
        let mut identity = Xoauth2Identity::default();

        for part in response.split(|&b| b == 0x01) {
            if part.is_empty() {
                continue;
            }
            let Some(eq) = part.iter().position(|&b| b == b'=') else {
                return Err("invalid response, missing '='".to_string());
            };
            let key = &part[..eq];
            let value = String::from_utf8_lossy(&part[eq + 1..]);

            match key {
                b"user" => identity.username = value.into_owned(),
                b"auth" => {
                    // Token type is case-insensitive.
                    const PREFIX: &str = "bearer ";
                    if !value.to_lowercase().starts_with(PREFIX) {
                        return Err("unsupported token type".to_string());
                    }
                    identity.token = value[PREFIX.len()..].to_string();
                }
                other => {
                    return Err(format!(
                        "invalid response, unknown parameter: {}",
                        String::from_utf8_lossy(other)
                    ));
                }
            }
        }

        Ok(identity)
    }
}

impl<A> ServerMechanism for Xoauth2Server<A>
where
    A: FnMut(&Xoauth2Identity) -> Result<()>,
{
    fn step(&mut self, response: Option<&[u8]>) -> Result<ServerStep> {
        let Some(response) = response else {
            return Ok(ServerStep::Challenge(Vec::new()));
        };

        if let Some(error) = self.fail_pending.take() {
            if response.len() != 1 || response[0] != 0x01 {
                return Err(Error::Protocol("invalid response".into()));
            }
            return Err(error);
        }

        if self.done {
            return Err(Error::Protocol("unexpected client response".into()));
        }
        self.done = true;

        let identity = match Self::parse_response(response) {
            Ok(identity) => identity,
            Err(descr) => return self.fail(Error::Auth(descr)),
        };

        match (self.authenticate)(&identity) {
            Ok(()) => Ok(ServerStep::Done),
            Err(error) => self.fail(error),
        }
    }
}
