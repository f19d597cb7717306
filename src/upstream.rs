//! Upstream session driver
//!
//! Entered once a downstream client has authenticated. Dials the
//! user's upstream server, optionally wraps TLS, validates the
//! greeting, and runs `AUTHENTICATE` with the configured mechanism and
//! the upstream credentials the downstream client never sees. The
//! exchange is a single sequential function; retries belong to the
//! downstream side only.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tracing::debug;

use crate::codec::{Command, ImapStream, Response, StatusKind};
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::sasl::{Mechanism, PlainClient, Xoauth2Client};
use crate::stream::NetStream;
use crate::tap::{Tap, TapStream};
use crate::tls;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Tag on the one command the proxy issues in its own name.
const PROXY_TAG: &str = "mailp.1";

/// Dial and authenticate against the upstream for one session.
///
/// On success returns the raw upstream socket and any bytes the codec
/// read past the tagged auth result, ready for the relay. Failures
/// carry short, fixed detail strings suitable for a `BYE` to the
/// client.
pub async fn connect(
    cid: u64,
    conf: &UpstreamConfig,
    tap: Option<Tap>,
) -> Result<(TapStream<NetStream>, Vec<u8>)> {
    debug!("conn({cid}) connect upstream: {}", conf.addr);

    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&conf.addr))
        .await
        .map_err(|_| Error::Upstream("connect upstream fail".into()))?
        .map_err(|_| Error::Upstream("connect upstream fail".into()))?;

    let socket = if conf.tls.enabled {
        let host = host_portion(&conf.addr);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::Upstream("bad upstream server name".into()))?;
        let connector = tls::client_connector(conf.tls.skip_verify);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|_| Error::Upstream("tls handshake fail".into()))?;
        NetStream::client_tls(stream)
    } else {
        NetStream::plain(tcp)
    };

    debug!("conn({cid}) connect upstream: {} (ok)", conf.addr);

    let tapped = match tap {
        Some(tap) => TapStream::new(socket, tap, "s> ", "s< "),
        None => TapStream::passthrough(socket),
    };
    let mut io = ImapStream::client(tapped);

    read_greeting(&mut io).await?;
    authenticate(cid, &mut io, conf).await?;

    Ok(io.into_parts())
}

async fn read_greeting(io: &mut ImapStream<TapStream<NetStream>>) -> Result<()> {
    match io.read_response().await? {
        Response::Status { tag, kind } if tag == "*" && kind == StatusKind::Ok => Ok(()),
        Response::Status { .. } => Err(Error::Upstream("bad greet".into())),
        _ => Err(Error::Upstream("want greet".into())),
    }
}

/// Issue `AUTHENTICATE` with an initial response and read until the
/// matching tagged result.
///
/// Untagged `CAPABILITY` data during the exchange carries the
/// post-auth capability list; it is absorbed, not forwarded, since the
/// client already saw the proxy's fixed pre-auth set.
async fn authenticate(
    cid: u64,
    io: &mut ImapStream<TapStream<NetStream>>,
    conf: &UpstreamConfig,
) -> Result<()> {
    let mechanism = Mechanism::from_config(&conf.auth.mechanism).ok_or_else(|| {
        Error::Upstream(format!(
            "upstream auth support plain and xoauth2, got {}",
            conf.auth.mechanism
        ))
    })?;

    debug!("conn({cid}) login upstream as {}", conf.auth.username);

    let (mech_name, initial_response) = match mechanism {
        Mechanism::Plain => {
            PlainClient::new(conf.auth.username.as_str(), conf.auth.password.as_str()).start()
        }
        Mechanism::Xoauth2 => {
            Xoauth2Client::new(conf.auth.username.as_str(), conf.auth.password.as_str()).start()
        }
    };

    io.write_command(&Command {
        tag: PROXY_TAG.to_string(),
        name: "AUTHENTICATE".to_string(),
        args: vec![mech_name.to_string(), BASE64.encode(initial_response)],
    })
    .await?;

    loop {
        match io.read_response().await? {
            Response::Data { name } if name.eq_ignore_ascii_case("CAPABILITY") => {}
            Response::Data { .. } => return Err(Error::Upstream("auth bad data".into())),
            Response::Continuation { payload } => {
                // A challenge during XOAUTH2 is an error report.
                if mechanism == Mechanism::Xoauth2 {
                    let decoded = BASE64
                        .decode(payload.trim())
                        .map_err(|_| Error::Upstream("auth bad".into()))?;
                    return Err(Xoauth2Client::decode_challenge(&decoded));
                }
                return Err(Error::Upstream("auth bad".into()));
            }
            Response::Status { tag, kind } if tag == PROXY_TAG && kind == StatusKind::Ok => {
                return Ok(());
            }
            Response::Status { .. } => return Err(Error::Upstream("auth fail".into())),
        }
    }
}

/// The host part of a host:port address, for SNI and verification.
fn host_portion(addr: &str) -> &str {
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}
