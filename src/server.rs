//! Listener and accept loop
//!
//! Binds the configured address, optionally wraps accepted sockets in
//! TLS, and spawns one independent task per connection. Connection ids
//! are allocated from an atomic counter. An accept error ends the
//! loop; sessions already running continue to completion.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::stream::NetStream;
use crate::tap::{stderr_sink, TapSink};
use crate::tls;

/// The proxy server. Build with [`Server::new`], then [`Server::bind`]
/// and [`BoundServer::run`].
pub struct Server {
    config: Arc<Config>,
    tap_sink: TapSink,
}

impl Server {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            tap_sink: stderr_sink(),
        }
    }

    /// Replace the connection tap sink (stderr by default).
    #[must_use]
    pub fn with_tap_sink(mut self, sink: TapSink) -> Self {
        self.tap_sink = sink;
        self
    }

    /// Bind the listener and load the TLS material. Failures here are
    /// fatal to startup.
    pub async fn bind(self) -> Result<BoundServer> {
        let listener = TcpListener::bind(&self.config.imap.addr)
            .await
            .map_err(|e| Error::Config(format!("listen {}: {e}", self.config.imap.addr)))?;

        let acceptor = if self.config.imap.tls.enabled {
            Some(tls::server_acceptor(
                Path::new(&self.config.imap.tls.cert),
                Path::new(&self.config.imap.tls.key),
            )?)
        } else {
            None
        };

        info!("listening on {}", listener.local_addr()?);

        Ok(BoundServer {
            listener,
            acceptor,
            config: self.config,
            tap_sink: self.tap_sink,
            next_cid: AtomicU64::new(0),
        })
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.run().await
    }
}

/// A server with its listener bound, ready to accept.
pub struct BoundServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    config: Arc<Config>,
    tap_sink: TapSink,
    next_cid: AtomicU64,
}

impl BoundServer {
    /// The bound listen address, useful when configured with port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener errors.
    pub async fn run(self) -> Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let cid = self.next_cid.fetch_add(1, Ordering::SeqCst) + 1;
            info!("conn({cid}) {peer}");

            let acceptor = self.acceptor.clone();
            let session = Session::new(cid, Arc::clone(&self.config), &self.tap_sink);

            tokio::spawn(async move {
                let stream = match acceptor {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(tls) => NetStream::server_tls(tls),
                        Err(e) => {
                            debug!("conn({cid}) tls accept failed: {e}");
                            return;
                        }
                    },
                    None => NetStream::plain(socket),
                };

                if let Err(e) = session.serve(stream).await {
                    debug!("conn({cid}) ended with error: {e}");
                }
                info!("conn({cid}) close");
            });
        }
    }
}
