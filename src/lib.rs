//! mailgate: credential-brokering IMAP reverse proxy
//!
//! Authenticates downstream IMAP clients against a local user
//! directory, then opens the user's configured upstream server,
//! authenticates there with credentials the client never sees (PLAIN
//! or an XOAUTH2 bearer token), and splices the two connections into a
//! transparent byte relay.
//!
//! ## Connection lifecycle
//!
//! ```text
//!   Client connects (TCP, or implicit TLS)
//!       |
//!   Proxy greets: * OK [CAPABILITY ...] IMAP4rev1 Service Ready
//!       |
//!   Client authenticates: LOGIN or AUTHENTICATE PLAIN
//!       |
//!   Proxy dials the user's upstream, authenticates with the
//!   configured mechanism (PLAIN or XOAUTH2)
//!       |
//!   Both byte streams are spliced verbatim until either side closes
//! ```

pub mod codec;
pub mod config;
mod error;
pub mod relay;
pub mod sasl;
pub mod server;
pub mod session;
mod stream;
pub mod tap;
pub mod tls;
pub mod upstream;

pub use config::{Config, ConnLog};
pub use error::{Error, Result};
pub use server::{BoundServer, Server};
pub use stream::NetStream;
