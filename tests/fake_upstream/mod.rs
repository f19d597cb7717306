//! Fake upstream IMAP server for integration testing
//!
//! An in-process IMAP server playing the role of the user's real mail
//! provider: it greets, runs `AUTHENTICATE` (PLAIN or XOAUTH2, checked
//! against configured credentials), and answers the handful of
//! commands the tests relay through the proxy.
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, optional TLS, and connection dispatch
//! - `handlers/` -- one file per IMAP command
//! - `io` -- shared write helpers

mod handlers;
mod io;
mod server;

pub use server::FakeUpstream;
