//! Crate-level error types.
//!
//! [`ApiError`] describes what went wrong on the wire; [`ChatError`] says which
//! part of the client it went wrong in. Most [`ChatError`]s never leave the
//! crate: poll loops and the socket task log them and carry on.

use thiserror::Error;

/// Failure of a single HTTP call against the chat server.
///
/// Each variant carries enough context to diagnose the failure without
/// needing to inspect the originating `reqwest` error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// A TCP-level connection could not be established, or the request timed out.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },
    /// The server replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    /// The response body could not be decoded into the expected shape.
    #[error("malformed response from {url}: {detail}")]
    Json { url: String, detail: String },
}

/// Error kinds of the synchronization core.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Username generation or `/join` failed. Fatal to session start; retry
    /// by calling `join` again.
    #[error("could not acquire an identity: {0}")]
    Identity(#[source] ApiError),
    /// A fetch (poll, history, chat lookup, roster) failed.
    #[error("fetch failed: {0}")]
    Fetch(#[source] ApiError),
    /// A message could not be delivered to the server.
    #[error("send failed: {0}")]
    Send(String),
    /// The realtime connection dropped or produced an undecodable frame.
    #[error("socket error: {0}")]
    Socket(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An operation that needs a session was called before `join` succeeded.
    #[error("no session: join has not completed")]
    NotJoined,
}
