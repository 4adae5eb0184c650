//! SMTP protocol engine. The relay core only sees the `ProtocolSession`
//! trait: it pulls one `Event` at a time and answers each with
//! `accept`/`reject`.

pub mod conn;
pub mod tls;

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SmtpdSettings;

pub use conn::SmtpConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Noop,
    Vrfy,
    Expn,
    Help,
    StartTls,
    Auth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Client went away, timed out or broke the line protocol.
    Abort(String),
    /// Client cancelled an AUTH exchange with `*`.
    AuthAbort,
    TlsError(String),
    /// One client line of an AUTH exchange, still base64-encoded.
    AuthResponse(Vec<u8>),
    Command { cmd: Command, arg: String },
    /// Complete message body, dot-stuffing removed, CRLF line endings.
    GotData(String),
    /// Client sent QUIT.
    Done,
}

#[async_trait]
pub trait ProtocolSession: Send {
    async fn next(&mut self) -> Event;

    /// Positive reply to the last event.
    async fn accept(&mut self);

    /// Negative reply to the last event.
    async fn reject(&mut self);

    async fn continue_authentication(&mut self, client_bytes: &[u8]);

    /// Writes bytes straight to the connection, bypassing the engine.
    async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hostname: String,
    pub read_timeout: Duration,
    pub max_line_length: usize,
    pub max_message_size: usize,
    pub auth_users: HashMap<String, String>,
}

/// RFC 5321 4.5.3.1.4, including CRLF.
pub const MAX_COMMAND_LINE: usize = 1000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SmtpdSettings::default())
    }
}

impl From<&SmtpdSettings> for EngineConfig {
    fn from(settings: &SmtpdSettings) -> Self {
        Self {
            hostname: settings.hostname.clone(),
            read_timeout: Duration::from_secs(settings.read_timeout_secs),
            max_line_length: MAX_COMMAND_LINE,
            max_message_size: settings.max_message_size,
            auth_users: settings.auth_users.clone(),
        }
    }
}

impl EngineConfig {
    pub fn auth_enabled(&self) -> bool {
        !self.auth_users.is_empty()
    }
}
