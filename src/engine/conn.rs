use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use super::{Command, EngineConfig, Event, ProtocolSession, MAX_COMMAND_LINE};

enum Transport<S> {
    Plain(BufReader<S>),
    Tls(Box<BufReader<TlsStream<S>>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    async fn read_until_newline(&mut self, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize> {
        match self {
            Self::Plain(r) => (&mut *r).take(limit as u64).read_until(b'\n', buf).await,
            Self::Tls(r) => (&mut **r).take(limit as u64).read_until(b'\n', buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(r) => {
                let w = r.get_mut();
                w.write_all(data).await?;
                w.flush().await
            }
            Self::Tls(r) => {
                let w = r.get_mut();
                w.write_all(data).await?;
                w.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(r) => r.get_mut().shutdown().await,
            Self::Tls(r) => r.get_mut().shutdown().await,
        }
    }
}

/// What the last emitted event is waiting for.
enum Pending {
    Command(Command, String),
    Data,
    Quit,
    AuthAbort,
    AuthStep,
    Dead,
}

enum AuthState {
    Plain,
    LoginUser,
    LoginPass { user: String },
}

/// Line-oriented SMTP server session over any byte stream.
pub struct SmtpConn<S> {
    stream: Option<Transport<S>>,
    config: Arc<EngineConfig>,
    tls: Option<TlsAcceptor>,
    greeted: bool,
    helo: Option<String>,
    has_sender: bool,
    recipients: usize,
    reading_data: bool,
    tls_active: bool,
    authenticated: bool,
    auth: Option<AuthState>,
    last: Option<Pending>,
    queued: Option<Event>,
    failure: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpConn<S> {
    pub fn new(stream: S, config: Arc<EngineConfig>, tls: Option<TlsAcceptor>) -> Self {
        Self {
            stream: Some(Transport::Plain(BufReader::new(stream))),
            config,
            tls,
            greeted: false,
            helo: None,
            has_sender: false,
            recipients: 0,
            reading_data: false,
            tls_active: false,
            authenticated: false,
            auth: None,
            last: None,
            queued: None,
            failure: None,
        }
    }

    fn emit(&mut self, event: Event) -> Event {
        self.last = Some(match &event {
            Event::Command { cmd, arg } => Pending::Command(*cmd, arg.clone()),
            Event::GotData(_) => Pending::Data,
            Event::Done => Pending::Quit,
            Event::AuthAbort => Pending::AuthAbort,
            Event::AuthResponse(_) => Pending::AuthStep,
            Event::Abort(_) | Event::TlsError(_) => Pending::Dead,
        });
        event
    }

    async fn send(&mut self, reply: &str) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut line = String::with_capacity(reply.len() + 2);
        line.push_str(reply);
        line.push_str("\r\n");

        if let Err(e) = stream.write_all(line.as_bytes()).await {
            self.failure.get_or_insert_with(|| format!("write error: {}", e));
            self.stream = None;
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn reset_transaction(&mut self) {
        self.has_sender = false;
        self.recipients = 0;
    }

    /// One raw line including its terminator. `Ok(None)` means the
    /// line hit `limit` before a newline.
    async fn read_raw_line(&mut self, limit: usize) -> Result<Option<Vec<u8>>, String> {
        let timeout = self.config.read_timeout;
        let stream = self.stream.as_mut().ok_or_else(|| "connection closed".to_string())?;

        let mut buf = Vec::new();
        match time::timeout(timeout, stream.read_until_newline(&mut buf, limit)).await {
            Err(_) => Err("read timeout".to_string()),
            Ok(Err(e)) => Err(format!("read error: {}", e)),
            Ok(Ok(0)) => Err("connection closed by client".to_string()),
            Ok(Ok(_)) if buf.ends_with(b"\n") => Ok(Some(buf)),
            Ok(Ok(n)) if n >= limit => Ok(None),
            Ok(Ok(_)) => Err("connection closed by client".to_string()),
        }
    }

    async fn read_command_line(&mut self) -> Result<String, String> {
        match self.read_raw_line(self.config.max_line_length).await? {
            Some(buf) => Ok(String::from_utf8_lossy(trim_eol(&buf)).into_owned()),
            None => {
                self.send("500 5.5.2 Error: line too long").await;
                Err("command line too long".to_string())
            }
        }
    }

    /// Reads the message up to the lone dot. `Ok(None)` when the body was
    /// refused for size and the client has already been answered.
    async fn read_body(&mut self) -> Result<Option<String>, String> {
        let max_size = self.config.max_message_size;
        let line_limit = max_size.saturating_add(MAX_COMMAND_LINE);
        let mut body = String::new();
        let mut too_large = false;

        loop {
            let buf = match self.read_raw_line(line_limit).await {
                Ok(Some(buf)) => buf,
                Ok(None) => {
                    too_large = true;
                    continue;
                }
                Err(reason) => return Err(format!("{} during DATA", reason)),
            };

            let mut line = trim_eol(&buf);
            if line == b"." {
                break;
            }
            if line.starts_with(b".") {
                line = &line[1..];
            }

            if too_large {
                continue;
            }
            // measured after decoding: each invalid byte grows to U+FFFD
            let text = String::from_utf8_lossy(line);
            if body.len() + text.len() + 2 > max_size {
                too_large = true;
                body = String::new();
                continue;
            }
            body.push_str(&text);
            body.push_str("\r\n");
        }

        self.reading_data = false;
        if too_large {
            self.reset_transaction();
            self.send("552 5.3.4 Error: message exceeds fixed maximum message size").await;
            return Ok(None);
        }
        Ok(Some(body))
    }

    /// Answers sequencing and syntax errors itself; returns the event for
    /// anything the caller has to decide on.
    async fn parse_command(&mut self, line: &str) -> Option<Event> {
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line.trim(), ""),
        };
        let verb = verb.to_ascii_uppercase();

        let (cmd, arg) = match verb.as_str() {
            "HELO" | "EHLO" => {
                if rest.is_empty() {
                    self.send(&format!("501 5.5.4 Syntax: {} hostname", verb)).await;
                    return None;
                }
                let cmd = if verb == "HELO" { Command::Helo } else { Command::Ehlo };
                (cmd, rest.to_string())
            }
            "MAIL" => {
                if self.helo.is_none() {
                    self.send("503 5.5.1 Error: send HELO/EHLO first").await;
                    return None;
                }
                if self.has_sender {
                    self.send("503 5.5.1 Error: nested MAIL command").await;
                    return None;
                }
                match parse_path(rest, "FROM:") {
                    Some(path) => (Command::MailFrom, path),
                    None => {
                        self.send("501 5.5.4 Syntax: MAIL FROM:<address>").await;
                        return None;
                    }
                }
            }
            "RCPT" => {
                if !self.has_sender {
                    self.send("503 5.5.1 Error: need MAIL command").await;
                    return None;
                }
                match parse_path(rest, "TO:").filter(|path| !path.is_empty()) {
                    Some(path) => (Command::RcptTo, path),
                    None => {
                        self.send("501 5.5.4 Syntax: RCPT TO:<address>").await;
                        return None;
                    }
                }
            }
            "DATA" => {
                if self.recipients == 0 {
                    self.send("503 5.5.1 Error: need RCPT command").await;
                    return None;
                }
                (Command::Data, String::new())
            }
            "RSET" => (Command::Rset, rest.to_string()),
            "NOOP" => (Command::Noop, rest.to_string()),
            "HELP" => (Command::Help, rest.to_string()),
            "VRFY" => (Command::Vrfy, rest.to_string()),
            "EXPN" => (Command::Expn, rest.to_string()),
            "STARTTLS" => {
                if self.tls.is_none() || self.tls_active {
                    self.send("454 4.7.0 TLS not available").await;
                    return None;
                }
                (Command::StartTls, String::new())
            }
            "AUTH" => {
                if !self.config.auth_enabled() {
                    self.send("502 5.5.1 Error: authentication not enabled").await;
                    return None;
                }
                if self.authenticated {
                    self.send("503 5.5.1 Error: already authenticated").await;
                    return None;
                }
                if self.has_sender {
                    self.send("503 5.5.1 Error: MAIL transaction in progress").await;
                    return None;
                }
                let mechanism = rest.split_whitespace().next().unwrap_or("");
                if !mechanism.eq_ignore_ascii_case("PLAIN") && !mechanism.eq_ignore_ascii_case("LOGIN") {
                    self.send("504 5.5.4 Unrecognized authentication type").await;
                    return None;
                }
                (Command::Auth, rest.to_string())
            }
            "QUIT" => return Some(Event::Done),
            "" => {
                self.send("500 5.5.2 Error: bad syntax").await;
                return None;
            }
            _ => {
                self.send("502 5.5.2 Error: command not recognized").await;
                return None;
            }
        };

        Some(Event::Command { cmd, arg })
    }

    async fn accept_command(&mut self, cmd: Command, arg: String) {
        match cmd {
            Command::Helo => {
                let reply = format!("250 {} Hello {}", self.config.hostname, arg);
                self.helo = Some(arg);
                self.reset_transaction();
                self.send(&reply).await;
            }
            Command::Ehlo => {
                let reply = self.ehlo_reply(&arg);
                self.helo = Some(arg);
                self.reset_transaction();
                self.send(&reply).await;
            }
            Command::MailFrom => {
                self.has_sender = true;
                self.send("250 2.1.0 Ok").await;
            }
            Command::RcptTo => {
                self.recipients += 1;
                self.send("250 2.1.5 Ok").await;
            }
            Command::Data => {
                self.reading_data = true;
                self.send("354 End data with <CR><LF>.<CR><LF>").await;
            }
            Command::Rset => {
                self.reset_transaction();
                self.send("250 2.0.0 Ok").await;
            }
            Command::Noop => self.send("250 2.0.0 Ok").await,
            Command::Help => self.send("214 2.0.0 Commands: HELO EHLO MAIL RCPT DATA RSET NOOP QUIT").await,
            Command::Vrfy | Command::Expn => {
                self.send("252 2.5.2 Cannot VRFY user, but will accept message and attempt delivery")
                    .await
            }
            Command::StartTls => self.start_tls().await,
            Command::Auth => self.start_auth(&arg).await,
        }
    }

    fn ehlo_reply(&self, client: &str) -> String {
        let mut lines = vec![
            format!("{} Hello {}", self.config.hostname, client),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            format!("SIZE {}", self.config.max_message_size),
        ];
        if self.tls.is_some() && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        if self.config.auth_enabled() && !self.authenticated {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines.push("HELP".to_string());

        let last = lines.len() - 1;
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("250{}{}", if i == last { ' ' } else { '-' }, line))
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    async fn start_tls(&mut self) {
        let Some(acceptor) = self.tls.clone() else {
            self.send("454 4.7.0 TLS not available").await;
            return;
        };

        self.send("220 2.0.0 Ready to start TLS").await;

        let inner = match self.stream.take() {
            Some(Transport::Plain(reader)) => reader.into_inner(),
            Some(tls) => {
                self.stream = Some(tls);
                return;
            }
            None => return,
        };

        match time::timeout(self.config.read_timeout, acceptor.accept(inner)).await {
            Ok(Ok(tls_stream)) => {
                self.stream = Some(Transport::Tls(Box::new(BufReader::new(tls_stream))));
                self.tls_active = true;
                self.helo = None;
                self.reset_transaction();
            }
            Ok(Err(e)) => self.queued = Some(Event::TlsError(format!("TLS handshake failed: {}", e))),
            Err(_) => self.queued = Some(Event::TlsError("TLS handshake timed out".to_string())),
        }
    }

    async fn start_auth(&mut self, arg: &str) {
        let mut parts = arg.split_whitespace();
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next().map(|resp| resp.as_bytes().to_vec());

        match (mechanism.as_str(), initial) {
            ("PLAIN", Some(resp)) => {
                self.auth = Some(AuthState::Plain);
                self.queued = Some(Event::AuthResponse(resp));
            }
            ("PLAIN", None) => {
                self.auth = Some(AuthState::Plain);
                self.send("334 ").await;
            }
            ("LOGIN", Some(user)) => {
                self.auth = Some(AuthState::LoginUser);
                self.queued = Some(Event::AuthResponse(user));
            }
            ("LOGIN", None) => {
                self.auth = Some(AuthState::LoginUser);
                self.send("334 VXNlcm5hbWU6").await;
            }
            _ => self.send("504 5.5.4 Unrecognized authentication type").await,
        }
    }

    async fn finish_auth(&mut self, user: &[u8], password: &[u8]) {
        let user = String::from_utf8_lossy(user);
        let password = String::from_utf8_lossy(password);

        let valid = self
            .config
            .auth_users
            .get(&*user)
            .map_or(false, |expected| *expected == password);

        if valid {
            self.authenticated = true;
            self.send("235 2.7.0 Authentication successful").await;
        } else {
            self.send("535 5.7.8 Error: authentication failed").await;
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ProtocolSession for SmtpConn<S> {
    async fn next(&mut self) -> Event {
        loop {
            if let Some(event) = self.queued.take() {
                return self.emit(event);
            }
            if let Some(reason) = self.failure.take() {
                return self.emit(Event::Abort(reason));
            }
            if self.stream.is_none() {
                return self.emit(Event::Abort("connection closed".to_string()));
            }

            if !self.greeted {
                self.greeted = true;
                let banner = format!("220 {} ESMTP", self.config.hostname);
                self.send(&banner).await;
                continue;
            }

            if self.reading_data {
                match self.read_body().await {
                    Ok(Some(body)) => return self.emit(Event::GotData(body)),
                    Ok(None) => continue,
                    Err(reason) => return self.emit(Event::Abort(reason)),
                }
            }

            let line = match self.read_command_line().await {
                Ok(line) => line,
                Err(reason) => return self.emit(Event::Abort(reason)),
            };

            if self.auth.is_some() {
                if line.trim() == "*" {
                    self.auth = None;
                    return self.emit(Event::AuthAbort);
                }
                return self.emit(Event::AuthResponse(line.into_bytes()));
            }

            if let Some(event) = self.parse_command(&line).await {
                return self.emit(event);
            }
        }
    }

    async fn accept(&mut self) {
        match self.last.take() {
            Some(Pending::Command(cmd, arg)) => self.accept_command(cmd, arg).await,
            Some(Pending::Data) => {
                self.reset_transaction();
                self.send("250 2.0.0 Ok: message accepted").await;
            }
            Some(Pending::Quit) => {
                self.send("221 2.0.0 Bye").await;
                self.close().await;
            }
            Some(Pending::AuthAbort) => self.send("501 5.7.0 Authentication aborted").await,
            Some(Pending::Dead) => self.close().await,
            Some(Pending::AuthStep) | None => {}
        }
    }

    async fn reject(&mut self) {
        match self.last.take() {
            Some(Pending::Command(cmd, _)) => {
                let reply = match cmd {
                    Command::Auth => "535 5.7.8 Error: authentication rejected",
                    Command::Data => "554 5.5.1 Error: transaction failed",
                    _ => "550 5.7.1 Rejected",
                };
                self.send(reply).await;
            }
            Some(Pending::Data) => {
                self.reset_transaction();
                self.send("554 5.6.0 Error: message rejected").await;
            }
            Some(Pending::Quit) => {
                self.send("221 2.0.0 Bye").await;
                self.close().await;
            }
            Some(Pending::AuthAbort) => self.send("501 5.7.0 Authentication aborted").await,
            Some(Pending::AuthStep) => {
                self.auth = None;
                self.send("535 5.7.8 Error: authentication failed").await;
            }
            Some(Pending::Dead) => self.close().await,
            None => {}
        }
    }

    async fn continue_authentication(&mut self, client_bytes: &[u8]) {
        self.last = None;

        let Some(state) = self.auth.take() else {
            self.send("503 5.5.1 Error: no authentication in progress").await;
            return;
        };

        let decoded = match decode_response(client_bytes) {
            Some(decoded) => decoded,
            None => {
                self.send("501 5.5.2 Error: cannot decode response").await;
                return;
            }
        };

        match state {
            AuthState::Plain => {
                // authzid NUL authcid NUL passwd
                let mut fields = decoded.split(|b| *b == 0);
                match (fields.next(), fields.next(), fields.next(), fields.next()) {
                    (Some(_), Some(user), Some(password), None) => self.finish_auth(user, password).await,
                    _ => self.send("501 5.5.2 Error: malformed PLAIN response").await,
                }
            }
            AuthState::LoginUser => {
                let user = String::from_utf8_lossy(&decoded).into_owned();
                self.auth = Some(AuthState::LoginPass { user });
                self.send("334 UGFzc3dvcmQ6").await;
            }
            AuthState::LoginPass { user } => self.finish_auth(user.as_bytes(), &decoded).await,
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(bytes).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        }
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_response(bytes: &[u8]) -> Option<Vec<u8>> {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    let trimmed = &bytes[start..end];
    // RFC 4954: a lone "=" is an empty response
    if trimmed == b"=" {
        return Some(Vec::new());
    }
    STANDARD.decode(trimmed).ok()
}

/// Extracts the bare address from `FROM:<addr> PARAMS` or `TO:<addr>`.
fn parse_path(rest: &str, prefix: &str) -> Option<String> {
    let head = rest.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let path = rest[prefix.len()..].split_whitespace().next().unwrap_or("");
    match path.strip_prefix('<').and_then(|p| p.strip_suffix('>')) {
        // drop an RFC 5321 source route: <@relay1,@relay2:user@domain>
        Some(inner) if inner.starts_with('@') => inner.split_once(':').map(|(_, addr)| addr.to_string()),
        Some(inner) => Some(inner.to_string()),
        None if path.is_empty() || path.contains(&['<', '>'][..]) => None,
        None => Some(path.to_string()),
    }
}
