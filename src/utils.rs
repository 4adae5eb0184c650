use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

pub const LOG_FILE_NAME: &str = "smtp-proxy.log";

/// Escapes control and non-ASCII characters so a client-supplied value
/// cannot break a log record across lines.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii() => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

struct LogFile {
    out: Box<dyn Write + Send>,
    /// Set after the first failed write, which is reported once.
    failed: bool,
}

impl LogFile {
    fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out, failed: false }
    }

    fn append(&mut self, line: &str) {
        let result = self
            .out
            .write_all(line.as_bytes())
            .and_then(|()| self.out.flush());

        if let Err(e) = result {
            if !self.failed {
                eprintln!("[ERROR] error writing log file: {}", e);
                self.failed = true;
            }
        }
    }
}

type Sink = Arc<Mutex<LogFile>>;

/// Process-wide audit log, mirrored to stdout.
#[derive(Clone)]
pub struct Logger {
    writer: Option<Sink>,
    console: bool,
    debug: bool,
}

impl Logger {
    /// Opens `<log_dir>/smtp-proxy.log` for appending. Failing to open it is
    /// reported once and leaves a console-only logger.
    pub fn new(log_dir: &Path, debug: bool) -> Self {
        let writer = match open_log_file(log_dir) {
            Ok(file) => Some(Arc::new(Mutex::new(LogFile::new(Box::new(BufWriter::new(file)))))),
            Err(e) => {
                eprintln!("[ERROR] error opening log file: {:#}", e);
                None
            }
        };

        Self { writer, console: true, debug }
    }

    pub fn with_writer(writer: Box<dyn Write + Send>, console: bool, debug: bool) -> Self {
        Self {
            writer: Some(Arc::new(Mutex::new(LogFile::new(writer)))),
            console,
            debug,
        }
    }

    pub async fn log(&self, message: &str) {
        let timestamp = Local::now().format("%Y/%m/%d %H:%M:%S");
        let line = format!("{} {}\n", timestamp, message);

        if self.console {
            print!("{}", line);
        }

        if let Some(writer) = &self.writer {
            writer.lock().await.append(&line);
        }
    }

    pub async fn debug(&self, message: &str) {
        if self.debug {
            self.log(message).await;
        }
    }
}

fn open_log_file(log_dir: &Path) -> Result<File> {
    create_log_dir(log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    let path = log_dir.join(LOG_FILE_NAME);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {:?}", path))
}

#[cfg(unix)]
fn create_log_dir(log_dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(log_dir)
}

#[cfg(not(unix))]
fn create_log_dir(log_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(log_dir)
}
