//! Capturing SMTP sink for delivery tests.

use base64::prelude::*;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A message accepted by the sink.
#[derive(Debug, Clone)]
pub struct Captured {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: String,
    /// Username of an AUTH PLAIN/LOGIN exchange, if one took place.
    pub auth_user: Option<String>,
}

/// Plain-text SMTP server that accepts everything and records it.
pub struct SmtpSink {
    pub addr: SocketAddr,
    messages: Arc<Mutex<Vec<Captured>>>,
    handle: JoinHandle<()>,
}

impl SmtpSink {
    /// Bind to an ephemeral port on localhost.
    pub async fn start(advertise_auth: bool) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let messages = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(&messages);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, store, advertise_auth).await;
                });
            }
        });

        Ok(Self {
            addr,
            messages,
            handle,
        })
    }

    pub fn messages(&self) -> Vec<Captured> {
        self.messages.lock().unwrap().clone()
    }
}

impl Drop for SmtpSink {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct Session {
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    auth_user: Option<String>,
    awaiting_login_user: bool,
    awaiting_login_password: bool,
}

impl Session {
    fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }
}

async fn handle_connection(
    stream: TcpStream,
    store: Arc<Mutex<Vec<Captured>>>,
    advertise_auth: bool,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut session = Session::default();

    writer.write_all(b"220 localhost ESMTP sink\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        let cmd = trimmed.to_uppercase();

        if session.awaiting_login_user {
            session.awaiting_login_user = false;
            session.awaiting_login_password = true;
            session.auth_user = decode(trimmed);
            writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
            continue;
        }
        if session.awaiting_login_password {
            session.awaiting_login_password = false;
            writer.write_all(b"235 Authentication successful\r\n").await?;
            continue;
        }

        if cmd.starts_with("EHLO") || cmd.starts_with("HELO") {
            writer.write_all(b"250-localhost Hello\r\n").await?;
            writer.write_all(b"250-8BITMIME\r\n").await?;
            if advertise_auth {
                writer.write_all(b"250-AUTH PLAIN LOGIN\r\n").await?;
            }
            writer.write_all(b"250 OK\r\n").await?;
        } else if cmd.starts_with("AUTH PLAIN ") {
            session.auth_user = BASE64_STANDARD
                .decode(trimmed[11..].trim())
                .ok()
                .and_then(|raw| {
                    raw.split(|&b| b == 0)
                        .nth(1)
                        .map(|u| String::from_utf8_lossy(u).into_owned())
                });
            writer.write_all(b"235 Authentication successful\r\n").await?;
        } else if cmd.starts_with("AUTH LOGIN") {
            session.awaiting_login_user = true;
            writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
        } else if cmd.starts_with("MAIL FROM:") {
            session.mail_from = Some(extract_address(&trimmed[10..]));
            writer.write_all(b"250 OK\r\n").await?;
        } else if cmd.starts_with("RCPT TO:") {
            session.rcpt_to.push(extract_address(&trimmed[8..]));
            writer.write_all(b"250 OK\r\n").await?;
        } else if cmd == "DATA" {
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;
            let data = read_data(&mut reader).await?;
            store.lock().unwrap().push(Captured {
                mail_from: session.mail_from.clone().unwrap_or_default(),
                rcpt_to: session.rcpt_to.clone(),
                data,
                auth_user: session.auth_user.clone(),
            });
            session.reset();
            writer.write_all(b"250 OK: queued\r\n").await?;
        } else if cmd == "RSET" || cmd == "NOOP" {
            session.reset();
            writer.write_all(b"250 OK\r\n").await?;
        } else if cmd == "QUIT" {
            writer.write_all(b"221 Bye\r\n").await?;
            return Ok(());
        } else {
            writer.write_all(b"500 Command not recognized\r\n").await?;
        }
    }
}

fn decode(encoded: &str) -> Option<String> {
    BASE64_STANDARD
        .decode(encoded)
        .ok()
        .map(|raw| String::from_utf8_lossy(&raw).into_owned())
}

fn extract_address(s: &str) -> String {
    let s = s.trim();
    if let (Some(start), Some(end)) = (s.find('<'), s.find('>')) {
        return s[start + 1..end].to_string();
    }
    s.to_string()
}

async fn read_data<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut data = String::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim_end() == "." {
            break;
        }
        let content = if line.starts_with("..") { &line[1..] } else { &line };
        data.push_str(content);
    }

    Ok(data)
}
