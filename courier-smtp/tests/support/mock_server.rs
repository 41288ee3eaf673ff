//! Scripted SMTP server for exercising the transport.
//!
//! Every reply can be overridden, a command verb can be made to hang or to
//! drop the connection, and everything the client sends is recorded. With
//! [`MockSmtpServerBuilder::with_tls`] the server completes STARTTLS using the
//! self-signed certificate in `tests/fixtures`.
//!
//! ```rust,no_run
//! # async fn example() -> std::io::Result<()> {
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "User unknown")
//!     .build()
//!     .await?;
//!
//! // point an SmtpConfig at server.addr() ...
//! # Ok(())
//! # }
//! ```
#![allow(dead_code)]

use std::{io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task::JoinHandle,
};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};

/// A command as the server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    StartTls,
    /// Recorded by the server once the TLS handshake has completed
    TlsEstablished,
    /// Everything after `AUTH `
    Auth(String),
    /// Everything after `MAIL `, e.g. `FROM:<a@b.com>`
    MailFrom(String),
    /// Everything after `RCPT `
    RcptTo(String),
    Data,
    /// The DATA payload, without the terminating `.` line
    Message(String),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![message.into()],
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let last = self.lines.len().saturating_sub(1);
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("{}{separator}{line}\r\n", self.code)
            })
            .collect::<String>()
            .into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo: Reply,
    starttls: Reply,
    auth: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    hang_on: Option<String>,
    drop_on: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.example.com ESMTP ready"),
            ehlo: Reply {
                code: 250,
                lines: vec![
                    "mock.example.com".to_string(),
                    "SIZE 10240000".to_string(),
                    "STARTTLS".to_string(),
                    "AUTH PLAIN LOGIN".to_string(),
                ],
            },
            starttls: Reply::new(502, "Command not implemented"),
            auth: Reply::new(235, "Authentication successful"),
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "OK: queued"),
            quit: Reply::new(221, "Bye"),
            hang_on: None,
            drop_on: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    task: JoinHandle<()>,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
            tls: false,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// Messages received across all connections.
    pub async fn messages(&self) -> Vec<String> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::Message(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    async fn handle_client(
        stream: TcpStream,
        script: Arc<Script>,
        tls: Option<TlsAcceptor>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> io::Result<()> {
        let mut stream = BufReader::new(stream);

        stream.write_all(&script.greeting.to_bytes()).await?;
        stream.flush().await?;

        if Self::converse(&mut stream, &script, &commands, false).await? == Ended::Closed {
            return Ok(());
        }

        let Some(acceptor) = tls else {
            return Ok(());
        };
        let secured = acceptor.accept(stream.into_inner()).await?;
        commands.write().await.push(SmtpCommand::TlsEstablished);

        Self::converse(&mut BufReader::new(secured), &script, &commands, true).await?;
        Ok(())
    }

    /// Answers commands until the client leaves or a STARTTLS is accepted.
    async fn converse<S>(
        stream: &mut BufReader<S>,
        script: &Script,
        commands: &RwLock<Vec<SmtpCommand>>,
        secured: bool,
    ) -> io::Result<Ended>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if stream.read_line(&mut line).await? == 0 {
                return Ok(Ended::Closed);
            }

            let command_line = line.trim_end_matches(['\r', '\n']).to_string();
            let (verb, argument) = command_line
                .split_once(' ')
                .map_or((command_line.as_str(), ""), |(verb, rest)| (verb, rest));
            let verb = verb.to_ascii_uppercase();

            if script.hang_on.as_deref() == Some(verb.as_str()) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(Ended::Closed);
            }
            if script.drop_on.as_deref() == Some(verb.as_str()) {
                return Ok(Ended::Closed);
            }

            let already_secured = Reply::new(503, "TLS already active");
            let (command, reply) = match verb.as_str() {
                "EHLO" => (SmtpCommand::Ehlo(argument.to_string()), &script.ehlo),
                "STARTTLS" if secured => (SmtpCommand::StartTls, &already_secured),
                "STARTTLS" => (SmtpCommand::StartTls, &script.starttls),
                "AUTH" => (SmtpCommand::Auth(argument.to_string()), &script.auth),
                "MAIL" => (SmtpCommand::MailFrom(argument.to_string()), &script.mail_from),
                "RCPT" => (SmtpCommand::RcptTo(argument.to_string()), &script.rcpt_to),
                "DATA" => (SmtpCommand::Data, &script.data),
                "QUIT" => (SmtpCommand::Quit, &script.quit),
                _ => {
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::Other(command_line.clone()));
                    stream
                        .write_all(&Reply::new(500, "Unknown command").to_bytes())
                        .await?;
                    stream.flush().await?;
                    continue;
                }
            };

            let is_data = command == SmtpCommand::Data;
            let is_quit = command == SmtpCommand::Quit;
            let upgrade = command == SmtpCommand::StartTls && reply.code == 220;
            commands.write().await.push(command);

            stream.write_all(&reply.to_bytes()).await?;
            stream.flush().await?;

            if is_quit {
                return Ok(Ended::Closed);
            }
            if upgrade {
                return Ok(Ended::StartTls);
            }

            if is_data && reply.code == 354 {
                let mut message = String::new();
                loop {
                    line.clear();
                    if stream.read_line(&mut line).await? == 0 {
                        return Ok(Ended::Closed);
                    }
                    if line == ".\r\n" {
                        break;
                    }
                    message.push_str(&line);
                }

                commands.write().await.push(SmtpCommand::Message(message));
                stream.write_all(&script.data_end.to_bytes()).await?;
                stream.flush().await?;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Closed,
    StartTls,
}

/// Server side of the handshake, from the PEM files in `tests/fixtures`.
fn tls_acceptor() -> io::Result<TlsAcceptor> {
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");

    let certificate = std::fs::read(fixtures.join("certificate.pem"))?;
    let certs = rustls_pemfile::certs(&mut certificate.as_slice())
        .collect::<Result<Vec<_>, _>>()?;

    let key = std::fs::read(fixtures.join("key.pem"))?;
    let key = rustls_pemfile::private_key(&mut key.as_slice())?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key in key.pem"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(io::Error::other)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
    tls: bool,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: &str) -> Self {
        self.script.greeting = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: &str) -> Self {
        self.script.starttls = Reply::new(code, message);
        self
    }

    /// Answer STARTTLS with 220 and complete the handshake.
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.script.starttls = Reply::new(220, "Ready to start TLS");
        self.tls = true;
        self
    }

    /// Leave STARTTLS out of the EHLO capabilities.
    #[must_use]
    pub fn without_starttls_capability(mut self) -> Self {
        self.script
            .ehlo
            .lines
            .retain(|line| !line.eq_ignore_ascii_case("STARTTLS"));
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: &str) -> Self {
        self.script.auth = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: &str) -> Self {
        self.script.mail_from = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: &str) -> Self {
        self.script.rcpt_to = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: &str) -> Self {
        self.script.data = Reply::new(code, message);
        self
    }

    /// Reply to the message payload (after `<CRLF>.<CRLF>`)
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: &str) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_quit_response(mut self, code: u16, message: &str) -> Self {
        self.script.quit = Reply::new(code, message);
        self
    }

    /// Never answer the given verb (e.g. "MAIL").
    #[must_use]
    pub fn hang_on(mut self, verb: &str) -> Self {
        self.script.hang_on = Some(verb.to_ascii_uppercase());
        self
    }

    /// Close the connection instead of answering the given verb.
    #[must_use]
    pub fn drop_on(mut self, verb: &str) -> Self {
        self.script.drop_on = Some(verb.to_ascii_uppercase());
        self
    }

    pub async fn build(self) -> io::Result<MockSmtpServer> {
        let tls = if self.tls { Some(tls_acceptor()?) } else { None };
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let recorded = Arc::clone(&commands);

        let task = tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let script = Arc::clone(&script);
                let commands = Arc::clone(&recorded);
                let tls = tls.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        MockSmtpServer::handle_client(stream, script, tls, commands).await
                    {
                        eprintln!("mock server client error: {e}");
                    }
                });
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands,
            task,
        })
    }
}
