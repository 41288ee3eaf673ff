//! A single email submission over one SMTP connection.
//!
//! The dialogue is `connect → greeting → EHLO → STARTTLS → EHLO → AUTH PLAIN →
//! MAIL FROM → RCPT TO → DATA → message → QUIT`. Every reply is checked and
//! every step runs under its own deadline; the first failure aborts the send
//! with a [`TransportError`] naming the step.

use core::fmt::{self, Display, Formatter};
use std::{future::Future, time::Duration};

use async_trait::async_trait;
use courier_common::{Attachment, internal, tracing};
use thiserror::Error;

use crate::{
    client::{ClientError, MessageBuilder, Response, SmtpClient},
    config::{SmtpConfig, TlsMode},
};

/// The rendered content of one email, ready to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Anything that can deliver an [`Email`]. The queue only ever talks to this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), TransportError>;
}

/// The step of the SMTP dialogue a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Greeting,
    Ehlo,
    StartTls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Message,
    Quit,
}

impl Display for Stage {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connect => "connect",
            Self::Greeting => "greeting",
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Message => "message",
            Self::Quit => "QUIT",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage} failed: {message}")]
pub struct TransportError {
    pub stage: Stage,
    /// The server's reply code, when the failure was a negative reply.
    pub code: Option<u16>,
    /// Raw server text or the underlying I/O/TLS error.
    pub message: String,
}

impl TransportError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            code: None,
            message: message.into(),
        }
    }

    fn rejected(stage: Stage, response: &Response) -> Self {
        Self {
            stage,
            code: Some(response.code),
            message: response.to_string(),
        }
    }

    fn client(stage: Stage, error: &ClientError) -> Self {
        Self::new(stage, error.to_string())
    }

    fn timeout(stage: Stage, after: Duration) -> Self {
        Self::new(stage, format!("timed out after {}s", after.as_secs()))
    }

    /// A 5xx reply; the same message will not be accepted on retry.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.code.is_some_and(|code| (500..600).contains(&code))
    }
}

/// Runs one step of the dialogue under a deadline.
async fn step<T, F>(stage: Stage, deadline: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, ClientError>> + Send,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TransportError::client(stage, &e)),
        Err(_) => Err(TransportError::timeout(stage, deadline)),
    }
}

/// Fails unless the reply code satisfies `accept`.
fn expect(
    stage: Stage,
    response: Response,
    accept: impl Fn(u16) -> bool,
) -> Result<Response, TransportError> {
    if accept(response.code) {
        Ok(response)
    } else {
        Err(TransportError::rejected(stage, &response))
    }
}

const fn positive(code: u16) -> bool {
    code >= 200 && code < 300
}

/// Sends mail through the configured submission server, one connection per
/// email.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: SmtpConfig,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Self {
        if config.accept_invalid_certs {
            tracing::warn!(
                host = %config.host,
                "SECURITY WARNING: TLS certificate validation is disabled for the SMTP relay. \
                 This should only be used for testing."
            );
        }
        if config.tls == TlsMode::None {
            tracing::warn!(host = %config.host, "SMTP relay is configured without TLS");
        }

        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Renders the MIME document for `email` with this transport's sender.
    #[must_use]
    pub fn render(&self, email: &Email) -> String {
        let mut builder = MessageBuilder::new()
            .from(&self.config.from_email, self.config.from_name.as_deref())
            .to(&email.to_email, email.to_name.as_deref())
            .subject(&email.subject)
            .attachments(&email.attachments);

        if let Some(text) = &email.text_body {
            builder = builder.text(text);
        }
        if let Some(html) = &email.html_body {
            builder = builder.html(html);
        }

        builder.build()
    }

    async fn connect(&self) -> Result<SmtpClient, TransportError> {
        let timeouts = &self.config.timeouts;
        let address = self.config.address();

        let client = step(
            Stage::Connect,
            timeouts.connect(),
            SmtpClient::connect(&address, self.config.host.clone()),
        )
        .await?;

        Ok(client.accept_invalid_certs(self.config.accept_invalid_certs))
    }

    async fn transaction(
        &self,
        client: &mut SmtpClient,
        email: &Email,
    ) -> Result<(), TransportError> {
        let timeouts = &self.config.timeouts;
        let command = timeouts.command();
        let helo = self.config.helo_domain.as_str();

        let greeting = step(Stage::Greeting, command, client.read_greeting()).await?;
        expect(Stage::Greeting, greeting, |code| code == 220)?;

        let ehlo = step(Stage::Ehlo, command, client.ehlo(helo)).await?;
        let ehlo = expect(Stage::Ehlo, ehlo, positive)?;

        if self.config.tls == TlsMode::StartTls {
            if !ehlo.advertises("STARTTLS") {
                return Err(TransportError::new(
                    Stage::StartTls,
                    format!("{} does not offer STARTTLS", self.config.host),
                ));
            }

            // Covers the reply and the handshake.
            let reply = step(Stage::StartTls, command * 2, client.starttls()).await?;
            expect(Stage::StartTls, reply, |code| code == 220)?;
            internal!(level = DEBUG, "STARTTLS negotiated with {}", self.config.host);

            let ehlo = step(Stage::Ehlo, command, client.ehlo(helo)).await?;
            expect(Stage::Ehlo, ehlo, positive)?;
        }

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        {
            let auth = step(Stage::Auth, command, client.auth_plain(username, password)).await?;
            expect(Stage::Auth, auth, |code| code == 235)?;
        }

        let mail = step(
            Stage::MailFrom,
            command,
            client.mail_from(&self.config.from_email),
        )
        .await?;
        expect(Stage::MailFrom, mail, positive)?;

        let rcpt = step(Stage::RcptTo, command, client.rcpt_to(&email.to_email)).await?;
        expect(Stage::RcptTo, rcpt, |code| code == 250 || code == 251)?;

        let data = step(Stage::Data, command, client.data()).await?;
        expect(Stage::Data, data, |code| code == 354)?;

        let payload = self.render(email);
        let accepted = step(Stage::Message, timeouts.data(), client.send_data(&payload)).await?;
        expect(Stage::Message, accepted, positive)?;

        // The message is already accepted; a failed goodbye doesn't undo that.
        match step(Stage::Quit, timeouts.quit(), client.quit()).await {
            Ok(reply) if !reply.is_success() => {
                tracing::debug!(%reply, "Server did not acknowledge QUIT");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "QUIT failed after message was accepted"),
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    #[tracing::instrument(skip(self, email), fields(to = %email.to_email, host = %self.config.host))]
    async fn send(&self, email: &Email) -> Result<(), TransportError> {
        let mut client = self.connect().await?;
        let result = self.transaction(&mut client, email).await;

        if tokio::time::timeout(self.config.timeouts.quit(), client.close())
            .await
            .is_err()
        {
            tracing::debug!("Timed out closing SMTP connection");
        }

        match &result {
            Ok(()) => internal!(level = INFO, "Delivered to {}", email.to_email),
            Err(e) => internal!(level = WARN, "Delivery to {} failed: {e}", email.to_email),
        }

        result
    }
}
