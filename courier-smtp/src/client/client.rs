//! SMTP client connection with STARTTLS support.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Upper bound for a single reply (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// The socket underneath the client, before or after STARTTLS.
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn shutdown(&mut self) {
        let result = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };
        if let Err(e) = result {
            tracing::debug!("Error shutting down SMTP connection: {e}");
        }
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        };

        let mut root_store = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        if !native.errors.is_empty() {
            tracing::warn!(errors = ?native.errors, "Some certificates could not be loaded");
        }
        let (added, ignored) = root_store.add_parsable_certificates(native.certs);
        tracing::trace!(added, ignored, "Loaded native root certificates");

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

        let tls_stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

/// Accepts any server certificate. Only reachable through `accept_invalid_certs`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Normalises line endings to CRLF and escapes lines that begin with a dot
/// (RFC 5321 section 4.5.2). The result always ends with CRLF.
#[must_use]
pub fn dot_stuff(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 32 + 2);
    let body = data.strip_suffix('\n').unwrap_or(data);

    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    out
}

/// An SMTP client for sending commands and receiving replies.
///
/// The TCP (or TLS) stream is owned by the client, so dropping the client
/// closes the connection whichever way a transaction ends.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Opens a TCP connection to `addr`. `server_domain` is used for TLS SNI
    /// and certificate verification after STARTTLS.
    pub async fn connect(addr: &str, server_domain: String) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        tracing::debug!(%addr, "Connected to SMTP server");

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain,
            accept_invalid_certs: false,
        })
    }

    /// Sets whether to accept invalid TLS certificates. Testing only.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Reads the initial server greeting (220 response).
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{line}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await
    }

    /// Sends a command line and reads the reply.
    ///
    /// Nothing is written if `command` contains a CR or LF.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        if command.contains(['\r', '\n']) {
            return Err(ClientError::LineBreak(command.to_string()));
        }

        outgoing!("{command}");
        self.write_line(command).await?;
        self.read_response().await
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// Sends STARTTLS and, on a 2xx reply, upgrades the same connection to TLS.
    ///
    /// The server forgets everything negotiated before the upgrade, so EHLO
    /// has to be sent again afterwards.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let connection = self
                .connection
                .take()
                .ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                connection
                    .upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                    .await?,
            );
            // Anything buffered before the handshake belongs to the plaintext session.
            self.buffer_pos = 0;
        }

        Ok(response)
    }

    /// `AUTH PLAIN` with an initial response (RFC 4616).
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        outgoing!("AUTH PLAIN <redacted>");
        self.write_line(&format!("AUTH PLAIN {token}")).await?;
        self.read_response().await
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message payload followed by the terminating `.` line and
    /// reads the server's verdict on the message.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        let mut payload = dot_stuff(data);
        payload.push_str(".\r\n");

        outgoing!("<{} bytes of message data>", payload.len());
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(payload.as_bytes())
            .await?;

        self.read_response().await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Shuts the socket down. Dropping the client has the same effect without
    /// the orderly TLS close.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{response}");
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ReplyTooLarge {
                        max: MAX_BUFFER_SIZE,
                    });
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
