//! Node side of the protocol: register with the coordinator and receive
//! its broadcasts on the contact address.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use pki_core::{Announcement, RegistrationMessage, RegistrationStatus};

use crate::tls::{self, Credentials};

/// Longest broadcast line a node accepts.
const MAX_ANNOUNCEMENT_BYTES: u64 = 16 * 1024 * 1024;

/// Send one registration to the coordinator at `addr` and return its reply.
///
/// `coordinator_cert_pem` is the certificate the coordinator presents.
pub async fn register(
    addr: &str,
    coordinator_cert_pem: &[u8],
    msg: &RegistrationMessage,
) -> Result<RegistrationStatus> {
    let connector = tls::pinned_connector(coordinator_cert_pem)?;
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to coordinator {addr}"))?;
    let stream = connector
        .connect(tls::server_name(addr)?, tcp)
        .await
        .context("TLS handshake with coordinator")?;

    let mut conn = BufReader::new(stream);
    conn.get_mut()
        .write_all(msg.to_line()?.as_bytes())
        .await
        .context("failed to send registration")?;
    conn.get_mut().flush().await.context("failed to send registration")?;

    let mut reply = String::new();
    (&mut conn)
        .take(16)
        .read_line(&mut reply)
        .await
        .context("failed to read status")?;
    RegistrationStatus::parse_line(&reply)
        .with_context(|| format!("unexpected status reply {reply:?}"))
}

/// Receives coordinator broadcasts on a node's contact address.
pub struct BroadcastInbox {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl BroadcastInbox {
    pub async fn bind(addr: &str, credentials: Credentials) -> Result<Self> {
        let acceptor = tls::acceptor(credentials)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind contact address {addr}"))?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next broadcast and parse it.
    pub async fn recv(&self) -> Result<Announcement> {
        let line = self.recv_line().await?;
        Ok(Announcement::parse(&line)?)
    }

    /// Wait for the next broadcast and return the raw line.
    pub async fn recv_line(&self) -> Result<String> {
        let (tcp, peer) = self.listener.accept().await.context("accept failed")?;
        let stream = self
            .acceptor
            .accept(tcp)
            .await
            .with_context(|| format!("TLS handshake with {peer}"))?;

        let mut line = String::new();
        BufReader::new(stream)
            .take(MAX_ANNOUNCEMENT_BYTES)
            .read_line(&mut line)
            .await
            .context("failed to read broadcast")?;
        if !line.ends_with('\n') {
            anyhow::bail!("broadcast from {peer} was not newline-terminated");
        }
        line.pop();
        Ok(line)
    }
}
