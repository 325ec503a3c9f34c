//! Registration listener.
//!
//! Accepts TLS connections on the coordinator's listen address. Each
//! connection carries exactly one registration line and gets exactly one
//! status line back. Connections are handled in their own tasks; a bad
//! connection never affects the accept loop or other registrations.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use pki_core::endpoint::MAX_REGISTRATION_BYTES;
use pki_core::{Endpoint, RegistrationMessage, RegistrationStatus};

use crate::registry::SharedDirectory;

/// Handshake plus registration read, unless overridden.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RegistrationListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    directory: SharedDirectory,
    read_timeout: Duration,
}

impl RegistrationListener {
    /// Bind the listen address. Failure here is fatal to the coordinator.
    pub fn bind(addr: SocketAddr, acceptor: TlsAcceptor, directory: SharedDirectory) -> Result<Self> {
        let listener = make_listener_socket(addr)
            .with_context(|| format!("failed to bind registration listener on {addr}"))?;
        let listener =
            TcpListener::from_std(listener).context("failed to convert to tokio TcpListener")?;
        Ok(Self {
            listener,
            acceptor,
            directory,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// Drop connections that have not delivered a registration within `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept registrations forever. Cancel by dropping the task handle.
    pub async fn run(self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "registration listener starting");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let directory = self.directory.clone();
            let read_timeout = self.read_timeout;
            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, acceptor, directory, read_timeout).await
                {
                    tracing::warn!(peer = %peer_addr, error = %e, "registration connection failed");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    directory: SharedDirectory,
    read_timeout: Duration,
) -> Result<()> {
    let received = tokio::time::timeout(read_timeout, async {
        let tls = acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;
        let mut conn = BufReader::new(tls);
        let registration = read_registration(&mut conn).await;
        anyhow::Ok((conn, registration))
    })
    .await
    .with_context(|| format!("no registration within {read_timeout:?}"))?;
    let (conn, registration) = received?;

    let status = match registration {
        Ok(endpoint) => {
            let name = endpoint.name.clone();
            let category = endpoint.category;
            let status = directory.current().register(endpoint).await;
            match status {
                RegistrationStatus::Accepted => {
                    tracing::info!(peer = %peer_addr, node = %name, %category, "registration accepted")
                }
                _ => {
                    tracing::debug!(peer = %peer_addr, node = %name, %category, "registration window closed")
                }
            }
            status
        }
        Err(e) => {
            tracing::warn!(peer = %peer_addr, error = %e, "rejecting registration");
            RegistrationStatus::Invalid
        }
    };

    let mut conn = conn.into_inner();
    conn.write_all(status.to_line().as_bytes())
        .await
        .context("failed to write status")?;
    conn.shutdown().await.ok();
    Ok(())
}

/// Read one bounded line and turn it into a validated endpoint.
pub(crate) async fn read_registration<R>(conn: &mut R) -> Result<Endpoint>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *conn)
        .take(MAX_REGISTRATION_BYTES as u64)
        .read_line(&mut line)
        .await
        .context("failed to read registration")?;
    if n == 0 {
        anyhow::bail!("connection closed before registration was sent");
    }
    if !line.ends_with('\n') {
        anyhow::bail!("registration exceeds {MAX_REGISTRATION_BYTES} bytes or lacks newline");
    }

    let msg = RegistrationMessage::from_line(&line)?;
    Ok(Endpoint::try_from(msg)?)
}

/// Create a TCP listening socket with SO_REUSEADDR set.
fn make_listener_socket(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;
    socket.listen(1024).context("listen()")?;

    Ok(socket.into())
}
