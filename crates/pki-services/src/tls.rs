//! TLS material for both directions.
//!
//! Every config is TLS 1.3 only with X25519 as the single key exchange group.
//! The registration listener presents the coordinator's certificate, does
//! not ask for client certificates and keeps no resumption state. Outbound
//! broadcast connections each get their own root store holding only the
//! certificate the target node registered.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::client::Resumption;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::NoServerSessionStorage;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use pki_core::endpoint::split_host_port;

fn provider() -> Arc<CryptoProvider> {
    let mut provider = ring::default_provider();
    provider.kx_groups = vec![ring::kx_group::X25519];
    Arc::new(provider)
}

/// Certificate chain and key loaded from PEM files.
pub struct Credentials {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Credentials {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_chain = CertificateDer::pem_file_iter(cert_path)
            .map_err(|e| anyhow!("{e:?}"))
            .with_context(|| format!("failed to open certificate {}", cert_path.display()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("{e:?}"))
            .with_context(|| format!("failed to parse certificate {}", cert_path.display()))?;
        if cert_chain.is_empty() {
            anyhow::bail!("no certificate found in {}", cert_path.display());
        }

        let key = PrivateKeyDer::from_pem_file(key_path)
            .map_err(|e| anyhow!("{e:?}"))
            .with_context(|| format!("failed to load private key {}", key_path.display()))?;

        Ok(Self { cert_chain, key })
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("failed to parse certificate: {e:?}"))?;
        if cert_chain.is_empty() {
            anyhow::bail!("no certificate found in PEM input");
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| anyhow!("failed to parse private key: {e:?}"))?;
        Ok(Self { cert_chain, key })
    }
}

/// Server side of a TLS 1.3 endpoint. Used by the registration listener and
/// by nodes waiting for broadcasts.
pub fn acceptor(credentials: Credentials) -> Result<TlsAcceptor> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_no_client_auth()
        .with_single_cert(credentials.cert_chain, credentials.key)
        .context("certificate and key do not form a usable server identity")?;

    // No resumption: no session cache, no tickets.
    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.send_tls13_tickets = 0;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client side trusting exactly the certificates in `trusted_pem`.
///
/// Built fresh for every target; trust anchors are never pooled.
pub fn pinned_connector(trusted_pem: &[u8]) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(trusted_pem) {
        let cert = cert.map_err(|e| anyhow!("failed to parse trusted certificate: {e:?}"))?;
        roots
            .add(cert)
            .context("trusted certificate rejected as trust anchor")?;
    }
    if roots.is_empty() {
        anyhow::bail!("no trusted certificate supplied");
    }

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.resumption = Resumption::disabled();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Name to verify the peer certificate against: the host part of `addr`.
pub fn server_name(addr: &str) -> Result<ServerName<'static>> {
    let (host, _) = split_host_port(addr).with_context(|| format!("{addr:?} is not host:port"))?;
    ServerName::try_from(host.to_string()).with_context(|| format!("invalid server name {host:?}"))
}
