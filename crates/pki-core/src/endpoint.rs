//! Endpoint records — what a node submits to register for an epoch.
//!
//! `RegistrationMessage` is the on-wire JSON form. It is decoded in full and
//! then validated into an `Endpoint`; nothing is stored until both steps
//! succeed, so the registry never holds a partial record.

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

/// Largest registration line the listener will read, newline included.
pub const MAX_REGISTRATION_BYTES: usize = 64 * 1024;

// ── Category ──────────────────────────────────────────────────────────────────

/// The role a node declares for the upcoming epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    /// Relay in the evaluated mix network.
    Mix = 0,
    /// Traffic originator / recipient.
    Client = 1,
}

impl Category {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Mix),
            1 => Some(Self::Client),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mix => "mix",
            Self::Client => "client",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Wire message ──────────────────────────────────────────────────────────────

/// One registration as sent by a node: a single JSON object on one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    /// 0 = mix, 1 = client. Anything else is rejected during validation.
    pub category: u8,
    pub name: String,
    pub public_addr: String,
    /// Hex-encoded 32-byte key.
    pub public_key: String,
    /// PEM, passed through to other nodes untouched.
    pub public_cert: String,
    /// `host:port` the coordinator dials for broadcast delivery.
    pub contact_addr: String,
    /// PEM certificate the coordinator trusts when dialing `contact_addr`.
    pub contact_cert: String,
}

impl RegistrationMessage {
    /// Encode as a newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, RegistrationError> {
        let mut line = serde_json::to_string(self).map_err(RegistrationError::Encode)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line. Trailing whitespace (the newline) is ignored.
    pub fn from_line(line: &str) -> Result<Self, RegistrationError> {
        serde_json::from_str(line.trim_end()).map_err(RegistrationError::Decode)
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// A validated registration, as stored in the node registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub category: Category,
    /// Registry key. Re-registering under the same name overwrites.
    pub name: String,
    /// Address other nodes use during the protocol run.
    pub public_addr: String,
    /// Key material of the evaluated protocol. Opaque here.
    pub public_key: [u8; 32],
    pub public_cert_pem: Vec<u8>,
    pub contact_addr: String,
    /// Trusted on first use, for this epoch only.
    pub contact_cert_pem: Vec<u8>,
}

impl TryFrom<RegistrationMessage> for Endpoint {
    type Error = RegistrationError;

    fn try_from(msg: RegistrationMessage) -> Result<Self, Self::Error> {
        let category =
            Category::from_u8(msg.category).ok_or(RegistrationError::UnknownCategory(msg.category))?;

        if msg.name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if msg.public_addr.trim().is_empty() {
            return Err(RegistrationError::EmptyPublicAddr);
        }
        if has_reserved(&msg.name) {
            return Err(RegistrationError::ReservedCharacter("name"));
        }
        if has_reserved(&msg.public_addr) {
            return Err(RegistrationError::ReservedCharacter("public_addr"));
        }

        let key_bytes =
            hex::decode(&msg.public_key).map_err(|_| RegistrationError::PublicKeyNotHex)?;
        let public_key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| RegistrationError::PublicKeyLength(key_bytes.len()))?;

        split_host_port(&msg.contact_addr)
            .ok_or_else(|| RegistrationError::BadContactAddr(msg.contact_addr.clone()))?;

        let contact_cert_pem = msg.contact_cert.into_bytes();
        if first_certificate(&contact_cert_pem).is_none() {
            return Err(RegistrationError::BadContactCert);
        }

        Ok(Self {
            category,
            name: msg.name,
            public_addr: msg.public_addr,
            public_key,
            public_cert_pem: msg.public_cert.into_bytes(),
            contact_addr: msg.contact_addr,
            contact_cert_pem,
        })
    }
}

/// Characters that delimit entries and fields of a broadcast line.
const RESERVED: [char; 4] = [';', ',', '\r', '\n'];

fn has_reserved(field: &str) -> bool {
    field.contains(RESERVED)
}

/// Split `host:port` into its parts. IPv6 literals must be bracketed.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None => host,
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// First certificate in a PEM bundle, if any parses.
pub fn first_certificate(pem: &[u8]) -> Option<CertificateDer<'static>> {
    CertificateDer::pem_slice_iter(pem).next()?.ok()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("malformed registration message: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode registration message: {0}")]
    Encode(serde_json::Error),
    #[error("unknown category value {0}")]
    UnknownCategory(u8),
    #[error("node name is empty")]
    EmptyName,
    #[error("public address is empty")]
    EmptyPublicAddr,
    #[error("{0} contains a broadcast delimiter")]
    ReservedCharacter(&'static str),
    #[error("public key is not valid hex")]
    PublicKeyNotHex,
    #[error("public key must be 32 bytes, got {0}")]
    PublicKeyLength(usize),
    #[error("contact address {0:?} is not host:port")]
    BadContactAddr(String),
    #[error("contact certificate holds no PEM certificate")]
    BadContactCert,
}
