//! Line protocol between the coordinator and evaluated nodes.
//!
//! Registration reply: one status line, `0`, `1` or `2`.
//! Broadcast: one line per delivery, one of
//!
//! ```text
//! mixes;<name>,<public_addr>,<pubkey-hex>,<pubcert-hex>;...
//! clients;<name>,<public_addr>,<pubkey-hex>,<pubcert-hex>;...
//! epoch;
//! ```
//!
//! An empty set is sent as the bare tag (`mixes`, `clients`).

use crate::endpoint::{Category, Endpoint};

pub const MIXES_TAG: &str = "mixes";
pub const CLIENTS_TAG: &str = "clients";
pub const EPOCH_TAG: &str = "epoch";

// ── Registration status ───────────────────────────────────────────────────────

/// Reply to a single registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationStatus {
    /// Stored; the node will appear in this epoch's snapshot.
    Accepted = 0,
    /// The message could not be decoded or failed validation.
    Invalid = 1,
    /// The window for this category is closed. Retry next epoch.
    NotAccepting = 2,
}

impl RegistrationStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::Invalid),
            2 => Some(Self::NotAccepting),
            _ => None,
        }
    }

    /// Newline-terminated reply line.
    pub fn to_line(self) -> String {
        format!("{}\n", self.code())
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        Self::from_code(line.trim().parse().ok()?)
    }
}

// ── Snapshots ─────────────────────────────────────────────────────────────────

/// What a broadcast carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    MixSet,
    ClientSet,
    EpochRotate,
}

impl SnapshotKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::MixSet => MIXES_TAG,
            Self::ClientSet => CLIENTS_TAG,
            Self::EpochRotate => EPOCH_TAG,
        }
    }

    /// Category whose members are listed, if any.
    pub fn category(self) -> Option<Category> {
        match self {
            Self::MixSet => Some(Category::Mix),
            Self::ClientSet => Some(Category::Client),
            Self::EpochRotate => None,
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Build the broadcast payload (without the trailing newline).
///
/// Only endpoints of the snapshot's category are listed. The caller decides
/// the order; the registry passes them sorted by name.
pub fn snapshot_line<'a>(kind: SnapshotKind, endpoints: impl IntoIterator<Item = &'a Endpoint>) -> String {
    let Some(category) = kind.category() else {
        return format!("{EPOCH_TAG};");
    };

    let mut line = String::from(kind.tag());
    for ep in endpoints.into_iter().filter(|ep| ep.category == category) {
        line.push(';');
        line.push_str(&ep.name);
        line.push(',');
        line.push_str(&ep.public_addr);
        line.push(',');
        line.push_str(&hex::encode(ep.public_key));
        line.push(',');
        line.push_str(&hex::encode(&ep.public_cert_pem));
    }
    line
}

// ── Node-side parsing ─────────────────────────────────────────────────────────

/// One node as listed in a membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedNode {
    pub name: String,
    pub public_addr: String,
    pub public_key: [u8; 32],
    pub public_cert_pem: Vec<u8>,
}

/// A broadcast line as received by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    Mixes(Vec<AnnouncedNode>),
    Clients(Vec<AnnouncedNode>),
    EpochRotate,
}

impl Announcement {
    pub fn kind(&self) -> SnapshotKind {
        match self {
            Self::Mixes(_) => SnapshotKind::MixSet,
            Self::Clients(_) => SnapshotKind::ClientSet,
            Self::EpochRotate => SnapshotKind::EpochRotate,
        }
    }

    /// Listed nodes; empty for an epoch rotation.
    pub fn nodes(&self) -> &[AnnouncedNode] {
        match self {
            Self::Mixes(n) | Self::Clients(n) => n,
            Self::EpochRotate => &[],
        }
    }

    pub fn parse(line: &str) -> Result<Self, AnnouncementError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(';');
        let tag = parts.next().unwrap_or_default();

        match tag {
            EPOCH_TAG => Ok(Self::EpochRotate),
            MIXES_TAG => Ok(Self::Mixes(parse_nodes(parts)?)),
            CLIENTS_TAG => Ok(Self::Clients(parse_nodes(parts)?)),
            other => Err(AnnouncementError::UnknownTag(other.to_string())),
        }
    }
}

fn parse_nodes<'a>(fields: impl Iterator<Item = &'a str>) -> Result<Vec<AnnouncedNode>, AnnouncementError> {
    fields
        .filter(|f| !f.is_empty())
        .map(|field| {
            let cols: Vec<&str> = field.split(',').collect();
            let [name, addr, key, cert] = cols[..] else {
                return Err(AnnouncementError::FieldCount(cols.len()));
            };
            let key = hex::decode(key).map_err(|_| AnnouncementError::BadHex(name.to_string()))?;
            let public_key: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| AnnouncementError::BadHex(name.to_string()))?;
            let public_cert_pem =
                hex::decode(cert).map_err(|_| AnnouncementError::BadHex(name.to_string()))?;
            Ok(AnnouncedNode {
                name: name.to_string(),
                public_addr: addr.to_string(),
                public_key,
                public_cert_pem,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnouncementError {
    #[error("unknown broadcast tag {0:?}")]
    UnknownTag(String),
    #[error("node entry has {0} fields, expected 4")]
    FieldCount(usize),
    #[error("bad hex in entry for node {0:?}")]
    BadHex(String),
}
