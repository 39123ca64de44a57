//! Value types shared by the engine and card-server protocol plug-ins.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// PID value meaning "no ECM PID chosen yet".
pub const NO_PID: u16 = 0xffff;

/// Maximum table section length accepted from the demultiplexer.
pub const MAX_SECTION_SIZE: usize = 4096;

/// An 8-byte smart-card address (unique address or shared address).
///
/// All-zero means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CardAddress(pub [u8; 8]);

impl CardAddress {
    /// Returns true if every byte is zero.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<[u8; 8]> for CardAddress {
    fn from(value: [u8; 8]) -> Self {
        Self(value)
    }
}

impl fmt::Display for CardAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}.{:02x}.{:02x}.{:02x}.{:02x}.{:02x}.{:02x}.{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// A provider (operator) within a CA system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// 24-bit provider id.
    pub id: u32,
    /// Shared address for this provider, when the server reports one.
    pub sa: Option<CardAddress>,
}

impl ProviderInfo {
    pub fn new(id: u32) -> Self {
        Self { id, sa: None }
    }

    pub fn with_sa(id: u32, sa: CardAddress) -> Self {
        Self { id, sa: Some(sa) }
    }
}

/// A card announced by the server, either at login or later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardAnnouncement {
    pub caid: u16,
    pub card_id: u32,
    /// Unique address of the card, if known.
    pub ua: Option<CardAddress>,
    pub providers: Vec<ProviderInfo>,
}

/// Login credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Cipher the control words are meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// DVB-CSA, 8-byte keys.
    Csa,
    /// DES in ECB mode, 8-byte keys.
    Des,
    /// AES-128 in ECB mode, 16-byte keys.
    Aes128Ecb,
}

impl KeyType {
    /// Length in bytes of one control word.
    pub fn key_len(self) -> usize {
        match self {
            KeyType::Csa | KeyType::Des => 8,
            KeyType::Aes128Ecb => 16,
        }
    }
}

/// An even/odd control-word pair.
#[derive(Clone, PartialEq, Eq)]
pub struct ControlWords {
    pub key_type: KeyType,
    pub even: Bytes,
    pub odd: Bytes,
}

impl ControlWords {
    pub fn new(key_type: KeyType, even: impl Into<Bytes>, odd: impl Into<Bytes>) -> Self {
        Self {
            key_type,
            even: even.into(),
            odd: odd.into(),
        }
    }
}

// Keys never end up in logs.
impl fmt::Debug for ControlWords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlWords")
            .field("key_type", &self.key_type)
            .field("even_len", &self.even.len())
            .field("odd_len", &self.odd.len())
            .finish()
    }
}

/// A key request for one ECM section.
#[derive(Debug, Clone, Copy)]
pub struct EcmRequest<'a> {
    /// Sequence number the reply must carry.
    pub seq: u32,
    /// DVB service id the ECM belongs to.
    pub service_id: u16,
    pub caid: u16,
    pub provider_id: u32,
    /// Elementary PID that carried the ECM.
    pub pid: u16,
    pub card_id: u32,
    /// The raw ECM section.
    pub data: &'a [u8],
}

/// An EMM the per-card filter decided to forward.
#[derive(Debug, Clone, Copy)]
pub struct EmmRequest<'a> {
    pub caid: u16,
    pub provider_id: u32,
    pub card_id: u32,
    pub data: &'a [u8],
}

/// Something the server told us, decoded by the protocol plug-in.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A card became available (or was refreshed).
    CardAdded(CardAnnouncement),
    /// A card went away.
    CardRemoved { card_id: u32 },
    /// Reply to an ECM request. `keys == None` is a NOK.
    EcmReply { seq: u32, keys: Option<ControlWords> },
    /// Server-side permission to forward EMMs.
    EmmAllowed(bool),
}
