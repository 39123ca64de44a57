//! EMM filtering: deciding which entitlement messages concern a card.
//!
//! Every card gets its own [`EmmFilter`], created by an
//! [`EmmFilterFactory`] from the card's CAID. The default
//! [`AddressFilter`] matches unique, shared and global addressing for the
//! card families whose EMMs can be judged one section at a time.

use bytes::Bytes;
use cardclient_protocol::{caid_name, CardAddress, CardType, ProviderInfo};
use log::trace;

use crate::logging::hexdump;
use crate::service::MuxId;

/// Number of recently forwarded EMMs remembered per card.
const EMM_CACHE_SIZE: usize = 32;

/// What a filter knows about the card it works for.
#[derive(Debug, Clone, Copy)]
pub struct CardContext<'a> {
    pub caid: u16,
    pub card_id: u32,
    /// Unique address, all-zero when unknown.
    pub ua: CardAddress,
    pub providers: &'a [ProviderInfo],
}

/// An EMM to send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmmForward {
    /// Provider the EMM was matched against, 0 for card-wide EMMs.
    pub provider_id: u32,
    pub data: Bytes,
}

/// Per-card EMM filter.
pub trait EmmFilter: Send {
    /// Inspect one EMM section received on `mux` and return what should be
    /// forwarded.
    fn filter(&mut self, card: &CardContext<'_>, data: &[u8], mux: MuxId) -> Vec<EmmForward>;
}

/// Creates the EMM filter for a newly discovered card.
pub trait EmmFilterFactory: Send + Sync {
    fn create(&self, caid: u16) -> Box<dyn EmmFilter>;
}

impl<F> EmmFilterFactory for F
where
    F: Fn(u16) -> Box<dyn EmmFilter> + Send + Sync,
{
    fn create(&self, caid: u16) -> Box<dyn EmmFilter> {
        self(caid)
    }
}

/// Factory handing out [`AddressFilter`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEmmFilters;

impl EmmFilterFactory for DefaultEmmFilters {
    fn create(&self, caid: u16) -> Box<dyn EmmFilter> {
        Box::new(AddressFilter::new(caid))
    }
}

/// Address-matching EMM filter with duplicate suppression.
#[derive(Debug)]
pub struct AddressFilter {
    card_type: CardType,
    cache: EmmCache,
}

impl AddressFilter {
    pub fn new(caid: u16) -> Self {
        Self {
            card_type: CardType::detect(caid),
            cache: EmmCache::default(),
        }
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Returns `Some(provider_id)` if the EMM is addressed to the card.
    fn address_match(&self, card: &CardContext<'_>, data: &[u8]) -> Option<u32> {
        let ua = card.ua.as_bytes();
        let table_id = *data.first()?;

        match self.card_type {
            CardType::Conax => {
                if data.len() < 10 || table_id != 0x82 {
                    return None;
                }
                match_provider(card.providers, |sa| data[3..10] == sa[1..8])
            }
            CardType::Irdeto => {
                let mode = *data.get(3)? >> 3;
                let len = (data[3] & 0x07) as usize;
                let addr = data.get(4..4 + len)?;
                let matches = |target: &[u8; 8]| {
                    mode == target[4] && (len == 0 || target.get(5..5 + len) == Some(addr))
                };
                if mode & 0x10 != 0 {
                    matches(ua).then_some(0)
                } else {
                    match_provider(card.providers, matches)
                }
            }
            CardType::Seca => match table_id {
                0x82 if data.len() >= 9 => (data[3..9] == ua[2..8]).then_some(0),
                0x84 if data.len() >= 8 => {
                    match_provider(card.providers, |sa| data[5..8] == sa[5..8])
                }
                0x83 => Some(0),
                _ => None,
            },
            CardType::Dre => match table_id {
                0x87 if data.len() >= 7 => (data[3..7] == ua[4..8]).then_some(0),
                0x86 => {
                    let addr = data.get(40..44)?;
                    match_provider(card.providers, |sa| addr == &sa[4..8])
                }
                _ => None,
            },
            CardType::Nagra => match table_id {
                0x83 => {
                    let d = data.get(3..8)?;
                    let serial = [d[2], d[1], d[0], d[3]];
                    let n = if d[4] == 0x10 { 3 } else { 4 };
                    (serial[..n] == ua[4..4 + n]).then_some(0)
                }
                0x82 => Some(0),
                _ => None,
            },
            CardType::Nds => {
                let b = *data.get(3)?;
                let serials = ((b >> 4) & 3) as usize + 1;
                match (b & 0xc0) >> 6 {
                    0 => Some(0),
                    kind @ (1 | 2) => {
                        let n = 5 - kind as usize;
                        (0..serials)
                            .any(|i| data.get(4 + i * 4..4 + i * 4 + n) == Some(&ua[4..4 + n]))
                            .then_some(0)
                    }
                    _ => None,
                }
            }
            CardType::Bulcrypt => {
                if data.len() < 10 {
                    return None;
                }
                match table_id {
                    0x82 | 0x8a | 0x85 | 0x8b => (data[3..6] == ua[2..5]).then_some(0),
                    0x84 => (data[3..5] == ua[2..4]).then_some(0),
                    _ => None,
                }
            }
            CardType::Griffin => match table_id {
                0x82 | 0x83 => {
                    let addr = data.get(3..7)?;
                    match_provider(card.providers, |sa| addr == &sa[0..4])
                }
                _ => None,
            },
            // Families whose EMMs need multi-section reassembly.
            _ => None,
        }
    }
}

impl EmmFilter for AddressFilter {
    fn filter(&mut self, card: &CardContext<'_>, data: &[u8], mux: MuxId) -> Vec<EmmForward> {
        trace!(
            "emm filter: {} - len {} {}",
            caid_name(card.caid),
            data.len(),
            mux
        );
        hexdump("emm", data);

        let Some(provider_id) = self.address_match(card, data) else {
            return Vec::new();
        };

        let crc = crc32_mpeg2(data);
        if self.cache.contains(crc) {
            trace!("emm filter: already forwarded (crc {:08x})", crc);
            return Vec::new();
        }
        self.cache.insert(crc);

        vec![EmmForward {
            provider_id,
            data: Bytes::copy_from_slice(data),
        }]
    }
}

fn match_provider(
    providers: &[ProviderInfo],
    mut pred: impl FnMut(&[u8; 8]) -> bool,
) -> Option<u32> {
    providers
        .iter()
        .find(|p| pred(p.sa.unwrap_or_default().as_bytes()))
        .map(|p| p.id)
}

/// Ring of recently forwarded EMM checksums.
#[derive(Debug, Default)]
struct EmmCache {
    entries: Vec<u32>,
    write: usize,
}

impl EmmCache {
    fn contains(&self, crc: u32) -> bool {
        self.entries.contains(&crc)
    }

    fn insert(&mut self, crc: u32) {
        if self.entries.len() < EMM_CACHE_SIZE {
            self.entries.push(crc);
        } else {
            self.entries[self.write] = crc;
        }
        self.write = (self.write + 1) % EMM_CACHE_SIZE;
    }
}

/// CRC32 with the MPEG-2 polynomial (0x04C11DB7), initial value 0xFFFFFFFF.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                if crc & 0x8000_0000 != 0 {
                    crc = (crc << 1) ^ 0x04C1_1DB7;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    data.iter().fold(0xFFFF_FFFF, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) ^ b as u32) & 0xFF) as usize]
    })
}
