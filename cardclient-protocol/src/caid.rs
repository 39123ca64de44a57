//! CA system identification based on the CA system id (CAID).
//!
//! CAIDs are allocated by DVB in blocks; most vendors own a whole
//! `0xNN00` block, a few own single values. The table below is matched in
//! order with `caid & mask == value`.
//!
//! ref: https://www.dvbservices.com/identifiers/ca_system_id

use serde::{Deserialize, Serialize};

/// (name, value, mask)
const CAID_NAMES: &[(&str, u16, u16)] = &[
    ("Seca", 0x0100, 0xff00),
    ("CCETT", 0x0200, 0xff00),
    ("Deutsche Telekom", 0x0300, 0xff00),
    ("Eurodec", 0x0400, 0xff00),
    ("Viaccess", 0x0500, 0xff00),
    ("Irdeto", 0x0600, 0xff00),
    ("Jerroldgi", 0x0700, 0xff00),
    ("Matra", 0x0800, 0xff00),
    ("NDS", 0x0900, 0xff00),
    ("Nokia", 0x0A00, 0xff00),
    ("Conax", 0x0B00, 0xff00),
    ("NTL", 0x0C00, 0xff00),
    ("CryptoWorks", 0x0D00, 0xff80),
    ("CryptoWorks ICE", 0x0D80, 0xff80),
    ("PowerVu", 0x0E00, 0xff00),
    ("Sony", 0x0F00, 0xff00),
    ("Tandberg", 0x1000, 0xff00),
    ("Thompson", 0x1100, 0xff00),
    ("TV-Com", 0x1200, 0xff00),
    ("HPT", 0x1300, 0xff00),
    ("HRT", 0x1400, 0xff00),
    ("IBM", 0x1500, 0xff00),
    ("Nera", 0x1600, 0xff00),
    ("BetaCrypt", 0x1700, 0xff00),
    ("NagraVision", 0x1800, 0xff00),
    ("Titan", 0x1900, 0xff00),
    ("Telefonica", 0x2000, 0xff00),
    ("Stentor", 0x2100, 0xff00),
    ("Tadiran Scopus", 0x2200, 0xff00),
    ("BARCO AS", 0x2300, 0xff00),
    ("StarGuide", 0x2400, 0xff00),
    ("Mentor", 0x2500, 0xff00),
    ("EBU", 0x2600, 0xff00),
    ("GI", 0x4700, 0xff00),
    ("Telemann", 0x4800, 0xff00),
    ("DGCrypt", 0x4abf, 0xffff),
    ("StreamGuard", 0x4ad2, 0xffff),
    ("DRECrypt", 0x4ae0, 0xffff),
    ("DRECrypt2", 0x4ae1, 0xffff),
    ("Bulcrypt", 0x4aee, 0xffff),
    ("TongFang", 0x4b00, 0xff00),
    ("Griffin", 0x5500, 0xffe0),
    ("Bulcrypt", 0x5581, 0xffff),
    ("Verimatrix", 0x5601, 0xffff),
    ("DRECrypt", 0x7be0, 0xffff),
    ("DRECrypt2", 0x7be1, 0xffff),
];

/// Look up the vendor name for a CAID.
///
/// # Example
/// ```
/// use cardclient_protocol::caid::caid_name;
///
/// assert_eq!(caid_name(0x0B00), "Conax");
/// assert_eq!(caid_name(0x0D96), "CryptoWorks ICE");
/// assert_eq!(caid_name(0xABCD), "0xabcd");
/// ```
pub fn caid_name(caid: u16) -> String {
    CAID_NAMES
        .iter()
        .find(|(_, value, mask)| caid & mask == *value)
        .map(|(name, _, _)| name.to_string())
        .unwrap_or_else(|| format!("0x{:x}", caid))
}

/// Reverse lookup: vendor name to CAID, falling back to parsing a number
/// (`0x` prefix for hex).
pub fn name_to_caid(name: &str) -> Option<u16> {
    if let Some((_, value, _)) = CAID_NAMES.iter().find(|(n, _, _)| *n == name) {
        return Some(*value);
    }
    match name.strip_prefix("0x").or_else(|| name.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => name.parse().ok(),
    }
}

/// Card family, used to pick the EMM filter and to decide whether EMM
/// forwarding can be verified for a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardType {
    Unknown,
    Irdeto,
    Viaccess,
    Conax,
    Seca,
    Dre,
    Nagra,
    Nds,
    CryptoWorks,
    Bulcrypt,
    StreamGuard,
    Griffin,
}

impl CardType {
    /// Detect the card family from its CAID.
    pub fn detect(caid: u16) -> Self {
        match caid {
            0x4ad2 => return CardType::StreamGuard,
            0x5581 | 0x4aee => return CardType::Bulcrypt,
            0x5500..=0x551a => return CardType::Griffin,
            _ => {}
        }

        match caid >> 8 {
            0x17 | 0x06 => CardType::Irdeto,
            0x05 => CardType::Viaccess,
            0x0b => CardType::Conax,
            0x01 => CardType::Seca,
            0x4a => CardType::Dre,
            0x18 => CardType::Nagra,
            0x09 => CardType::Nds,
            0x0d => CardType::CryptoWorks,
            _ => CardType::Unknown,
        }
    }

    /// Returns true if this is a recognised CA system.
    pub fn is_known(self) -> bool {
        self != CardType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caid_name_masks() {
        assert_eq!(caid_name(0x0500), "Viaccess");
        assert_eq!(caid_name(0x0604), "Irdeto");
        assert_eq!(caid_name(0x0D00), "CryptoWorks");
        assert_eq!(caid_name(0x0D7F), "CryptoWorks");
        assert_eq!(caid_name(0x0D80), "CryptoWorks ICE");
        assert_eq!(caid_name(0x5510), "Griffin");
        assert_eq!(caid_name(0x5581), "Bulcrypt");
        assert_eq!(caid_name(0x4ae1), "DRECrypt2");
        assert_eq!(caid_name(0x4a30), "0x4a30");
    }

    #[test]
    fn test_name_to_caid() {
        assert_eq!(name_to_caid("Conax"), Some(0x0B00));
        assert_eq!(name_to_caid("0x1801"), Some(0x1801));
        assert_eq!(name_to_caid("2816"), Some(0x0B00));
        assert_eq!(name_to_caid("nonsense"), None);
    }

    #[test]
    fn test_detect_card_type() {
        assert_eq!(CardType::detect(0x0B00), CardType::Conax);
        assert_eq!(CardType::detect(0x0604), CardType::Irdeto);
        assert_eq!(CardType::detect(0x1702), CardType::Irdeto);
        assert_eq!(CardType::detect(0x4ad2), CardType::StreamGuard);
        assert_eq!(CardType::detect(0x4aee), CardType::Bulcrypt);
        assert_eq!(CardType::detect(0x4ae0), CardType::Dre);
        assert_eq!(CardType::detect(0x5501), CardType::Griffin);
        assert_eq!(CardType::detect(0x551b), CardType::Unknown);
        assert_eq!(CardType::detect(0x2600), CardType::Unknown);
        assert!(!CardType::detect(0x2600).is_known());
        assert!(CardType::detect(0x0100).is_known());
    }
}
