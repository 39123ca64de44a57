//! Protocol plug-in boundary for the cardclient conditional-access engine.
//!
//! The engine talks to a card server (a process that owns smart cards and
//! turns ECMs into control words) through an implementation of
//! [`CardServerProtocol`]. This crate holds everything both sides agree on:
//!
//! - [`types`]: card, provider, control word and request/reply types
//! - [`codec`]: the u16 length-prefixed framing most card servers use
//! - [`caid`]: CA system naming and card family detection
//! - [`error`]: [`ProtocolError`]
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use cardclient_protocol::{decode_frame, encode_frame};
//!
//! let frame = encode_frame(&[0x80, 0x70, 0x00]).unwrap();
//!
//! let mut buf = BytesMut::from(&frame[..]);
//! let payload = decode_frame(&mut buf).unwrap().unwrap();
//! assert_eq!(&payload[..], &[0x80, 0x70, 0x00]);
//! ```

pub mod caid;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod types;

pub use caid::{caid_name, CardType};
pub use codec::{decode_frame, decode_header, encode_frame, HEADER_SIZE, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use protocol::CardServerProtocol;
pub use types::{
    CardAddress, CardAnnouncement, ControlWords, Credentials, EcmRequest, EmmRequest, KeyType,
    ProviderInfo, ServerEvent, MAX_SECTION_SIZE, NO_PID,
};
