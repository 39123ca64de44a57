//! Conditional-access card client engine.
//!
//! A [`Client`] keeps one session to a card server alive, learns which
//! smart cards the server offers, turns ECM sections of the services bound
//! to it into key requests and hands the returned control words to the
//! descrambling pipeline. EMM sections are filtered per card and forwarded
//! so the cards stay entitled.
//!
//! The wire format is supplied by the host as a
//! [`CardServerProtocol`](cardclient_protocol::CardServerProtocol)
//! implementation; the engine owns the socket, the retry policy and the
//! ECM state machine.
//!
//! ```no_run
//! # async fn run(protocol: Box<dyn cardclient::CardServerProtocol>) -> Result<(), Box<dyn std::error::Error>> {
//! use std::path::Path;
//!
//! use cardclient::{load_config, Client, Collaborators};
//!
//! let config = load_config(Path::new("cardclient.toml"))?.remove(0);
//! let client = Client::new(config, protocol, Collaborators::detached())?;
//! client.conf_changed().await;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
pub mod emm;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod registry;
pub mod service;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cardclient_protocol::{
    caid_name, CardAddress, CardAnnouncement, CardServerProtocol, CardType, ControlWords,
    Credentials, KeyType, ProviderInfo, ServerEvent,
};
pub use client::{
    BindingSnapshot, CardSnapshot, Client, ClientBuilder, ClientStatus, EcmState, PidSnapshot,
    SectionSnapshot, SectionState,
};
pub use config::{load_config, load_from_env, parse_config, ClientConfig};
pub use emm::{AddressFilter, DefaultEmmFilters, EmmFilter, EmmFilterFactory, EmmForward};
pub use error::{ClientError, ConfigError};
pub use hooks::{
    Collaborators, DemuxControl, DescramblerSink, DescramblerState, Detached, Resolution,
    ServiceStore,
};
pub use logging::init_logging;
pub use service::{
    CaDescriptor, ElementaryStream, MuxId, PrefCapidLock, ServiceDescriptor, ServiceId,
};
pub use transport::{BoxedStream, Connector, ServerStream, TcpConnector};
