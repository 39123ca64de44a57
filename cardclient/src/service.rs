//! What the engine needs to know about a subscribed service.
//!
//! The host owns its services; the engine only keeps a snapshot of the
//! parts that matter for descrambling and refers back by [`ServiceId`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Host-assigned identifier of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u32);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc#{}", self.0)
    }
}

/// Host-assigned identifier of a mux (transport stream on a tuner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MuxId(pub u32);

impl fmt::Display for MuxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mux#{}", self.0)
    }
}

/// A CA descriptor attached to an elementary stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaDescriptor {
    pub caid: u16,
    /// Provider id, 0 when the descriptor does not name one.
    pub provider_id: u32,
    /// Cleared when the user disabled this CAID for the service.
    pub enabled: bool,
}

impl CaDescriptor {
    pub fn new(caid: u16, provider_id: u32) -> Self {
        Self {
            caid,
            provider_id,
            enabled: true,
        }
    }
}

/// One elementary stream of a service, as far as CA is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementaryStream {
    pub pid: u16,
    /// True for CA (ECM) streams.
    pub is_ca: bool,
    pub caids: Vec<CaDescriptor>,
}

impl ElementaryStream {
    /// A CA stream carrying ECMs for the given descriptors.
    pub fn ecm(pid: u16, caids: Vec<CaDescriptor>) -> Self {
        Self {
            pid,
            is_ca: true,
            caids,
        }
    }
}

/// How strongly the user pinned the preferred ECM PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrefCapidLock {
    /// The engine may replace the preferred PID.
    #[default]
    Off,
    /// Keep the preferred PID, but fall back to others.
    On,
    /// Only ever use the preferred PID.
    Force,
}

/// Snapshot of a service handed to [`Client::service_start`].
///
/// [`Client::service_start`]: crate::Client::service_start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    /// DVB service id.
    pub sid: u16,
    pub name: String,
    pub mux: MuxId,
    pub streams: Vec<ElementaryStream>,
    /// Remembered working ECM PID, 0 if none.
    pub pref_capid: u16,
    pub pref_capid_lock: PrefCapidLock,
    /// Only use this CAID, 0 for any.
    pub force_caid: u16,
}

impl ServiceDescriptor {
    pub fn new(id: ServiceId, sid: u16, name: impl Into<String>, mux: MuxId) -> Self {
        Self {
            id,
            sid,
            name: name.into(),
            mux,
            streams: Vec::new(),
            pref_capid: 0,
            pref_capid_lock: PrefCapidLock::Off,
            force_caid: 0,
        }
    }

    pub fn with_stream(mut self, stream: ElementaryStream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Find the elementary stream on `pid`.
    pub fn stream(&self, pid: u16) -> Option<&ElementaryStream> {
        self.streams.iter().find(|st| st.pid == pid)
    }
}
