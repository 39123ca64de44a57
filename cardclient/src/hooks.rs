//! Collaborators the engine reports to.
//!
//! All calls are one-way. The engine collects them while it holds the
//! client lock and delivers them after releasing it, so implementations may
//! call back into the [`Client`](crate::Client).

use std::sync::Arc;
use std::time::Duration;

use cardclient_protocol::ControlWords;

use crate::service::{MuxId, ServiceId};

/// Key state of a service binding, as reported to the descrambler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescramblerState {
    /// Waiting for keys.
    Ready,
    /// Keys are flowing.
    Resolved,
    /// The card server denied access to the service.
    Forbidden,
    /// Another source already descrambles the service; this client stays quiet.
    Idle,
}

/// Details of a successful key resolution, for UIs and statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub caid: u16,
    pub provider_id: u32,
    pub caid_name: String,
    pub pid: u16,
    /// Time between sending the request and receiving the keys.
    pub delay: Duration,
    /// `host:port` of the card server.
    pub resolver: String,
    /// Protocol tag.
    pub protocol: String,
    /// Configured client name.
    pub client: String,
}

/// The descrambling pipeline.
pub trait DescramblerSink: Send + Sync {
    fn report_key_state(&self, service: ServiceId, state: DescramblerState, reason: &str);

    fn deliver_keys(&self, service: ServiceId, keys: &ControlWords);

    fn notify_resolution(&self, service: ServiceId, resolution: &Resolution);

    /// Ask the demultiplexer to forget the last section it handed out for
    /// this service, so the next one is delivered even if unchanged.
    fn flush_table_data(&self, _service: ServiceId) {}

    /// Returns true if some descrambler already has working keys for the
    /// service. Queried with the client lock held; must not call back.
    fn service_resolved(&self, _service: ServiceId) -> bool {
        false
    }
}

/// Table filters on the tuner.
pub trait DemuxControl: Send + Sync {
    fn open_pid(&self, mux: MuxId, pid: u16, service: ServiceId);

    fn close_pid(&self, mux: MuxId, pid: u16, service: ServiceId);

    fn open_emm(&self, mux: MuxId, caid: u16);

    fn close_emm(&self, mux: MuxId, caid: u16);
}

/// Persistence of the per-service preferred ECM PID.
pub trait ServiceStore: Send + Sync {
    fn save_preferred_pid(&self, service: ServiceId, pid: u16);
}

/// Collaborator that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl DescramblerSink for Detached {
    fn report_key_state(&self, _: ServiceId, _: DescramblerState, _: &str) {}
    fn deliver_keys(&self, _: ServiceId, _: &ControlWords) {}
    fn notify_resolution(&self, _: ServiceId, _: &Resolution) {}
}

impl DemuxControl for Detached {
    fn open_pid(&self, _: MuxId, _: u16, _: ServiceId) {}
    fn close_pid(&self, _: MuxId, _: u16, _: ServiceId) {}
    fn open_emm(&self, _: MuxId, _: u16) {}
    fn close_emm(&self, _: MuxId, _: u16) {}
}

impl ServiceStore for Detached {
    fn save_preferred_pid(&self, _: ServiceId, _: u16) {}
}

/// The set of collaborators a client reports to.
#[derive(Clone)]
pub struct Collaborators {
    pub descrambler: Arc<dyn DescramblerSink>,
    pub demux: Arc<dyn DemuxControl>,
    pub store: Arc<dyn ServiceStore>,
}

impl Collaborators {
    pub fn new(
        descrambler: Arc<dyn DescramblerSink>,
        demux: Arc<dyn DemuxControl>,
        store: Arc<dyn ServiceStore>,
    ) -> Self {
        Self {
            descrambler,
            demux,
            store,
        }
    }

    /// Collaborators that ignore every call.
    pub fn detached() -> Self {
        Self {
            descrambler: Arc::new(Detached),
            demux: Arc::new(Detached),
            store: Arc::new(Detached),
        }
    }

    pub(crate) fn dispatch(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::KeyState {
                    service,
                    state,
                    reason,
                } => self.descrambler.report_key_state(service, state, reason),
                Notice::Keys { service, keys } => self.descrambler.deliver_keys(service, &keys),
                Notice::Resolved {
                    service,
                    resolution,
                } => self.descrambler.notify_resolution(service, &resolution),
                Notice::FlushTables { service } => self.descrambler.flush_table_data(service),
                Notice::OpenPid { mux, pid, service } => self.demux.open_pid(mux, pid, service),
                Notice::ClosePid { mux, pid, service } => self.demux.close_pid(mux, pid, service),
                Notice::OpenEmm { mux, caid } => self.demux.open_emm(mux, caid),
                Notice::CloseEmm { mux, caid } => self.demux.close_emm(mux, caid),
                Notice::SavePreferredPid { service, pid } => {
                    self.store.save_preferred_pid(service, pid)
                }
            }
        }
    }
}

/// A collaborator call recorded under the client lock.
#[derive(Debug, Clone)]
pub(crate) enum Notice {
    KeyState {
        service: ServiceId,
        state: DescramblerState,
        reason: &'static str,
    },
    Keys {
        service: ServiceId,
        keys: ControlWords,
    },
    Resolved {
        service: ServiceId,
        resolution: Resolution,
    },
    FlushTables {
        service: ServiceId,
    },
    OpenPid {
        mux: MuxId,
        pid: u16,
        service: ServiceId,
    },
    ClosePid {
        mux: MuxId,
        pid: u16,
        service: ServiceId,
    },
    OpenEmm {
        mux: MuxId,
        caid: u16,
    },
    CloseEmm {
        mux: MuxId,
        caid: u16,
    },
    SavePreferredPid {
        service: ServiceId,
        pid: u16,
    },
}
