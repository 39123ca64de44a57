//! Binding subscribed services to the client's cards.

use std::collections::{BTreeMap, BTreeSet};

use cardclient_protocol::NO_PID;
use log::debug;
use serde::Serialize;

use crate::client::ecm::{EcmPid, PidSnapshot, SectionState};
use crate::client::state::ClientState;
use crate::hooks::{DescramblerState, Notice};
use crate::service::{PrefCapidLock, ServiceDescriptor, ServiceId};

/// Protocol state of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EcmState {
    /// Looking for a working ECM PID.
    Init,
    /// An ECM PID delivered keys.
    Valid,
    /// Start over with the next ECM.
    Reset,
}

/// A service this client descrambles.
#[derive(Debug, Clone)]
pub(crate) struct ServiceBinding {
    pub service: ServiceDescriptor,
    /// CAID of the card chosen for the service.
    pub caid: u16,
    /// ECM PID that delivered keys, [`NO_PID`] if none yet.
    pub capid: u16,
    pub ecm_state: EcmState,
    pub key_state: DescramblerState,
    /// Elementary PIDs opened on the demultiplexer.
    pub epids: BTreeSet<u16>,
    pub pids: BTreeMap<u16, EcmPid>,
}

impl ServiceBinding {
    fn new(service: ServiceDescriptor, caid: u16) -> Self {
        Self {
            service,
            caid,
            capid: NO_PID,
            ecm_state: EcmState::Init,
            key_state: DescramblerState::Ready,
            epids: BTreeSet::new(),
            pids: BTreeMap::new(),
        }
    }

    fn set_sections(&mut self, state: SectionState) {
        for section in self.pids.values_mut().flat_map(|ep| ep.sections.values_mut()) {
            section.reset(state);
        }
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        BindingSnapshot {
            service: self.service.id,
            caid: self.caid,
            capid: (self.capid != NO_PID).then_some(self.capid),
            pref_capid: self.service.pref_capid,
            ecm_state: self.ecm_state,
            key_state: self.key_state,
            epids: self.epids.iter().copied().collect(),
            pids: self.pids.values().map(EcmPid::snapshot).collect(),
        }
    }
}

/// Read-only view of a service binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingSnapshot {
    pub service: ServiceId,
    pub caid: u16,
    pub capid: Option<u16>,
    pub pref_capid: u16,
    pub ecm_state: EcmState,
    #[serde(skip)]
    pub key_state: DescramblerState,
    pub epids: Vec<u16>,
    pub pids: Vec<PidSnapshot>,
}

/// CAID of the first running card that can serve a stream of `service`.
fn select_card(state: &ClientState, service: &ServiceDescriptor) -> Option<u16> {
    state
        .cards
        .iter()
        .filter(|card| card.running && card.caid != 0)
        .find(|card| {
            service
                .streams
                .iter()
                .filter(|st| {
                    service.pref_capid_lock != PrefCapidLock::Force
                        || service.pref_capid == st.pid
                })
                .any(|st| {
                    st.caids.iter().any(|c| {
                        c.enabled
                            && c.caid == card.caid
                            && (service.force_caid == 0 || service.force_caid == c.caid)
                    })
                })
        })
        .map(|card| card.caid)
}

impl ClientState {
    /// Bind `service` to a capable card, or drop its binding if no card
    /// can serve it.
    pub(crate) fn service_start(&mut self, service: ServiceDescriptor) {
        let id = service.id;
        let Some(caid) = select_card(self, &service) else {
            if self.bindings.contains_key(&id) {
                self.service_stop(id);
            }
            return;
        };

        let epids: BTreeSet<u16> = service
            .streams
            .iter()
            .filter(|st| st.caids.iter().any(|c| c.enabled && c.caid == caid))
            .map(|st| st.pid)
            .collect();
        let mux = service.mux;
        let service_name = service.name.clone();

        let reused = self.bindings.contains_key(&id);
        let binding = self.bindings.entry(id).or_insert_with(|| {
            ServiceBinding::new(service.clone(), caid)
        });

        let mut changed = !reused || binding.caid != caid;
        if reused {
            for &pid in binding.epids.difference(&epids) {
                self.notices.push(Notice::ClosePid {
                    mux: binding.service.mux,
                    pid,
                    service: id,
                });
            }
            binding.service = service;
            binding.caid = caid;
        } else {
            self.notices.push(Notice::KeyState {
                service: id,
                state: DescramblerState::Ready,
                reason: "new binding",
            });
        }

        for &pid in epids.difference(&binding.epids) {
            self.notices.push(Notice::OpenPid {
                mux,
                pid,
                service: id,
            });
        }
        if binding.epids != epids {
            changed = true;
        }
        binding.epids = epids;

        if changed {
            binding.capid = NO_PID;
            binding.ecm_state = EcmState::Init;
            debug!(
                "{}: {} {}using card server {}",
                self.name,
                service_name,
                if reused { "re" } else { "" },
                self.config.display_name()
            );
        }
    }

    /// Drop the binding of `service` and close its PIDs.
    pub(crate) fn service_stop(&mut self, service: ServiceId) {
        let Some(binding) = self.bindings.remove(&service) else {
            return;
        };
        for &pid in &binding.epids {
            self.notices.push(Notice::ClosePid {
                mux: binding.service.mux,
                pid,
                service,
            });
        }
        debug!(
            "{}: Stopped descrambling service \"{}\"",
            self.name, binding.service.name
        );

        if self.bindings.is_empty() {
            if let Some(frame) = self.protocol.on_idle() {
                self.writer.enqueue(frame);
            }
        }
    }

    /// Forget every section of `service` and start over.
    pub(crate) fn ecm_reset(&mut self, service: ServiceId) {
        let Some(binding) = self.bindings.get_mut(&service) else {
            return;
        };
        binding.key_state = DescramblerState::Ready;
        self.notices.push(Notice::KeyState {
            service,
            state: DescramblerState::Ready,
            reason: "reset",
        });
        binding.set_sections(SectionState::Unknown);
        binding.ecm_state = EcmState::Reset;
    }

    /// Stop requesting keys for `service`.
    pub(crate) fn ecm_idle(&mut self, service: ServiceId) {
        let Some(binding) = self.bindings.get_mut(&service) else {
            return;
        };
        binding.set_sections(SectionState::Idle);
        binding.ecm_state = EcmState::Reset;
        if binding.key_state != DescramblerState::Idle {
            binding.key_state = DescramblerState::Idle;
            self.notices.push(Notice::KeyState {
                service,
                state: DescramblerState::Idle,
                reason: "idle",
            });
        }
    }
}
