//! ECM sections and the request/reply state machine.

use std::collections::BTreeMap;

use cardclient_protocol::{caid_name, ControlWords, EcmRequest, MAX_SECTION_SIZE, NO_PID};
use log::{debug, error, trace, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::client::binding::{EcmState, ServiceBinding};
use crate::client::state::{forward_emms, ClientState};
use crate::hooks::{DescramblerState, Notice, Resolution};
use crate::logging::hexdump;
use crate::service::{PrefCapidLock, ServiceId};

/// Key state of one ECM section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SectionState {
    Unknown,
    Pending,
    Resolved,
    Forbidden,
    Idle,
}

/// Request state of one ECM section.
#[derive(Debug, Clone)]
pub(crate) struct Section {
    pub index: u8,
    pub state: SectionState,
    /// Last payload sent, for de-duplication.
    pub data: Vec<u8>,
    pub caid: u16,
    pub provider_id: u32,
    pub pid: u16,
    pub nok: u8,
    pub seq: u32,
    pub requested_at: Option<Instant>,
    pub pending: bool,
    pub resolved: bool,
}

impl Section {
    fn new(index: u8) -> Self {
        Self {
            index,
            state: SectionState::Unknown,
            data: Vec::new(),
            caid: 0,
            provider_id: 0,
            pid: 0,
            nok: 0,
            seq: 0,
            requested_at: None,
            pending: false,
            resolved: false,
        }
    }

    /// Forget the payload and the failure history.
    pub fn reset(&mut self, state: SectionState) {
        self.state = state;
        self.data.clear();
        self.nok = 0;
        self.pending = false;
        self.resolved = false;
    }

    /// Drop the outstanding request so the next ECM is sent again.
    /// The failure count and a Forbidden or Idle verdict survive.
    pub fn forget_request(&mut self) {
        self.data.clear();
        self.pending = false;
        self.resolved = false;
        if self.state == SectionState::Pending {
            self.state = SectionState::Unknown;
        }
    }

    fn snapshot(&self) -> SectionSnapshot {
        SectionSnapshot {
            index: self.index,
            state: self.state,
            nok: self.nok,
            seq: self.seq,
            pending: self.pending,
            resolved: self.resolved,
        }
    }
}

/// Sections seen on one ECM PID.
#[derive(Debug, Clone)]
pub(crate) struct EcmPid {
    pub pid: u16,
    pub last_section: u8,
    pub sections: BTreeMap<u8, Section>,
}

impl EcmPid {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            last_section: 0,
            sections: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> PidSnapshot {
        PidSnapshot {
            pid: self.pid,
            last_section: self.last_section,
            sections: self.sections.values().map(Section::snapshot).collect(),
        }
    }
}

/// Read-only view of an ECM section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionSnapshot {
    pub index: u8,
    pub state: SectionState,
    pub nok: u8,
    pub seq: u32,
    pub pending: bool,
    pub resolved: bool,
}

/// Read-only view of an ECM PID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PidSnapshot {
    pub pid: u16,
    pub last_section: u8,
    pub sections: Vec<SectionSnapshot>,
}

/// Is this table id an ECM for `caid`?
fn is_ecm(caid: u16, table_id: u8) -> bool {
    table_id == 0x80 || table_id == 0x81 || (caid == 0x4a30 && table_id == 0x50)
}

/// Section number and last section number of an ECM.
fn section_index(caid: u16, data: &[u8]) -> Option<(u8, u8)> {
    if caid >> 8 == 0x06 {
        // Irdeto splits ECMs into numbered sections.
        Some((*data.get(4)?, *data.get(5)?))
    } else if caid == 0x0e00 {
        Some((data[0] & 1, 0))
    } else {
        Some((0, 0))
    }
}

/// The preferred PID is only kept if a running card can serve its stream.
fn preferred_pid_valid(state: &ClientState, binding: &ServiceBinding) -> bool {
    let Some(stream) = binding.service.stream(binding.service.pref_capid) else {
        return false;
    };
    stream.is_ca
        && stream
            .caids
            .iter()
            .any(|c| state.cards.capable(c.caid, c.provider_id).is_some())
}

impl ClientState {
    /// Handle a table section received on one of a binding's PIDs.
    pub(crate) fn table_input(&mut self, service: ServiceId, pid: u16, data: &[u8]) {
        if data.is_empty() || data.len() > MAX_SECTION_SIZE {
            return;
        }
        let name = self.name.clone();

        let Some(binding) = self.bindings.get(&service) else {
            return;
        };
        if binding.key_state == DescramblerState::Idle {
            return;
        }

        let pref_valid = binding.ecm_state == EcmState::Init
            && binding.service.pref_capid_lock != PrefCapidLock::Off
            && !binding.pids.contains_key(&pid)
            && preferred_pid_valid(self, binding);

        let Some(binding) = self.bindings.get_mut(&service) else {
            return;
        };

        if binding.ecm_state == EcmState::Reset {
            binding.pids.clear();
            binding.ecm_state = EcmState::Init;
            binding.capid = NO_PID;
            binding.service.pref_capid = 0;
            debug!(
                "{}: Reset after unexpected or no reply for service \"{}\"",
                name, binding.service.name
            );
        }

        if !binding.pids.contains_key(&pid) {
            if binding.ecm_state == EcmState::Init {
                debug!("{}: ECM state INIT", name);
                let lock = binding.service.pref_capid_lock;
                if lock != PrefCapidLock::Off && binding.service.pref_capid != 0 && !pref_valid {
                    debug!(
                        "{}: Invalid preferred ECM (PID {}) found for service \"{}\"",
                        name, binding.service.pref_capid, binding.service.name
                    );
                    binding.service.pref_capid = 0;
                }
                let pref = binding.service.pref_capid;
                if pref == pid || pref == 0 || lock == PrefCapidLock::Off {
                    binding.pids.insert(pid, EcmPid::new(pid));
                    debug!(
                        "{}: Insert {} ECM (PID {}) for service \"{}\"",
                        name,
                        if pref != 0 { "preferred" } else { "new" },
                        pid,
                        binding.service.name
                    );
                }
            }
            if !binding.pids.contains_key(&pid) {
                return;
            }
        }

        let Some(stream) = binding.service.stream(pid) else {
            return;
        };
        let Some((caid, provider_id, card_id)) = stream.caids.iter().find_map(|c| {
            self.cards
                .capable(c.caid, c.provider_id)
                .map(|card| (c.caid, c.provider_id, card.card_id))
        }) else {
            return;
        };

        let table_id = data[0];
        if !is_ecm(caid, table_id) {
            if self.forward_emm && (0x82..=0x92).contains(&table_id) {
                trace!(
                    "{}: sending EMM for {:04X}:{:06X} service \"{}\"",
                    name,
                    caid,
                    provider_id,
                    binding.service.name
                );
                let mux = binding.service.mux;
                if let Some(card) = self
                    .cards
                    .iter_mut()
                    .find(|c| c.caid == caid && c.card_id == card_id)
                {
                    let forwards = card.filter_emm(data, mux);
                    forward_emms(
                        self.protocol.as_mut(),
                        &mut self.writer,
                        &name,
                        caid,
                        card_id,
                        forwards,
                    );
                }
            }
            return;
        }

        let Some((index, last_section)) = section_index(caid, data) else {
            return;
        };
        let Some(ecm_pid) = binding.pids.get_mut(&pid) else {
            return;
        };
        ecm_pid.last_section = last_section;
        let section = ecm_pid
            .sections
            .entry(index)
            .or_insert_with(|| Section::new(index));

        if section.data == data {
            return;
        }

        if !self.connected {
            // New key but no server to ask.
            if binding.key_state != DescramblerState::Ready {
                binding.key_state = DescramblerState::Ready;
                self.notices.push(Notice::KeyState {
                    service,
                    state: DescramblerState::Ready,
                    reason: "not connected",
                });
            }
            return;
        }

        if matches!(section.state, SectionState::Forbidden | SectionState::Idle) {
            return;
        }

        if binding.capid != NO_PID && binding.capid > 0 && pid > 0 && binding.capid != pid {
            debug!(
                "{}: Filtering ECM (PID {}), using PID {}",
                name, pid, binding.capid
            );
            return;
        }

        section.data.clear();
        section.data.extend_from_slice(data);
        section.caid = caid;
        section.provider_id = provider_id;
        section.pid = pid;
        section.pending = true;
        section.resolved = false;
        if section.state == SectionState::Unknown {
            section.state = SectionState::Pending;
        }

        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        let seq = self.seq;

        let req = EcmRequest {
            seq,
            service_id: binding.service.sid,
            caid,
            provider_id,
            pid,
            card_id,
            data,
        };
        let sent = match self.protocol.encode_ecm(&req) {
            Ok(frame) => self.writer.enqueue(frame),
            Err(e) => {
                warn!("{}: Failed to encode ECM: {}", name, e);
                false
            }
        };

        if sent {
            section.seq = seq;
            section.requested_at = Some(Instant::now());
            debug!(
                "{}: Sending ECM (PID {}) section={}/{} for service \"{}\" (seqno: {})",
                name, pid, index, last_section, binding.service.name, seq
            );
            hexdump(&name, data);
        } else {
            section.pending = false;
            if section.state == SectionState::Pending {
                section.state = SectionState::Unknown;
            }
        }
    }

    /// Locate the pending section that sent `seq`.
    pub(crate) fn find_pending(&self, seq: u32) -> Option<(ServiceId, u16, u8)> {
        for (id, binding) in &self.bindings {
            for ecm_pid in binding.pids.values() {
                for section in ecm_pid.sections.values().filter(|s| s.seq == seq) {
                    if section.resolved {
                        debug!(
                            "{}: Ignore {}ECM (PID {}) for service \"{}\" (seq {})",
                            self.name,
                            if section.pending { "duplicate " } else { "" },
                            ecm_pid.pid,
                            binding.service.name,
                            seq
                        );
                        return None;
                    }
                    if section.pending {
                        return Some((*id, ecm_pid.pid, section.index));
                    }
                }
            }
        }
        warn!("{}: Got unexpected ECM reply (seqno: {})", self.name, seq);
        None
    }

    /// Handle a server reply to an ECM request.
    pub(crate) fn ecm_reply(&mut self, seq: u32, keys: Option<ControlWords>) {
        let Some((service, pid, index)) = self.find_pending(seq) else {
            return;
        };
        match keys {
            Some(keys) => self.ecm_resolved(service, pid, index, seq, keys),
            None => self.ecm_denied(service, pid, index, seq),
        }
    }

    fn ecm_resolved(
        &mut self,
        service: ServiceId,
        pid: u16,
        index: u8,
        seq: u32,
        keys: ControlWords,
    ) {
        let resolver = self.config.display_name();
        let Some(binding) = self.bindings.get_mut(&service) else {
            return;
        };
        let Some(section) = binding
            .pids
            .get_mut(&pid)
            .and_then(|ep| ep.sections.get_mut(&index))
        else {
            return;
        };

        section.pending = false;
        section.nok = 0;
        let delay = section
            .requested_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let first = section.state != SectionState::Resolved;
        section.state = SectionState::Resolved;
        section.resolved = true;
        let (caid, provider_id, capid) = (section.caid, section.provider_id, section.pid);

        binding.capid = capid;
        binding.ecm_state = EcmState::Valid;

        let svc = &mut binding.service;
        if svc.pref_capid == 0
            || (svc.pref_capid != capid && svc.pref_capid_lock == PrefCapidLock::Off)
        {
            svc.pref_capid = capid;
            debug!(
                "{}: Saving preferred PID {} for service \"{}\"",
                self.name, capid, svc.name
            );
            self.notices.push(Notice::SavePreferredPid { service, pid: capid });
        }

        debug!(
            "{}: Received ECM reply (PID {}) for service \"{}\" [{}] (seqno: {} Req delay: {} ms)",
            self.name,
            capid,
            binding.service.name,
            index,
            seq,
            delay.as_millis()
        );
        if first {
            debug!(
                "{}: Obtained keys for service \"{}\" in {} ms",
                self.name,
                binding.service.name,
                delay.as_millis()
            );
        }

        if binding.key_state != DescramblerState::Resolved {
            binding.key_state = DescramblerState::Resolved;
            self.notices.push(Notice::KeyState {
                service,
                state: DescramblerState::Resolved,
                reason: "keys received",
            });
        }
        self.notices.push(Notice::Keys { service, keys });
        self.notices.push(Notice::Resolved {
            service,
            resolution: Resolution {
                caid,
                provider_id,
                caid_name: caid_name(caid),
                pid: capid,
                delay,
                resolver,
                protocol: self.protocol.id().to_string(),
                client: self.config.name.clone(),
            },
        });
    }

    fn ecm_denied(&mut self, service: ServiceId, pid: u16, index: u8, seq: u32) {
        let max = self.config.max_noks();
        let descrambler = self.descrambler.clone();
        let Some(binding) = self.bindings.get_mut(&service) else {
            return;
        };
        // Keys from this client only count once the section is out of retries.
        let own_keys = binding.key_state == DescramblerState::Resolved;
        let resolved_elsewhere = descrambler.service_resolved(service);

        let Some(section) = binding
            .pids
            .get_mut(&pid)
            .and_then(|ep| ep.sections.get_mut(&index))
        else {
            return;
        };

        section.pending = false;
        let delay = section
            .requested_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        if section.nok < max {
            section.nok += 1;
        }
        if section.state == SectionState::Forbidden {
            return;
        }

        if section.nok >= max {
            debug!(
                "{}: Too many NOKs[{}] for service \"{}\" (PID {})",
                self.name, index, binding.service.name, pid
            );
            section.state = if resolved_elsewhere || own_keys {
                SectionState::Idle
            } else {
                SectionState::Forbidden
            };
        } else if resolved_elsewhere {
            debug!(
                "{}: NOK[{}]: Already has a key for service \"{}\"",
                self.name, index, binding.service.name
            );
            // Stop asking for this section.
            section.nok = max;
            section.state = SectionState::Idle;
        } else {
            debug!(
                "{}: Received NOK[{}] for service \"{}\" (PID {}) (seqno: {} Req delay: {} ms)",
                self.name,
                index,
                binding.service.name,
                pid,
                seq,
                delay.as_millis()
            );
            section.state = SectionState::Unknown;
        }
        let nok = section.nok;

        if section.state == SectionState::Idle {
            if binding.key_state == DescramblerState::Ready {
                binding.key_state = DescramblerState::Idle;
                self.notices.push(Notice::KeyState {
                    service,
                    state: DescramblerState::Idle,
                    reason: "already descrambled",
                });
            }
            return;
        }

        let mut viable = 0;
        for (_, other) in binding
            .pids
            .values()
            .flat_map(|ep| ep.sections.values().map(move |s| (ep.pid, s)))
            .filter(|(p, s)| !(*p == pid && s.index == index) && s.nok == 0)
        {
            if other.pending {
                return;
            }
            viable += 1;
        }
        if viable > 0 && nok < max {
            return;
        }

        let all_exhausted = binding
            .pids
            .values()
            .flat_map(|ep| ep.sections.values())
            .all(|s| matches!(s.state, SectionState::Forbidden | SectionState::Idle));
        if !all_exhausted {
            return;
        }

        error!(
            "{}: Can not descramble service \"{}\", access denied (seqno: {} Req delay: {} ms)",
            self.name,
            binding.service.name,
            seq,
            delay.as_millis()
        );
        binding.key_state = DescramblerState::Forbidden;
        binding.ecm_state = EcmState::Reset;
        self.notices.push(Notice::KeyState {
            service,
            state: DescramblerState::Forbidden,
            reason: "access denied",
        });

        let svc = &mut binding.service;
        if svc.pref_capid != 0 && svc.pref_capid_lock == PrefCapidLock::Off {
            // Force a full PID scan next time.
            svc.pref_capid = 0;
            self.notices.push(Notice::SavePreferredPid { service, pid: 0 });
        }
    }
}
