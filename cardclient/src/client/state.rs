//! Everything a client guards with its lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use cardclient_protocol::{caid_name, CardAnnouncement, CardServerProtocol, EmmRequest, ServerEvent};
use log::{debug, info, trace, warn};
use tokio::time::Instant;

use crate::client::binding::ServiceBinding;
use crate::client::card::{Card, CardRegistry};
use crate::client::writer::WritePipeline;
use crate::config::ClientConfig;
use crate::emm::{EmmFilterFactory, EmmForward};
use crate::hooks::{DescramblerSink, Notice};
use crate::logging::hexdump;
use crate::service::{MuxId, ServiceId};

pub(crate) struct ClientState {
    /// Log prefix, `host:port`.
    pub name: String,
    pub config: ClientConfig,
    pub protocol: Box<dyn CardServerProtocol>,
    pub cards: CardRegistry,
    pub bindings: BTreeMap<ServiceId, ServiceBinding>,
    pub writer: WritePipeline,
    /// Collaborator calls to deliver once the lock is released.
    pub notices: Vec<Notice>,
    /// A session is established.
    pub connected: bool,
    /// The worker should keep running.
    pub running: bool,
    /// Reconnect without waiting for the backoff.
    pub reconfigure: bool,
    pub seq: u32,
    pub forward_emm: bool,
    /// Mux EMMs were last forwarded from.
    pub emm_mux: Option<MuxId>,
    pub emm_update_time: Option<Instant>,
    pub filters: Arc<dyn EmmFilterFactory>,
    pub descrambler: Arc<dyn DescramblerSink>,
}

impl ClientState {
    pub fn new(
        config: ClientConfig,
        protocol: Box<dyn CardServerProtocol>,
        filters: Arc<dyn EmmFilterFactory>,
        descrambler: Arc<dyn DescramblerSink>,
    ) -> Self {
        Self {
            name: config.display_name(),
            config,
            protocol,
            cards: CardRegistry::default(),
            bindings: BTreeMap::new(),
            writer: WritePipeline::default(),
            notices: Vec::new(),
            connected: false,
            running: false,
            reconfigure: false,
            seq: 0,
            forward_emm: false,
            emm_mux: None,
            emm_update_time: None,
            filters,
            descrambler,
        }
    }

    /// Replace the configuration. Takes effect on the next connection.
    pub fn set_config(&mut self, config: ClientConfig) {
        self.name = config.display_name();
        self.config = config;
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Apply what the protocol decoded.
    pub fn apply_events(&mut self, events: Vec<ServerEvent>) {
        for event in events {
            match event {
                ServerEvent::CardAdded(ann) => self.upsert_card(ann),
                ServerEvent::CardRemoved { card_id } => {
                    self.remove_card(card_id);
                }
                ServerEvent::EcmReply { seq, keys } => self.ecm_reply(seq, keys),
                ServerEvent::EmmAllowed(allowed) => self.emm_set_allowed(allowed),
            }
        }
    }

    fn upsert_card(&mut self, ann: CardAnnouncement) {
        let name = self.name.clone();
        let user = self.config.username.clone();
        let card = self.cards.upsert(ann, self.filters.as_ref());

        info!(
            "{}: Connected as user {} to a {}-card-{:08x} [CAID: {:04x}, UA: {}, {} provider{}]",
            name,
            user,
            caid_name(card.caid),
            card.card_id,
            card.caid,
            card.ua,
            card.providers.len(),
            if card.providers.len() != 1 { "s" } else { "" }
        );
        for (i, prov) in card.providers.iter().enumerate() {
            match prov.sa {
                Some(sa) => debug!("{}:   provider {} [{:06x}] SA: {}", name, i, prov.id, sa),
                None => debug!("{}:   provider {} [{:06x}]", name, i, prov.id),
            }
        }

        let has_ua = !card.ua.is_empty();
        if self.config.emm && has_ua {
            self.emm_set_allowed(true);
        }
    }

    /// Turn EMM forwarding on or off. Stays off unless the configuration
    /// allows it and some card is of a type the filters understand.
    pub fn emm_set_allowed(&mut self, allowed: bool) {
        let forward = allowed && self.config.emm && self.cards.any_known_type();
        if forward != self.forward_emm {
            info!(
                "{}: EMM forwarding {}",
                self.name,
                if forward { "enabled" } else { "disabled" }
            );
        }
        self.forward_emm = forward;
    }

    /// Drop a card and every section it was serving.
    pub fn remove_card(&mut self, card_id: u32) -> bool {
        let Some(card) = self.cards.remove(card_id) else {
            return false;
        };

        for binding in self.bindings.values_mut() {
            for ecm_pid in binding.pids.values_mut() {
                ecm_pid
                    .sections
                    .retain(|_, s| !(s.caid == card.caid && card.has_provider(s.provider_id)));
            }
            binding.pids.retain(|_, ep| !ep.sections.is_empty());
        }
        if let Some(mux) = card.mux {
            self.notices.push(Notice::CloseEmm {
                mux,
                caid: card.caid,
            });
        }
        info!("{}: Removed card {}", self.name, card.name());
        true
    }

    /// A mux gained or lost a usable EMM source for `caid`.
    pub fn caid_update(&mut self, mux: MuxId, caid: u16, pid: u16, valid: bool) {
        if !self.running {
            return;
        }
        for card in self
            .cards
            .iter_mut()
            .filter(|c| c.caid == caid && c.mux.map_or(true, |m| m == mux))
        {
            if valid {
                if card.mux.is_none() {
                    debug!(
                        "{}: EMM for {} on {} (PID {})",
                        self.name,
                        card.name(),
                        mux,
                        pid
                    );
                }
                card.mux = Some(mux);
                self.notices.push(Notice::OpenEmm { mux, caid });
            } else {
                card.mux = None;
                self.notices.push(Notice::CloseEmm { mux, caid });
            }
        }
    }

    /// Route an EMM section from `mux` to the cards bound to it.
    pub fn emm_input(&mut self, mux: MuxId, caid: u16, data: &[u8]) {
        if !self.forward_emm || !self.writer.is_running() {
            return;
        }
        let now = Instant::now();
        let cooldown = self.config.emm_mux_cooldown();
        let name = self.name.clone();

        let mut batches = Vec::new();
        for card in self
            .cards
            .iter_mut()
            .filter(|c| c.running && c.caid == caid && c.mux == Some(mux))
        {
            if self.config.emmex {
                if let (Some(current), Some(since)) = (self.emm_mux, self.emm_update_time) {
                    if current != mux && since + cooldown > now {
                        trace!("{}: EMM from {} ignored, using {}", name, mux, current);
                        continue;
                    }
                }
                self.emm_update_time = Some(now);
            }
            self.emm_mux = Some(mux);
            batches.push((card.card_id, card.filter_emm(data, mux)));
        }

        for (card_id, forwards) in batches {
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

    /// The EMM stream of `mux` ended for `caid`.
    pub fn emm_end(&mut self, mux: MuxId, caid: u16) {
        for card in self
            .cards
            .iter_mut()
            .filter(|c| c.caid == caid && c.mux == Some(mux))
        {
            card.mux = None;
        }
        if self.emm_mux == Some(mux) {
            self.emm_mux = None;
            self.emm_update_time = None;
        }
    }

    /// Login completed: flush stale table data and open the pipeline.
    pub fn session_started(&mut self) {
        for &service in self.bindings.keys() {
            self.notices.push(Notice::FlushTables { service });
        }
        self.writer.enable();
        self.connected = true;
    }

    /// Connection lost: requests in flight are gone with it.
    pub fn session_ended(&mut self) {
        self.writer.disable();
        self.connected = false;
        for section in self
            .bindings
            .values_mut()
            .flat_map(|b| b.pids.values_mut())
            .flat_map(|ep| ep.sections.values_mut())
        {
            section.forget_request();
        }
    }

    /// The worker is going away: let go of every card.
    pub fn release_cards(&mut self) {
        for card in self.cards.clear() {
            self.release_card(card);
        }
        self.forward_emm = false;
        self.emm_mux = None;
        self.emm_update_time = None;
    }

    fn release_card(&mut self, card: Card) {
        if let Some(mux) = card.mux {
            self.notices.push(Notice::CloseEmm {
                mux,
                caid: card.caid,
            });
        }
    }
}

/// Encode and queue the EMMs a card filter accepted.
pub(crate) fn forward_emms(
    protocol: &mut dyn CardServerProtocol,
    writer: &mut WritePipeline,
    name: &str,
    caid: u16,
    card_id: u32,
    forwards: Vec<EmmForward>,
) {
    for fwd in forwards {
        let req = EmmRequest {
            caid,
            provider_id: fwd.provider_id,
            card_id,
            data: &fwd.data,
        };
        match protocol.encode_emm(&req) {
            Ok(frame) => {
                if writer.enqueue(frame) {
                    trace!(
                        "{}: Forwarded EMM for {:04x}:{:06x}",
                        name,
                        caid,
                        fwd.provider_id
                    );
                    hexdump(name, &fwd.data);
                }
            }
            Err(e) => warn!("{}: Failed to encode EMM: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cardclient_protocol::{CardAddress, ProviderInfo};

    use super::*;
    use crate::client::ecm::SectionState;
    use crate::service::{CaDescriptor, ElementaryStream, ServiceDescriptor};
    use crate::testing::{connected_state, ScriptedProtocol, TestState};

    const MUX_A: MuxId = MuxId(1);
    const MUX_B: MuxId = MuxId(2);

    fn conax_card(card_id: u32) -> CardAnnouncement {
        CardAnnouncement {
            caid: 0x0b00,
            card_id,
            ua: Some(CardAddress([0, 0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66])),
            providers: vec![ProviderInfo::with_sa(0, CardAddress([0, 1, 2, 3, 4, 5, 6, 7]))],
        }
    }

    /// Conax EMM addressed to the shared address of the card above.
    fn conax_emm(tag: u8) -> Vec<u8> {
        vec![0x82, 0x70, 0x0a, 1, 2, 3, 4, 5, 6, 7, tag]
    }

    fn emm_frames(state: &mut ClientState) -> usize {
        std::iter::from_fn(|| state.writer.pop())
            .filter(|f| ScriptedProtocol::is_emm(f))
            .count()
    }

    fn emm_state() -> TestState {
        let mut state = connected_state();
        state.running = true;
        state.apply_events(vec![ServerEvent::CardAdded(conax_card(1))]);
        state
    }

    #[test]
    fn test_card_with_ua_enables_emm() {
        let state = emm_state();
        assert!(state.forward_emm);
        assert_eq!(state.cards.len(), 1);
    }

    #[test]
    fn test_emm_stays_off_when_disabled_or_unknown() {
        let mut state = connected_state();
        state.config.emm = false;
        state.apply_events(vec![ServerEvent::CardAdded(conax_card(1))]);
        assert!(!state.forward_emm);

        let mut state = connected_state();
        state.apply_events(vec![ServerEvent::CardAdded(CardAnnouncement {
            caid: 0x2600,
            card_id: 9,
            ua: None,
            providers: vec![],
        })]);
        state.emm_set_allowed(true);
        assert!(!state.forward_emm);
    }

    #[test]
    fn test_caid_update_binds_mux() {
        let mut state = emm_state();
        state.caid_update(MUX_A, 0x0b00, 0x20, true);
        assert_eq!(state.cards.iter().next().unwrap().mux, Some(MUX_A));
        assert!(matches!(
            state.take_notices()[..],
            [Notice::OpenEmm { mux: MUX_A, caid: 0x0b00 }]
        ));

        // Another mux does not steal the card.
        state.caid_update(MUX_B, 0x0b00, 0x20, true);
        assert_eq!(state.cards.iter().next().unwrap().mux, Some(MUX_A));
        assert!(state.take_notices().is_empty());

        state.caid_update(MUX_A, 0x0b00, 0x20, false);
        assert_eq!(state.cards.iter().next().unwrap().mux, None);
        assert!(matches!(
            state.take_notices()[..],
            [Notice::CloseEmm { mux: MUX_A, .. }]
        ));
    }

    #[test]
    fn test_caid_update_ignored_when_stopped() {
        let mut state = emm_state();
        state.running = false;
        state.caid_update(MUX_A, 0x0b00, 0x20, true);
        assert!(state.take_notices().is_empty());
    }

    #[test]
    fn test_emm_input_forwards_once() {
        let mut state = emm_state();
        state.caid_update(MUX_A, 0x0b00, 0x20, true);

        state.emm_input(MUX_A, 0x0b00, &conax_emm(1));
        assert_eq!(emm_frames(&mut state), 1);

        // Already forwarded.
        state.emm_input(MUX_A, 0x0b00, &conax_emm(1));
        assert_eq!(emm_frames(&mut state), 0);

        // Wrong mux or CAID.
        state.emm_input(MUX_B, 0x0b00, &conax_emm(2));
        state.emm_input(MUX_A, 0x0500, &conax_emm(2));
        assert_eq!(emm_frames(&mut state), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emmex_cooldown() {
        let mut state = emm_state();
        state.caid_update(MUX_A, 0x0b00, 0x20, true);
        state.emm_input(MUX_A, 0x0b00, &conax_emm(1));
        assert_eq!(emm_frames(&mut state), 1);

        // Card 2 is fed from another mux.
        state.apply_events(vec![ServerEvent::CardAdded(conax_card(2))]);
        for card in state.cards.iter_mut().filter(|c| c.card_id == 2) {
            card.mux = Some(MUX_B);
        }
        state.emm_input(MUX_B, 0x0b00, &conax_emm(2));
        assert_eq!(emm_frames(&mut state), 0);
        assert_eq!(state.emm_mux, Some(MUX_A));

        tokio::time::advance(Duration::from_secs(26)).await;
        state.emm_input(MUX_B, 0x0b00, &conax_emm(3));
        assert_eq!(emm_frames(&mut state), 1);
        assert_eq!(state.emm_mux, Some(MUX_B));
    }

    #[test]
    fn test_emm_end_unbinds_mux() {
        let mut state = emm_state();
        state.caid_update(MUX_A, 0x0b00, 0x20, true);
        state.emm_input(MUX_A, 0x0b00, &conax_emm(1));
        state.emm_end(MUX_A, 0x0b00);

        assert_eq!(state.cards.iter().next().unwrap().mux, None);
        assert_eq!(state.emm_mux, None);
        state.emm_input(MUX_A, 0x0b00, &conax_emm(2));
        assert_eq!(emm_frames(&mut state), 0);

        state.caid_update(MUX_A, 0x0b00, 0x20, true);
        state.emm_input(MUX_A, 0x0b00, &conax_emm(2));
        assert_eq!(emm_frames(&mut state), 1);
    }

    #[test]
    fn test_remove_card_drops_sections() {
        let mut state = emm_state();
        state.caid_update(MUX_A, 0x0b00, 0x20, true);
        let svc = ServiceDescriptor::new(ServiceId(1), 1, "One", MUX_A)
            .with_stream(ElementaryStream::ecm(100, vec![CaDescriptor::new(0x0b00, 0)]));
        state.service_start(svc);
        state.table_input(ServiceId(1), 100, &[0x80, 0x70, 0x01, 0x01]);
        let snap = state.bindings[&ServiceId(1)].snapshot();
        assert_eq!(snap.pids[0].sections[0].state, SectionState::Pending);
        state.take_notices();

        assert!(state.remove_card(1));
        assert!(state.bindings[&ServiceId(1)].pids.is_empty());
        assert!(matches!(
            state.take_notices()[..],
            [Notice::CloseEmm { mux: MUX_A, .. }]
        ));
        assert!(!state.remove_card(1));
    }

    #[test]
    fn test_session_start_and_release() {
        let mut state = emm_state();
        state.caid_update(MUX_A, 0x0b00, 0x20, true);
        let svc = ServiceDescriptor::new(ServiceId(4), 1, "Four", MUX_A)
            .with_stream(ElementaryStream::ecm(100, vec![CaDescriptor::new(0x0b00, 0)]));
        state.service_start(svc);
        state.session_ended();
        assert!(!state.connected);
        state.take_notices();

        state.session_started();
        assert!(state.connected);
        assert!(state.writer.is_running());
        assert!(matches!(
            state.take_notices()[..],
            [Notice::FlushTables { service: ServiceId(4) }]
        ));

        state.release_cards();
        assert!(state.cards.is_empty());
        assert!(!state.forward_emm);
        assert!(matches!(
            state.take_notices()[..],
            [Notice::CloseEmm { mux: MUX_A, .. }]
        ));
    }
}
