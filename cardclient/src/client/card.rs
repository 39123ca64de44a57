//! Cards behind the current session.

use cardclient_protocol::{caid_name, CardAddress, CardAnnouncement, CardType, ProviderInfo};
use serde::Serialize;

use crate::emm::{CardContext, EmmFilter, EmmFilterFactory};
use crate::service::MuxId;

/// A smart card (or CA module) the server offers.
pub(crate) struct Card {
    pub caid: u16,
    pub card_id: u32,
    pub ua: CardAddress,
    pub providers: Vec<ProviderInfo>,
    /// Confirmed by the server during the current session.
    pub running: bool,
    /// Mux whose EMM stream feeds this card.
    pub mux: Option<MuxId>,
    pub card_type: CardType,
    pub filter: Box<dyn EmmFilter>,
}

impl Card {
    fn new(caid: u16, card_id: u32, filter: Box<dyn EmmFilter>) -> Self {
        Self {
            caid,
            card_id,
            ua: CardAddress::default(),
            providers: Vec::new(),
            running: false,
            mux: None,
            card_type: CardType::detect(caid),
            filter,
        }
    }

    /// Provider 0 stands for "any provider".
    pub fn has_provider(&self, provider_id: u32) -> bool {
        provider_id == 0 || self.providers.iter().any(|p| p.id == provider_id)
    }

    /// Can this card answer ECMs for `caid`/`provider_id` right now?
    pub fn serves(&self, caid: u16, provider_id: u32) -> bool {
        self.running && self.caid == caid && self.has_provider(provider_id)
    }

    pub fn name(&self) -> String {
        format!(
            "ID:{:08x} CAID:{:04x} with {} provider{}",
            self.card_id,
            self.caid,
            self.providers.len(),
            if self.providers.len() != 1 { "s" } else { "" }
        )
    }

    /// Run the card's EMM filter.
    pub fn filter_emm(&mut self, data: &[u8], mux: MuxId) -> Vec<crate::emm::EmmForward> {
        let ctx = CardContext {
            caid: self.caid,
            card_id: self.card_id,
            ua: self.ua,
            providers: &self.providers,
        };
        self.filter.filter(&ctx, data, mux)
    }

    pub fn snapshot(&self) -> CardSnapshot {
        CardSnapshot {
            caid: self.caid,
            caid_name: caid_name(self.caid),
            card_id: self.card_id,
            card_type: self.card_type,
            ua: (!self.ua.is_empty()).then_some(self.ua),
            providers: self.providers.clone(),
            running: self.running,
            emm_mux: self.mux,
        }
    }
}

/// Read-only view of a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardSnapshot {
    pub caid: u16,
    pub caid_name: String,
    pub card_id: u32,
    pub card_type: CardType,
    pub ua: Option<CardAddress>,
    pub providers: Vec<ProviderInfo>,
    pub running: bool,
    pub emm_mux: Option<MuxId>,
}

/// Cards of one client, keyed by (CAID, card id).
#[derive(Default)]
pub(crate) struct CardRegistry {
    cards: Vec<Card>,
}

impl CardRegistry {
    /// Create or refresh a card. Identity is kept across reconnects; only
    /// the provider list and UA are replaced.
    pub fn upsert(&mut self, ann: CardAnnouncement, filters: &dyn EmmFilterFactory) -> &mut Card {
        let idx = match self
            .cards
            .iter()
            .position(|c| c.caid == ann.caid && c.card_id == ann.card_id)
        {
            Some(idx) => idx,
            None => {
                self.cards
                    .push(Card::new(ann.caid, ann.card_id, filters.create(ann.caid)));
                self.cards.len() - 1
            }
        };

        let card = &mut self.cards[idx];
        card.ua = ann.ua.unwrap_or_default();
        card.providers = ann.providers;
        card.running = true;
        card
    }

    /// Mark every card stale ahead of a new session.
    pub fn invalidate(&mut self) {
        for card in &mut self.cards {
            card.running = false;
        }
    }

    pub fn remove(&mut self, card_id: u32) -> Option<Card> {
        let idx = self.cards.iter().position(|c| c.card_id == card_id)?;
        Some(self.cards.remove(idx))
    }

    pub fn clear(&mut self) -> Vec<Card> {
        std::mem::take(&mut self.cards)
    }

    /// First card able to serve `caid`/`provider_id`.
    pub fn capable(&self, caid: u16, provider_id: u32) -> Option<&Card> {
        self.cards.iter().find(|c| c.serves(caid, provider_id))
    }

    /// True if some card belongs to a CA system we can filter EMMs for.
    pub fn any_known_type(&self) -> bool {
        self.cards.iter().any(|c| c.card_type.is_known())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Card> {
        self.cards.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}
