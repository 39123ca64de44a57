//! Process-wide lookup of clients by name.
//!
//! The registry only holds weak handles: dropping every [`Client`] clone
//! removes it from lookups and stops its worker.

use std::collections::HashMap;
use std::sync::Weak;

use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::client::{Client, ClientHandle};

static CLIENTS: Lazy<Mutex<HashMap<String, Weak<ClientHandle>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Make `client` findable under its configured name. Replaces any client
/// registered under the same name.
pub fn register(client: &Client) {
    let name = client.name();
    debug!("Registering client {}", name);
    let mut clients = CLIENTS.lock();
    clients.retain(|_, weak| weak.strong_count() > 0);
    clients.insert(name, client.downgrade());
}

pub fn lookup(name: &str) -> Option<Client> {
    CLIENTS
        .lock()
        .get(name)
        .and_then(Weak::upgrade)
        .map(Client::from_handle)
}

pub fn unregister(name: &str) -> bool {
    CLIENTS.lock().remove(name).is_some()
}

/// Names of all live registered clients.
pub fn names() -> Vec<String> {
    let clients = CLIENTS.lock();
    let mut names: Vec<String> = clients
        .iter()
        .filter(|(_, weak)| weak.strong_count() > 0)
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();
    names
}
