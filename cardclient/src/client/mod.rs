//! Card clients: one connection to one card server, shared by every
//! service that needs its cards.

mod binding;
mod card;
mod ecm;
mod session;
pub(crate) mod state;
pub(crate) mod writer;

use std::sync::Arc;

use cardclient_protocol::CardServerProtocol;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::emm::{DefaultEmmFilters, EmmFilterFactory};
use crate::error::ClientError;
use crate::hooks::Collaborators;
use crate::service::{MuxId, ServiceDescriptor, ServiceId};
use crate::transport::{Connector, TcpConnector};

pub use binding::{BindingSnapshot, EcmState};
pub use card::CardSnapshot;
pub use ecm::{PidSnapshot, SectionSnapshot, SectionState};

use state::ClientState;

/// Connection status, for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientStatus {
    /// Disabled or not configured.
    None,
    /// Trying to connect.
    Ready,
    /// Logged in.
    Connected,
    /// Waiting before the next attempt.
    Disconnected,
}

pub(crate) struct ClientInner {
    state: Mutex<ClientState>,
    collaborators: Collaborators,
    connector: Arc<dyn Connector>,
    /// Wakes the worker out of connect and backoff waits.
    interrupt: Notify,
    status: watch::Sender<ClientStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl ClientInner {
    /// Run `f` under the client lock, then deliver the collaborator calls
    /// it produced.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        let (result, notices) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            (result, state.take_notices())
        };
        self.collaborators.dispatch(notices);
        result
    }

    pub(crate) fn set_status(&self, status: ClientStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Tell the worker to exit at its next wait. Returns the client name.
    fn request_stop(&self) -> String {
        let name = self.with_state(|st| {
            st.running = false;
            st.writer.disable();
            st.writer.close();
            st.name.clone()
        });
        self.interrupt.notify_waiters();
        name
    }
}

/// Shared by all clones of a [`Client`] but not by its worker, so the
/// worker is stopped once the last clone goes away.
pub(crate) struct ClientHandle {
    inner: Arc<ClientInner>,
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.inner.state.lock().running {
            let name = self.inner.request_stop();
            debug!("{}: Last handle dropped, stopping worker", name);
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    protocol: Box<dyn CardServerProtocol>,
    collaborators: Collaborators,
    connector: Arc<dyn Connector>,
    filters: Arc<dyn EmmFilterFactory>,
}

impl ClientBuilder {
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn emm_filters(mut self, filters: Arc<dyn EmmFilterFactory>) -> Self {
        self.filters = filters;
        self
    }

    /// Create the client. Must be called inside a tokio runtime; the
    /// worker is spawned on it by [`Client::conf_changed`].
    pub fn build(self) -> Result<Client, ClientError> {
        let runtime = Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;
        let state = ClientState::new(
            self.config,
            self.protocol,
            self.filters,
            self.collaborators.descrambler.clone(),
        );
        let (status, _) = watch::channel(ClientStatus::None);

        let inner = Arc::new(ClientInner {
            state: Mutex::new(state),
            collaborators: self.collaborators,
            connector: self.connector,
            interrupt: Notify::new(),
            status,
            worker: Mutex::new(None),
            runtime,
        });
        Ok(Client::from_handle(Arc::new(ClientHandle { inner })))
    }
}

/// Handle to one card client. Cheap to clone.
///
/// Every method returns quickly: network I/O happens on the client's
/// worker task and its outcome is reported through the collaborators.
/// Dropping the last clone stops the worker without waiting for it; use
/// [`shutdown`](Self::shutdown) to wait.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    handle: Arc<ClientHandle>,
}

impl Client {
    pub fn builder(config: ClientConfig, protocol: Box<dyn CardServerProtocol>) -> ClientBuilder {
        ClientBuilder {
            config,
            protocol,
            collaborators: Collaborators::detached(),
            connector: Arc::new(TcpConnector),
            filters: Arc::new(DefaultEmmFilters),
        }
    }

    /// A TCP client with the default EMM filters.
    pub fn new(
        config: ClientConfig,
        protocol: Box<dyn CardServerProtocol>,
        collaborators: Collaborators,
    ) -> Result<Self, ClientError> {
        Self::builder(config, protocol)
            .collaborators(collaborators)
            .build()
    }

    pub(crate) fn from_handle(handle: Arc<ClientHandle>) -> Self {
        Self {
            inner: handle.inner.clone(),
            handle,
        }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ClientHandle> {
        Arc::downgrade(&self.handle)
    }

    /// Configured client name.
    pub fn name(&self) -> String {
        self.inner.state.lock().config.name.clone()
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.state.lock().config.clone()
    }

    /// Replace the configuration. Call [`conf_changed`](Self::conf_changed)
    /// to apply it.
    pub fn set_config(&self, config: ClientConfig) {
        self.inner.with_state(|st| st.set_config(config));
    }

    /// Replace the configuration and apply it.
    pub async fn reconfigure(&self, config: ClientConfig) {
        self.set_config(config);
        self.conf_changed().await;
    }

    /// Start, restart or stop the worker to match the configuration.
    pub async fn conf_changed(&self) {
        let inner = &self.inner;
        let (wanted, configured, running, name) = inner.with_state(|st| {
            (
                st.config.enabled && st.config.is_configured(),
                st.config.is_configured(),
                st.running,
                st.name.clone(),
            )
        });

        match (wanted, running) {
            (true, false) => {
                info!("{}: Starting card client", name);
                let (tx, rx) = mpsc::unbounded_channel();
                inner.with_state(|st| {
                    st.running = true;
                    st.reconfigure = false;
                    st.writer.attach(tx);
                });
                let handle = inner.runtime.spawn(session::run(inner.clone(), rx));
                *inner.worker.lock() = Some(handle);
            }
            (true, true) => {
                debug!("{}: Reconfiguring card client", name);
                inner.with_state(|st| {
                    st.reconfigure = true;
                    st.writer.close();
                });
                inner.interrupt.notify_waiters();
            }
            (false, true) => self.stop().await,
            (false, false) => {
                if !configured {
                    debug!("{}: Not configured", name);
                }
                inner.set_status(ClientStatus::None);
            }
        }
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    async fn stop(&self) {
        let inner = &self.inner;
        let name = inner.request_stop();

        let worker = inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("{}: Worker task failed: {}", name, e);
            }
            info!("{}: Card client stopped", name);
        }
        inner.with_state(|st| st.writer.detach());
        inner.set_status(ClientStatus::None);
    }

    /// Bind a service to one of this client's cards, or update the binding
    /// after the service changed.
    pub fn service_start(&self, service: ServiceDescriptor) {
        self.inner.with_state(|st| st.service_start(service));
    }

    pub fn service_stop(&self, service: ServiceId) {
        self.inner.with_state(|st| st.service_stop(service));
    }

    /// A table section arrived on one of a bound service's PIDs.
    pub fn table_input(&self, service: ServiceId, pid: u16, data: &[u8]) {
        self.inner.with_state(|st| st.table_input(service, pid, data));
    }

    /// An EMM section arrived on `mux` for `caid`.
    pub fn emm_input(&self, mux: MuxId, caid: u16, data: &[u8]) {
        self.inner.with_state(|st| st.emm_input(mux, caid, data));
    }

    /// The EMM stream of `mux` ended.
    pub fn emm_end(&self, mux: MuxId, caid: u16) {
        self.inner.with_state(|st| st.emm_end(mux, caid));
    }

    /// A mux gained (`valid`) or lost an EMM source for `caid` on `pid`.
    pub fn caid_update(&self, mux: MuxId, caid: u16, pid: u16, valid: bool) {
        self.inner.with_state(|st| st.caid_update(mux, caid, pid, valid));
    }

    /// Forget a card. Returns false if there is no such card.
    pub fn remove_card(&self, card_id: u32) -> bool {
        self.inner.with_state(|st| st.remove_card(card_id))
    }

    pub fn ecm_reset(&self, service: ServiceId) {
        self.inner.with_state(|st| st.ecm_reset(service));
    }

    pub fn ecm_idle(&self, service: ServiceId) {
        self.inner.with_state(|st| st.ecm_idle(service));
    }

    pub fn status(&self) -> ClientStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn cards(&self) -> Vec<CardSnapshot> {
        self.inner.state.lock().cards.iter().map(|c| c.snapshot()).collect()
    }

    pub fn binding(&self, service: ServiceId) -> Option<BindingSnapshot> {
        self.inner
            .state
            .lock()
            .bindings
            .get(&service)
            .map(|b| b.snapshot())
    }
}
