//! Test doubles: a scripted protocol, an in-memory connector and a
//! recording collaborator.

use std::collections::VecDeque;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cardclient_protocol::{
    decode_frame, encode_frame, CardAnnouncement, CardServerProtocol, ControlWords, Credentials,
    EcmRequest, EmmRequest, KeyType, ProtocolError, ServerEvent, HEADER_SIZE,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::state::ClientState;
use crate::client::writer::Wake;
use crate::config::ClientConfig;
use crate::emm::DefaultEmmFilters;
use crate::hooks::{
    Collaborators, DemuxControl, DescramblerSink, DescramblerState, Detached, Resolution,
    ServiceStore,
};
use crate::service::{MuxId, ServiceId};
use crate::transport::{BoxedStream, Connector};

const TAG_LOGIN: u8 = 0x10;
const TAG_ECM: u8 = 0xe0;
const TAG_EMM: u8 = 0xe1;
const TAG_KEEPALIVE: u8 = 0xee;
const TAG_IDLE: u8 = 0xef;

const MSG_ECM_REPLY: u8 = 0x01;
const MSG_CARD_REMOVED: u8 = 0x02;
const MSG_CARD_ADDED: u8 = 0x03;
const MSG_EMM_ALLOWED: u8 = 0x04;

pub fn keys() -> ControlWords {
    ControlWords::new(KeyType::Csa, vec![0x11; 8], vec![0x22; 8])
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        name: "test".to_string(),
        hostname: "localhost".to_string(),
        port: 15000,
        username: "user".to_string(),
        password: "pass".to_string(),
        ..Default::default()
    }
}

/// Client state with its writer attached to a live wake channel.
pub(crate) struct TestState {
    state: ClientState,
    _wake: mpsc::UnboundedReceiver<Wake>,
}

impl Deref for TestState {
    type Target = ClientState;

    fn deref(&self) -> &ClientState {
        &self.state
    }
}

impl DerefMut for TestState {
    fn deref_mut(&mut self) -> &mut ClientState {
        &mut self.state
    }
}

/// Client state as it looks in the middle of a session.
pub fn connected_state() -> TestState {
    let mut state = ClientState::new(
        test_config(),
        Box::new(ScriptedProtocol::default()),
        Arc::new(DefaultEmmFilters),
        Arc::new(Detached),
    );
    let (tx, wake) = mpsc::unbounded_channel();
    state.writer.attach(tx);
    state.session_started();
    TestState { state, _wake: wake }
}

/// A minimal card-server protocol: u16 length prefixed frames, one tag byte.
///
/// Server messages:
/// - `"OK"` completes the login, `"NO"` rejects it
/// - `01 seq:u32 ok:u8` ECM reply
/// - `02 card_id:u32` card removed
/// - `03 caid:u16 card_id:u32` card added
/// - `04 allowed:u8` EMM permission
#[derive(Debug, Default)]
pub struct ScriptedProtocol {
    /// Cards announced when the login completes.
    cards: Vec<CardAnnouncement>,
    logged_in: bool,
}

impl ScriptedProtocol {
    pub fn with_cards(cards: Vec<CardAnnouncement>) -> Self {
        Self {
            cards,
            logged_in: false,
        }
    }

    fn tag(frame: &[u8]) -> Option<u8> {
        frame.get(HEADER_SIZE).copied()
    }

    /// Sequence number of an encoded ECM request.
    pub fn ecm_seq(frame: &Bytes) -> Option<u32> {
        if Self::tag(frame)? != TAG_ECM {
            return None;
        }
        let seq = frame.get(HEADER_SIZE + 1..HEADER_SIZE + 5)?;
        Some(u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]]))
    }

    pub fn is_emm(frame: &Bytes) -> bool {
        Self::tag(frame) == Some(TAG_EMM)
    }

    pub fn is_idle(frame: &Bytes) -> bool {
        Self::tag(frame) == Some(TAG_IDLE)
    }

    pub fn login_ok() -> Bytes {
        frame(b"OK")
    }

    pub fn login_rejected() -> Bytes {
        frame(b"NO")
    }

    pub fn ecm_reply(seq: u32, ok: bool) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(MSG_ECM_REPLY);
        payload.put_u32(seq);
        payload.put_u8(ok as u8);
        frame(&payload)
    }

    pub fn card_removed(card_id: u32) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(MSG_CARD_REMOVED);
        payload.put_u32(card_id);
        frame(&payload)
    }

    pub fn card_added(caid: u16, card_id: u32) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(MSG_CARD_ADDED);
        payload.put_u16(caid);
        payload.put_u32(card_id);
        frame(&payload)
    }

    pub fn emm_allowed(allowed: bool) -> Bytes {
        frame(&[MSG_EMM_ALLOWED, allowed as u8])
    }

    fn decode_one(mut payload: Bytes) -> Result<ServerEvent, ProtocolError> {
        let short = || ProtocolError::DecodeError("short message".to_string());
        if payload.is_empty() {
            return Err(short());
        }
        match payload.get_u8() {
            MSG_ECM_REPLY if payload.len() >= 5 => {
                let seq = payload.get_u32();
                let ok = payload.get_u8() != 0;
                Ok(ServerEvent::EcmReply {
                    seq,
                    keys: ok.then(keys),
                })
            }
            MSG_CARD_REMOVED if payload.len() >= 4 => Ok(ServerEvent::CardRemoved {
                card_id: payload.get_u32(),
            }),
            MSG_CARD_ADDED if payload.len() >= 6 => {
                let caid = payload.get_u16();
                let card_id = payload.get_u32();
                Ok(ServerEvent::CardAdded(CardAnnouncement {
                    caid,
                    card_id,
                    ua: None,
                    providers: Vec::new(),
                }))
            }
            MSG_EMM_ALLOWED if !payload.is_empty() => {
                Ok(ServerEvent::EmmAllowed(payload.get_u8() != 0))
            }
            MSG_ECM_REPLY | MSG_CARD_REMOVED | MSG_CARD_ADDED | MSG_EMM_ALLOWED => Err(short()),
            other => Err(ProtocolError::Unexpected(format!("message type {:#04x}", other))),
        }
    }
}

fn frame(payload: &[u8]) -> Bytes {
    encode_frame(payload).unwrap()
}

impl CardServerProtocol for ScriptedProtocol {
    fn id(&self) -> &str {
        "scripted"
    }

    fn reset_session(&mut self) {
        self.logged_in = false;
    }

    fn login(&mut self, credentials: &Credentials) -> Result<Vec<Bytes>, ProtocolError> {
        let mut payload = vec![TAG_LOGIN];
        payload.extend_from_slice(credentials.username.as_bytes());
        Ok(vec![encode_frame(&payload)?])
    }

    fn login_response(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Vec<ServerEvent>>, ProtocolError> {
        let Some(payload) = decode_frame(buf)? else {
            return Ok(None);
        };
        match &payload[..] {
            b"OK" => {
                self.logged_in = true;
                Ok(Some(
                    self.cards.iter().cloned().map(ServerEvent::CardAdded).collect(),
                ))
            }
            _ => Err(ProtocolError::LoginRejected("bad credentials".to_string())),
        }
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Vec<ServerEvent>, ProtocolError> {
        if !self.logged_in {
            return Err(ProtocolError::Unexpected("not logged in".to_string()));
        }
        let mut events = Vec::new();
        while let Some(payload) = decode_frame(buf)? {
            events.push(Self::decode_one(payload)?);
        }
        Ok(events)
    }

    fn encode_ecm(&mut self, req: &EcmRequest<'_>) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::with_capacity(7 + req.data.len());
        payload.put_u8(TAG_ECM);
        payload.put_u32(req.seq);
        payload.put_u16(req.caid);
        payload.put_slice(req.data);
        encode_frame(&payload)
    }

    fn encode_emm(&mut self, req: &EmmRequest<'_>) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::with_capacity(3 + req.data.len());
        payload.put_u8(TAG_EMM);
        payload.put_u16(req.caid);
        payload.put_slice(req.data);
        encode_frame(&payload)
    }

    fn keepalive(&mut self) -> Option<Bytes> {
        Some(frame(&[TAG_KEEPALIVE]))
    }

    fn on_idle(&mut self) -> Option<Bytes> {
        Some(frame(&[TAG_IDLE]))
    }
}

/// What the next connection attempt should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Refuse,
    Accept,
}

/// In-memory connector handing out duplex streams.
///
/// Attempts beyond the script are refused.
pub struct MockConnector {
    script: Mutex<VecDeque<Script>>,
    attempts: Mutex<Vec<Instant>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    pub fn new(script: Vec<Script>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: Mutex::new(Vec::new()),
            servers: tx,
        });
        (connector, rx)
    }

    /// Times of every connection attempt so far.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

impl Connector for MockConnector {
    fn connect<'a>(
        &'a self,
        _host: &'a str,
        _port: u16,
        _timeout: Duration,
    ) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            self.attempts.lock().push(Instant::now());
            let step = self.script.lock().pop_front().unwrap_or(Script::Refuse);
            match step {
                Script::Refuse => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
                Script::Accept => {
                    let (client, server) = tokio::io::duplex(64 * 1024);
                    let _ = self.servers.send(ServerEnd::new(server));
                    Ok(Box::new(client) as BoxedStream)
                }
            }
        })
    }
}

/// The card server's side of an accepted mock connection.
pub struct ServerEnd {
    stream: DuplexStream,
    buf: BytesMut,
}

impl ServerEnd {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Next frame payload the client sent, `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            if let Ok(Some(payload)) = decode_frame(&mut self.buf) {
                return Some(payload);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Next ECM request, skipping everything else. Returns its sequence number.
    pub async fn recv_ecm(&mut self) -> Option<u32> {
        loop {
            let payload = self.recv().await?;
            if payload.first() == Some(&TAG_ECM) && payload.len() >= 5 {
                return Some(u32::from_be_bytes([
                    payload[1], payload[2], payload[3], payload[4],
                ]));
            }
        }
    }

    pub async fn send(&mut self, frame: Bytes) {
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Read the login frame and accept it.
    pub async fn accept_login(&mut self) {
        let login = self.recv().await.unwrap();
        assert_eq!(login.first(), Some(&TAG_LOGIN));
        self.send(ScriptedProtocol::login_ok()).await;
    }
}

/// Is this payload (frame header already stripped) a keepalive?
pub fn is_keepalive_payload(payload: &[u8]) -> bool {
    payload == [TAG_KEEPALIVE]
}

/// Recorded collaborator call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    KeyState(ServiceId, DescramblerState, String),
    Keys(ServiceId),
    Resolution(ServiceId, u16),
    Flush(ServiceId),
    OpenPid(MuxId, u16),
    ClosePid(MuxId, u16),
    OpenEmm(MuxId, u16),
    CloseEmm(MuxId, u16),
    SavePid(ServiceId, u16),
}

/// Records every collaborator call.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<Call>>,
    resolved: AtomicBool,
}

impl RecordingSink {
    pub fn set_resolved(&self, resolved: bool) {
        self.resolved.store(resolved, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn key_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Keys(_)))
            .count()
    }

    pub fn key_states(&self) -> Vec<DescramblerState> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                Call::KeyState(_, state, _) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators::new(self.clone(), self.clone(), self.clone())
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl DescramblerSink for RecordingSink {
    fn report_key_state(&self, service: ServiceId, state: DescramblerState, reason: &str) {
        self.record(Call::KeyState(service, state, reason.to_string()));
    }

    fn deliver_keys(&self, service: ServiceId, _keys: &ControlWords) {
        self.record(Call::Keys(service));
    }

    fn notify_resolution(&self, service: ServiceId, resolution: &Resolution) {
        self.record(Call::Resolution(service, resolution.pid));
    }

    fn flush_table_data(&self, service: ServiceId) {
        self.record(Call::Flush(service));
    }

    fn service_resolved(&self, _service: ServiceId) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }
}

impl DemuxControl for RecordingSink {
    fn open_pid(&self, mux: MuxId, pid: u16, _service: ServiceId) {
        self.record(Call::OpenPid(mux, pid));
    }

    fn close_pid(&self, mux: MuxId, pid: u16, _service: ServiceId) {
        self.record(Call::ClosePid(mux, pid));
    }

    fn open_emm(&self, mux: MuxId, caid: u16) {
        self.record(Call::OpenEmm(mux, caid));
    }

    fn close_emm(&self, mux: MuxId, caid: u16) {
        self.record(Call::CloseEmm(mux, caid));
    }
}

impl ServiceStore for RecordingSink {
    fn save_preferred_pid(&self, service: ServiceId, pid: u16) {
        self.record(Call::SavePid(service, pid));
    }
}
