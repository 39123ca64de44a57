//! The interface every card-server protocol variant implements.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::{Credentials, EcmRequest, EmmRequest, ServerEvent};

/// A card-server wire protocol.
///
/// Implementations are sans-I/O: the engine owns the socket, feeds received
/// bytes in and ships the encoded frames out through its write pipeline.
/// All methods are called with the client's lock held and must not block.
pub trait CardServerProtocol: Send + 'static {
    /// Short tag used in log lines and resolver notices, e.g. `"newcamd"`.
    fn id(&self) -> &str;

    /// Forget all per-connection state. Called before every connection
    /// attempt.
    fn reset_session(&mut self) {}

    /// Frames to send right after the TCP connection is established.
    fn login(&mut self, credentials: &Credentials) -> Result<Vec<Bytes>, ProtocolError>;

    /// Consume login responses from `buf`.
    ///
    /// Returns `Ok(None)` while the handshake is still in progress and
    /// `Ok(Some(events))` once it completed; the events typically announce
    /// the cards behind the server. Consumed bytes are removed from `buf`,
    /// anything left over is handed to [`decode`](Self::decode).
    fn login_response(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Vec<ServerEvent>>, ProtocolError>;

    /// Decode every complete message in `buf`, leaving partial data.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Vec<ServerEvent>, ProtocolError>;

    /// Encode an ECM key request.
    fn encode_ecm(&mut self, req: &EcmRequest<'_>) -> Result<Bytes, ProtocolError>;

    /// Encode an EMM forward.
    fn encode_emm(&mut self, req: &EmmRequest<'_>) -> Result<Bytes, ProtocolError>;

    /// Frame to send when the keepalive timer fires, if the protocol has one.
    fn keepalive(&mut self) -> Option<Bytes> {
        None
    }

    /// Frame to send when the last service stopped using this client.
    fn on_idle(&mut self) -> Option<Bytes> {
        None
    }
}
