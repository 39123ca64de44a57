//! The per-client worker: connect, log in, pump the socket, reconnect.

use std::sync::Arc;

use bytes::BytesMut;
use cardclient_protocol::{Credentials, ServerEvent};
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};

use crate::client::writer::Wake;
use crate::client::{ClientInner, ClientStatus};
use crate::error::ClientError;
use crate::logging::hexdump;
use crate::transport::BoxedStream;

const READ_BUFFER_SIZE: usize = 8192;

/// Where to connect, captured at the start of each attempt.
struct Target {
    name: String,
    host: String,
    port: u16,
    credentials: Credentials,
    timeout: std::time::Duration,
}

/// Run the worker until the client is stopped.
pub(crate) async fn run(inner: Arc<ClientInner>, mut wake: mpsc::UnboundedReceiver<Wake>) {
    let mut attempts: u32 = 0;

    loop {
        let target = inner.with_state(|st| {
            if !st.running {
                return None;
            }
            st.reconfigure = false;
            st.cards.invalidate();
            st.protocol.reset_session();
            Some(Target {
                name: st.name.clone(),
                host: st.config.hostname.clone(),
                port: st.config.port,
                credentials: st.config.credentials(),
                timeout: st.config.connect_timeout(),
            })
        });
        let Some(target) = target else {
            break;
        };
        inner.set_status(ClientStatus::Ready);

        match connect(&inner, &target).await {
            Ok((stream, buf, events)) => {
                attempts = 0;
                info!("{}: Logged in to card server", target.name);
                match session(&inner, &target.name, &mut wake, stream, buf, events).await {
                    Ok(()) => debug!("{}: Session closed", target.name),
                    Err(e) => warn!("{}: Session ended: {}", target.name, e),
                }
            }
            Err(ClientError::Interrupted) => {
                debug!("{}: Connection attempt interrupted", target.name);
            }
            Err(e) => {
                attempts += 1;
                error!(
                    "{}: Connection failed (attempt {}): {}",
                    target.name, attempts, e
                );
            }
        }

        let (running, reconfigure, delay) =
            inner.with_state(|st| (st.running, st.reconfigure, st.config.reconnect_delay()));
        if !running {
            break;
        }
        if attempts == 1 || reconfigure {
            continue;
        }

        inner.set_status(ClientStatus::Disconnected);
        debug!(
            "{}: Reconnecting in {} s",
            target.name,
            delay.as_secs()
        );
        let interrupted = inner.interrupt.notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();
        if inner.with_state(|st| !st.running || st.reconfigure) {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = interrupted => {}
        }
    }

    inner.with_state(|st| {
        st.release_cards();
        st.writer.detach();
    });
    inner.set_status(ClientStatus::None);
    debug!("{}: Worker stopped", inner.name());
}

/// Connect and log in, giving up early on shutdown or reconfiguration.
async fn connect(
    inner: &ClientInner,
    target: &Target,
) -> Result<(BoxedStream, BytesMut, Vec<ServerEvent>), ClientError> {
    let interrupted = inner.interrupt.notified();
    tokio::pin!(interrupted);
    interrupted.as_mut().enable();
    if inner.with_state(|st| !st.running || st.reconfigure) {
        return Err(ClientError::Interrupted);
    }

    tokio::select! {
        result = login(inner, target) => result,
        _ = interrupted => Err(ClientError::Interrupted),
    }
}

async fn login(
    inner: &ClientInner,
    target: &Target,
) -> Result<(BoxedStream, BytesMut, Vec<ServerEvent>), ClientError> {
    debug!("{}: Connecting to card server", target.name);
    let mut stream = inner
        .connector
        .connect(&target.host, target.port, target.timeout)
        .await?;

    let frames = inner.with_state(|st| st.protocol.login(&target.credentials))?;
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let handshake = async {
        for frame in frames {
            hexdump(&target.name, &frame);
            stream.write_all(&frame).await?;
        }
        loop {
            if let Some(events) = inner.with_state(|st| st.protocol.login_response(&mut buf))? {
                return Ok::<_, ClientError>(events);
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    };
    let events = tokio::time::timeout(target.timeout, handshake)
        .await
        .map_err(|_| ClientError::LoginTimeout)??;

    Ok((stream, buf, events))
}

/// Serve one established session until it closes.
async fn session(
    inner: &ClientInner,
    name: &str,
    wake: &mut mpsc::UnboundedReceiver<Wake>,
    stream: BoxedStream,
    mut buf: BytesMut,
    events: Vec<ServerEvent>,
) -> Result<(), ClientError> {
    // Leftovers from before the session: their messages were dropped.
    while wake.try_recv().is_ok() {}

    let (interrupted, period) = inner.with_state(|st| {
        st.apply_events(events);
        st.session_started();
        (!st.running || st.reconfigure, st.config.keepalive_interval())
    });
    inner.set_status(ClientStatus::Connected);

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut keepalive = interval_at(Instant::now() + period, period);

    let result = if interrupted {
        Ok(())
    } else {
        let leftover = if buf.is_empty() {
            Ok(())
        } else {
            inner.with_state(|st| {
                let events = st.protocol.decode(&mut buf)?;
                st.apply_events(events);
                Ok::<_, ClientError>(())
            })
        };
        match leftover {
            Ok(()) => loop {
                tokio::select! {
                    signal = wake.recv() => match signal {
                        Some(Wake::Write) => {
                            if let Some(frame) = inner.with_state(|st| st.writer.pop()) {
                                hexdump(name, &frame);
                                if let Err(e) = writer.write_all(&frame).await {
                                    break Err(e.into());
                                }
                            }
                        }
                        Some(Wake::Close) | None => break Ok(()),
                    },
                    read = reader.read_buf(&mut buf) => {
                        let n = match read {
                            Ok(0) => break Err(ClientError::ConnectionClosed),
                            Ok(n) => n,
                            Err(e) => break Err(e.into()),
                        };
                        trace!("{}: Received {} bytes", name, n);
                        let decoded = inner.with_state(|st| {
                            let events = st.protocol.decode(&mut buf)?;
                            st.apply_events(events);
                            Ok::<_, ClientError>(())
                        });
                        if let Err(e) = decoded {
                            break Err(e);
                        }
                    }
                    _ = keepalive.tick() => {
                        inner.with_state(|st| {
                            if let Some(frame) = st.protocol.keepalive() {
                                trace!("{}: Sending keepalive", st.name);
                                st.writer.enqueue(frame);
                            }
                        });
                    }
                }
            },
            Err(e) => Err(e),
        }
    };

    inner.with_state(|st| st.session_ended());
    let _ = writer.shutdown().await;
    result
}
