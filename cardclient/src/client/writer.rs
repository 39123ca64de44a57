//! Outbound message queue drained by the session task.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Signals for the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// A message was queued.
    Write,
    /// Close the connection.
    Close,
}

/// FIFO of frames waiting for the socket.
///
/// Producers only touch it under the client lock; frames queued while no
/// session is active are dropped.
#[derive(Debug, Default)]
pub(crate) struct WritePipeline {
    queue: VecDeque<Bytes>,
    running: bool,
    wake: Option<mpsc::UnboundedSender<Wake>>,
}

impl WritePipeline {
    /// Connect the pipeline to a worker's wake channel.
    pub fn attach(&mut self, wake: mpsc::UnboundedSender<Wake>) {
        self.wake = Some(wake);
    }

    pub fn detach(&mut self) {
        self.disable();
        self.wake = None;
    }

    /// Start accepting messages (session established).
    pub fn enable(&mut self) {
        self.queue.clear();
        self.running = true;
    }

    /// Stop accepting messages and drop everything queued.
    pub fn disable(&mut self) {
        self.running = false;
        self.queue.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Queue a frame. Returns false if it was dropped.
    pub fn enqueue(&mut self, msg: Bytes) -> bool {
        if !self.running {
            return false;
        }
        let Some(wake) = &self.wake else {
            return false;
        };
        self.queue.push_back(msg);
        if wake.send(Wake::Write).is_err() {
            self.queue.pop_back();
            return false;
        }
        true
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Ask the session task to close its connection.
    pub fn close(&self) {
        if let Some(wake) = &self.wake {
            let _ = wake.send(Wake::Close);
        }
    }
}
