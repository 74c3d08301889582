//! Concurrent execution of the control channel.
//!
//! The [`ControlChannel`] runs on its own task. The event loop hands it
//! control packets and receives datagrams to send and events through
//! channels; the key ring is the only state both sides touch.

use std::future;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::core::ControlError;
use crate::crypto::SharedKeyRing;

use super::channel::{ControlChannel, ControlEvent};

/// Queue depth in each direction.
const WORKER_QUEUE_DEPTH: usize = 32;

/// Completed work reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutput {
    /// A control datagram to put on the link.
    Send(Vec<u8>),
    /// A state change for the session.
    Event(ControlEvent),
}

/// Handle to a control channel running on its own task.
#[derive(Debug)]
pub struct ControlWorker {
    input: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    output: mpsc::Receiver<ControlOutput>,
    keys: SharedKeyRing,
    task: JoinHandle<()>,
}

impl ControlWorker {
    /// Move `channel` onto a new task.
    pub fn spawn(channel: ControlChannel) -> Self {
        let (input, input_rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        let (output_tx, output) = mpsc::channel(WORKER_QUEUE_DEPTH);
        let keys = channel.current_keys();
        let task = tokio::spawn(run(channel, input_rx, output_tx));
        Self {
            input,
            output,
            keys,
            task,
        }
    }

    /// The key ring shared with the worker.
    pub fn current_keys(&self) -> SharedKeyRing {
        self.keys.clone()
    }

    /// Hand a control-addressed datagram to the worker.
    ///
    /// A full queue drops the packet; the handshake retransmits.
    pub fn submit(&self, packet: Vec<u8>, from: SocketAddr) -> Result<(), ControlError> {
        match self.input.try_send((packet, from)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("control queue full, dropping packet");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ControlError::WorkerGone),
        }
    }

    /// Wait for the next piece of completed work.
    pub async fn recv(&mut self) -> Result<ControlOutput, ControlError> {
        self.output.recv().await.ok_or(ControlError::WorkerGone)
    }
}

impl Drop for ControlWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut channel: ControlChannel,
    mut input: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    output: mpsc::Sender<ControlOutput>,
) {
    let mut wakeup = channel.process(Instant::now());
    loop {
        while let Some(packet) = channel.drain_outgoing() {
            if output.send(ControlOutput::Send(packet)).await.is_err() {
                return;
            }
        }
        while let Some(event) = channel.take_event() {
            if output.send(ControlOutput::Event(event)).await.is_err() {
                return;
            }
        }

        let timer = async {
            match wakeup {
                Some(at) => sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            msg = input.recv() => match msg {
                Some((packet, from)) => channel.submit_incoming(packet, from),
                None => return,
            },
            _ = timer => {}
        }

        wakeup = channel.process(Instant::now());
    }
}
