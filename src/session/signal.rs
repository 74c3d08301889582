//! Shutdown and restart requests.
//!
//! A [`SignalHandle`] may be cloned and handed to anything that wants to
//! stop or restart the tunnel. The event loop owns the matching
//! [`SignalReceiver`] and samples it at the top of each iteration, so a
//! request never interrupts a packet halfway through the pipeline.

use std::future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// An external request to the running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Stop everything.
    Terminate,
    /// Restart and reload configuration.
    Hangup,
    /// Restart, keeping state selected by the persist flags.
    UserRestart,
    /// Log counters and keep running.
    UserStats,
}

/// Sending side; cheap to clone.
#[derive(Debug, Clone)]
pub struct SignalHandle {
    tx: mpsc::UnboundedSender<SignalKind>,
}

/// Receiving side, owned by the event loop.
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::UnboundedReceiver<SignalKind>,
    pending: Option<SignalKind>,
}

/// Create a connected handle and receiver.
pub fn signal_channel() -> (SignalHandle, SignalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalHandle { tx }, SignalReceiver { rx, pending: None })
}

impl SignalHandle {
    /// Request `kind`. Returns false if the receiver is gone.
    pub fn raise(&self, kind: SignalKind) -> bool {
        self.tx.send(kind).is_ok()
    }
}

impl SignalReceiver {
    /// Wait until a request is available without consuming it.
    ///
    /// Never completes once every handle has been dropped.
    pub async fn wait(&mut self) {
        if self.pending.is_some() {
            return;
        }
        match self.rx.recv().await {
            Some(kind) => self.pending = Some(kind),
            None => future::pending::<()>().await,
        }
    }

    /// Take the oldest outstanding request.
    pub fn take(&mut self) -> Option<SignalKind> {
        self.pending.take().or_else(|| self.rx.try_recv().ok())
    }
}

/// Forward process signals to `handle`.
///
/// `SIGINT`/`SIGTERM` terminate, `SIGHUP` reloads, `SIGUSR1` restarts and
/// `SIGUSR2` dumps statistics.
#[cfg(unix)]
pub fn forward_os_signals(handle: SignalHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind as Os, signal};

    let mut interrupt = signal(Os::interrupt())?;
    let mut terminate = signal(Os::terminate())?;
    let mut hangup = signal(Os::hangup())?;
    let mut usr1 = signal(Os::user_defined1())?;
    let mut usr2 = signal(Os::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            let kind = tokio::select! {
                _ = interrupt.recv() => SignalKind::Terminate,
                _ = terminate.recv() => SignalKind::Terminate,
                _ = hangup.recv() => SignalKind::Hangup,
                _ = usr1.recv() => SignalKind::UserRestart,
                _ = usr2.recv() => SignalKind::UserStats,
            };
            info!(?kind, "signal received");
            if !handle.raise(kind) {
                return;
            }
        }
    }))
}

/// Forward Ctrl-C to `handle` as a terminate request.
#[cfg(not(unix))]
pub fn forward_os_signals(handle: SignalHandle) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            if !handle.raise(SignalKind::Terminate) {
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_does_not_consume() {
        let (handle, mut rx) = signal_channel();
        handle.raise(SignalKind::UserStats);
        handle.raise(SignalKind::Terminate);

        rx.wait().await;
        assert_eq!(rx.take(), Some(SignalKind::UserStats));
        assert_eq!(rx.take(), Some(SignalKind::Terminate));
        assert_eq!(rx.take(), None);
    }

    #[tokio::test]
    async fn test_dropped_handle_never_wakes() {
        let (handle, mut rx) = signal_channel();
        drop(handle);
        let woke = tokio::time::timeout(std::time::Duration::from_millis(20), rx.wait()).await;
        assert!(woke.is_err());
        assert_eq!(rx.take(), None);
    }
}
