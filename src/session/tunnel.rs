//! Restart driver.
//!
//! [`Tunnel`] runs sessions back to back until one ends for good. A user or
//! keepalive restart hands over whatever the persist flags keep. A hangup
//! is a full restart: configuration is reloaded and nothing is kept except
//! the packet-id file.

use std::io;

use tracing::info;

use crate::core::{ConfigError, TunnelError, VirtualInterface};

use super::config::SessionConfig;
use super::event_loop::{Carryover, ExitReason, Session, SessionExit};
use super::signal::SignalReceiver;

type OpenInterface<I> = Box<dyn FnMut(&SessionConfig) -> io::Result<I> + Send>;
type ReloadConfig = Box<dyn FnMut() -> Result<SessionConfig, ConfigError> + Send>;

/// Runs sessions until a terminal exit.
pub struct Tunnel<I> {
    config: SessionConfig,
    signals: SignalReceiver,
    open_interface: OpenInterface<I>,
    reload: Option<ReloadConfig>,
    restarts: u32,
}

impl<I: VirtualInterface> Tunnel<I> {
    /// Create a driver. `open_interface` is called whenever a session
    /// starts without a kept interface.
    pub fn new(
        config: SessionConfig,
        signals: SignalReceiver,
        open_interface: impl FnMut(&SessionConfig) -> io::Result<I> + Send + 'static,
    ) -> Self {
        Self {
            config,
            signals,
            open_interface: Box::new(open_interface),
            reload: None,
            restarts: 0,
        }
    }

    /// Source of fresh configuration on hangup. Without one the current
    /// configuration is reused.
    pub fn with_reload(
        mut self,
        reload: impl FnMut() -> Result<SessionConfig, ConfigError> + Send + 'static,
    ) -> Self {
        self.reload = Some(Box::new(reload));
        self
    }

    /// Sessions restarted so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Run until a terminate request, inactivity or keepalive exit.
    ///
    /// # Errors
    /// Configuration errors and session-fatal errors end the tunnel.
    pub async fn run(&mut self) -> Result<ExitReason, TunnelError> {
        let mut interface = None;
        let mut carry = Carryover::default();

        loop {
            let iface = match interface.take() {
                Some(iface) => iface,
                None => (self.open_interface)(&self.config)?,
            };
            let session = Session::start(self.config.clone(), iface, carry).await?;
            let exit = session.run(&mut self.signals).await?;

            if !exit.reason.is_restart() {
                info!(reason = %exit.reason, restarts = self.restarts, "tunnel stopped");
                return Ok(exit.reason);
            }

            self.restarts += 1;
            if exit.reason.reloads_config() {
                if let Some(reload) = &mut self.reload {
                    self.config = reload()?;
                    info!("configuration reloaded");
                }
            }
            let reason = exit.reason;
            (interface, carry) = hand_over(exit, self.config.persist.tun);
            info!(%reason, restarts = self.restarts, "restarting session");
        }
    }
}

/// What the next session starts from after `exit`.
fn hand_over<I>(exit: SessionExit<I>, persist_tun: bool) -> (Option<I>, Carryover) {
    if exit.reason.reloads_config() {
        return (None, Carryover::default());
    }
    (persist_tun.then_some(exit.interface), exit.carry)
}
