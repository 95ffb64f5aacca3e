//! Application coordinator for BitChat
//!
//! The seam between the protocol engine and whatever sits on top of it
//! (UI, command parser, bridges). Commands come in through a bounded
//! submission channel with synchronous admission; events go out through a
//! single-consumer stream. The coordinator owns the announce beacon and
//! the panic teardown; it holds no protocol state of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::BitchatConfig;
use crate::crypto::BitchatIdentity;
use crate::error::{Error, Result};
use crate::mesh::{MeshConfig, MeshService, MeshStats};
use crate::protocol::{Fingerprint, PeerId, MAX_CONTENT_LEN, MAX_NICKNAME_LEN};
use crate::transport::Transport;

pub use crate::mesh::MeshEvent as Event;

/// Depth of the command submission queue
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Commands accepted from the application layer
#[derive(Debug, Clone)]
pub enum Command {
    SendBroadcast { content: String },
    SendDirect { peer_id: PeerId, content: String },
    Announce { nickname: Option<String> },
    Disconnect { peer_id: PeerId },
    Panic,
}

/// The assembled BitChat node
pub struct BitchatApp {
    identity: Arc<BitchatIdentity>,
    mesh: Arc<MeshService>,
    config: BitchatConfig,
    command_sender: mpsc::Sender<Command>,
    command_receiver: Mutex<Option<mpsc::Receiver<Command>>>,
    event_receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    running: Arc<AtomicBool>,
}

impl BitchatApp {
    pub fn new(
        identity: Arc<BitchatIdentity>,
        transport: Arc<dyn Transport>,
        config: BitchatConfig,
    ) -> Self {
        let mesh_config = MeshConfig {
            max_ttl: config.max_ttl,
            power_mode: config.power_mode,
        };
        let (mesh, event_receiver) = MeshService::new(identity.clone(), transport, mesh_config);
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        Self {
            identity,
            mesh,
            config,
            command_sender,
            command_receiver: Mutex::new(Some(command_receiver)),
            event_receiver: Mutex::new(Some(event_receiver)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bring up the mesh, the command loop and the announce beacon
    pub async fn start(&self) -> Result<()> {
        let receiver = self
            .command_receiver
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("app already started".to_string()))?;

        self.running.store(true, Ordering::Release);
        self.mesh.start().await?;
        self.spawn_command_loop(receiver);
        self.spawn_announce_beacon();

        log::info!(
            "node up: peer id {}, fingerprint {}",
            self.peer_id(),
            self.fingerprint()
        );
        Ok(())
    }

    /// Submit a command. Admission is synchronous: invalid commands and a
    /// full queue are rejected here, everything else is accepted for
    /// asynchronous execution.
    pub fn submit(&self, command: Command) -> Result<()> {
        self.validate(&command)?;
        self.command_sender
            .try_send(command)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Backpressure("command queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::InvalidState("node is shut down".to_string())
                }
            })
    }

    /// Hand out the event stream. Single consumer; `None` after the first
    /// call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.event_receiver.lock().take()
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub fn mesh(&self) -> &Arc<MeshService> {
        &self.mesh
    }

    pub fn stats(&self) -> MeshStats {
        self.mesh.stats()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn validate(&self, command: &Command) -> Result<()> {
        match command {
            Command::SendBroadcast { content } | Command::SendDirect { content, .. } => {
                if content.is_empty() {
                    return Err(Error::InvalidInput("empty message content".to_string()));
                }
                if content.len() > MAX_CONTENT_LEN {
                    return Err(Error::InvalidInput(format!(
                        "content of {} bytes exceeds limit",
                        content.len()
                    )));
                }
            }
            Command::Announce { nickname: Some(nickname) } => {
                if nickname.len() > MAX_NICKNAME_LEN {
                    return Err(Error::InvalidInput("nickname too long".to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn spawn_command_loop(&self, mut receiver: mpsc::Receiver<Command>) {
        let mesh = self.mesh.clone();
        let running = self.running.clone();
        let nickname = self.config.nickname.clone();

        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::SendBroadcast { content } => {
                        if let Err(e) = mesh.send_broadcast(&content, Some(nickname.clone())).await
                        {
                            log::warn!("broadcast failed: {}", e);
                        }
                    }
                    Command::SendDirect { peer_id, content } => {
                        if let Err(e) = mesh
                            .send_direct(peer_id, &content, Some(nickname.clone()))
                            .await
                        {
                            log::warn!("direct send to {} failed: {}", peer_id, e);
                        }
                    }
                    Command::Announce { nickname: hint } => {
                        let name = hint.unwrap_or_else(|| nickname.clone());
                        if let Err(e) = mesh.announce(&name).await {
                            log::warn!("announce failed: {}", e);
                        }
                    }
                    Command::Disconnect { peer_id } => {
                        if let Err(e) = mesh.disconnect(peer_id).await {
                            log::warn!("disconnect of {} failed: {}", peer_id, e);
                        }
                    }
                    Command::Panic => {
                        running.store(false, Ordering::Release);
                        mesh.panic_wipe().await;
                        break;
                    }
                }
            }
            log::info!("command loop stopped");
        });
    }

    fn spawn_announce_beacon(&self) {
        let mesh = self.mesh.clone();
        let running = self.running.clone();
        let nickname = self.config.nickname.clone();
        let cadence = if self.config.low_visibility {
            Duration::from_secs(8)
        } else {
            self.config.announce_interval
        };

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cadence);
            loop {
                tick.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = mesh.announce(&nickname).await {
                    log::debug!("periodic announce failed: {}", e);
                }
            }
        });
    }

    /// Orderly shutdown: tell the mesh we are leaving, stop everything
    pub async fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let _ = self.mesh.leave().await;
        self.mesh.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};

    fn test_app() -> BitchatApp {
        let identity = Arc::new(BitchatIdentity::generate());
        let hub = MemoryHub::new();
        let transport = MemoryTransport::register(&hub, identity.peer_id());
        BitchatApp::new(identity, transport, BitchatConfig::default())
    }

    #[test]
    fn test_invalid_commands_rejected_synchronously() {
        let app = test_app();

        assert!(matches!(
            app.submit(Command::SendBroadcast { content: String::new() }),
            Err(Error::InvalidInput(_))
        ));

        let oversize = "x".repeat(MAX_CONTENT_LEN + 1);
        assert!(app
            .submit(Command::SendBroadcast { content: oversize })
            .is_err());

        assert!(app
            .submit(Command::Announce {
                nickname: Some("n".repeat(MAX_NICKNAME_LEN + 1)),
            })
            .is_err());
    }

    #[test]
    fn test_backpressure_on_full_queue() {
        let app = test_app();

        // Nothing drains the queue before start(); fill it up
        for i in 0..COMMAND_QUEUE_DEPTH {
            app.submit(Command::SendBroadcast {
                content: format!("msg {}", i),
            })
            .unwrap();
        }
        assert!(matches!(
            app.submit(Command::SendBroadcast { content: "overflow".to_string() }),
            Err(Error::Backpressure(_))
        ));
    }

    #[test]
    fn test_event_stream_single_consumer() {
        let app = test_app();
        assert!(app.events().is_some());
        assert!(app.events().is_none());
    }
}
