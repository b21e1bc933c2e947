//! Application-facing node handle.
//!
//! The node event loop owns all state; applications talk to it through
//! cloneable handles that push commands over a channel and listen on the
//! event stream returned at construction.

use tokio::sync::{mpsc, oneshot};

use whisper_wire::PeerId;

use crate::error::NodeError;

/// What arriving chat traffic was addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContext {
    /// A channel the local node has joined
    Channel(String),
    /// A direct message to this node
    Private,
}

/// Events pushed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// A decrypted, verified chat message arrived
    MessageReceived {
        /// Sending peer
        sender: PeerId,
        /// Sender nickname, when known from discovery
        nickname: Option<String>,
        /// Channel or private
        context: MessageContext,
        /// Message text
        content: String,
    },
    /// A peer announced itself or came back online
    PeerSeen {
        /// The peer
        peer: PeerId,
        /// Announced nickname
        nickname: String,
    },
    /// A peer went unreachable
    PeerLost {
        /// The peer
        peer: PeerId,
    },
    /// A private message could not be sent and was parked offline
    DeliveryPending {
        /// Intended recipient
        recipient: PeerId,
    },
    /// The recipient acknowledged a private message
    Acked {
        /// Id of the acknowledged message
        message_id: u64,
    },
}

pub(crate) enum Command {
    SendPrivate {
        to: PeerId,
        content: String,
        reply: oneshot::Sender<Result<u64, NodeError>>,
    },
    SendChannel {
        channel: String,
        content: String,
        reply: oneshot::Sender<Result<u64, NodeError>>,
    },
    JoinChannel {
        channel: String,
        password: String,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    LeaveChannel {
        channel: String,
    },
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    SetDutyCycle(f32),
    Suspend,
    Resume,
    Wipe,
    Shutdown,
}

/// Cloneable handle to a running [`crate::MeshNode`].
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, NodeError>>) -> Command,
    ) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| NodeError::NodeStopped)?;
        rx.await.map_err(|_| NodeError::NodeStopped)?
    }

    /// Encrypt, sign, and send a private message. Returns the message id.
    pub async fn send_private(&self, to: PeerId, content: String) -> Result<u64, NodeError> {
        self.request(|reply| Command::SendPrivate { to, content, reply })
            .await
    }

    /// Encrypt and flood a channel message. Returns the message id.
    pub async fn send_channel(&self, channel: String, content: String) -> Result<u64, NodeError> {
        self.request(|reply| Command::SendChannel {
            channel,
            content,
            reply,
        })
        .await
    }

    /// Derive the channel key and start decrypting its traffic.
    pub async fn join_channel(&self, channel: String, password: String) -> Result<(), NodeError> {
        self.request(|reply| Command::JoinChannel {
            channel,
            password,
            reply,
        })
        .await
    }

    /// Forget a channel key.
    pub async fn leave_channel(&self, channel: String) -> Result<(), NodeError> {
        self.commands
            .send(Command::LeaveChannel { channel })
            .await
            .map_err(|_| NodeError::NodeStopped)
    }

    /// Start dialing a peer known to the transport.
    ///
    /// Returns once the attempt is in flight; the dial itself retries in
    /// the background.
    pub async fn connect(&self, peer: PeerId) -> Result<(), NodeError> {
        self.request(|reply| Command::Connect { peer, reply }).await
    }

    /// Hint the transport's radio duty cycle.
    pub async fn set_duty_cycle(&self, fraction: f32) -> Result<(), NodeError> {
        self.commands
            .send(Command::SetDutyCycle(fraction))
            .await
            .map_err(|_| NodeError::NodeStopped)
    }

    /// Drop all links and zeroize session keys, for power saving.
    pub async fn suspend(&self) -> Result<(), NodeError> {
        self.commands
            .send(Command::Suspend)
            .await
            .map_err(|_| NodeError::NodeStopped)
    }

    /// Reconnect after a suspend.
    pub async fn resume(&self) -> Result<(), NodeError> {
        self.commands
            .send(Command::Resume)
            .await
            .map_err(|_| NodeError::NodeStopped)
    }

    /// Destroy all session and channel key material.
    pub async fn wipe(&self) -> Result<(), NodeError> {
        self.commands
            .send(Command::Wipe)
            .await
            .map_err(|_| NodeError::NodeStopped)
    }

    /// Stop the node event loop.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| NodeError::NodeStopped)
    }
}
