//! Boundary between the coordinator and the physical links.
//!
//! A [`Connector`] opens one [`Link`] per member. Outbound traffic is written through
//! [`Link::send`]; inbound traffic flows the other way through the [`LinkEventSender`]
//! handed to the connector, so every member feeds the same channel the group drains
//! in [`dispatch`](crate::group::WarmStandbyGroup::dispatch).
//!
//! ```text
//!  Connector::connect ──► Box<dyn Link> ◄── Link::send (group → provider)
//!         │
//!         └─ LinkEventSender ──► mpsc ──► dispatch (provider → group)
//! ```
//!
//! Each connect attempt carries a generation number. Events from an older generation
//! of the same member are discarded, so a late message from a dead link can never be
//! mistaken for traffic on its replacement.

use crate::{
    config::Credentials,
    errors::TransportError,
    types::{Descriptor, Envelope, MemberId},
};
use tokio::sync::mpsc;

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The link buffer is full; the caller keeps the message and retries later.
    WouldBlock,
}

/// One open connection to a provider.
pub trait Link: Send {
    fn descriptor(&self) -> Descriptor;

    /// Writes one message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the link is broken.
    fn send(&mut self, msg: &Envelope) -> Result<SendOutcome, TransportError>;

    fn close(&mut self);
}

/// Opens links to member endpoints.
pub trait Connector: Send {
    /// Starts a connection attempt.
    ///
    /// The returned link may still be handshaking; the transport reports
    /// [`LinkEventKind::Established`] through `request.events` once it can carry traffic.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] if the endpoint cannot be reached.
    fn connect(&mut self, request: ConnectRequest) -> Result<Box<dyn Link>, TransportError>;
}

/// Everything a connector needs to open a member link.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub member: MemberId,
    pub name: String,
    pub endpoint: String,
    pub credentials: Credentials,
    pub events: LinkEventSender,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    Established,
    Message(Envelope),
    Closed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub member: MemberId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// Inbound handle bound to one connect attempt of one member.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    member: MemberId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSender {
    pub(crate) fn new(
        member: MemberId,
        generation: u64,
        tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self { member, generation, tx }
    }

    #[must_use]
    pub fn member(&self) -> MemberId {
        self.member
    }

    /// Reports that the link can carry traffic. Returns `false` once the group is gone.
    pub fn established(&self) -> bool {
        self.emit(LinkEventKind::Established)
    }

    /// Hands one decoded inbound message to the group.
    pub fn message(&self, envelope: Envelope) -> bool {
        self.emit(LinkEventKind::Message(envelope))
    }

    /// Reports that the link failed or was closed by the peer.
    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.emit(LinkEventKind::Closed(reason.into()))
    }

    fn emit(&self, kind: LinkEventKind) -> bool {
        self.tx.send(LinkEvent { member: self.member, generation: self.generation, kind }).is_ok()
    }
}
