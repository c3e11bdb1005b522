//! Core type definitions shared by every coordinator component.
//!
//! # Type Categories
//!
//! ## Identifiers
//! - [`MemberId`]: position of a member in the configured list; its ordering *is* the
//!   promotion order
//! - [`StreamId`], [`ServiceId`]: wire identifiers copied out of decoded messages
//! - [`Descriptor`]: opaque socket handle allocated by the transport
//!
//! ## Message Envelopes
//! - [`Envelope`]: the decoded view of one message. Only the fields routing and
//!   aggregation need are exposed; the encoded body travels as an opaque payload.
//! - [`StreamStatus`], [`ServiceEntry`], [`RoleNotice`]: structured parts of an envelope
//!
//! ## Application Events
//! - [`Event`]: the single tagged union returned from
//!   [`WarmStandbyGroup::dispatch`](crate::group::WarmStandbyGroup::dispatch)

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Stream id used for the login stream when the application does not pick one.
pub const LOGIN_STREAM_ID: StreamId = 1;

/// Stream id used for the directory stream when the application does not pick one.
pub const DIRECTORY_STREAM_ID: StreamId = 2;

pub type StreamId = i32;
pub type ServiceId = u16;

/// Index of a member in the configured connection list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub usize);

impl MemberId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member#{}", self.0)
    }
}

/// Socket handle backing one member link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(pub u64);

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Ownership granularity of a warm-standby group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandbyMode {
    /// One member is active for the whole session.
    #[default]
    LoginBased,
    /// Each service has its own active member.
    ServiceBased,
}

impl fmt::Display for StandbyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginBased => write!(f, "login_based"),
            Self::ServiceBased => write!(f, "service_based"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Active,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgClass {
    Request,
    Refresh,
    Update,
    Status,
    Close,
    Generic,
    Post,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Login,
    Source,
    Dictionary,
    MarketPrice,
    MarketByOrder,
    MarketByPrice,
    Other(u8),
}

impl Domain {
    /// Login and directory streams are session plumbing every member maintains on its own.
    #[inline]
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Login | Self::Source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Open,
    NonStreaming,
    ClosedRecover,
    Closed,
    Redirected,
}

impl StreamState {
    #[inline]
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedRecover | Self::Closed | Self::Redirected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataState {
    Ok,
    Suspect,
    NoChange,
}

/// Stream and data state carried by refresh and status messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub text: String,
}

impl StreamStatus {
    #[must_use]
    pub fn new(stream_state: StreamState, data_state: DataState, text: impl Into<String>) -> Self {
        Self { stream_state, data_state, text: text.into() }
    }

    #[must_use]
    pub fn open_ok() -> Self {
        Self::new(StreamState::Open, DataState::Ok, "")
    }

    #[must_use]
    pub fn open_suspect(text: impl Into<String>) -> Self {
        Self::new(StreamState::Open, DataState::Suspect, text)
    }

    #[must_use]
    pub fn closed_recover(text: impl Into<String>) -> Self {
        Self::new(StreamState::ClosedRecover, DataState::Suspect, text)
    }

    #[must_use]
    pub fn closed(text: impl Into<String>) -> Self {
        Self::new(StreamState::Closed, DataState::Suspect, text)
    }

    #[inline]
    #[must_use]
    pub fn is_open_suspect(&self) -> bool {
        self.stream_state == StreamState::Open && self.data_state == DataState::Suspect
    }

    #[inline]
    #[must_use]
    pub fn is_closed_recover(&self) -> bool {
        self.stream_state == StreamState::ClosedRecover
    }
}

/// Health of a service as reported by one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Up,
    Down,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Add,
    Update,
    Delete,
}

/// One service entry of a directory refresh or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_id: ServiceId,
    pub name: Option<String>,
    pub action: ServiceAction,
    pub state: ServiceState,
}

impl ServiceEntry {
    #[must_use]
    pub fn add(service_id: ServiceId, name: impl Into<String>, state: ServiceState) -> Self {
        Self { service_id, name: Some(name.into()), action: ServiceAction::Add, state }
    }

    #[must_use]
    pub fn update(service_id: ServiceId, state: ServiceState) -> Self {
        Self { service_id, name: None, action: ServiceAction::Update, state }
    }

    #[must_use]
    pub fn delete(service_id: ServiceId) -> Self {
        Self {
            service_id,
            name: None,
            action: ServiceAction::Delete,
            state: ServiceState::Deleted,
        }
    }
}

/// Role notification sent to one member after ownership changes.
///
/// Login-based groups carry a single role on the login stream; service-based groups
/// carry the changed per-service roles on the directory stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleNotice {
    Session(Role),
    Services(Vec<(ServiceId, Role)>),
}

/// Boolean message flags the coordinator inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct MsgFlags {
    pub private_stream: bool,
    pub streaming: bool,
    pub pause: bool,
    pub refresh_complete: bool,
    pub solicited: bool,
}

/// Decoded view of a single message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub class: MsgClass,
    pub domain: Domain,
    pub stream_id: StreamId,
    pub service_id: Option<ServiceId>,
    pub service_name: Option<String>,
    /// Item name, or the user name on login requests.
    pub key_name: Option<String>,
    pub flags: MsgFlags,
    pub status: Option<StreamStatus>,
    /// Directory service deltas; empty for every other domain.
    pub services: Vec<ServiceEntry>,
    pub role: Option<RoleNotice>,
    pub attributes: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl Envelope {
    #[must_use]
    pub fn new(class: MsgClass, domain: Domain, stream_id: StreamId) -> Self {
        Self {
            class,
            domain,
            stream_id,
            service_id: None,
            service_name: None,
            key_name: None,
            flags: MsgFlags::default(),
            status: None,
            services: Vec::new(),
            role: None,
            attributes: BTreeMap::new(),
            payload: Bytes::new(),
        }
    }

    /// Streaming request for `key_name` on `domain`.
    #[must_use]
    pub fn request(domain: Domain, stream_id: StreamId, key_name: impl Into<String>) -> Self {
        let mut env = Self::new(MsgClass::Request, domain, stream_id);
        env.key_name = Some(key_name.into());
        env.flags.streaming = true;
        env
    }

    /// Login request for `user_name` on the default login stream.
    #[must_use]
    pub fn login_request(user_name: impl Into<String>) -> Self {
        Self::request(Domain::Login, LOGIN_STREAM_ID, user_name)
    }

    /// Directory request on `stream_id`.
    #[must_use]
    pub fn directory_request(stream_id: StreamId) -> Self {
        let mut env = Self::new(MsgClass::Request, Domain::Source, stream_id);
        env.flags.streaming = true;
        env
    }

    /// Complete, solicited, OPEN/OK refresh.
    #[must_use]
    pub fn refresh(domain: Domain, stream_id: StreamId) -> Self {
        let mut env = Self::new(MsgClass::Refresh, domain, stream_id);
        env.flags.refresh_complete = true;
        env.flags.solicited = true;
        env.status = Some(StreamStatus::open_ok());
        env
    }

    #[must_use]
    pub fn update(domain: Domain, stream_id: StreamId) -> Self {
        Self::new(MsgClass::Update, domain, stream_id)
    }

    #[must_use]
    pub fn status(domain: Domain, stream_id: StreamId, status: StreamStatus) -> Self {
        let mut env = Self::new(MsgClass::Status, domain, stream_id);
        env.status = Some(status);
        env
    }

    #[must_use]
    pub fn close(domain: Domain, stream_id: StreamId) -> Self {
        Self::new(MsgClass::Close, domain, stream_id)
    }

    #[must_use]
    pub fn generic(domain: Domain, stream_id: StreamId) -> Self {
        Self::new(MsgClass::Generic, domain, stream_id)
    }

    #[must_use]
    pub fn post(domain: Domain, stream_id: StreamId) -> Self {
        Self::new(MsgClass::Post, domain, stream_id)
    }

    #[must_use]
    pub fn with_service_id(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    #[must_use]
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_services(mut self, services: Vec<ServiceEntry>) -> Self {
        self.services = services;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.flags.private_stream = true;
        self
    }

    #[must_use]
    pub fn snapshot(mut self) -> Self {
        self.flags.streaming = false;
        self
    }

    #[must_use]
    pub fn paused(mut self) -> Self {
        self.flags.pause = true;
        self
    }

    #[must_use]
    pub fn unsolicited(mut self) -> Self {
        self.flags.solicited = false;
        self
    }

    #[must_use]
    pub fn partial(mut self) -> Self {
        self.flags.refresh_complete = false;
        self
    }

    /// True for a STATUS or REFRESH whose stream state ends the stream.
    #[must_use]
    pub fn closes_stream(&self) -> bool {
        matches!(self.class, MsgClass::Status | MsgClass::Refresh)
            && self.status.as_ref().is_some_and(|s| s.stream_state.is_closed())
    }
}

/// Add/remove diff of the descriptor set backing the logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SocketSetDiff {
    pub added: Vec<Descriptor>,
    pub removed: Vec<Descriptor>,
    /// Descriptors of members currently active for at least one scope.
    pub active: Vec<Descriptor>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Up,
    Ready,
    Down,
    DownReconnecting,
    SocketSetChanged(SocketSetDiff),
}

/// Where a delivered message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Member(MemberId),
    /// Synthesized by the group itself, e.g. failover status.
    Group,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub origin: Origin,
}

/// Everything the application observes from a warm-standby group.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Channel(ChannelEvent),
    Msg(Delivery),
    LoginMsg(Delivery),
    DirectoryMsg(Delivery),
}

impl Event {
    /// Wraps `envelope` in the event kind matching its domain.
    #[must_use]
    pub fn delivery(envelope: Envelope, origin: Origin) -> Self {
        let domain = envelope.domain;
        let delivery = Delivery { envelope, origin };
        match domain {
            Domain::Login => Self::LoginMsg(delivery),
            Domain::Source => Self::DirectoryMsg(delivery),
            _ => Self::Msg(delivery),
        }
    }

    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Msg(d) | Self::LoginMsg(d) | Self::DirectoryMsg(d) => Some(&d.envelope),
            Self::Channel(_) => None,
        }
    }

    #[must_use]
    pub fn origin(&self) -> Option<Origin> {
        match self {
            Self::Msg(d) | Self::LoginMsg(d) | Self::DirectoryMsg(d) => Some(d.origin),
            Self::Channel(_) => None,
        }
    }

    #[must_use]
    pub fn channel(&self) -> Option<&ChannelEvent> {
        match self {
            Self::Channel(event) => Some(event),
            _ => None,
        }
    }
}
