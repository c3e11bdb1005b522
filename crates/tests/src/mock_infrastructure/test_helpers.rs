//! Test Helper Functions and Utilities
//!
//! Builders for groups wired to a [`MockNetwork`], dispatch shortcuts and event filters.

use super::mock_provider::{MockNetwork, MockProvider};
use std::time::Duration;
use tandem_core::{
    config::{HandshakeConfig, ReconnectConfig},
    group::{SubmitOptions, WarmStandbyGroup, WarmStandbyGroupBuilder},
    types::{
        ChannelEvent, Delivery, Domain, Envelope, Event, MemberId, Origin, ServiceEntry,
        ServiceState, StandbyMode, StreamId, StreamStatus,
    },
};

/// Group under test plus handles to its providers, in member order.
pub struct Harness {
    pub group: WarmStandbyGroup,
    pub network: MockNetwork,
    pub providers: Vec<MockProvider>,
}

impl Harness {
    #[must_use]
    pub fn provider(&self, member: usize) -> &MockProvider {
        &self.providers[member]
    }
}

/// Endpoint of the `index`-th test member.
#[must_use]
pub fn endpoint(index: usize) -> String {
    format!("provider-{index}:14002")
}

/// Unlimited, jitter-free reconnects starting at 100ms.
#[must_use]
pub fn fast_reconnect(attempt_limit: i32) -> ReconnectConfig {
    ReconnectConfig { attempt_limit, min_delay_ms: 100, max_delay_ms: 1_000, jitter_factor: 0.0 }
}

#[must_use]
pub fn handshake(request_directory: bool) -> HandshakeConfig {
    HandshakeConfig { login_timeout_ms: 5_000, directory_timeout_ms: 5_000, request_directory }
}

/// Builds an unconnected group of `members` mock providers.
///
/// # Panics
///
/// Panics if the builder rejects the settings.
#[must_use]
pub fn harness_with(
    mode: StandbyMode,
    members: usize,
    configure: impl FnOnce(WarmStandbyGroupBuilder) -> WarmStandbyGroupBuilder,
) -> Harness {
    let network = MockNetwork::new();
    let mut builder = WarmStandbyGroupBuilder::new()
        .mode(mode)
        .reconnect(fast_reconnect(-1))
        .handshake(handshake(true));
    for index in 0..members {
        builder = builder.member(format!("member-{index}"), endpoint(index));
    }
    let group = configure(builder).connector(network.connector()).build().unwrap();
    let providers = (0..members).map(|index| network.provider(&endpoint(index))).collect();
    Harness { group, network, providers }
}

#[must_use]
pub fn harness(mode: StandbyMode, members: usize) -> Harness {
    harness_with(mode, members, |builder| builder)
}

/// One non-blocking dispatch pass returning every queued event.
pub async fn drain(group: &mut WarmStandbyGroup) -> Vec<Event> {
    group.dispatch(usize::MAX, Duration::ZERO).await
}

/// Dispatches until `timeout` passes, collecting everything produced.
pub async fn run_for(group: &mut WarmStandbyGroup, timeout: Duration) -> Vec<Event> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut events = Vec::new();
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        events.extend(group.dispatch(usize::MAX, deadline - now).await);
    }
    events
}

/// Connects, logs in every member and answers directory requests with `services`
/// (one list per member). Returns every event produced on the way.
pub async fn bring_up(h: &mut Harness, services: &[Vec<ServiceEntry>]) -> Vec<Event> {
    h.group.connect();
    h.group.submit(Envelope::login_request("trader"), SubmitOptions::default()).unwrap();
    let mut events = drain(&mut h.group).await;

    for provider in &h.providers {
        provider.respond_login();
    }
    events.extend(drain(&mut h.group).await);

    for (provider, entries) in h.providers.iter().zip(services) {
        provider.send_directory_refresh(entries.clone());
    }
    events.extend(drain(&mut h.group).await);
    events
}

#[must_use]
pub fn service(id: u16, name: &str) -> ServiceEntry {
    ServiceEntry::add(id, name, ServiceState::Up)
}

#[must_use]
pub fn channel_events(events: &[Event]) -> Vec<ChannelEvent> {
    events.iter().filter_map(|e| e.channel().cloned()).collect()
}

/// Channel events without socket-set diffs.
#[must_use]
pub fn lifecycle(events: &[Event]) -> Vec<ChannelEvent> {
    channel_events(events)
        .into_iter()
        .filter(|e| !matches!(e, ChannelEvent::SocketSetChanged(_)))
        .collect()
}

#[must_use]
pub fn item_messages(events: &[Event], stream_id: StreamId) -> Vec<Delivery> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Msg(d) if d.envelope.stream_id == stream_id => Some(d.clone()),
            _ => None,
        })
        .collect()
}

#[must_use]
pub fn login_messages(events: &[Event]) -> Vec<Delivery> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::LoginMsg(d) => Some(d.clone()),
            _ => None,
        })
        .collect()
}

#[must_use]
pub fn directory_messages(events: &[Event]) -> Vec<Delivery> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::DirectoryMsg(d) => Some(d.clone()),
            _ => None,
        })
        .collect()
}

/// Statuses delivered for `stream_id`, in order.
#[must_use]
pub fn statuses(events: &[Event], stream_id: StreamId) -> Vec<StreamStatus> {
    item_messages(events, stream_id)
        .into_iter()
        .filter(|d| d.envelope.class == tandem_core::types::MsgClass::Status)
        .filter_map(|d| d.envelope.status)
        .collect()
}

#[must_use]
pub fn from_member(delivery: &Delivery, member: usize) -> bool {
    delivery.origin == Origin::Member(MemberId(member))
}

/// Streaming market price request for `key` on `stream_id`.
#[must_use]
pub fn item_request(stream_id: StreamId, key: &str) -> Envelope {
    Envelope::request(Domain::MarketPrice, stream_id, key)
}
