//! One provider connection inside the group.
//!
//! [`Member`] owns one link together with its handshake deadlines and reconnect
//! schedule. It also keeps the services the provider last reported and any writes a
//! blocked link held back. Roles and routing live in the coordinator, which reads a
//! member through [`MemberView`].

use crate::{
    config::{MemberConfig, ReconnectConfig},
    errors::TransportError,
    group::roles::{MemberView, ScopeKey},
    transport::{ConnectRequest, Connector, Link, LinkEvent, LinkEventSender, SendOutcome},
    types::{
        Descriptor, Domain, Envelope, MemberId, Role, ServiceEntry, ServiceId, ServiceState,
        StreamId,
    },
};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

/// Lifecycle of one member link.
///
/// ```text
/// Down ──► Connecting ──► Up ──► Ready
///              ▲                  │
///              └─ DownReconnecting ◄┘ (budget left)
///                                 └──► Down (budget exhausted, terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    Down,
    Connecting,
    /// Link established, login not yet answered.
    Up,
    /// Login refresh received.
    Ready,
    DownReconnecting,
}

impl MemberState {
    /// UP or READY: the member accepts writes.
    #[inline]
    #[must_use]
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up | Self::Ready)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Connecting => "connecting",
            Self::Up => "up",
            Self::Ready => "ready",
            Self::DownReconnecting => "down_reconnecting",
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake phase guarded by a per-member deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handshake {
    Connect,
    Login,
    Directory,
}

impl Handshake {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Login => "login",
            Self::Directory => "directory",
        }
    }
}

/// A service as one member reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceView {
    pub service_id: ServiceId,
    pub name: Option<String>,
    pub state: ServiceState,
}

/// Counts consecutive failures of one member and schedules its next reconnect.
///
/// The count resets only when the member reaches READY, so a provider that accepts
/// connections but never answers the login still exhausts the budget.
#[derive(Debug, Default)]
pub(crate) struct ReconnectTracker {
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
}

impl ReconnectTracker {
    /// Records a failure and returns when to retry, or `None` once the budget is spent.
    pub(crate) fn record_failure(
        &mut self,
        policy: &ReconnectConfig,
        now: Instant,
    ) -> Option<Instant> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.should_stop_retrying(policy) {
            self.next_attempt_at = None;
            return None;
        }

        let at = now + backoff_delay(policy, self.consecutive_failures);
        self.next_attempt_at = Some(at);
        Some(at)
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.next_attempt_at = None;
    }

    #[must_use]
    pub(crate) fn should_stop_retrying(&self, policy: &ReconnectConfig) -> bool {
        u32::try_from(policy.attempt_limit)
            .is_ok_and(|limit| self.consecutive_failures > limit)
    }

    pub(crate) fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Exponential backoff for the `attempt`-th consecutive failure, capped and jittered.
pub(crate) fn backoff_delay(policy: &ReconnectConfig, attempt: u32) -> Duration {
    use rand::Rng;

    let exponent = attempt.saturating_sub(1).min(10);
    let base_delay = policy.min_delay_ms.saturating_mul(1u64 << exponent);
    let capped_delay = base_delay.min(policy.max_delay_ms);

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let jitter_range = (capped_delay as f64 * policy.jitter_factor) as u64;
    let jitter_offset =
        if jitter_range > 0 { rand::rng().random_range(0..jitter_range) } else { 0 };

    Duration::from_millis(capped_delay.saturating_sub(jitter_range / 2) + jitter_offset)
}

/// One physical link to one provider plus its handshake and service state.
pub(crate) struct Member {
    id: MemberId,
    config: MemberConfig,
    state: MemberState,
    link: Option<Box<dyn Link>>,
    descriptor: Option<Descriptor>,
    generation: u64,
    login_stream_id: Option<StreamId>,
    directory_stream_id: Option<StreamId>,
    directory_received: bool,
    services: BTreeMap<ServiceId, ServiceView>,
    deadline: Option<(Handshake, Instant)>,
    outbound: VecDeque<Envelope>,
    reconnect: ReconnectTracker,
    roles: BTreeMap<ScopeKey, Role>,
}

impl Member {
    pub(crate) fn new(id: MemberId, config: MemberConfig) -> Self {
        Self {
            id,
            config,
            state: MemberState::Down,
            link: None,
            descriptor: None,
            generation: 0,
            login_stream_id: None,
            directory_stream_id: None,
            directory_received: false,
            services: BTreeMap::new(),
            deadline: None,
            outbound: VecDeque::new(),
            reconnect: ReconnectTracker::default(),
            roles: BTreeMap::new(),
        }
    }

    pub(crate) fn id(&self) -> MemberId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn config(&self) -> &MemberConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> MemberState {
        self.state
    }

    pub(crate) fn is_up(&self) -> bool {
        self.state.is_up()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == MemberState::Ready
    }

    pub(crate) fn descriptor(&self) -> Option<Descriptor> {
        self.descriptor
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn login_stream_id(&self) -> Option<StreamId> {
        self.login_stream_id
    }

    pub(crate) fn directory_stream_id(&self) -> Option<StreamId> {
        self.directory_stream_id
    }

    pub(crate) fn directory_received(&self) -> bool {
        self.directory_received
    }

    pub(crate) fn services(&self) -> &BTreeMap<ServiceId, ServiceView> {
        &self.services
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.reconnect.failure_count()
    }

    pub(crate) fn has_service_up(&self, service: ServiceId) -> bool {
        self.services.get(&service).is_some_and(|s| s.state == ServiceState::Up)
    }

    pub(crate) fn view(&self) -> MemberView {
        MemberView {
            id: self.id,
            up: self.is_up(),
            ready: self.is_ready(),
            directory_known: self.directory_received,
            directory_pending: self.directory_stream_id.is_some() && !self.directory_received,
            services_up: self
                .services
                .values()
                .filter(|s| s.state == ServiceState::Up)
                .map(|s| s.service_id)
                .collect::<BTreeSet<_>>(),
        }
    }

    /// Starts a connect attempt and returns the new link's descriptor.
    pub(crate) fn connect(
        &mut self,
        connector: &mut dyn Connector,
        tx: &mpsc::UnboundedSender<LinkEvent>,
        now: Instant,
        connect_timeout: Duration,
    ) -> Result<Descriptor, TransportError> {
        self.generation += 1;
        let request = ConnectRequest {
            member: self.id,
            name: self.config.name.clone(),
            endpoint: self.config.endpoint.clone(),
            credentials: self.config.credentials.clone(),
            events: LinkEventSender::new(self.id, self.generation, tx.clone()),
        };

        // stays Connecting on refusal so `fail` charges the attempt
        self.state = MemberState::Connecting;
        let link = connector.connect(request)?;
        let descriptor = link.descriptor();
        debug!(
            member = %self.config.name,
            endpoint = %self.config.endpoint,
            generation = self.generation,
            descriptor = %descriptor,
            "member connecting"
        );

        self.link = Some(link);
        self.descriptor = Some(descriptor);
        self.deadline = Some((Handshake::Connect, now + connect_timeout));
        Ok(descriptor)
    }

    /// Link can carry traffic. The login deadline starts once a login is written.
    pub(crate) fn on_established(&mut self) {
        self.state = MemberState::Up;
        self.deadline = None;
        info!(member = %self.config.name, "member up");
    }

    /// Login refresh received; the member becomes READY.
    pub(crate) fn on_login_refresh(&mut self, now: Instant, directory_timeout: Option<Duration>) {
        self.state = MemberState::Ready;
        self.reconnect.record_success();
        self.deadline = directory_timeout.map(|timeout| (Handshake::Directory, now + timeout));
        info!(member = %self.config.name, "member ready");
    }

    pub(crate) fn note_login_sent(
        &mut self,
        stream_id: StreamId,
        now: Instant,
        timeout: Duration,
    ) {
        self.login_stream_id = Some(stream_id);
        if self.state == MemberState::Up {
            self.deadline = Some((Handshake::Login, now + timeout));
        }
    }

    pub(crate) fn note_directory_sent(&mut self, stream_id: StreamId) {
        self.directory_stream_id = Some(stream_id);
    }

    /// Applies directory entries. A refresh replaces the known service set.
    pub(crate) fn apply_directory(&mut self, entries: &[ServiceEntry], refresh: bool) {
        if refresh {
            self.services.clear();
            self.directory_received = true;
            if matches!(self.deadline, Some((Handshake::Directory, _))) {
                self.deadline = None;
            }
        }

        for entry in entries {
            if entry.state == ServiceState::Deleted {
                self.services.remove(&entry.service_id);
                continue;
            }
            let view = self.services.entry(entry.service_id).or_insert_with(|| ServiceView {
                service_id: entry.service_id,
                name: None,
                state: entry.state,
            });
            if entry.name.is_some() {
                view.name.clone_from(&entry.name);
            }
            view.state = entry.state;
        }
    }

    /// Writes `msg`, queueing it behind earlier blocked writes.
    pub(crate) fn send(&mut self, msg: &Envelope) -> Result<SendOutcome, TransportError> {
        if !self.is_up() {
            return Err(TransportError::NotReady);
        }
        if !self.outbound.is_empty() {
            self.outbound.push_back(msg.clone());
            return Ok(SendOutcome::WouldBlock);
        }

        let link = self.link.as_mut().ok_or(TransportError::NotReady)?;
        let outcome = link.send(msg)?;
        if outcome == SendOutcome::WouldBlock {
            self.outbound.push_back(msg.clone());
        }
        Ok(outcome)
    }

    /// Retries queued writes in order. Returns how many are still waiting.
    pub(crate) fn flush(&mut self) -> Result<usize, TransportError> {
        let Some(link) = self.link.as_mut() else {
            return Ok(self.outbound.len());
        };
        while let Some(front) = self.outbound.front() {
            match link.send(front)? {
                SendOutcome::Sent => {
                    self.outbound.pop_front();
                }
                SendOutcome::WouldBlock => break,
            }
        }
        Ok(self.outbound.len())
    }

    /// Drops queued item writes for `stream_id`.
    pub(crate) fn purge_stream(&mut self, stream_id: StreamId) -> usize {
        let before = self.outbound.len();
        self.outbound.retain(|env| env.domain.is_control() || env.stream_id != stream_id);
        before - self.outbound.len()
    }

    pub(crate) fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Tears down the link after a failure and returns the descriptor it held.
    ///
    /// Known services are kept but marked DOWN until the next directory refresh, so the
    /// group still knows their names.
    pub(crate) fn fail(
        &mut self,
        policy: &ReconnectConfig,
        now: Instant,
        reason: &str,
    ) -> Option<Descriptor> {
        let descriptor = self.teardown();
        for service in self.services.values_mut() {
            service.state = ServiceState::Down;
        }

        match self.reconnect.record_failure(policy, now) {
            Some(at) => {
                self.state = MemberState::DownReconnecting;
                warn!(
                    member = %self.config.name,
                    reason = reason,
                    failures = self.reconnect.failure_count(),
                    retry_in_ms = at.saturating_duration_since(now).as_millis(),
                    "member down, reconnect scheduled"
                );
            }
            None => {
                self.state = MemberState::Down;
                warn!(
                    member = %self.config.name,
                    reason = reason,
                    failures = self.reconnect.failure_count(),
                    "member down, reconnect budget exhausted"
                );
            }
        }
        descriptor
    }

    /// Explicit close; the member never reconnects.
    pub(crate) fn shutdown(&mut self) -> Option<Descriptor> {
        let descriptor = self.teardown();
        self.services.clear();
        self.state = MemberState::Down;
        descriptor
    }

    fn teardown(&mut self) -> Option<Descriptor> {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.deadline = None;
        self.outbound.clear();
        self.roles.clear();
        self.login_stream_id = None;
        self.directory_stream_id = None;
        self.directory_received = false;
        self.descriptor.take()
    }

    pub(crate) fn expired_handshake(&self, now: Instant) -> Option<Handshake> {
        self.deadline.and_then(|(phase, at)| (at <= now).then_some(phase))
    }

    pub(crate) fn reconnect_due(&self, now: Instant) -> bool {
        self.state == MemberState::DownReconnecting &&
            self.reconnect.next_attempt_at().is_some_and(|at| at <= now)
    }

    /// Earliest instant at which this member needs attention from the dispatch loop.
    pub(crate) fn next_wakeup(&self) -> Option<Instant> {
        let reconnect = (self.state == MemberState::DownReconnecting)
            .then(|| self.reconnect.next_attempt_at())
            .flatten();
        match (self.deadline.map(|(_, at)| at), reconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn notified_role(&self, scope: ScopeKey) -> Option<Role> {
        self.roles.get(&scope).copied()
    }

    pub(crate) fn set_notified_role(&mut self, scope: ScopeKey, role: Role) {
        self.roles.insert(scope, role);
    }

    pub(crate) fn forget_role(&mut self, scope: ScopeKey) {
        self.roles.remove(&scope);
    }

    pub(crate) fn notified_scopes(&self) -> Vec<ScopeKey> {
        self.roles.keys().copied().collect()
    }

    /// Stream id of this member's own copy of a control stream.
    pub(crate) fn control_stream(&self, domain: Domain) -> Option<StreamId> {
        match domain {
            Domain::Login => self.login_stream_id,
            Domain::Source => self.directory_stream_id,
            _ => None,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .field("generation", &self.generation)
            .field("services", &self.services.len())
            .field("queued", &self.outbound.len())
            .finish_non_exhaustive()
    }
}
