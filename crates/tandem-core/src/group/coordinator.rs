use super::{
    aggregator::{combine_services, ItemOutcome, LossCause, Recovery, ResponseAggregator},
    connection::{Member, MemberState, ServiceView},
    funnel::{ChannelState, EventFunnel},
    pending::{PendingRequest, PendingTable, StreamPhase},
    roles::{MemberView, RoleAssignor, ScopeKey, ScopeOwnership},
    router::{ItemRoute, RequestRouter, RouteDecision, RoutingContext},
    stats::{GroupStats, MemberStatus},
};
use crate::{
    config::{HandshakeConfig, ReconnectConfig},
    errors::{SubmitError, TransportError},
    transport::{Connector, LinkEvent, LinkEventKind, SendOutcome},
    types::{
        Descriptor, Domain, Envelope, Event, MemberId, MsgClass, Role, RoleNotice, ServiceId,
        StandbyMode, StreamId, DIRECTORY_STREAM_ID,
    },
};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, trace, warn};

/// Login attribute carrying a member's application id.
pub const APPLICATION_ID_ATTRIBUTE: &str = "ApplicationId";

/// Login attribute carrying a member's position.
pub const POSITION_ATTRIBUTE: &str = "Position";

/// Settings a group runs with, resolved by the builder.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub mode: StandbyMode,
    pub reconnect: ReconnectConfig,
    pub handshake: HandshakeConfig,
}

/// Per-call routing hints for [`WarmStandbyGroup::submit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub service_name: Option<String>,
    pub service_id: Option<ServiceId>,
    pub private_stream: bool,
}

impl SubmitOptions {
    #[must_use]
    pub fn service_id(service_id: ServiceId) -> Self {
        Self { service_id: Some(service_id), ..Self::default() }
    }

    #[must_use]
    pub fn service_name(name: impl Into<String>) -> Self {
        Self { service_name: Some(name.into()), ..Self::default() }
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.private_stream = true;
        self
    }
}

/// What [`WarmStandbyGroup::submit`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    /// Written (or queued behind a blocked write) to these members.
    Sent { targets: Vec<MemberId> },
    /// Held until a member can take it.
    Queued,
}

impl Submitted {
    fn from_targets(targets: Vec<MemberId>) -> Self {
        if targets.is_empty() {
            Self::Queued
        } else {
            Self::Sent { targets }
        }
    }
}

/// One logical channel backed by an ordered list of member links.
///
/// The group presents a single session to the application while keeping every member
/// logged in. Ownership of the session (login-based) or of each service
/// (service-based) belongs to exactly one READY member at a time; the others mirror
/// shared streams so a failover only needs a resubmission.
///
/// All state is owned by the group and mutated through `&mut self`, so the group is
/// driven by one task: [`submit`](Self::submit) to write, [`dispatch`](Self::dispatch)
/// to read.
///
/// # Examples
///
/// ```no_run
/// # use tandem_core::{group::{WarmStandbyGroupBuilder, SubmitOptions}, transport::Connector};
/// # use tandem_core::types::{Domain, Envelope};
/// # use std::time::Duration;
/// # async fn example(connector: Box<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
/// let mut group = WarmStandbyGroupBuilder::new()
///     .member("primary", "10.0.0.1:14002")
///     .member("backup", "10.0.0.2:14002")
///     .connector(connector)
///     .build()?;
///
/// group.connect();
/// group.submit(Envelope::login_request("trader"), SubmitOptions::default())?;
/// group.submit(
///     Envelope::request(Domain::MarketPrice, 5, "IBM.N"),
///     SubmitOptions::service_name("ELEKTRON"),
/// )?;
///
/// for event in group.dispatch(100, Duration::from_millis(50)).await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct WarmStandbyGroup {
    settings: GroupSettings,
    members: Vec<Member>,
    connector: Box<dyn Connector>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    router: RequestRouter,
    assignor: RoleAssignor,
    ownership: ScopeOwnership,
    pending: PendingTable,
    aggregator: ResponseAggregator,
    funnel: EventFunnel,
    stats: GroupStats,
    login_request: Option<Envelope>,
    directory_request: Option<Envelope>,
    failed: Vec<(MemberId, TransportError)>,
    started: bool,
    closed: bool,
}

impl WarmStandbyGroup {
    pub(crate) fn new(
        settings: GroupSettings,
        members: Vec<Member>,
        connector: Box<dyn Connector>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Self {
            router: RequestRouter::new(settings.mode),
            assignor: RoleAssignor::new(settings.mode),
            settings,
            members,
            connector,
            link_tx,
            link_rx,
            ownership: ScopeOwnership::default(),
            pending: PendingTable::default(),
            aggregator: ResponseAggregator::default(),
            funnel: EventFunnel::default(),
            stats: GroupStats::default(),
            login_request: None,
            directory_request: None,
            failed: Vec::new(),
            started: false,
            closed: false,
        }
    }

    #[must_use]
    pub fn mode(&self) -> StandbyMode {
        self.settings.mode
    }

    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.funnel.state()
    }

    #[must_use]
    pub fn stats(&self) -> GroupStats {
        self.stats
    }

    /// Descriptors of every member link currently open.
    #[must_use]
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.funnel.descriptors().current().iter().copied().collect()
    }

    #[must_use]
    pub fn active_member(&self, scope: ScopeKey) -> Option<MemberId> {
        self.ownership.active(scope)
    }

    #[must_use]
    pub fn role_of(&self, member: MemberId, scope: ScopeKey) -> Option<Role> {
        self.ownership.role_of(member, scope)
    }

    /// Item streams the application has open through the group.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn member_statuses(&self) -> Vec<MemberStatus> {
        self.members
            .iter()
            .map(|m| MemberStatus {
                name: m.name().to_string(),
                state: m.state().as_str(),
                consecutive_failures: m.failure_count(),
                queued_messages: m.queued(),
                services_up: m.view().services_up.len(),
            })
            .collect()
    }

    #[must_use]
    pub fn member_state(&self, member: MemberId) -> Option<MemberState> {
        self.members.get(member.index()).map(Member::state)
    }

    /// Opens every member link. Calling it again has no effect.
    pub fn connect(&mut self) {
        if self.started || self.closed {
            return;
        }
        self.started = true;
        self.funnel.connecting();
        info!(
            mode = %self.settings.mode,
            members = self.members.len(),
            "warm standby group connecting"
        );

        let now = Instant::now();
        for index in 0..self.members.len() {
            self.connect_member(index, now);
        }
        self.settle();
    }

    /// Closes every member link. The group stays DOWN afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for member in &mut self.members {
            if let Some(descriptor) = member.shutdown() {
                self.funnel.descriptors_mut().remove(descriptor);
            }
        }
        self.ownership = ScopeOwnership::default();
        self.funnel.descriptors_mut().set_active([]);
        self.funnel.flush_descriptors();
        self.funnel.closed();
        self.pending.drain().for_each(drop);
        self.login_request = None;
        self.directory_request = None;
        self.failed.clear();
        info!("warm standby group closed");
    }

    /// Writes an application message through the group.
    ///
    /// Login and directory requests are stored and replayed to every member as it comes
    /// UP. Item requests go to the scope owner and are mirrored to standbys; if nobody
    /// owns the scope yet a shared request is held and sent on promotion.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::GroupDown`] once the channel is DOWN or closed
    /// - [`SubmitError::PauseNotSupported`] for any pause request
    /// - [`SubmitError::NoActiveMember`] for a private request nobody can own now
    /// - [`SubmitError::UnknownStream`] when closing a stream that is not open
    /// - [`SubmitError::InvalidMessage`] for message classes the application cannot send
    /// - [`SubmitError::Transport`] when the only target of a directed generic or post
    ///   rejects the write
    pub fn submit(
        &mut self,
        envelope: Envelope,
        options: SubmitOptions,
    ) -> Result<Submitted, SubmitError> {
        if self.closed || self.funnel.state().is_down() {
            return Err(SubmitError::GroupDown);
        }
        if envelope.flags.pause {
            return Err(SubmitError::PauseNotSupported(envelope.stream_id));
        }

        let result = match (envelope.domain, envelope.class) {
            (Domain::Login, MsgClass::Request) => Ok(self.submit_login(envelope)),
            (Domain::Login, MsgClass::Close) => Ok(self.close_login(&envelope)),
            (Domain::Source, MsgClass::Request) => Ok(self.submit_directory(envelope)),
            (Domain::Source, MsgClass::Close) => {
                self.aggregator.directory_closed();
                self.directory_request = None;
                Ok(Submitted::Sent { targets: Vec::new() })
            }
            (_, MsgClass::Request) => self.submit_item(envelope, &options),
            (_, MsgClass::Close) => self.close_item(&envelope),
            (_, MsgClass::Generic | MsgClass::Post) => self.submit_generic(&envelope, &options),
            (_, class) => {
                Err(SubmitError::InvalidMessage(format!("{class:?} cannot be submitted")))
            }
        };

        self.settle();
        result
    }

    /// Services every member link and returns up to `max_events` events.
    ///
    /// A zero `timeout` never waits. Otherwise the call returns as soon as at least one
    /// event is queued, or when `timeout` elapses.
    pub async fn dispatch(&mut self, max_events: usize, timeout: Duration) -> Vec<Event> {
        let start = Instant::now();
        let deadline = start.checked_add(timeout).unwrap_or(start + Duration::from_secs(86_400));

        loop {
            self.service_timers(Instant::now());
            self.flush_outbound();
            while let Ok(event) = self.link_rx.try_recv() {
                self.handle_link_event(event);
            }
            self.settle();

            if !self.funnel.is_empty() || timeout.is_zero() || self.closed {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }

            let wake = self.next_wakeup().map_or(deadline, |at| at.min(deadline));
            match tokio::time::timeout_at(wake, self.link_rx.recv()).await {
                Ok(Some(event)) => {
                    self.handle_link_event(event);
                    self.settle();
                }
                Ok(None) | Err(_) => {}
            }
        }

        self.funnel.drain(max_events)
    }

    // --- submit paths ---

    fn submit_login(&mut self, login: Envelope) -> Submitted {
        debug!(stream_id = login.stream_id, "login submitted");
        self.aggregator.login_opened(login.stream_id);
        self.login_request = Some(login);

        let targets: Vec<MemberId> =
            self.members.iter().filter(|m| m.is_up()).map(Member::id).collect();
        let sent: Vec<MemberId> =
            targets.into_iter().filter(|id| self.send_login(*id)).collect();
        Submitted::from_targets(sent)
    }

    fn close_login(&mut self, close: &Envelope) -> Submitted {
        let mut targets = Vec::new();
        for member in &mut self.members {
            if let Some(stream_id) = member.login_stream_id() {
                let mut copy = close.clone();
                copy.stream_id = stream_id;
                if member.is_up() && member.send(&copy).is_ok() {
                    targets.push(member.id());
                }
            }
        }
        self.aggregator.login_closed();
        self.login_request = None;
        Submitted::Sent { targets }
    }

    fn submit_directory(&mut self, request: Envelope) -> Submitted {
        let stream_id = request.stream_id;
        self.directory_request = Some(request);

        let combined = self.combined_services();
        let answered = self.members.iter().any(Member::directory_received);
        self.aggregator.directory_opened(stream_id, &combined, answered, &mut self.funnel);

        let targets: Vec<MemberId> = self
            .members
            .iter()
            .filter(|m| m.is_ready() && m.directory_stream_id().is_none())
            .map(Member::id)
            .collect();
        let sent: Vec<MemberId> =
            targets.into_iter().filter(|id| self.send_directory(*id)).collect();
        Submitted::Sent { targets: sent }
    }

    fn submit_item(
        &mut self,
        mut envelope: Envelope,
        options: &SubmitOptions,
    ) -> Result<Submitted, SubmitError> {
        let stream_id = envelope.stream_id;
        if let Some(name) = &options.service_name {
            envelope.service_name = Some(name.clone());
        }
        if let Some(id) = options.service_id {
            envelope.service_id = Some(id);
        }

        if self.pending.contains(stream_id) {
            return Ok(self.reissue_item(envelope));
        }

        let private = options.private_stream || envelope.flags.private_stream;
        let service = envelope
            .service_id
            .or_else(|| envelope.service_name.as_deref().and_then(|n| self.lookup_service(n)));
        let service_pending = self.settings.mode == StandbyMode::ServiceBased &&
            service.is_none() &&
            envelope.service_name.is_some();

        let views = self.member_views();
        let ctx = RoutingContext { ownership: &self.ownership, members: &views };
        let route = ItemRoute {
            stream_id,
            service,
            service_pending,
            private_stream: private,
            pause: envelope.flags.pause,
        };
        let decision = self.router.route_item(&ctx, &route)?;

        let mut request = PendingRequest::new(envelope, service, private);
        request.scope = self.router.scope_for(service);

        match decision {
            RouteDecision::Directed { target, mirrors } => {
                request.owner = Some(target);
                request.mirrors = mirrors.iter().copied().collect();
                let outbound = request.outbound_request();
                self.pending.insert(request);

                let targets: Vec<MemberId> = std::iter::once(target).chain(mirrors).collect();
                for id in &targets {
                    self.send_or_fail(*id, &outbound);
                }
                debug!(stream_id, owner = %target, holders = targets.len(), "item stream opened");
                Ok(Submitted::Sent { targets })
            }
            RouteDecision::Queue | RouteDecision::Broadcast(_) => {
                debug!(stream_id, "item stream queued until a member can own it");
                self.pending.insert(request);
                Ok(Submitted::Queued)
            }
        }
    }

    fn reissue_item(&mut self, envelope: Envelope) -> Submitted {
        let stream_id = envelope.stream_id;
        let Some(request) = self.pending.get_mut(stream_id) else {
            return Submitted::Queued;
        };
        request.key_name.clone_from(&envelope.key_name);
        request.streaming = envelope.flags.streaming;
        request.request = envelope;
        let outbound = request.outbound_request();
        let holders = request.holders();

        for id in &holders {
            self.send_or_fail(*id, &outbound);
        }
        debug!(stream_id, holders = holders.len(), "item stream reissued");
        Submitted::from_targets(holders)
    }

    fn close_item(&mut self, close: &Envelope) -> Result<Submitted, SubmitError> {
        let stream_id = close.stream_id;
        let request = self.pending.remove(stream_id).ok_or(SubmitError::UnknownStream(stream_id))?;

        let mut targets = Vec::new();
        for id in request.holders() {
            let member = &mut self.members[id.index()];
            member.purge_stream(stream_id);
            if member.is_up() {
                self.send_or_fail(id, close);
                targets.push(id);
            }
        }
        debug!(stream_id, "item stream closed by application");
        Ok(Submitted::Sent { targets })
    }

    fn submit_generic(
        &mut self,
        message: &Envelope,
        options: &SubmitOptions,
    ) -> Result<Submitted, SubmitError> {
        let stream_id = message.stream_id;
        let service = options
            .service_id
            .or(message.service_id)
            .or_else(|| self.pending.get(stream_id).and_then(|p| p.service_id))
            .or_else(|| {
                options
                    .service_name
                    .as_deref()
                    .or(message.service_name.as_deref())
                    .and_then(|n| self.lookup_service(n))
            });

        let views = self.member_views();
        let ctx = RoutingContext { ownership: &self.ownership, members: &views };
        let decision = if message.domain.is_control() && service.is_none() {
            self.router.route_control(&ctx)
        } else {
            self.router.route_generic(&ctx, stream_id, service)?
        };

        match decision {
            RouteDecision::Broadcast(targets) => {
                let mut sent = Vec::with_capacity(targets.len());
                for id in targets {
                    let copy = self.copy_for(id, message);
                    if self.send_or_fail(id, &copy) {
                        sent.push(id);
                    }
                }
                if sent.is_empty() {
                    return Err(SubmitError::NotReady);
                }
                Ok(Submitted::Sent { targets: sent })
            }
            RouteDecision::Directed { target, .. } => {
                let copy = self.copy_for(target, message);
                match self.members[target.index()].send(&copy) {
                    Ok(_) => Ok(Submitted::Sent { targets: vec![target] }),
                    Err(source) => {
                        self.failed.push((target, source.clone()));
                        Err(SubmitError::Transport { member: target, source })
                    }
                }
            }
            RouteDecision::Queue => Ok(Submitted::Queued),
        }
    }

    /// Control-stream messages carry the member's own stream id.
    fn copy_for(&self, member: MemberId, message: &Envelope) -> Envelope {
        let mut copy = message.clone();
        if let Some(stream_id) = self.members[member.index()].control_stream(message.domain) {
            copy.stream_id = stream_id;
        }
        copy
    }

    // --- member lifecycle ---

    fn connect_member(&mut self, index: usize, now: Instant) {
        let timeout = self.settings.handshake.login_timeout();
        let member = &mut self.members[index];
        match member.connect(self.connector.as_mut(), &self.link_tx, now, timeout) {
            Ok(descriptor) => self.funnel.descriptors_mut().add(descriptor),
            Err(err) => {
                debug!(member = %member.name(), error = %err, "connect attempt failed");
                self.failed.push((member.id(), err));
            }
        }
    }

    fn send_login(&mut self, id: MemberId) -> bool {
        let Some(login) = self.login_for(id) else {
            return false;
        };
        let now = Instant::now();
        let timeout = self.settings.handshake.login_timeout();
        self.members[id.index()].note_login_sent(login.stream_id, now, timeout);
        self.send_or_fail(id, &login)
    }

    /// The stored login with `id`'s credentials stamped in.
    fn login_for(&self, id: MemberId) -> Option<Envelope> {
        let mut login = self.login_request.clone()?;
        let credentials = &self.members[id.index()].config().credentials;
        if let Some(user) = &credentials.user_name {
            login.key_name = Some(user.clone());
        }
        if let Some(app) = &credentials.application_id {
            login.attributes.insert(APPLICATION_ID_ATTRIBUTE.to_string(), app.clone());
        }
        if let Some(position) = &credentials.position {
            login.attributes.insert(POSITION_ATTRIBUTE.to_string(), position.clone());
        }
        Some(login)
    }

    fn send_directory(&mut self, id: MemberId) -> bool {
        let request = self
            .directory_request
            .clone()
            .unwrap_or_else(|| Envelope::directory_request(DIRECTORY_STREAM_ID));
        self.members[id.index()].note_directory_sent(request.stream_id);
        self.send_or_fail(id, &request)
    }

    /// Writes to one member; a failed write schedules the member for teardown.
    fn send_or_fail(&mut self, id: MemberId, message: &Envelope) -> bool {
        let member = &mut self.members[id.index()];
        match member.send(message) {
            Ok(SendOutcome::Sent) => {
                trace!(
                    member = %member.name(),
                    stream_id = message.stream_id,
                    class = ?message.class,
                    "sent"
                );
                true
            }
            Ok(SendOutcome::WouldBlock) => {
                debug!(member = %member.name(), queued = member.queued(), "write blocked, queued");
                true
            }
            Err(err) => {
                self.failed.push((id, err));
                false
            }
        }
    }

    fn service_timers(&mut self, now: Instant) {
        for index in 0..self.members.len() {
            let member = &self.members[index];
            if let Some(phase) = member.expired_handshake(now) {
                warn!(member = %member.name(), phase = phase.as_str(), "handshake timed out");
                self.failed.push((member.id(), TransportError::HandshakeTimeout(phase.as_str())));
            } else if member.reconnect_due(now) {
                self.stats.reconnect_attempts += 1;
                info!(member = %member.name(), failures = member.failure_count(), "reconnecting");
                self.connect_member(index, now);
            }
        }
    }

    fn flush_outbound(&mut self) {
        for member in &mut self.members {
            if member.queued() == 0 {
                continue;
            }
            match member.flush() {
                Ok(0) => debug!(member = %member.name(), "outbound backlog drained"),
                Ok(_) => {}
                Err(err) => self.failed.push((member.id(), err)),
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.members.iter().filter_map(Member::next_wakeup).min()
    }

    /// Applies queued member failures, then publishes the descriptor diff.
    fn settle(&mut self) {
        while !self.failed.is_empty() {
            for (id, err) in std::mem::take(&mut self.failed) {
                self.fail_member(id, &err);
            }
        }
        self.funnel.flush_descriptors();
    }

    fn fail_member(&mut self, id: MemberId, err: &TransportError) {
        let member = &mut self.members[id.index()];
        if !matches!(
            member.state(),
            MemberState::Connecting | MemberState::Up | MemberState::Ready
        ) {
            return;
        }

        let policy = if err.is_transient() {
            self.settings.reconnect.clone()
        } else {
            ReconnectConfig { attempt_limit: 0, ..self.settings.reconnect.clone() }
        };
        if let Some(descriptor) = member.fail(&policy, Instant::now(), &err.to_string()) {
            self.funnel.descriptors_mut().remove(descriptor);
        }
        let dropped = self.pending.drop_mirror(id);
        if dropped > 0 {
            debug!(member = %id, streams = dropped, "mirrors dropped with member");
        }

        let combined = self.combined_services();
        self.aggregator.directory_changed(None, &combined, &mut self.funnel);

        let exhausted = self.members.iter().all(|m| m.state() == MemberState::Down);
        self.recompute_roles();
        if exhausted {
            self.close_all_streams();
        } else {
            self.reconcile_streams();
        }

        if !self.members.iter().any(Member::is_ready) {
            self.aggregator.login_lost(&mut self.funnel, &mut self.stats);
        }
        if !self.members.iter().any(Member::is_up) {
            // initial attempts of other members are still outstanding
            let first_attempts = self.funnel.state() == ChannelState::Connecting &&
                self.members.iter().any(|m| m.state() == MemberState::Connecting);
            if exhausted || !first_attempts {
                self.funnel.members_lost(exhausted);
            }
        }
    }

    fn close_all_streams(&mut self) {
        let streams: Vec<PendingRequest> = self.pending.drain().collect();
        for mut request in streams {
            self.aggregator.owner_lost(
                &mut request,
                LossCause::ChannelDown,
                &mut self.funnel,
                &mut self.stats,
            );
        }
    }

    // --- inbound ---

    fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(member) = self.members.get(event.member.index()) else {
            return;
        };
        let live = matches!(
            member.state(),
            MemberState::Connecting | MemberState::Up | MemberState::Ready
        );
        if member.generation() != event.generation || !live {
            trace!(member = %member.name(), generation = event.generation, "stale link event");
            return;
        }

        let id = event.member;
        match event.kind {
            LinkEventKind::Established => self.on_established(id),
            LinkEventKind::Message(envelope) => match envelope.domain {
                Domain::Login => self.on_login_message(id, envelope),
                Domain::Source => self.on_directory_message(id, envelope),
                _ => self.on_item_message(id, envelope),
            },
            LinkEventKind::Closed(reason) => {
                self.failed.push((id, TransportError::LinkClosed(reason)));
            }
        }
    }

    fn on_established(&mut self, id: MemberId) {
        let member = &mut self.members[id.index()];
        if member.state() != MemberState::Connecting {
            return;
        }
        member.on_established();
        self.funnel.member_up();
        if self.login_request.is_some() {
            self.send_login(id);
        }
    }

    fn on_login_message(&mut self, id: MemberId, envelope: Envelope) {
        if envelope.closes_stream() {
            let text = envelope.status.map(|s| s.text).unwrap_or_default();
            warn!(member = %id, reason = %text, "login closed by provider");
            self.failed.push((id, TransportError::LoginRejected(text)));
            return;
        }

        let first_refresh =
            envelope.class == MsgClass::Refresh && !self.members[id.index()].is_ready();
        if first_refresh {
            let request_directory =
                self.settings.handshake.request_directory || self.directory_request.is_some();
            let timeout = request_directory.then(|| self.settings.handshake.directory_timeout());
            self.members[id.index()].on_login_refresh(Instant::now(), timeout);
            if request_directory {
                self.send_directory(id);
            }
        }

        let from_leader = self.login_leader() == Some(id);
        self.aggregator.consume_login(id, envelope, from_leader, &mut self.funnel);

        if first_refresh {
            self.recompute_roles();
            self.reconcile_streams();
            self.check_ready();
        }
    }

    /// Member whose login stream stands in for the group's.
    fn login_leader(&self) -> Option<MemberId> {
        match self.settings.mode {
            StandbyMode::LoginBased => self.ownership.active(ScopeKey::Session),
            StandbyMode::ServiceBased => {
                self.members.iter().find(|m| m.is_ready()).map(Member::id)
            }
        }
    }

    fn on_directory_message(&mut self, id: MemberId, envelope: Envelope) {
        match envelope.class {
            MsgClass::Refresh | MsgClass::Update if !envelope.closes_stream() => {
                let refresh = envelope.class == MsgClass::Refresh;
                self.members[id.index()].apply_directory(&envelope.services, refresh);
                debug!(
                    member = %id,
                    refresh,
                    entries = envelope.services.len(),
                    "directory applied"
                );

                let combined = self.combined_services();
                let refreshed = refresh.then(|| (id, self.members[id.index()].services()));
                self.aggregator.directory_changed(refreshed, &combined, &mut self.funnel);

                self.recompute_roles();
                self.reconcile_streams();
                self.check_ready();
            }
            _ if envelope.closes_stream() => {
                warn!(member = %id, "directory stream closed by provider");
                self.failed
                    .push((id, TransportError::LinkClosed("directory stream closed".to_string())));
            }
            _ => trace!(member = %id, class = ?envelope.class, "directory message ignored"),
        }
    }

    fn on_item_message(&mut self, id: MemberId, envelope: Envelope) {
        let domain = envelope.domain;
        let stream_id = envelope.stream_id;
        let outcome = self.aggregator.consume_item(
            id,
            envelope,
            &mut self.pending,
            &mut self.funnel,
            &mut self.stats,
        );

        if let ItemOutcome::Finished { release } = outcome {
            let close = Envelope::close(domain, stream_id);
            for mirror in release {
                self.members[mirror.index()].purge_stream(stream_id);
                if self.members[mirror.index()].is_up() {
                    self.send_or_fail(mirror, &close);
                }
            }
        }
    }

    fn check_ready(&mut self) {
        let active = self.ownership.active_members();
        let complete = self.members.iter().any(|m| {
            let handshake_done =
                m.is_ready() && (m.directory_stream_id().is_none() || m.directory_received());
            handshake_done && (active.is_empty() || active.contains(&m.id()))
        });
        if complete {
            self.funnel.handshake_complete();
        }
    }

    // --- ownership ---

    fn member_views(&self) -> Vec<MemberView> {
        self.members.iter().map(Member::view).collect()
    }

    fn combined_services(&self) -> BTreeMap<ServiceId, ServiceView> {
        combine_services(self.members.iter().map(Member::services))
    }

    fn lookup_service(&self, name: &str) -> Option<ServiceId> {
        self.members
            .iter()
            .flat_map(|m| m.services().values())
            .find(|s| s.name.as_deref() == Some(name))
            .map(|s| s.service_id)
    }

    fn recompute_roles(&mut self) {
        let views = self.member_views();
        let next = self.assignor.assign(&views, &self.ownership);

        for change in self.ownership.diff(&next) {
            match (change.previous, change.current) {
                (Some(from), Some(to)) => {
                    self.stats.failovers += 1;
                    info!(scope = %change.scope, from = %from, to = %to, "failover");
                }
                (None, Some(to)) => {
                    self.stats.promotions += 1;
                    info!(scope = %change.scope, member = %to, "member promoted to active");
                }
                (Some(from), None) => {
                    warn!(scope = %change.scope, member = %from, "scope has no eligible member");
                }
                (None, None) => {}
            }
        }

        self.ownership = next;
        self.notify_roles();

        let active: Vec<Descriptor> = self
            .ownership
            .active_members()
            .into_iter()
            .filter_map(|id| self.members[id.index()].descriptor())
            .collect();
        self.funnel.descriptors_mut().set_active(active);
    }

    /// Tells each READY member about roles that changed since it was last told.
    fn notify_roles(&mut self) {
        for index in 0..self.members.len() {
            let member = &self.members[index];
            if !member.is_ready() {
                continue;
            }
            let id = member.id();

            let notice = match self.settings.mode {
                StandbyMode::LoginBased => {
                    let role = self.ownership.role_of(id, ScopeKey::Session);
                    match (role, member.login_stream_id()) {
                        (Some(role), Some(stream_id))
                            if member.notified_role(ScopeKey::Session) != Some(role) =>
                        {
                            let mut generic = Envelope::generic(Domain::Login, stream_id);
                            generic.role = Some(RoleNotice::Session(role));
                            Some((generic, vec![(ScopeKey::Session, role)]))
                        }
                        _ => None,
                    }
                }
                StandbyMode::ServiceBased => {
                    let Some(stream_id) = member.directory_stream_id() else {
                        continue;
                    };
                    let mut changed = Vec::new();
                    for (scope, _) in self.ownership.scopes() {
                        if let (ScopeKey::Service(service), Some(role)) =
                            (*scope, self.ownership.role_of(id, *scope))
                        {
                            if member.notified_role(*scope) != Some(role) {
                                changed.push((service, role));
                            }
                        }
                    }
                    (!changed.is_empty()).then(|| {
                        let mut generic = Envelope::generic(Domain::Source, stream_id);
                        let scopes: Vec<(ScopeKey, Role)> =
                            changed.iter().map(|(s, r)| (ScopeKey::Service(*s), *r)).collect();
                        generic.role = Some(RoleNotice::Services(changed));
                        (generic, scopes)
                    })
                }
            };

            let stale: Vec<ScopeKey> = member
                .notified_scopes()
                .into_iter()
                .filter(|scope| self.ownership.role_of(id, *scope).is_none())
                .collect();
            for scope in stale {
                self.members[index].forget_role(scope);
            }

            if let Some((generic, roles)) = notice {
                if self.send_or_fail(id, &generic) {
                    self.stats.role_notifications += 1;
                    debug!(member = %id, notice = ?generic.role, "role notification sent");
                    for (scope, role) in roles {
                        self.members[index].set_notified_role(scope, role);
                    }
                }
            }
        }
    }

    // --- stream reconciliation ---

    /// Stamps service ids on streams opened by name, including streams that already
    /// have an owner, so later service changes reach them.
    fn resolve_service_names(&mut self) {
        for (stream_id, name) in self.pending.unresolved() {
            let Some(service) = self.lookup_service(&name) else {
                continue;
            };
            if let Some(request) = self.pending.get_mut(stream_id) {
                request.service_id = Some(service);
                request.scope = self.router.scope_for(Some(service));
                debug!(stream_id, service, name = %name, "service name resolved");
            }
        }
    }

    /// Moves every open stream to the member that should own it now, synthesizes
    /// failover status for streams that lost their owner, and keeps mirrors current.
    fn reconcile_streams(&mut self) {
        self.resolve_service_names();

        let views = self.member_views();
        let ctx = RoutingContext { ownership: &self.ownership, members: &views };
        let ready: BTreeSet<MemberId> = views.iter().filter(|v| v.ready).map(|v| v.id).collect();
        let up: BTreeSet<MemberId> = views.iter().filter(|v| v.up).map(|v| v.id).collect();

        let mut outbox: Vec<(MemberId, Envelope)> = Vec::new();
        let mut purge: Vec<(MemberId, StreamId)> = Vec::new();
        let mut terminal: Vec<StreamId> = Vec::new();

        for stream_id in self.pending.stream_ids() {
            let Some(request) = self.pending.get_mut(stream_id) else {
                continue;
            };
            let service_pending = self.router.mode() == StandbyMode::ServiceBased &&
                request.service_id.is_none() &&
                request.service_name.is_some();

            let keeps_owner = request.owner.is_some_and(|owner| {
                views.iter().any(|v| v.id == owner && v.can_serve(request.service_id))
            });
            let desired = if keeps_owner {
                request.owner
            } else if service_pending {
                None
            } else {
                self.router.owner_for(&ctx, request.service_id)
            };

            match (request.owner, desired) {
                (Some(current), Some(next)) if current == next => {}
                (Some(current), next) => {
                    let cause = if ready.contains(&current) {
                        LossCause::ServiceUnavailable
                    } else {
                        LossCause::OwnerLost
                    };
                    let recovery = self.aggregator.owner_lost(
                        request,
                        cause,
                        &mut self.funnel,
                        &mut self.stats,
                    );
                    let close = Envelope::close(request.domain, stream_id);

                    if recovery == Recovery::Terminal {
                        for holder in request.holders() {
                            purge.push((holder, stream_id));
                            if up.contains(&holder) {
                                outbox.push((holder, close.clone()));
                            }
                        }
                        terminal.push(stream_id);
                        continue;
                    }

                    if up.contains(&current) {
                        purge.push((current, stream_id));
                        outbox.push((current, close));
                    }
                    request.owner = next;
                    if let Some(next) = next {
                        request.mirrors.remove(&next);
                        outbox.push((next, request.outbound_request()));
                        self.stats.resubmissions += 1;
                        info!(stream_id, from = %current, to = %next, "stream moved to new owner");
                    } else {
                        debug!(stream_id, "stream waiting for an eligible owner");
                    }
                }
                (None, Some(next)) => {
                    request.owner = Some(next);
                    request.mirrors.remove(&next);
                    outbox.push((next, request.outbound_request()));
                    if request.phase == StreamPhase::Recovering {
                        self.stats.resubmissions += 1;
                        info!(stream_id, to = %next, "stream resubmitted to new owner");
                    } else {
                        debug!(stream_id, owner = %next, "queued stream assigned");
                    }
                }
                (None, None) => {}
            }

            let Some(owner) = request.owner else {
                continue;
            };
            let wanted: BTreeSet<MemberId> = if request.private_stream {
                BTreeSet::new()
            } else {
                self.router.mirrors_for(&ctx, owner, request.service_id).into_iter().collect()
            };
            for added in wanted.difference(&request.mirrors) {
                outbox.push((*added, request.outbound_request()));
                debug!(stream_id, member = %added, "standby mirror opened");
            }
            for removed in request.mirrors.difference(&wanted) {
                purge.push((*removed, stream_id));
                if up.contains(removed) {
                    outbox.push((*removed, Envelope::close(request.domain, stream_id)));
                }
            }
            request.mirrors = wanted;
        }

        for stream_id in terminal {
            self.pending.remove(stream_id);
        }
        for (member, stream_id) in purge {
            self.members[member.index()].purge_stream(stream_id);
        }
        for (member, message) in outbox {
            self.send_or_fail(member, &message);
        }
    }
}

impl std::fmt::Debug for WarmStandbyGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmStandbyGroup")
            .field("mode", &self.settings.mode)
            .field("members", &self.members)
            .field("channel", &self.funnel.state())
            .field("ownership", &self.ownership)
            .field("open_streams", &self.pending.len())
            .finish_non_exhaustive()
    }
}
