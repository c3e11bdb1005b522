//! Inbound merge of per-member traffic into one application view.
//!
//! # Item Streams
//!
//! Every member holding a stream answers it, but only the member recognized as the
//! stream's owner is heard: its refreshes, updates and status messages are delivered,
//! everything from mirrors is counted and dropped. When two members race, the first
//! message received from the current owner wins.
//!
//! # Failover Status
//!
//! | Stream                           | Owner leaves READY     | Service goes DOWN      |
//! |----------------------------------|------------------------|------------------------|
//! | private                          | CLOSED_RECOVER         | CLOSED_RECOVER         |
//! | shared, refresh incomplete       | CLOSED_RECOVER         | OPEN/SUSPECT, resubmit |
//! | shared, refresh complete         | OPEN/SUSPECT, resubmit | OPEN/SUSPECT, resubmit |
//!
//! # Login and Directory
//!
//! The application sees one login stream and one directory stream regardless of
//! member count. The first member refresh on each is delivered; afterwards the
//! directory only changes through UPDATEs computed against what was already published.

use crate::{
    group::{
        connection::ServiceView,
        funnel::EventFunnel,
        pending::{PendingRequest, PendingTable, StreamPhase},
        stats::GroupStats,
    },
    types::{
        Domain, Envelope, Event, MemberId, MsgClass, Origin, ServiceAction, ServiceEntry,
        ServiceId, ServiceState, StreamId, StreamStatus,
    },
};
use std::collections::BTreeMap;
use tracing::{debug, info, trace};

/// What happened to an inbound item message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Delivered,
    /// Sent by a member that does not own the stream.
    Suppressed,
    /// The owner ended the stream; `release` still hold a mirror that must be closed.
    Finished { release: Vec<MemberId> },
    /// No open stream with that id.
    Unknown,
}

/// Why a stream lost its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossCause {
    /// The owning member left READY.
    OwnerLost,
    /// The owning member no longer reports the stream's service UP.
    ServiceUnavailable,
    /// No member will ever come back.
    ChannelDown,
}

/// Outcome of failover synthesis for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// CLOSED_RECOVER delivered; the stream is gone.
    Terminal,
    /// The stream stays open and must be resubmitted once an owner exists.
    Resume,
}

#[derive(Debug, Default)]
struct LoginStream {
    stream_id: Option<StreamId>,
    refresh_delivered: bool,
    suspect_delivered: bool,
    reissue_pending: bool,
}

#[derive(Debug, Default)]
struct DirectoryStream {
    app_stream_id: Option<StreamId>,
    refresh_delivered: bool,
    published: BTreeMap<ServiceId, ServiceView>,
}

/// Merges member services into the group view: a service is UP if any member has it UP.
pub(crate) fn combine_services<'a>(
    members: impl IntoIterator<Item = &'a BTreeMap<ServiceId, ServiceView>>,
) -> BTreeMap<ServiceId, ServiceView> {
    let mut combined: BTreeMap<ServiceId, ServiceView> = BTreeMap::new();
    for services in members {
        for view in services.values() {
            let entry = combined.entry(view.service_id).or_insert_with(|| ServiceView {
                service_id: view.service_id,
                name: None,
                state: ServiceState::Down,
            });
            if entry.name.is_none() {
                entry.name.clone_from(&view.name);
            }
            if view.state == ServiceState::Up {
                entry.state = ServiceState::Up;
            }
        }
    }
    combined
}

fn service_delta(
    published: &BTreeMap<ServiceId, ServiceView>,
    combined: &BTreeMap<ServiceId, ServiceView>,
) -> Vec<ServiceEntry> {
    let mut entries = Vec::new();
    for (id, view) in combined {
        match published.get(id) {
            None => entries.push(ServiceEntry {
                service_id: *id,
                name: view.name.clone(),
                action: ServiceAction::Add,
                state: view.state,
            }),
            Some(old) if old != view => entries.push(ServiceEntry {
                service_id: *id,
                name: if old.name == view.name { None } else { view.name.clone() },
                action: ServiceAction::Update,
                state: view.state,
            }),
            Some(_) => {}
        }
    }
    entries.extend(
        published
            .keys()
            .filter(|id| !combined.contains_key(id))
            .map(|id| ServiceEntry::delete(*id)),
    );
    entries
}

fn as_entries(services: &BTreeMap<ServiceId, ServiceView>) -> Vec<ServiceEntry> {
    services
        .values()
        .map(|v| ServiceEntry {
            service_id: v.service_id,
            name: v.name.clone(),
            action: ServiceAction::Add,
            state: v.state,
        })
        .collect()
}

/// Inbound classification, deduplication and status synthesis.
#[derive(Debug, Default)]
pub struct ResponseAggregator {
    login: LoginStream,
    directory: DirectoryStream,
}

impl ResponseAggregator {
    // --- login ---

    /// The application opened or reissued its login.
    pub fn login_opened(&mut self, stream_id: StreamId) {
        self.login.stream_id = Some(stream_id);
        if self.login.refresh_delivered {
            self.login.reissue_pending = true;
        }
    }

    pub fn login_closed(&mut self) {
        self.login = LoginStream::default();
    }

    #[must_use]
    pub fn login_stream_id(&self) -> Option<StreamId> {
        self.login.stream_id
    }

    /// Handles a login-domain message. `from_leader` marks the member whose login
    /// stream stands in for the group's.
    pub fn consume_login(
        &mut self,
        member: MemberId,
        envelope: Envelope,
        from_leader: bool,
        funnel: &mut EventFunnel,
    ) -> bool {
        if self.login.stream_id.is_none() {
            trace!(member = %member, "login message without an application login stream");
            return false;
        }

        let deliver = match envelope.class {
            MsgClass::Refresh => {
                let first = !self.login.refresh_delivered || self.login.reissue_pending;
                if first {
                    self.login.refresh_delivered = true;
                    self.login.suspect_delivered = false;
                    self.login.reissue_pending = false;
                }
                first
            }
            MsgClass::Status | MsgClass::Update | MsgClass::Generic | MsgClass::Ack => from_leader,
            _ => false,
        };

        if deliver {
            funnel.push(Event::delivery(envelope, Origin::Member(member)));
        }
        deliver
    }

    /// No member is READY: tell the application its login is suspect, once.
    pub fn login_lost(&mut self, funnel: &mut EventFunnel, stats: &mut GroupStats) {
        let Some(stream_id) = self.login.stream_id else {
            return;
        };
        if !self.login.refresh_delivered || self.login.suspect_delivered {
            return;
        }
        self.login.refresh_delivered = false;
        self.login.suspect_delivered = true;
        stats.synthesized_statuses += 1;
        funnel.push(Event::delivery(
            Envelope::status(
                Domain::Login,
                stream_id,
                StreamStatus::open_suspect("no warm standby member is ready"),
            ),
            Origin::Group,
        ));
    }

    // --- directory ---

    /// The application opened its directory stream; replies at once if services are known
    /// or some member has already `answered`, even with an empty directory.
    pub fn directory_opened(
        &mut self,
        stream_id: StreamId,
        combined: &BTreeMap<ServiceId, ServiceView>,
        answered: bool,
        funnel: &mut EventFunnel,
    ) {
        self.directory.app_stream_id = Some(stream_id);
        self.directory.refresh_delivered = false;
        if combined.is_empty() && !answered {
            return;
        }

        let mut refresh =
            Envelope::refresh(Domain::Source, stream_id).with_services(as_entries(combined));
        refresh.flags.solicited = true;
        self.directory.published.clone_from(combined);
        self.directory.refresh_delivered = true;
        funnel.push(Event::delivery(refresh, Origin::Group));
    }

    pub fn directory_closed(&mut self) {
        self.directory.app_stream_id = None;
        self.directory.refresh_delivered = false;
    }

    #[must_use]
    pub fn directory_stream_id(&self) -> Option<StreamId> {
        self.directory.app_stream_id
    }

    /// Publishes directory changes after any member's service set moved.
    ///
    /// `refreshed` carries the services of a member that just answered with a directory
    /// refresh; if the application has not seen a refresh yet, that member's view
    /// becomes it.
    pub fn directory_changed(
        &mut self,
        refreshed: Option<(MemberId, &BTreeMap<ServiceId, ServiceView>)>,
        combined: &BTreeMap<ServiceId, ServiceView>,
        funnel: &mut EventFunnel,
    ) {
        let Some(stream_id) = self.directory.app_stream_id else {
            self.directory.published.clone_from(combined);
            return;
        };

        if !self.directory.refresh_delivered {
            let Some((member, services)) = refreshed else {
                return;
            };
            let refresh =
                Envelope::refresh(Domain::Source, stream_id).with_services(as_entries(services));
            self.directory.published.clone_from(services);
            self.directory.refresh_delivered = true;
            debug!(member = %member, services = services.len(), "directory refresh delivered");
            funnel.push(Event::delivery(refresh, Origin::Member(member)));
        }

        let delta = service_delta(&self.directory.published, combined);
        if delta.is_empty() {
            return;
        }
        debug!(entries = delta.len(), "directory update delivered");
        self.directory.published.clone_from(combined);
        funnel.push(Event::delivery(
            Envelope::update(Domain::Source, stream_id).with_services(delta),
            Origin::Group,
        ));
    }

    // --- items ---

    /// Handles an item-domain message from `member`.
    pub fn consume_item(
        &mut self,
        member: MemberId,
        envelope: Envelope,
        pending: &mut PendingTable,
        funnel: &mut EventFunnel,
        stats: &mut GroupStats,
    ) -> ItemOutcome {
        let stream_id = envelope.stream_id;
        let Some(request) = pending.get_mut(stream_id) else {
            trace!(member = %member, stream_id, "message for unknown stream dropped");
            return ItemOutcome::Unknown;
        };

        if request.owner != Some(member) {
            if envelope.closes_stream() && request.mirrors.remove(&member) {
                debug!(member = %member, stream_id, "standby closed its mirror");
            }
            if matches!(envelope.class, MsgClass::Refresh | MsgClass::Update) {
                stats.suppressed_duplicates += 1;
            }
            trace!(
                member = %member,
                stream_id,
                class = ?envelope.class,
                "non-owner message suppressed"
            );
            return ItemOutcome::Suppressed;
        }

        let finished = match envelope.class {
            MsgClass::Refresh => {
                request.phase = StreamPhase::Open;
                if envelope.flags.refresh_complete {
                    request.refresh_completed = true;
                }
                envelope.closes_stream() ||
                    (!request.streaming && envelope.flags.refresh_complete)
            }
            MsgClass::Update => {
                if request.phase == StreamPhase::Recovering {
                    request.phase = StreamPhase::Open;
                }
                false
            }
            MsgClass::Status => envelope.closes_stream(),
            MsgClass::Generic | MsgClass::Ack => false,
            MsgClass::Request | MsgClass::Close | MsgClass::Post => {
                trace!(member = %member, stream_id, class = ?envelope.class, "unexpected class");
                return ItemOutcome::Suppressed;
            }
        };

        funnel.push(Event::delivery(envelope, Origin::Member(member)));

        if finished {
            let release = pending
                .remove(stream_id)
                .map(|r| r.mirrors.into_iter().collect())
                .unwrap_or_default();
            debug!(member = %member, stream_id, "stream finished by owner");
            return ItemOutcome::Finished { release };
        }
        ItemOutcome::Delivered
    }

    /// Synthesizes the status for a stream whose owner can no longer serve it.
    pub fn owner_lost(
        &mut self,
        request: &mut PendingRequest,
        cause: LossCause,
        funnel: &mut EventFunnel,
        stats: &mut GroupStats,
    ) -> Recovery {
        let terminal = match cause {
            LossCause::ChannelDown => true,
            LossCause::OwnerLost => request.private_stream || !request.refresh_completed,
            LossCause::ServiceUnavailable => request.private_stream,
        };

        if terminal {
            let text = match cause {
                LossCause::ChannelDown => "warm standby group is down",
                _ if request.private_stream => "private stream owner lost",
                _ => "owner lost before the refresh completed",
            };
            info!(stream_id = request.stream_id, cause = ?cause, "stream closed by failover");
            stats.synthesized_statuses += 1;
            let status = StreamStatus::closed_recover(text);
            funnel.push(Event::delivery(
                Envelope::status(request.domain, request.stream_id, status),
                Origin::Group,
            ));
            return Recovery::Terminal;
        }

        if request.phase != StreamPhase::Recovering {
            request.phase = StreamPhase::Recovering;
            stats.synthesized_statuses += 1;
            let text = match cause {
                LossCause::ServiceUnavailable => "service unavailable on owning member",
                _ => "warm standby failover in progress",
            };
            debug!(stream_id = request.stream_id, cause = ?cause, "stream suspect, recovering");
            let status = StreamStatus::open_suspect(text);
            funnel.push(Event::delivery(
                Envelope::status(request.domain, request.stream_id, status),
                Origin::Group,
            ));
        }
        Recovery::Resume
    }
}
