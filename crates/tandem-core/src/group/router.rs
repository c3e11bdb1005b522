//! Outbound routing decisions.
//!
//! The router is stateless: everything it needs arrives through a
//! [`RoutingContext`] built from the group's current ownership and member views, so
//! the same decision logic serves fresh submits, failover resubmits and mirror
//! catch-up.
//!
//! | Message                    | Login-based                | Service-based              |
//! |----------------------------|----------------------------|----------------------------|
//! | login / directory          | every UP member            | every UP member            |
//! | item request (shared)      | active + standby mirrors   | service owner + mirrors    |
//! | item request (private)     | active only                | service owner only         |
//! | generic / post             | every UP member            | service owner only         |
//! | pause reissue              | rejected                   | rejected                   |

use crate::{
    errors::SubmitError,
    group::roles::{MemberView, ScopeKey, ScopeOwnership},
    types::{MemberId, ServiceId, StandbyMode, StreamId},
};

/// Shared context required by [`RequestRouter`].
///
/// - **`ownership`**: current active/standby assignment per scope
/// - **`members`**: member views in configured order
#[derive(Debug, Clone, Copy)]
pub struct RoutingContext<'a> {
    pub ownership: &'a ScopeOwnership,
    pub members: &'a [MemberView],
}

impl RoutingContext<'_> {
    fn view(&self, id: MemberId) -> Option<&MemberView> {
        self.members.iter().find(|m| m.id == id)
    }

    fn up_members(&self) -> Vec<MemberId> {
        self.members.iter().filter(|m| m.up).map(|m| m.id).collect()
    }
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// One owner, plus standbys that keep a mirror of the stream.
    Directed { target: MemberId, mirrors: Vec<MemberId> },
    Broadcast(Vec<MemberId>),
    /// Hold until a member becomes eligible.
    Queue,
}

/// Routing-relevant facts about an item request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRoute {
    pub stream_id: StreamId,
    pub service: Option<ServiceId>,
    /// A service name was given that no member has advertised yet.
    pub service_pending: bool,
    pub private_stream: bool,
    pub pause: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestRouter {
    mode: StandbyMode,
}

impl RequestRouter {
    #[must_use]
    pub fn new(mode: StandbyMode) -> Self {
        Self { mode }
    }

    #[must_use]
    pub fn mode(&self) -> StandbyMode {
        self.mode
    }

    /// Ownership scope of a stream on `service`.
    #[must_use]
    pub fn scope_for(&self, service: Option<ServiceId>) -> Option<ScopeKey> {
        match self.mode {
            StandbyMode::LoginBased => Some(ScopeKey::Session),
            StandbyMode::ServiceBased => service.map(ScopeKey::Service),
        }
    }

    /// Member that should own a stream on `service`.
    ///
    /// In login-based mode this is the session active, unless its directory shows the
    /// service is not UP there; then the earliest READY member reporting it UP serves
    /// the stream instead.
    #[must_use]
    pub fn owner_for(
        &self,
        ctx: &RoutingContext<'_>,
        service: Option<ServiceId>,
    ) -> Option<MemberId> {
        match self.mode {
            StandbyMode::LoginBased => {
                let active = ctx.ownership.active(ScopeKey::Session)?;
                let serves = ctx.view(active).is_some_and(|v| v.can_serve(service));
                if serves || service.is_none() {
                    return Some(active);
                }
                ctx.members
                    .iter()
                    .find(|m| m.directory_known && m.can_serve(service))
                    .map(|m| m.id)
            }
            StandbyMode::ServiceBased => ctx.ownership.active(ScopeKey::Service(service?)),
        }
    }

    /// Member that may open a private stream on `service`: the scope active and nobody
    /// else. In login-based mode a session active without the service refuses it.
    #[must_use]
    pub fn private_owner_for(
        &self,
        ctx: &RoutingContext<'_>,
        service: Option<ServiceId>,
    ) -> Option<MemberId> {
        match self.mode {
            StandbyMode::LoginBased => ctx
                .ownership
                .active(ScopeKey::Session)
                .filter(|active| ctx.view(*active).is_some_and(|v| v.can_serve(service))),
            StandbyMode::ServiceBased => self.owner_for(ctx, service),
        }
    }

    /// Members other than `owner` that should carry a mirror of a shared stream.
    #[must_use]
    pub fn mirrors_for(
        &self,
        ctx: &RoutingContext<'_>,
        owner: MemberId,
        service: Option<ServiceId>,
    ) -> Vec<MemberId> {
        match self.mode {
            StandbyMode::LoginBased => ctx
                .members
                .iter()
                .filter(|m| m.id != owner && m.can_mirror(service))
                .map(|m| m.id)
                .collect(),
            StandbyMode::ServiceBased => service
                .map(|s| {
                    ctx.ownership
                        .standbys(ScopeKey::Service(s))
                        .iter()
                        .copied()
                        .filter(|id| *id != owner)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Login and directory traffic goes to every member holding a session.
    #[must_use]
    pub fn route_control(&self, ctx: &RoutingContext<'_>) -> RouteDecision {
        RouteDecision::Broadcast(ctx.up_members())
    }

    /// Routes an item open or reissue.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::PauseNotSupported`] for any pause request
    /// - [`SubmitError::InvalidMessage`] for a service-based request without a service
    /// - [`SubmitError::NoActiveMember`] for a private request nobody can own right now
    pub fn route_item(
        &self,
        ctx: &RoutingContext<'_>,
        item: &ItemRoute,
    ) -> Result<RouteDecision, SubmitError> {
        if item.pause {
            return Err(SubmitError::PauseNotSupported(item.stream_id));
        }
        if self.mode == StandbyMode::ServiceBased && item.service.is_none() && !item.service_pending
        {
            return Err(SubmitError::InvalidMessage(format!(
                "stream {} names no service",
                item.stream_id
            )));
        }

        let owner = if item.service_pending {
            None
        } else if item.private_stream {
            self.private_owner_for(ctx, item.service)
        } else {
            self.owner_for(ctx, item.service)
        };
        match owner {
            Some(target) => {
                let mirrors = if item.private_stream {
                    Vec::new()
                } else {
                    self.mirrors_for(ctx, target, item.service)
                };
                Ok(RouteDecision::Directed { target, mirrors })
            }
            None if item.private_stream => Err(SubmitError::NoActiveMember(item.stream_id)),
            None => Ok(RouteDecision::Queue),
        }
    }

    /// Routes a generic or post message.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::NotReady`] when no member is UP (login-based)
    /// - [`SubmitError::NoActiveMember`] when the referenced service has no owner
    ///   (service-based)
    pub fn route_generic(
        &self,
        ctx: &RoutingContext<'_>,
        stream_id: StreamId,
        service: Option<ServiceId>,
    ) -> Result<RouteDecision, SubmitError> {
        match self.mode {
            StandbyMode::LoginBased => {
                let targets = ctx.up_members();
                if targets.is_empty() {
                    return Err(SubmitError::NotReady);
                }
                Ok(RouteDecision::Broadcast(targets))
            }
            StandbyMode::ServiceBased => {
                let target = self
                    .owner_for(ctx, service)
                    .ok_or(SubmitError::NoActiveMember(stream_id))?;
                Ok(RouteDecision::Directed { target, mirrors: Vec::new() })
            }
        }
    }
}
