//! Active/standby assignment.
//!
//! [`RoleAssignor::assign`] is a pure function of the member views and the previous
//! assignment. It runs after every member state or service change; the group then
//! diffs old against new ownership to decide which members to notify and which
//! streams need failover.
//!
//! # Promotion Rule
//!
//! 1. The current active keeps its scope while it stays eligible
//! 2. Otherwise the earliest eligible member in configured order wins
//!
//! Eligibility is READY for the session scope, and READY with the service UP for a
//! service scope.

use crate::types::{MemberId, Role, ServiceId, StandbyMode};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// What ownership is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    /// The whole session (login-based mode).
    Session,
    Service(ServiceId),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Service(id) => write!(f, "service:{id}"),
        }
    }
}

/// Snapshot of one member as role assignment and routing see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
    pub id: MemberId,
    pub up: bool,
    pub ready: bool,
    /// A directory refresh has been received since the last connect.
    pub directory_known: bool,
    /// A directory was requested on this link and has not been answered.
    pub directory_pending: bool,
    pub services_up: BTreeSet<ServiceId>,
}

impl MemberView {
    /// READY and either reporting `service` UP or not having a directory to consult.
    #[must_use]
    pub fn can_serve(&self, service: Option<ServiceId>) -> bool {
        match service {
            Some(id) if self.directory_known => self.ready && self.services_up.contains(&id),
            _ => self.ready,
        }
    }

    /// Like [`Self::can_serve`], but a member still waiting for its directory takes no
    /// mirrors until it has shown which services it carries.
    #[must_use]
    pub fn can_mirror(&self, service: Option<ServiceId>) -> bool {
        !self.directory_pending && self.can_serve(service)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeAssignment {
    pub active: MemberId,
    pub standbys: Vec<MemberId>,
}

/// Scope key to active/standby members. At most one active per scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeOwnership {
    scopes: BTreeMap<ScopeKey, ScopeAssignment>,
}

/// Change of active member for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipChange {
    pub scope: ScopeKey,
    pub previous: Option<MemberId>,
    pub current: Option<MemberId>,
}

impl OwnershipChange {
    /// An existing active was replaced by another member.
    #[must_use]
    pub fn is_failover(&self) -> bool {
        self.previous.is_some() && self.current.is_some()
    }
}

impl ScopeOwnership {
    #[must_use]
    pub fn active(&self, scope: ScopeKey) -> Option<MemberId> {
        self.scopes.get(&scope).map(|a| a.active)
    }

    #[must_use]
    pub fn standbys(&self, scope: ScopeKey) -> &[MemberId] {
        self.scopes.get(&scope).map_or(&[], |a| a.standbys.as_slice())
    }

    #[must_use]
    pub fn role_of(&self, member: MemberId, scope: ScopeKey) -> Option<Role> {
        let assignment = self.scopes.get(&scope)?;
        if assignment.active == member {
            Some(Role::Active)
        } else if assignment.standbys.contains(&member) {
            Some(Role::Standby)
        } else {
            None
        }
    }

    pub fn scopes(&self) -> impl Iterator<Item = (&ScopeKey, &ScopeAssignment)> {
        self.scopes.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Members active for at least one scope.
    #[must_use]
    pub fn active_members(&self) -> BTreeSet<MemberId> {
        self.scopes.values().map(|a| a.active).collect()
    }

    /// Scopes whose active member differs between `self` and `next`.
    #[must_use]
    pub fn diff(&self, next: &ScopeOwnership) -> Vec<OwnershipChange> {
        let keys: BTreeSet<ScopeKey> =
            self.scopes.keys().chain(next.scopes.keys()).copied().collect();
        keys.into_iter()
            .filter_map(|scope| {
                let previous = self.active(scope);
                let current = next.active(scope);
                (previous != current).then_some(OwnershipChange { scope, previous, current })
            })
            .collect()
    }
}

/// Computes [`ScopeOwnership`] for a mode.
#[derive(Debug, Clone, Copy)]
pub struct RoleAssignor {
    mode: StandbyMode,
}

impl RoleAssignor {
    #[must_use]
    pub fn new(mode: StandbyMode) -> Self {
        Self { mode }
    }

    /// Recomputes ownership. `members` must be in configured order.
    #[must_use]
    pub fn assign(&self, members: &[MemberView], previous: &ScopeOwnership) -> ScopeOwnership {
        let mut scopes = BTreeMap::new();

        match self.mode {
            StandbyMode::LoginBased => {
                let eligible: Vec<MemberId> =
                    members.iter().filter(|m| m.ready).map(|m| m.id).collect();
                if let Some(assignment) =
                    Self::elect(&eligible, previous.active(ScopeKey::Session))
                {
                    scopes.insert(ScopeKey::Session, assignment);
                }
            }
            StandbyMode::ServiceBased => {
                let services: BTreeSet<ServiceId> = members
                    .iter()
                    .filter(|m| m.ready)
                    .flat_map(|m| m.services_up.iter().copied())
                    .collect();
                for service in services {
                    let eligible: Vec<MemberId> = members
                        .iter()
                        .filter(|m| m.ready && m.services_up.contains(&service))
                        .map(|m| m.id)
                        .collect();
                    let scope = ScopeKey::Service(service);
                    if let Some(assignment) = Self::elect(&eligible, previous.active(scope)) {
                        scopes.insert(scope, assignment);
                    }
                }
            }
        }

        ScopeOwnership { scopes }
    }

    fn elect(eligible: &[MemberId], incumbent: Option<MemberId>) -> Option<ScopeAssignment> {
        let active = incumbent
            .filter(|id| eligible.contains(id))
            .or_else(|| eligible.first().copied())?;
        let standbys = eligible.iter().copied().filter(|id| *id != active).collect();
        Some(ScopeAssignment { active, standbys })
    }
}
