//! Warm-standby group: several member links presented as one logical channel.
//!
//! This module holds everything between the application API and the transport:
//! - Member lifecycle with handshake deadlines and per-member reconnect budgets
//! - Active/standby assignment per session or per service
//! - Outbound routing with standby mirroring of shared streams
//! - Inbound deduplication, directory aggregation and failover status synthesis
//! - One ordered event queue with channel-level state transitions
//!
//! # Ownership Modes
//!
//! 1. **Login-based** - one member is active for the whole session. Item requests go to
//!    it and are mirrored on every other READY member. If the active member's directory
//!    shows a service DOWN, streams on that service are served by the earliest member
//!    reporting it UP.
//!
//! 2. **Service-based** - each service has its own active member, chosen among the
//!    READY members that report the service UP. Losing the owner of one service does
//!    not touch streams on any other service.
//!
//! ## Event Flow
//!
//! ```text
//! submit ─► RequestRouter ─► Member::send ─► Link
//!                 ▲
//!           ScopeOwnership ◄── RoleAssignor ◄── member / directory change
//!                                                     ▲
//! Link ─► LinkEventSender ─► dispatch ─► ResponseAggregator ─► EventFunnel ─► Vec<Event>
//! ```
//!
//! See [`WarmStandbyGroup`] for the application-facing API.

pub mod aggregator;
pub mod builder;
pub mod connection;
pub mod coordinator;
pub mod funnel;
pub mod pending;
pub mod roles;
pub mod router;
pub mod stats;

pub use aggregator::{ItemOutcome, LossCause, Recovery, ResponseAggregator};
pub use builder::{BuilderError, WarmStandbyGroupBuilder};
pub use connection::{MemberState, ServiceView};
pub use coordinator::{
    GroupSettings, SubmitOptions, Submitted, WarmStandbyGroup, APPLICATION_ID_ATTRIBUTE,
    POSITION_ATTRIBUTE,
};
pub use funnel::{ChannelState, DescriptorSet, EventFunnel};
pub use pending::{PendingRequest, PendingTable, StreamPhase};
pub use roles::{
    MemberView, OwnershipChange, RoleAssignor, ScopeAssignment, ScopeKey, ScopeOwnership,
};
pub use router::{ItemRoute, RequestRouter, RouteDecision, RoutingContext};
pub use stats::{GroupStats, MemberStatus};
