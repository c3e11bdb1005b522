use serde::Serialize;

/// Counters describing what a warm-standby group has done since it was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// Scopes whose active member changed to another member
    pub failovers: u64,
    /// Scopes that gained an active member where there was none
    pub promotions: u64,
    /// Refreshes and updates from non-owners that were not delivered
    pub suppressed_duplicates: u64,
    /// Requests replayed to a new owner after failover
    pub resubmissions: u64,
    /// Status messages the group generated itself
    pub synthesized_statuses: u64,
    pub reconnect_attempts: u64,
    pub role_notifications: u64,
}

/// Point-in-time view of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub name: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub queued_messages: usize,
    pub services_up: usize,
}
