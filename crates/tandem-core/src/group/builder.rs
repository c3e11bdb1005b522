//! Builder pattern for constructing a `WarmStandbyGroup` from code or configuration.

use super::{
    connection::Member,
    coordinator::{GroupSettings, WarmStandbyGroup},
};
use crate::{
    config::{HandshakeConfig, MemberConfig, ReconnectConfig, TandemConfig},
    transport::Connector,
    types::{MemberId, StandbyMode},
};
use thiserror::Error;

/// Errors that can occur during group construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuilderError {
    /// A connector is required but was not provided
    #[error("`Connector` is required but was not provided")]
    MissingConnector,

    /// The group needs at least one member
    #[error("a warm standby group needs at least one member")]
    NoMembers,

    /// The resulting configuration failed validation
    #[error("invalid group configuration: {0}")]
    InvalidConfig(String),
}

/// Builder for a [`WarmStandbyGroup`].
///
/// Members keep the order they are added in; that order decides promotion.
///
/// # Examples
///
/// ```no_run
/// # use tandem_core::{group::WarmStandbyGroupBuilder, transport::Connector, types::StandbyMode};
/// # fn example(connector: Box<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
/// let group = WarmStandbyGroupBuilder::new()
///     .mode(StandbyMode::ServiceBased)
///     .member("primary", "10.0.0.1:14002")
///     .member("backup", "10.0.0.2:14002")
///     .connector(connector)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct WarmStandbyGroupBuilder {
    mode: StandbyMode,
    members: Vec<MemberConfig>,
    reconnect: ReconnectConfig,
    handshake: HandshakeConfig,
    connector: Option<Box<dyn Connector>>,
}

impl WarmStandbyGroupBuilder {
    /// Creates a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: StandbyMode::default(),
            members: Vec::new(),
            reconnect: ReconnectConfig::default(),
            handshake: HandshakeConfig::default(),
            connector: None,
        }
    }

    /// Starts from a loaded [`TandemConfig`]; a connector must still be supplied.
    #[must_use]
    pub fn from_config(config: &TandemConfig) -> Self {
        Self {
            mode: config.mode,
            members: config.members.clone(),
            reconnect: config.reconnect.clone(),
            handshake: config.handshake.clone(),
            connector: None,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: StandbyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Appends a member without credentials.
    #[must_use]
    pub fn member(mut self, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.members.push(MemberConfig::new(name, endpoint));
        self
    }

    #[must_use]
    pub fn member_config(mut self, member: MemberConfig) -> Self {
        self.members.push(member);
        self
    }

    /// Replaces the member list.
    #[must_use]
    pub fn members(mut self, members: Vec<MemberConfig>) -> Self {
        self.members = members;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the per-member reconnect budget (`-1` for unlimited).
    #[must_use]
    pub fn reconnect_attempt_limit(mut self, limit: i32) -> Self {
        self.reconnect.attempt_limit = limit;
        self
    }

    #[must_use]
    pub fn handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Builds the group. No link is opened until
    /// [`WarmStandbyGroup::connect`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError`] if the connector or members are missing, or if the
    /// settings fail the same validation as a loaded configuration.
    pub fn build(self) -> Result<WarmStandbyGroup, BuilderError> {
        let connector = self.connector.ok_or(BuilderError::MissingConnector)?;
        if self.members.is_empty() {
            return Err(BuilderError::NoMembers);
        }

        let config = TandemConfig {
            mode: self.mode,
            members: self.members,
            reconnect: self.reconnect,
            handshake: self.handshake,
            ..TandemConfig::default()
        };
        config.validate().map_err(BuilderError::InvalidConfig)?;

        let members = config
            .members
            .iter()
            .enumerate()
            .map(|(index, member)| Member::new(MemberId(index), member.clone()))
            .collect();
        let settings = GroupSettings {
            mode: config.mode,
            reconnect: config.reconnect,
            handshake: config.handshake,
        };
        Ok(WarmStandbyGroup::new(settings, members, connector))
    }
}

impl Default for WarmStandbyGroupBuilder {
    fn default() -> Self {
        Self::new()
    }
}
