use crate::types::{MemberId, StreamId};
use thiserror::Error;

/// Classification of failures for handling decisions.
///
/// Different classes surface in different ways:
/// - Transient member failures never reach the caller as errors, only as channel events
/// - Stream-level classes arrive as synthesized status messages on the affected stream
/// - Rejected operations are returned synchronously from `submit`
/// - Group exhaustion ends the logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Member link lost; retried internally up to the reconnect limit.
    Transient,
    /// Stream keeps going after an OPEN/SUSPECT status; the group resubmits it.
    RecoverableStream,
    /// Stream ended with CLOSED_RECOVER; the application must reopen it.
    TerminalStream,
    /// Operation refused at submit time.
    RejectedOperation,
    /// Every member is down with no reconnect budget left.
    GroupExhausted,
}

impl ErrorClass {
    /// Returns a static string representation for log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RecoverableStream => "recoverable_stream",
            Self::TerminalStream => "terminal_stream",
            Self::RejectedOperation => "rejected_operation",
            Self::GroupExhausted => "group_exhausted",
        }
    }
}

/// Errors raised by a member link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The member is not UP, so nothing can be written to it.
    #[error("member not ready")]
    NotReady,

    /// The remote endpoint refused or could not be reached.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The link was closed underneath a send.
    #[error("link closed: {0}")]
    LinkClosed(String),

    /// Writing to an open link failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A login or directory handshake did not complete in time.
    #[error("{0} handshake timed out")]
    HandshakeTimeout(&'static str),

    /// The provider refused the login.
    #[error("login rejected: {0}")]
    LoginRejected(String),
}

impl TransportError {
    /// Returns `true` if reconnecting may clear the failure.
    ///
    /// Everything but a rejected login is worth another attempt; a provider that
    /// denied the credentials will deny them again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::LoginRejected(_))
    }
}

/// Reasons a [`submit`](crate::group::WarmStandbyGroup::submit) call is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// Pause reissues cannot be kept consistent across members.
    #[error("pause is not supported by a warm standby group (stream {0})")]
    PauseNotSupported(StreamId),

    /// No member owns the scope and the request cannot wait for one.
    #[error("no active member for stream {0}")]
    NoActiveMember(StreamId),

    /// No member is UP to receive a broadcast message.
    #[error("no member is up")]
    NotReady,

    /// Close, generic or post on a stream the group does not know.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// The message cannot be routed as given.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The logical channel is down for good.
    #[error("warm standby group is down")]
    GroupDown,

    /// A member link refused the write.
    #[error("{member}: {source}")]
    Transport {
        member: MemberId,
        #[source]
        source: TransportError,
    },
}

impl SubmitError {
    /// Returns `true` if resubmitting the same message can never succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::PauseNotSupported(_) |
                Self::InvalidMessage(_) |
                Self::UnknownStream(_) |
                Self::GroupDown
        )
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::GroupDown => ErrorClass::GroupExhausted,
            Self::Transport { .. } => ErrorClass::Transient,
            _ => ErrorClass::RejectedOperation,
        }
    }
}
