//! Ordered application event queue and aggregate descriptor set.
//!
//! The funnel is the only place events are produced. Member-level facts go in
//! ("a member reached UP", "a descriptor went away") and channel-level events come
//! out, each exactly once per transition of the logical channel:
//!
//! ```text
//!  Idle/Connecting ──member UP──► Up ──handshake done──► Ready
//!        ▲                         │                       │
//!        │                         └───── all members lost ┘
//!        │                                    │
//!   DownReconnecting ◄──── budget left ───────┤
//!                                             └── budget spent ──► Down (terminal)
//! ```

use crate::types::{ChannelEvent, Descriptor, Event, SocketSetDiff};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// State of the logical channel as the application sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Up,
    Ready,
    DownReconnecting,
    Down,
}

impl ChannelState {
    #[must_use]
    pub fn is_down(self) -> bool {
        self == Self::Down
    }
}

/// Union of member descriptors with the last published snapshot.
#[derive(Debug, Default)]
pub struct DescriptorSet {
    current: BTreeSet<Descriptor>,
    active: BTreeSet<Descriptor>,
    published: BTreeSet<Descriptor>,
    published_active: BTreeSet<Descriptor>,
    version: u64,
}

impl DescriptorSet {
    pub fn add(&mut self, descriptor: Descriptor) {
        self.current.insert(descriptor);
    }

    pub fn remove(&mut self, descriptor: Descriptor) {
        self.current.remove(&descriptor);
        self.active.remove(&descriptor);
    }

    pub fn set_active(&mut self, active: impl IntoIterator<Item = Descriptor>) {
        self.active = active.into_iter().filter(|d| self.current.contains(d)).collect();
    }

    #[must_use]
    pub fn current(&self) -> &BTreeSet<Descriptor> {
        &self.current
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Diff since the last call, or `None` if nothing changed.
    pub fn take_diff(&mut self) -> Option<SocketSetDiff> {
        if self.current == self.published && self.active == self.published_active {
            return None;
        }
        let added = self.current.difference(&self.published).copied().collect();
        let removed = self.published.difference(&self.current).copied().collect();
        self.published.clone_from(&self.current);
        self.published_active.clone_from(&self.active);
        self.version += 1;
        Some(SocketSetDiff {
            added,
            removed,
            active: self.active.iter().copied().collect(),
            version: self.version,
        })
    }
}

/// Event queue plus channel state machine.
#[derive(Debug)]
pub struct EventFunnel {
    queue: VecDeque<Event>,
    descriptors: DescriptorSet,
    state: ChannelState,
}

impl Default for EventFunnel {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            descriptors: DescriptorSet::default(),
            state: ChannelState::Idle,
        }
    }
}

impl EventFunnel {
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[must_use]
    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    pub fn descriptors_mut(&mut self) -> &mut DescriptorSet {
        &mut self.descriptors
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Removes up to `max` events in production order.
    pub fn drain(&mut self, max: usize) -> Vec<Event> {
        let n = max.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Publishes the pending descriptor diff, if any.
    pub fn flush_descriptors(&mut self) {
        if let Some(diff) = self.descriptors.take_diff() {
            debug!(
                version = diff.version,
                added = diff.added.len(),
                removed = diff.removed.len(),
                active = diff.active.len(),
                "socket set changed"
            );
            self.queue.push_back(Event::Channel(ChannelEvent::SocketSetChanged(diff)));
        }
    }

    pub fn connecting(&mut self) {
        if self.state == ChannelState::Idle {
            self.state = ChannelState::Connecting;
        }
    }

    /// A member reached UP.
    pub fn member_up(&mut self) {
        if matches!(
            self.state,
            ChannelState::Idle | ChannelState::Connecting | ChannelState::DownReconnecting
        ) {
            self.state = ChannelState::Up;
            info!("channel up");
            self.queue.push_back(Event::Channel(ChannelEvent::Up));
        }
    }

    /// The handshake completed for an owning member.
    pub fn handshake_complete(&mut self) {
        if self.state == ChannelState::Up {
            self.state = ChannelState::Ready;
            info!("channel ready");
            self.queue.push_back(Event::Channel(ChannelEvent::Ready));
        }
    }

    /// No member is UP any more. `exhausted` means none will ever reconnect.
    pub fn members_lost(&mut self, exhausted: bool) {
        if exhausted {
            if self.state != ChannelState::Down {
                self.state = ChannelState::Down;
                warn!("channel down, every member exhausted its reconnect budget");
                self.queue.push_back(Event::Channel(ChannelEvent::Down));
            }
        } else if matches!(
            self.state,
            ChannelState::Connecting | ChannelState::Up | ChannelState::Ready
        ) {
            self.state = ChannelState::DownReconnecting;
            warn!("channel down, reconnecting");
            self.queue.push_back(Event::Channel(ChannelEvent::DownReconnecting));
        }
    }

    /// Explicit close; no channel event is produced.
    pub fn closed(&mut self) {
        self.state = ChannelState::Down;
    }
}
