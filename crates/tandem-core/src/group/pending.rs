//! Book of item streams the application has open through the group.

use crate::{
    group::roles::ScopeKey,
    types::{Domain, Envelope, MemberId, ServiceId, StreamId},
};
use std::collections::{BTreeMap, BTreeSet};

/// Delivery phase of one logical item stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Sent or queued; no refresh delivered yet.
    Opening,
    Open,
    /// OPEN/SUSPECT delivered; waiting for the next owner to answer.
    Recovering,
}

/// An item request the application has open through the group.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub stream_id: StreamId,
    pub domain: Domain,
    pub scope: Option<ScopeKey>,
    pub service_id: Option<ServiceId>,
    /// Name to resolve once a directory advertises it.
    pub service_name: Option<String>,
    pub key_name: Option<String>,
    pub private_stream: bool,
    pub streaming: bool,
    pub owner: Option<MemberId>,
    pub mirrors: BTreeSet<MemberId>,
    pub refresh_completed: bool,
    pub phase: StreamPhase,
    /// Latest request as submitted, replayed on resubmission.
    pub request: Envelope,
}

impl PendingRequest {
    #[must_use]
    pub fn new(request: Envelope, service_id: Option<ServiceId>, private_stream: bool) -> Self {
        Self {
            stream_id: request.stream_id,
            domain: request.domain,
            scope: None,
            service_id,
            service_name: request.service_name.clone(),
            key_name: request.key_name.clone(),
            private_stream,
            streaming: request.flags.streaming,
            owner: None,
            mirrors: BTreeSet::new(),
            refresh_completed: false,
            phase: StreamPhase::Opening,
            request,
        }
    }

    /// Members holding a provider-side copy of this stream.
    #[must_use]
    pub fn holders(&self) -> Vec<MemberId> {
        self.owner.into_iter().chain(self.mirrors.iter().copied()).collect()
    }

    #[must_use]
    pub fn is_held_by(&self, member: MemberId) -> bool {
        self.owner == Some(member) || self.mirrors.contains(&member)
    }

    /// Request envelope as it should go to a member, with the resolved service stamped in.
    #[must_use]
    pub fn outbound_request(&self) -> Envelope {
        let mut request = self.request.clone();
        if request.service_id.is_none() {
            request.service_id = self.service_id;
        }
        request.flags.private_stream = self.private_stream;
        request
    }
}

/// Open item streams keyed by stream id.
#[derive(Debug, Default)]
pub struct PendingTable {
    streams: BTreeMap<StreamId, PendingRequest>,
}

impl PendingTable {
    pub fn insert(&mut self, request: PendingRequest) -> Option<PendingRequest> {
        self.streams.insert(request.stream_id, request)
    }

    #[must_use]
    pub fn get(&self, stream_id: StreamId) -> Option<&PendingRequest> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut PendingRequest> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: StreamId) -> Option<PendingRequest> {
        self.streams.remove(&stream_id)
    }

    #[must_use]
    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Stream ids in ascending order, for iteration while mutating.
    #[must_use]
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.streams.values()
    }

    #[must_use]
    pub fn owned_by(&self, member: MemberId) -> Vec<StreamId> {
        self.streams.values().filter(|p| p.owner == Some(member)).map(|p| p.stream_id).collect()
    }

    /// Streams opened by service name whose id is not known yet, owned or not.
    #[must_use]
    pub fn unresolved(&self) -> Vec<(StreamId, String)> {
        self.streams
            .values()
            .filter(|p| p.service_id.is_none())
            .filter_map(|p| p.service_name.clone().map(|name| (p.stream_id, name)))
            .collect()
    }

    /// Forgets `member` as a mirror everywhere. Returns how many streams it mirrored.
    pub fn drop_mirror(&mut self, member: MemberId) -> usize {
        self.streams
            .values_mut()
            .map(|p| p.mirrors.remove(&member))
            .filter(|removed| *removed)
            .count()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingRequest> + '_ {
        std::mem::take(&mut self.streams).into_values()
    }
}
