use std::{collections::HashSet, sync::Arc};

use super::{Epoch, OperationKey, SubscriberId};
use crate::{
    cache::FetchPolicy,
    document::{OperationKind, OperationRequest},
    merge::ResultMerger,
    multiplexer::SubscriberSlot,
    result::MergedResult,
    transport::TransportSubscription,
};

/// One logical operation shared by every subscriber with the same key.
pub(crate) struct Operation {
    pub key: OperationKey,
    pub indexed: bool,
    pub request: OperationRequest,
    pub fetch_policy: FetchPolicy,
    pub merger: ResultMerger,
    pub epoch: Epoch,
    pub result: Arc<MergedResult>,
    /// Attached subscribers, in registration order.
    pub subscribers: Vec<Arc<SubscriberSlot>>,
    /// Attached subscribers plus released ones whose teardown delay has not elapsed.
    pub refs: usize,
    pub pending_releases: HashSet<SubscriberId>,
    pub transport: Option<TransportSubscription>,
}

impl Operation {
    pub fn new(key: OperationKey, indexed: bool, request: OperationRequest, fetch_policy: FetchPolicy) -> Self {
        Operation {
            key,
            indexed,
            merger: ResultMerger::new(request.kind()),
            request,
            fetch_policy,
            epoch: Epoch::default(),
            result: Arc::new(MergedResult::loading()),
            subscribers: Vec::new(),
            refs: 0,
            pending_releases: HashSet::new(),
            transport: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.merger.kind()
    }

    pub fn attach(&mut self, slot: Arc<SubscriberSlot>) {
        self.refs += 1;
        self.subscribers.push(slot);
    }

    /// Stops deliveries to a subscriber. Its reference is kept until
    /// [`Operation::finish_release`] runs.
    pub fn detach(&mut self, subscriber: SubscriberId) -> Option<Arc<SubscriberSlot>> {
        let position = self.subscribers.iter().position(|slot| slot.id() == subscriber)?;
        let slot = self.subscribers.remove(position);
        self.pending_releases.insert(subscriber);
        Some(slot)
    }

    /// Takes a released subscriber back before its reference was dropped.
    pub fn reclaim(&mut self, slot: Arc<SubscriberSlot>) -> bool {
        if !self.pending_releases.remove(&slot.id()) {
            return false;
        }
        self.subscribers.push(slot);
        true
    }

    /// Drops the reference of a released subscriber. Returns whether the
    /// operation is now unreferenced.
    pub fn finish_release(&mut self, subscriber: SubscriberId) -> Option<bool> {
        if !self.pending_releases.remove(&subscriber) {
            return None;
        }
        self.refs = self.refs.saturating_sub(1);
        Some(self.refs == 0)
    }
}
