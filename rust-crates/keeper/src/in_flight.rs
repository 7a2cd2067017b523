use crate::phase::RevealAction;
use std::collections::{
    BTreeMap,
    BTreeSet,
};

/// Blocks the indexer must have processed past a submission, with the request
/// still pending, before the same action is sent again.
pub const DEFAULT_RESUBMIT_AFTER_BLOCKS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Submitted { at_block: u64 },
    Failed { at_block: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub action: RevealAction,
    attempt: Attempt,
}

impl Marker {
    pub fn submitted_at(&self) -> Option<u64> {
        match self.attempt {
            Attempt::Submitted { at_block } => Some(at_block),
            Attempt::Failed { .. } => None,
        }
    }

    pub fn failed(&self) -> bool {
        matches!(self.attempt, Attempt::Failed { .. })
    }
}

/// In-flight markers per request id.
///
/// A marker is only dropped by [`InFlightTracker::retain_outstanding`], i.e. once
/// the projection no longer lists the request as pending. Sending a transaction
/// never clears one.
#[derive(Debug, Clone)]
pub struct InFlightTracker {
    markers: BTreeMap<u64, Marker>,
    resubmit_after: u64,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RESUBMIT_AFTER_BLOCKS)
    }
}

impl InFlightTracker {
    pub fn new(resubmit_after: u64) -> Self {
        Self {
            markers: BTreeMap::new(),
            resubmit_after,
        }
    }

    pub fn marker(&self, request_id: u64) -> Option<&Marker> {
        self.markers.get(&request_id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Whether `action` should be sent for `request_id` now.
    ///
    /// `indexed_through` is the last block the pending view reflects; a
    /// submission is only considered stale once that view has moved the
    /// resubmit buffer past it and still lists the request.
    pub fn is_due(
        &self,
        request_id: u64,
        action: RevealAction,
        head: u64,
        indexed_through: u64,
    ) -> bool {
        let Some(marker) = self.markers.get(&request_id) else {
            return true;
        };
        if marker.action != action {
            return true;
        }
        match marker.attempt {
            Attempt::Failed { at_block } => head > at_block,
            Attempt::Submitted { at_block } => {
                indexed_through >= at_block.saturating_add(self.resubmit_after)
            }
        }
    }

    pub fn mark_submitted(&mut self, request_id: u64, action: RevealAction, head: u64) {
        self.markers.insert(
            request_id,
            Marker {
                action,
                attempt: Attempt::Submitted { at_block: head },
            },
        );
    }

    pub fn mark_failed(&mut self, request_id: u64, action: RevealAction, head: u64) {
        self.markers.insert(
            request_id,
            Marker {
                action,
                attempt: Attempt::Failed { at_block: head },
            },
        );
    }

    /// Drops markers for requests no longer pending and returns their ids.
    pub fn retain_outstanding(
        &mut self,
        outstanding: impl IntoIterator<Item = u64>,
    ) -> Vec<u64> {
        let outstanding: BTreeSet<u64> = outstanding.into_iter().collect();
        let resolved: Vec<u64> = self
            .markers
            .keys()
            .filter(|request_id| !outstanding.contains(request_id))
            .copied()
            .collect();
        for request_id in &resolved {
            self.markers.remove(request_id);
        }
        resolved
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_due__unknown_request__is_due() {
        let tracker = InFlightTracker::default();
        assert!(tracker.is_due(1, RevealAction::Reveal, 100, 100));
    }

    #[test]
    fn is_due__fresh_submission__is_not_repeated() {
        // given
        let mut tracker = InFlightTracker::default();
        tracker.mark_submitted(1, RevealAction::Reveal, 100);

        // when
        let due = tracker.is_due(1, RevealAction::Reveal, 101, 101);

        // then
        assert!(!due);
    }

    #[test]
    fn is_due__submission_past_buffer_still_indexed_as_pending__is_resent() {
        // given
        let mut tracker = InFlightTracker::default();
        tracker.mark_submitted(1, RevealAction::Reveal, 100);

        // when
        let lagging = tracker.is_due(1, RevealAction::Reveal, 110, 104);
        let stale = tracker.is_due(1, RevealAction::Reveal, 110, 105);

        // then
        assert!(!lagging);
        assert!(stale);
    }

    #[test]
    fn is_due__failed_submission__is_retried_on_the_next_block() {
        // given
        let mut tracker = InFlightTracker::default();
        tracker.mark_failed(1, RevealAction::Reveal, 100);

        // then
        assert!(!tracker.is_due(1, RevealAction::Reveal, 100, 100));
        assert!(tracker.is_due(1, RevealAction::Reveal, 101, 100));
    }

    #[test]
    fn is_due__reveal_marker__does_not_block_rescue() {
        // given
        let mut tracker = InFlightTracker::default();
        tracker.mark_submitted(1, RevealAction::Reveal, 350);

        // when
        let due = tracker.is_due(1, RevealAction::Rescue, 360, 351);

        // then
        assert!(due);
    }

    #[test]
    fn retain_outstanding__clears_only_resolved_requests() {
        // given
        let mut tracker = InFlightTracker::default();
        tracker.mark_submitted(1, RevealAction::Reveal, 100);
        tracker.mark_submitted(2, RevealAction::Rescue, 100);
        tracker.mark_failed(3, RevealAction::Reveal, 100);

        // when
        let resolved = tracker.retain_outstanding([2, 3, 9]);

        // then
        assert_eq!(resolved, vec![1]);
        assert!(tracker.marker(1).is_none());
        assert_eq!(tracker.marker(2).and_then(Marker::submitted_at), Some(100));
        assert!(tracker.marker(3).is_some_and(Marker::failed));
    }
}
