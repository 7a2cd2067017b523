use crate::{
    Result,
    chain::RevealSubmitter,
    in_flight::InFlightTracker,
    indexer_client::PendingSource,
    phase::{
        RevealAction,
        RevealPhase,
    },
};
use futures::future::try_join;
use indexer::views::PendingClickDto;

#[cfg(test)]
mod tests;

/// The scheduling-relevant part of a projected pending click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: u64,
    pub game_id: u64,
    pub target_block: u64,
    pub orphaned: bool,
}

impl PendingRequest {
    pub fn from_dto(dto: &PendingClickDto) -> Result<Self> {
        Ok(Self {
            request_id: dto.request_id()?,
            game_id: dto.game_id()?,
            target_block: dto.target_block()?,
            orphaned: dto.orphaned,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueAction {
    pub request_id: u64,
    pub action: RevealAction,
}

/// Actions owed at `head` for the given `(request_id, target_block)` pairs,
/// skipping those the tracker already has in flight.
pub fn plan_actions(
    tracker: &InFlightTracker,
    requests: impl IntoIterator<Item = (u64, u64)>,
    head: u64,
    indexed_through: u64,
) -> Vec<DueAction> {
    requests
        .into_iter()
        .filter_map(|(request_id, target_block)| {
            let action = RevealPhase::classify(head, target_block).action()?;
            tracker
                .is_due(request_id, action, head, indexed_through)
                .then_some(DueAction { request_id, action })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub head: u64,
    pub outstanding: usize,
    /// Requests whose markers were dropped because the projection resolved them.
    pub resolved: Vec<u64>,
    pub due: Vec<DueAction>,
    pub submitted: Vec<DueAction>,
    pub failed: Vec<DueAction>,
}

pub struct Scheduler<Chain, Pending> {
    chain: Chain,
    pending: Pending,
    tracker: InFlightTracker,
    dry_run: bool,
}

impl<Chain: RevealSubmitter, Pending: PendingSource> Scheduler<Chain, Pending> {
    pub fn new(chain: Chain, pending: Pending, tracker: InFlightTracker) -> Self {
        Self {
            chain,
            pending,
            tracker,
            dry_run: false,
        }
    }

    /// Logs due actions instead of sending them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn tracker(&self) -> &InFlightTracker {
        &self.tracker
    }

    /// One pass: re-derive every decision from the projected pending set and
    /// the chain head, then send whatever is owed.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let (head, pending_set) =
            try_join(self.chain.head_block(), self.pending.pending_set()).await?;
        let indexed_through = pending_set.checkpoint()?.unwrap_or(head).min(head);

        let requests: Vec<PendingRequest> = pending_set
            .pending_clicks
            .iter()
            .filter_map(|dto| match PendingRequest::from_dto(dto) {
                Ok(request) => Some(request),
                Err(e) => {
                    tracing::warn!("skipping malformed pending click {}: {e}", dto.id);
                    None
                }
            })
            .collect();

        let resolved = self
            .tracker
            .retain_outstanding(requests.iter().map(|request| request.request_id));
        for request_id in &resolved {
            tracing::info!(request_id, "request resolved by the projection");
        }

        for request in requests.iter().filter(|request| request.orphaned) {
            tracing::debug!(
                request_id = request.request_id,
                game_id = request.game_id,
                "pending click outlived its game"
            );
        }

        let due = plan_actions(
            &self.tracker,
            requests
                .iter()
                .map(|request| (request.request_id, request.target_block)),
            head,
            indexed_through,
        );

        let mut report = TickReport {
            head,
            outstanding: requests.len(),
            resolved,
            due: due.clone(),
            ..TickReport::default()
        };

        if self.dry_run {
            for DueAction { request_id, action } in &due {
                tracing::info!(request_id, head, "dry run: would send {action}");
            }
            return Ok(report);
        }

        for item in due {
            let DueAction { request_id, action } = item;
            match self.chain.submit(request_id, action).await {
                Ok(tx_hash) => {
                    tracing::info!(request_id, head, %tx_hash, "sent {action}");
                    self.tracker.mark_submitted(request_id, action, head);
                    report.submitted.push(item);
                }
                Err(e) => {
                    tracing::warn!(request_id, head, "{action} failed, retrying next block: {e:#}");
                    self.tracker.mark_failed(request_id, action, head);
                    report.failed.push(item);
                }
            }
        }
        Ok(report)
    }
}
