use crate::{
    Result,
    board::render_board,
    board_reader::{
        BoardReader,
        read_current_game,
    },
    cache::ClientStateCache,
};
use indexer::app::{
    RunState,
    event_source::EventSource,
};
use keeper::{
    chain::RevealSubmitter,
    indexer_client::PendingSource,
};
use std::time::Duration;
use sweeper_abi::REVEAL_WINDOW_BLOCKS;
use tokio::time::{
    Interval,
    MissedTickBehavior,
};

#[cfg(test)]
mod tests;

/// How far behind the head the live tail starts; older requests are picked up
/// from the indexer's pending view.
pub const TAIL_LOOKBACK_BLOCKS: u64 = 2 * REVEAL_WINDOW_BLOCKS;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Keeps a [`ClientStateCache`] live: events are the fast path, a periodic
/// pass over chain state and the indexer is the backstop, and due reveals and
/// rescues are sent from the same pass.
pub struct Watcher<Events, Chain, Pending> {
    events: Events,
    chain: Chain,
    indexer: Pending,
    cache: ClientStateCache,
    reconcile: Interval,
    send_transactions: bool,
    head: u64,
    history_available: bool,
    dirty: bool,
}

impl<Events, Chain, Pending> Watcher<Events, Chain, Pending>
where
    Events: EventSource,
    Chain: BoardReader + RevealSubmitter,
    Pending: PendingSource,
{
    pub fn new(
        events: Events,
        chain: Chain,
        indexer: Pending,
        cache: ClientStateCache,
        reconcile_every: Duration,
    ) -> Self {
        let mut reconcile = tokio::time::interval(reconcile_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconcile.reset();
        Self {
            events,
            chain,
            indexer,
            cache,
            reconcile,
            send_transactions: true,
            head: 0,
            history_available: true,
            dirty: true,
        }
    }

    pub fn send_transactions(mut self, send: bool) -> Self {
        self.send_transactions = send;
        self
    }

    pub fn cache(&self) -> &ClientStateCache {
        &self.cache
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn history_available(&self) -> bool {
        self.history_available
    }

    /// The board text, if anything changed since the last call.
    pub fn take_frame(&mut self) -> Option<String> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(render_board(&self.cache, self.head, self.history_available))
    }

    pub async fn run(&mut self, interrupt: impl Future<Output = ()>) -> Result<RunState> {
        tokio::select! {
            batch = self.events.next_batch() => {
                let batch = batch?;
                for event in &batch.events {
                    self.dirty |= self.cache.apply_event(event);
                }
                self.cache.observe_through(batch.through_block);
                self.head = self.head.max(batch.through_block);
                tracing::debug!(
                    through_block = batch.through_block,
                    events = batch.events.len(),
                    "applied event batch"
                );
                Ok(RunState::Continue)
            }
            _ = self.reconcile.tick() => {
                self.reconcile_pass().await;
                Ok(RunState::Continue)
            }
            _ = interrupt => {
                Ok(RunState::Exit)
            }
        }
    }

    /// Pulls authoritative state, then sends whatever the cache says is owed.
    pub async fn reconcile_pass(&mut self) {
        let (head, board, projected) = futures::join!(
            self.chain.head_block(),
            read_current_game(&self.chain),
            self.indexer.pending_set(),
        );
        match head {
            Ok(head) => self.head = self.head.max(head),
            Err(e) => tracing::warn!("head block unavailable: {e:#}"),
        }
        match board {
            Ok(game) => {
                let dropped = self.cache.reconcile_chain_state(&game);
                if !dropped.is_empty() {
                    tracing::info!(?dropped, "chain shows tiles clicked; pending dropped");
                }
            }
            Err(e) => tracing::warn!("game state unavailable: {e:#}"),
        }
        match projected.and_then(|set| self.cache.reconcile_projected(&set)) {
            Ok(sync) => {
                if !self.history_available {
                    tracing::info!("indexer reachable again");
                }
                self.history_available = true;
                if !sync.dropped.is_empty() || !sync.adopted.is_empty() {
                    tracing::info!(
                        dropped = ?sync.dropped,
                        adopted = ?sync.adopted,
                        "reconciled against indexer"
                    );
                }
            }
            Err(e) => {
                if self.history_available {
                    tracing::warn!("indexer unavailable: {e:#}");
                }
                self.history_available = false;
            }
        }
        self.dirty = true;

        if !self.send_transactions {
            return;
        }
        let head = self.head;
        for due in self.cache.due_actions(head) {
            match self.chain.submit(due.request_id, due.action).await {
                Ok(tx_hash) => {
                    tracing::info!(request_id = due.request_id, %tx_hash, "sent {}", due.action);
                    self.cache.mark_submitted(due.request_id, due.action, head);
                }
                Err(e) => {
                    tracing::warn!(request_id = due.request_id, "{} failed: {e:#}", due.action);
                    self.cache.mark_failed(due.request_id, due.action, head);
                }
            }
        }
    }
}
