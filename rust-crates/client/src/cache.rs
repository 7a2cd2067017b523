//! Client-side view of the live game: the board as the chain reports it, the
//! requests this client has seen committed, and the in-flight markers for the
//! reveals and rescues it sends itself.
//!
//! Every event goes through [`ClientStateCache::apply_event`]; chain reads and
//! the indexer's pending view are folded in by the two `reconcile_*` methods and
//! always win over local bookkeeping.

use crate::{
    Result,
    watcher::TAIL_LOOKBACK_BLOCKS,
};
use alloy::primitives::{
    Address,
    U256,
};
use indexer::{
    events::{
        ContractEvent,
        EventPosition,
        LoggedEvent,
    },
    views::{
        PendingSetDto,
        parse_address,
    },
};
use keeper::{
    chain::OnChainGame,
    in_flight::{
        InFlightTracker,
        Marker,
    },
    phase::{
        RevealAction,
        RevealPhase,
    },
    scheduler::{
        DueAction,
        plan_actions,
    },
};
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    fmt,
};
use sweeper_abi::{
    ClickedMask,
    TILE_COUNT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardState {
    pub game_id: u64,
    pub pool: U256,
    pub winner: Option<Address>,
    pub active: bool,
    pub clicked_mask: ClickedMask,
}

impl BoardState {
    fn fresh(game_id: u64) -> Self {
        Self {
            game_id,
            pool: U256::ZERO,
            winner: None,
            active: true,
            clicked_mask: ClickedMask::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedClick {
    pub request_id: u64,
    pub game_id: u64,
    pub player: Address,
    pub tile_index: u8,
    pub target_block: u64,
    pub committed_at: EventPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Lost,
    Won,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileBadge {
    Available,
    Clicked,
    Pending(RevealPhase),
    Won,
    Refunded,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickBlocker {
    OffBoard,
    NoGame,
    GameOver,
    AlreadyClicked,
    AwaitingReveal(u64),
}

impl fmt::Display for ClickBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClickBlocker::OffBoard => write!(f, "tile is off the board (0..{TILE_COUNT})"),
            ClickBlocker::NoGame => write!(f, "no game is known yet"),
            ClickBlocker::GameOver => write!(f, "the game is over"),
            ClickBlocker::AlreadyClicked => write!(f, "tile was already clicked"),
            ClickBlocker::AwaitingReveal(request_id) => {
                write!(f, "request {request_id} on this tile is awaiting reveal")
            }
        }
    }
}

/// Outcome of folding the indexer's pending view into the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectedSync {
    pub dropped: Vec<u64>,
    pub adopted: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientStateCache {
    board: Option<BoardState>,
    pending: BTreeMap<u64, TrackedClick>,
    /// Settled request ids, keyed to the block their commit landed in.
    resolved: BTreeMap<u64, u64>,
    tile_outcomes: BTreeMap<(u64, u8), Resolution>,
    applied_refunds: BTreeSet<EventPosition>,
    observed_through: Option<u64>,
    tracker: InFlightTracker,
}

impl ClientStateCache {
    pub fn new(tracker: InFlightTracker) -> Self {
        Self {
            tracker,
            ..Self::default()
        }
    }

    pub fn board(&self) -> Option<&BoardState> {
        self.board.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &TrackedClick> {
        self.pending.values()
    }

    pub fn pending_click(&self, request_id: u64) -> Option<&TrackedClick> {
        self.pending.get(&request_id)
    }

    pub fn in_flight(&self, request_id: u64) -> Option<&Marker> {
        self.tracker.marker(request_id)
    }

    pub fn observed_through(&self) -> Option<u64> {
        self.observed_through
    }

    /// Records that the event stream has delivered everything up to `block`.
    /// Settlement records the tail can no longer redeliver are pruned.
    pub fn observe_through(&mut self, block: u64) {
        self.observed_through = Some(self.observed_through.map_or(block, |b| b.max(block)));
        if let Some(floor) = self.retention_floor() {
            self.resolved.retain(|_, committed_block| *committed_block >= floor);
            self.applied_refunds = self
                .applied_refunds
                .split_off(&EventPosition::new(floor, 0));
        }
    }

    fn retention_floor(&self) -> Option<u64> {
        self.observed_through
            .map(|block| block.saturating_sub(TAIL_LOOKBACK_BLOCKS))
    }

    /// Folds one event in. Returns whether anything changed; re-delivered
    /// events change nothing.
    pub fn apply_event(&mut self, logged: &LoggedEvent) -> bool {
        match &logged.event {
            ContractEvent::GameStarted(event) => {
                let newer = self
                    .board
                    .is_none_or(|board| event.game_id > board.game_id);
                if newer {
                    self.replace_board(BoardState::fresh(event.game_id));
                }
                newer
            }
            ContractEvent::ClickPending(event) => {
                if self.resolved.contains_key(&event.request_id)
                    || self.pending.contains_key(&event.request_id)
                {
                    return false;
                }
                self.pending.insert(
                    event.request_id,
                    TrackedClick {
                        request_id: event.request_id,
                        game_id: event.game_id,
                        player: event.player,
                        tile_index: event.tile_index,
                        target_block: event.target_block,
                        committed_at: logged.position,
                    },
                );
                true
            }
            ContractEvent::TileClicked(event) => {
                let mut changed = self.resolve(
                    event.request_id,
                    event.game_id,
                    event.tile_index,
                    Resolution::Lost,
                    logged.position,
                );
                if let Some(board) = self.board_for(event.game_id) {
                    let mask = board.clicked_mask.with_tile(event.tile_index);
                    let pool = if board.active {
                        board.pool.max(event.new_pool)
                    } else {
                        board.pool
                    };
                    changed |= mask != board.clicked_mask || pool != board.pool;
                    board.clicked_mask = mask;
                    board.pool = pool;
                }
                changed
            }
            ContractEvent::GameWon(event) => {
                let mut changed = self.resolve(
                    event.request_id,
                    event.game_id,
                    event.tile_index,
                    Resolution::Won,
                    logged.position,
                );
                if let Some(board) = self.board_for(event.game_id) {
                    changed |= board.active || board.winner.is_none();
                    board.winner.get_or_insert(event.winner);
                    board.active = false;
                    board.pool = event.payout;
                }
                changed
            }
            ContractEvent::ClickRefunded(event) => {
                if !self.applied_refunds.insert(logged.position) {
                    return false;
                }
                let candidate = self
                    .pending
                    .values()
                    .filter(|click| {
                        click.game_id == event.game_id
                            && click.player == event.player
                            && click.tile_index == event.tile_index
                            && click.committed_at < logged.position
                    })
                    .min_by_key(|click| (click.committed_at, click.request_id))
                    .map(|click| click.request_id);
                match candidate {
                    Some(request_id) => self.resolve(
                        request_id,
                        event.game_id,
                        event.tile_index,
                        Resolution::Refunded,
                        logged.position,
                    ),
                    None => {
                        tracing::debug!(
                            game_id = event.game_id,
                            tile = event.tile_index,
                            "refund for a click this client never saw committed"
                        );
                        false
                    }
                }
            }
        }
    }

    /// Folds in `getGameState` for the board's game (or a newer one). Pending
    /// clicks on tiles the chain already shows as clicked are dropped.
    pub fn reconcile_chain_state(&mut self, chain: &OnChainGame) -> Vec<u64> {
        match self.board.as_mut() {
            Some(board) if board.game_id > chain.game_id => return Vec::new(),
            Some(board) if board.game_id == chain.game_id => {
                board.clicked_mask = board.clicked_mask.union(chain.clicked_mask);
                board.pool = chain.pool;
                board.active = chain.active;
                board.winner = chain.winner.or(board.winner);
            }
            _ => {
                self.replace_board(BoardState {
                    game_id: chain.game_id,
                    pool: chain.pool,
                    winner: chain.winner,
                    active: chain.active,
                    clicked_mask: chain.clicked_mask,
                });
            }
        }
        let mask = self
            .board
            .map(|board| board.clicked_mask)
            .unwrap_or(chain.clicked_mask);
        let settled: Vec<u64> = self
            .pending
            .values()
            .filter(|click| click.game_id == chain.game_id && mask.contains(click.tile_index))
            .map(|click| click.request_id)
            .collect();
        for request_id in &settled {
            tracing::debug!(request_id, "tile already clicked on chain; dropping pending");
            self.settle(*request_id);
        }
        self.release_markers();
        settled
    }

    /// Folds in the indexer's pending view: a local click the projection has
    /// passed without listing is settled, a listed click this cache missed is
    /// adopted.
    pub fn reconcile_projected(&mut self, projected: &PendingSetDto) -> Result<ProjectedSync> {
        let Some(checkpoint) = projected.checkpoint()? else {
            return Ok(ProjectedSync::default());
        };
        let mut listed = BTreeMap::new();
        for dto in &projected.pending_clicks {
            listed.insert(dto.request_id()?, dto);
        }

        let dropped: Vec<u64> = self
            .pending
            .values()
            .filter(|click| {
                click.committed_at.block_number <= checkpoint
                    && !listed.contains_key(&click.request_id)
            })
            .map(|click| click.request_id)
            .collect();
        for request_id in &dropped {
            self.settle(*request_id);
        }

        // Settlement records below the floor are pruned, so a view that far
        // behind could bring back requests this cache already saw settled.
        if self.retention_floor().is_some_and(|floor| checkpoint < floor) {
            tracing::debug!(checkpoint, "indexer pending view too stale to adopt from");
            self.release_markers();
            return Ok(ProjectedSync {
                dropped,
                adopted: Vec::new(),
            });
        }

        let mut adopted = Vec::new();
        for (request_id, dto) in listed {
            if self.pending.contains_key(&request_id)
                || self.resolved.contains_key(&request_id)
            {
                continue;
            }
            let click = TrackedClick {
                request_id,
                game_id: dto.game_id()?,
                player: parse_address(&dto.player)?,
                tile_index: dto.tile_index,
                target_block: dto.target_block()?,
                committed_at: dto.commit_position()?,
            };
            let already_clicked = self.board.is_some_and(|board| {
                board.game_id == click.game_id && board.clicked_mask.contains(click.tile_index)
            });
            if already_clicked {
                continue;
            }
            self.pending.insert(request_id, click);
            adopted.push(request_id);
        }
        self.release_markers();
        Ok(ProjectedSync { dropped, adopted })
    }

    /// Reveals and rescues this client owes at `head`.
    pub fn due_actions(&self, head: u64) -> Vec<DueAction> {
        let indexed_through = self.observed_through.unwrap_or(head).min(head);
        plan_actions(
            &self.tracker,
            self.pending
                .values()
                .map(|click| (click.request_id, click.target_block)),
            head,
            indexed_through,
        )
    }

    pub fn mark_submitted(&mut self, request_id: u64, action: RevealAction, head: u64) {
        self.tracker.mark_submitted(request_id, action, head);
    }

    pub fn mark_failed(&mut self, request_id: u64, action: RevealAction, head: u64) {
        self.tracker.mark_failed(request_id, action, head);
    }

    pub fn tile_badges(&self, head: u64) -> [TileBadge; TILE_COUNT as usize] {
        std::array::from_fn(|index| {
            let tile = index as u8;
            let Some(board) = self.board else {
                return TileBadge::Locked;
            };
            let outcome = self.tile_outcomes.get(&(board.game_id, tile)).copied();
            if outcome == Some(Resolution::Won) {
                return TileBadge::Won;
            }
            if board.clicked_mask.contains(tile) {
                return TileBadge::Clicked;
            }
            let earliest_target = self
                .pending
                .values()
                .filter(|click| click.game_id == board.game_id && click.tile_index == tile)
                .map(|click| click.target_block)
                .min();
            if let Some(target_block) = earliest_target {
                return TileBadge::Pending(RevealPhase::classify(head, target_block));
            }
            if !board.active {
                return TileBadge::Locked;
            }
            if outcome == Some(Resolution::Refunded) {
                return TileBadge::Refunded;
            }
            TileBadge::Available
        })
    }

    pub fn click_blocker(&self, tile: u8) -> Option<ClickBlocker> {
        if tile >= TILE_COUNT {
            return Some(ClickBlocker::OffBoard);
        }
        let Some(board) = self.board else {
            return Some(ClickBlocker::NoGame);
        };
        if !board.active {
            return Some(ClickBlocker::GameOver);
        }
        if board.clicked_mask.contains(tile) {
            return Some(ClickBlocker::AlreadyClicked);
        }
        self.pending
            .values()
            .find(|click| click.game_id == board.game_id && click.tile_index == tile)
            .map(|click| ClickBlocker::AwaitingReveal(click.request_id))
    }

    /// Installs a newer game's board; outcomes of older games are forgotten.
    fn replace_board(&mut self, board: BoardState) {
        self.tile_outcomes
            .retain(|(game_id, _), _| *game_id >= board.game_id);
        self.board = Some(board);
    }

    fn board_for(&mut self, game_id: u64) -> Option<&mut BoardState> {
        self.board.as_mut().filter(|board| board.game_id == game_id)
    }

    fn resolve(
        &mut self,
        request_id: u64,
        game_id: u64,
        tile_index: u8,
        resolution: Resolution,
        at: EventPosition,
    ) -> bool {
        let was_pending = self.pending.contains_key(&request_id);
        let newly_resolved = !self.resolved.contains_key(&request_id);
        if was_pending {
            self.settle(request_id);
        } else {
            self.resolved.entry(request_id).or_insert(at.block_number);
        }
        let current = self.board.is_none_or(|board| game_id >= board.game_id);
        if newly_resolved && current {
            self.tile_outcomes.insert((game_id, tile_index), resolution);
        }
        self.release_markers();
        newly_resolved || was_pending
    }

    /// Moves a pending click to the settled set.
    fn settle(&mut self, request_id: u64) {
        if let Some(click) = self.pending.remove(&request_id) {
            self.resolved
                .insert(request_id, click.committed_at.block_number);
        }
    }

    fn release_markers(&mut self) {
        let outstanding: Vec<u64> = self.pending.keys().copied().collect();
        for request_id in self.tracker.retain_outstanding(outstanding) {
            tracing::debug!(request_id, "request settled; marker released");
        }
    }
}
