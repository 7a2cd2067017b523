use crate::events::{
    ClickPendingEvent,
    ClickRefundedEvent,
    ContractEvent,
    EventBatch,
    EventPosition,
    GameStartedEvent,
    GameWonEvent,
    LoggedEvent,
    TileClickedEvent,
};
use alloy::primitives::{
    Address,
    U256,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    fmt,
    str::FromStr,
};
use sweeper_abi::ClickedMask;


/// Applied positions are remembered for this many blocks behind the checkpoint;
/// anything older is treated as already applied.
pub const DEDUP_WINDOW_BLOCKS: u64 = 64;

/// Out-of-order events wait this many blocks for their parent entity.
pub const DEFER_WINDOW_BLOCKS: u64 = 64;

#[derive(
    PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Copy, Clone, Serialize, Deserialize,
)]
pub struct ClickId {
    pub game_id: u64,
    pub request_id: u64,
}

impl ClickId {
    pub fn new(game_id: u64, request_id: u64) -> Self {
        Self {
            game_id,
            request_id,
        }
    }
}

impl fmt::Display for ClickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.game_id, self.request_id)
    }
}

impl FromStr for ClickId {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (game, request) = raw
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("click id '{raw}' is not <game>-<request>"))?;
        Ok(Self::new(game.parse()?, request.parse()?))
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: u64,
    pub pool: U256,
    pub active: bool,
    pub clicked_mask: ClickedMask,
    pub winner: Option<Address>,
    pub started_at: u64,
    pub ended_at: Option<u64>,
}

impl Game {
    fn started(id: u64, started_at: u64) -> Self {
        Self {
            id,
            pool: U256::ZERO,
            active: true,
            clicked_mask: ClickedMask::default(),
            winner: None,
            started_at,
            ended_at: None,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone, Serialize, Deserialize)]
pub enum ClickOutcome {
    Pending,
    Lost,
    Won,
    Refunded,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Click {
    pub id: ClickId,
    pub player: Address,
    pub tile_index: u8,
    pub target_block: u64,
    pub clicked_at: u64,
    pub position: EventPosition,
    pub revealed: bool,
    pub is_winner: bool,
    pub refund: Option<RefundMark>,
}

impl Click {
    pub fn outcome(&self) -> ClickOutcome {
        match (self.revealed, self.is_winner, self.refund.is_some()) {
            (false, _, _) => ClickOutcome::Pending,
            (true, true, _) => ClickOutcome::Won,
            (true, false, true) => ClickOutcome::Refunded,
            (true, false, false) => ClickOutcome::Lost,
        }
    }

    fn pending_entry(&self) -> PendingClick {
        PendingClick {
            request_id: self.id.request_id,
            game_id: self.id.game_id,
            player: self.player,
            tile_index: self.tile_index,
            target_block: self.target_block,
            created_at: self.clicked_at,
            position: self.position,
        }
    }
}

/// The `ClickRefunded` log a click is currently credited with.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct RefundMark {
    pub position: EventPosition,
    pub block_timestamp: u64,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct PendingClick {
    pub request_id: u64,
    pub game_id: u64,
    pub player: Address,
    pub tile_index: u8,
    pub target_block: u64,
    pub created_at: u64,
    pub position: EventPosition,
}

impl PendingClick {
    pub fn click_id(&self) -> ClickId {
        ClickId::new(self.game_id, self.request_id)
    }
}

/// One upsert or delete against the persisted projection layout.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum EntityChange {
    UpsertGame(Game),
    UpsertClick(Click),
    UpsertPending(PendingClick),
    DeletePending(u64),
}

#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectionMeta {
    /// Last block whose events have all been applied.
    pub checkpoint: Option<u64>,
    pub recent_positions: BTreeSet<EventPosition>,
    pub deferred: Vec<LoggedEvent>,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
    Deferred,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
enum Deferral {
    UnknownGame(u64),
    UnknownClick(ClickId),
    NoRefundCandidate,
}

impl fmt::Display for Deferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferral::UnknownGame(id) => write!(f, "unknown game {id}"),
            Deferral::UnknownClick(id) => write!(f, "unknown click {id}"),
            Deferral::NoRefundCandidate => write!(f, "no outstanding click to refund"),
        }
    }
}

/// Canonical game, click and pending-click state folded from the event log.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct Projection {
    games: BTreeMap<u64, Game>,
    clicks: BTreeMap<ClickId, Click>,
    pending: BTreeMap<u64, PendingClick>,
    meta: ProjectionMeta,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        games: impl IntoIterator<Item = Game>,
        clicks: impl IntoIterator<Item = Click>,
        pending: impl IntoIterator<Item = PendingClick>,
        meta: ProjectionMeta,
    ) -> Self {
        Self {
            games: games.into_iter().map(|game| (game.id, game)).collect(),
            clicks: clicks.into_iter().map(|click| (click.id, click)).collect(),
            pending: pending
                .into_iter()
                .map(|pending| (pending.request_id, pending))
                .collect(),
            meta,
        }
    }

    pub fn checkpoint(&self) -> Option<u64> {
        self.meta.checkpoint
    }

    pub fn meta(&self) -> &ProjectionMeta {
        &self.meta
    }

    pub fn game(&self, game_id: u64) -> Option<&Game> {
        self.games.get(&game_id)
    }

    /// Games in ascending id order.
    pub fn games(&self) -> impl DoubleEndedIterator<Item = &Game> {
        self.games.values()
    }

    pub fn click(&self, id: ClickId) -> Option<&Click> {
        self.clicks.get(&id)
    }

    pub fn clicks(&self) -> impl Iterator<Item = &Click> {
        self.clicks.values()
    }

    pub fn clicks_for_game(&self, game_id: u64) -> impl Iterator<Item = &Click> {
        self.clicks
            .range(ClickId::new(game_id, 0)..=ClickId::new(game_id, u64::MAX))
            .map(|(_, click)| click)
    }

    pub fn pending_click(&self, request_id: u64) -> Option<&PendingClick> {
        self.pending.get(&request_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingClick> {
        self.pending.values()
    }

    pub fn pending_for_game(&self, game_id: u64) -> impl Iterator<Item = &PendingClick> {
        self.pending
            .values()
            .filter(move |pending| pending.game_id == game_id)
    }

    /// A pending click whose game has already been won: no reveal can make it win.
    pub fn is_orphaned(&self, pending: &PendingClick) -> bool {
        self.games
            .get(&pending.game_id)
            .map(|game| !game.active)
            .unwrap_or(false)
    }

    pub fn deferred(&self) -> &[LoggedEvent] {
        &self.meta.deferred
    }

    /// Apply a batch in position order and advance the checkpoint to the end of it.
    pub fn apply_batch(&mut self, batch: &EventBatch) -> Vec<EntityChange> {
        let mut events = batch.events.clone();
        events.sort_by_key(|event| event.position);
        let mut changes = Vec::new();
        for event in &events {
            self.apply_event(event, &mut changes);
        }
        self.advance_checkpoint(batch.through_block);
        changes
    }

    /// Apply a single event; convenience for callers without a batch boundary.
    pub fn apply(&mut self, event: &LoggedEvent) -> Vec<EntityChange> {
        let mut changes = Vec::new();
        self.apply_event(event, &mut changes);
        changes
    }

    pub fn apply_event(
        &mut self,
        event: &LoggedEvent,
        changes: &mut Vec<EntityChange>,
    ) -> ApplyOutcome {
        if self.is_duplicate(&event.position) {
            tracing::trace!(position = %event.position, "skipping duplicate {}", event.event.name());
            return ApplyOutcome::Duplicate;
        }
        match self.try_apply(event, changes) {
            Ok(()) => {
                self.meta.recent_positions.insert(event.position);
                self.retry_deferred(changes);
                ApplyOutcome::Applied
            }
            Err(reason) => {
                tracing::warn!(
                    position = %event.position,
                    "deferring {} event: {}",
                    event.event.name(),
                    reason
                );
                self.meta.deferred.push(event.clone());
                self.meta.deferred.sort_by_key(|deferred| deferred.position);
                ApplyOutcome::Deferred
            }
        }
    }

    fn dedup_floor(&self) -> Option<u64> {
        self.meta
            .checkpoint
            .and_then(|checkpoint| checkpoint.checked_sub(DEDUP_WINDOW_BLOCKS))
    }

    fn is_duplicate(&self, position: &EventPosition) -> bool {
        if let Some(floor) = self.dedup_floor()
            && position.block_number <= floor
        {
            return true;
        }
        self.meta.recent_positions.contains(position)
            || self
                .meta
                .deferred
                .iter()
                .any(|deferred| deferred.position == *position)
    }

    fn advance_checkpoint(&mut self, through_block: u64) {
        let checkpoint = self
            .meta
            .checkpoint
            .map_or(through_block, |current| current.max(through_block));
        self.meta.checkpoint = Some(checkpoint);

        if let Some(floor) = self.dedup_floor() {
            self.meta
                .recent_positions
                .retain(|position| position.block_number > floor);
        }

        if let Some(expiry) = checkpoint.checked_sub(DEFER_WINDOW_BLOCKS) {
            self.meta.deferred.retain(|deferred| {
                let keep = deferred.position.block_number > expiry;
                if !keep {
                    tracing::warn!(
                        position = %deferred.position,
                        game_id = deferred.event.game_id(),
                        "dropping {} event that never found its parent entity",
                        deferred.event.name()
                    );
                }
                keep
            });
        }
    }

    fn retry_deferred(&mut self, changes: &mut Vec<EntityChange>) {
        loop {
            let mut progressed = false;
            let waiting = std::mem::take(&mut self.meta.deferred);
            let mut still_waiting = Vec::new();
            for event in waiting {
                match self.try_apply(&event, changes) {
                    Ok(()) => {
                        tracing::debug!(position = %event.position, "applied deferred {}", event.event.name());
                        self.meta.recent_positions.insert(event.position);
                        progressed = true;
                    }
                    Err(_) => still_waiting.push(event),
                }
            }
            // settling a refund can park another one while this pass runs
            self.meta.deferred.extend(still_waiting);
            self.meta.deferred.sort_by_key(|deferred| deferred.position);
            if !progressed {
                return;
            }
        }
    }

    fn try_apply(
        &mut self,
        event: &LoggedEvent,
        changes: &mut Vec<EntityChange>,
    ) -> Result<(), Deferral> {
        match &event.event {
            ContractEvent::GameStarted(inner) => {
                self.on_game_started(inner, event.block_timestamp, changes);
                Ok(())
            }
            ContractEvent::ClickPending(inner) => self.on_click_pending(
                inner,
                event.position,
                event.block_timestamp,
                changes,
            ),
            ContractEvent::TileClicked(inner) => self.on_tile_clicked(inner, changes),
            ContractEvent::GameWon(inner) => {
                self.on_game_won(inner, event.block_timestamp, changes)
            }
            ContractEvent::ClickRefunded(inner) => {
                self.on_click_refunded(inner, event.position, event.block_timestamp, changes)
            }
        }
    }

    fn on_game_started(
        &mut self,
        event: &GameStartedEvent,
        timestamp: u64,
        changes: &mut Vec<EntityChange>,
    ) {
        if self.games.contains_key(&event.game_id) {
            return;
        }
        tracing::info!(game_id = event.game_id, "game started");
        let game = Game::started(event.game_id, timestamp);
        self.games.insert(game.id, game.clone());
        changes.push(EntityChange::UpsertGame(game));
    }

    fn on_click_pending(
        &mut self,
        event: &ClickPendingEvent,
        position: EventPosition,
        timestamp: u64,
        changes: &mut Vec<EntityChange>,
    ) -> Result<(), Deferral> {
        if !self.games.contains_key(&event.game_id) {
            return Err(Deferral::UnknownGame(event.game_id));
        }
        let id = ClickId::new(event.game_id, event.request_id);
        if self.clicks.contains_key(&id) {
            return Ok(());
        }
        let click = Click {
            id,
            player: event.player,
            tile_index: event.tile_index,
            target_block: event.target_block,
            clicked_at: timestamp,
            position,
            revealed: false,
            is_winner: false,
            refund: None,
        };
        let pending = click.pending_entry();
        tracing::debug!(
            request_id = event.request_id,
            target_block = event.target_block,
            "click pending on tile {}",
            event.tile_index
        );
        self.clicks.insert(id, click.clone());
        self.pending.insert(pending.request_id, pending.clone());
        changes.push(EntityChange::UpsertClick(click));
        changes.push(EntityChange::UpsertPending(pending));
        // an earlier click may take over a refund credited to a later one
        self.reissue_refund(event.game_id, event.player, event.tile_index, None, changes);
        Ok(())
    }

    fn on_tile_clicked(
        &mut self,
        event: &TileClickedEvent,
        changes: &mut Vec<EntityChange>,
    ) -> Result<(), Deferral> {
        let id = ClickId::new(event.game_id, event.request_id);
        if !self.games.contains_key(&event.game_id) {
            return Err(Deferral::UnknownGame(event.game_id));
        }
        if !self.clicks.contains_key(&id) {
            return Err(Deferral::UnknownClick(id));
        }

        if let Some(game) = self.games.get_mut(&event.game_id) {
            let mut updated = game.clone();
            updated.clicked_mask = updated.clicked_mask.with_tile(event.tile_index);
            if updated.active && event.new_pool > updated.pool {
                updated.pool = event.new_pool;
            }
            if updated != *game {
                *game = updated.clone();
                changes.push(EntityChange::UpsertGame(updated));
            }
        }

        let mut freed = None;
        if let Some(click) = self.clicks.get_mut(&id) {
            match click.outcome() {
                ClickOutcome::Pending => {
                    click.revealed = true;
                    changes.push(EntityChange::UpsertClick(click.clone()));
                }
                ClickOutcome::Lost => {}
                ClickOutcome::Refunded => {
                    tracing::warn!(
                        request_id = event.request_id,
                        "revealed click was credited with a refund; moving the refund"
                    );
                    freed = click.refund.take();
                    changes.push(EntityChange::UpsertClick(click.clone()));
                }
                ClickOutcome::Won => {
                    tracing::warn!(
                        request_id = event.request_id,
                        "ignoring TileClicked for click already resolved as Won"
                    );
                }
            }
        }

        self.remove_pending(event.request_id, changes);
        if freed.is_some() {
            self.reissue_refund(event.game_id, event.player, event.tile_index, freed, changes);
        }
        Ok(())
    }

    fn on_game_won(
        &mut self,
        event: &GameWonEvent,
        timestamp: u64,
        changes: &mut Vec<EntityChange>,
    ) -> Result<(), Deferral> {
        let id = ClickId::new(event.game_id, event.request_id);
        if !self.games.contains_key(&event.game_id) {
            return Err(Deferral::UnknownGame(event.game_id));
        }
        if !self.clicks.contains_key(&id) {
            return Err(Deferral::UnknownClick(id));
        }

        if let Some(game) = self.games.get_mut(&event.game_id) {
            match game.winner {
                Some(existing) if existing != event.winner => {
                    tracing::warn!(
                        game_id = event.game_id,
                        "ignoring second winner {} (already won by {})",
                        event.winner,
                        existing
                    );
                }
                _ => {
                    let mut updated = game.clone();
                    updated.winner = Some(event.winner);
                    updated.pool = event.payout;
                    updated.active = false;
                    updated.ended_at = updated.ended_at.or(Some(timestamp));
                    if updated != *game {
                        tracing::info!(
                            game_id = event.game_id,
                            payout = %event.payout,
                            "game won by {}",
                            event.winner
                        );
                        *game = updated.clone();
                        changes.push(EntityChange::UpsertGame(updated));
                    }
                }
            }
        }

        let mut freed = None;
        if let Some(click) = self.clicks.get_mut(&id) {
            match click.outcome() {
                ClickOutcome::Pending => {
                    click.revealed = true;
                    click.is_winner = true;
                    changes.push(EntityChange::UpsertClick(click.clone()));
                }
                ClickOutcome::Won => {}
                ClickOutcome::Refunded => {
                    tracing::warn!(
                        request_id = event.request_id,
                        "winning click was credited with a refund; moving the refund"
                    );
                    freed = click.refund.take();
                    click.is_winner = true;
                    changes.push(EntityChange::UpsertClick(click.clone()));
                }
                ClickOutcome::Lost => {
                    tracing::warn!(
                        request_id = event.request_id,
                        "ignoring GameWon for click already resolved as Lost"
                    );
                }
            }
        }

        self.remove_pending(event.request_id, changes);
        if freed.is_some() {
            self.reissue_refund(event.game_id, event.winner, event.tile_index, freed, changes);
        }

        let orphaned = self.pending_for_game(event.game_id).count();
        if orphaned > 0 {
            tracing::info!(
                game_id = event.game_id,
                "{orphaned} pending clicks orphaned by game end"
            );
        }
        Ok(())
    }

    fn on_click_refunded(
        &mut self,
        event: &ClickRefundedEvent,
        position: EventPosition,
        timestamp: u64,
        changes: &mut Vec<EntityChange>,
    ) -> Result<(), Deferral> {
        let mark = RefundMark {
            position,
            block_timestamp: timestamp,
        };
        let unmatched =
            self.settle_refunds(event.game_id, event.player, event.tile_index, Some(mark), changes);
        let mut settled = true;
        for leftover in unmatched {
            if leftover == mark {
                settled = false;
            } else {
                self.defer_refund(event.game_id, event.player, event.tile_index, leftover);
            }
        }
        if !settled {
            return Err(Deferral::NoRefundCandidate);
        }
        tracing::info!(
            game_id = event.game_id,
            position = %position,
            "click on tile {} refunded to {}",
            event.tile_index,
            event.player
        );
        Ok(())
    }

    fn reissue_refund(
        &mut self,
        game_id: u64,
        player: Address,
        tile_index: u8,
        freed: Option<RefundMark>,
        changes: &mut Vec<EntityChange>,
    ) {
        for leftover in self.settle_refunds(game_id, player, tile_index, freed, changes) {
            self.defer_refund(game_id, player, tile_index, leftover);
        }
    }

    /// Re-pairs every refund on one (game, player, tile) with the clicks it can
    /// belong to. Refunds are taken in log order, each by the earliest click
    /// committed before it that no reveal or win has resolved. Returns the
    /// refunds left without a click.
    fn settle_refunds(
        &mut self,
        game_id: u64,
        player: Address,
        tile_index: u8,
        incoming: Option<RefundMark>,
        changes: &mut Vec<EntityChange>,
    ) -> Vec<RefundMark> {
        let mut marks: Vec<RefundMark> = incoming.into_iter().collect();
        let mut candidates = Vec::new();
        for click in self
            .clicks_for_game(game_id)
            .filter(|click| click.player == player && click.tile_index == tile_index)
        {
            match click.refund {
                Some(mark) => {
                    marks.push(mark);
                    candidates.push((click.position, click.id));
                }
                None if !click.revealed => candidates.push((click.position, click.id)),
                None => {}
            }
        }
        if marks.is_empty() {
            return Vec::new();
        }
        candidates.sort();
        marks.sort_by_key(|mark| mark.position);

        let mut assigned: BTreeMap<ClickId, RefundMark> = BTreeMap::new();
        let mut unmatched = Vec::new();
        for mark in marks {
            let taker = candidates
                .iter()
                .find(|(committed, id)| *committed < mark.position && !assigned.contains_key(id))
                .map(|(_, id)| *id);
            match taker {
                Some(id) => {
                    assigned.insert(id, mark);
                }
                None => unmatched.push(mark),
            }
        }

        for (_, id) in candidates {
            self.set_refund(id, assigned.get(&id).copied(), changes);
        }
        unmatched
    }

    fn set_refund(
        &mut self,
        id: ClickId,
        refund: Option<RefundMark>,
        changes: &mut Vec<EntityChange>,
    ) {
        let Some(click) = self.clicks.get_mut(&id) else {
            return;
        };
        if click.refund == refund {
            return;
        }
        click.refund = refund;
        click.revealed = refund.is_some();
        let click = click.clone();
        changes.push(EntityChange::UpsertClick(click.clone()));
        if refund.is_some() {
            self.remove_pending(id.request_id, changes);
        } else {
            let pending = click.pending_entry();
            self.pending.insert(pending.request_id, pending.clone());
            changes.push(EntityChange::UpsertPending(pending));
        }
    }

    fn defer_refund(&mut self, game_id: u64, player: Address, tile_index: u8, mark: RefundMark) {
        tracing::debug!(
            position = %mark.position,
            "refund on tile {tile_index} waits for a click to settle"
        );
        let refund = ContractEvent::ClickRefunded(ClickRefundedEvent {
            game_id,
            tile_index,
            player,
        });
        self.meta
            .deferred
            .push(LoggedEvent::new(mark.position, mark.block_timestamp, refund));
        self.meta.deferred.sort_by_key(|deferred| deferred.position);
    }

    fn remove_pending(&mut self, request_id: u64, changes: &mut Vec<EntityChange>) {
        if self.pending.remove(&request_id).is_some() {
            changes.push(EntityChange::DeletePending(request_id));
        }
    }
}
