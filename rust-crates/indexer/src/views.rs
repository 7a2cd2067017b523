//! Read-side aggregations over the projection, in the serialized form served
//! over HTTP: integers as decimal strings, addresses as lowercase `0x` hex.

use crate::{
    events::EventPosition,
    projection::{
        Click,
        Game,
        PendingClick,
        Projection,
    },
};
use alloy::primitives::{
    Address,
    U256,
};
use anyhow::{
    Context,
    anyhow,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    str::FromStr,
};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

pub fn parse_address(raw: &str) -> crate::Result<Address> {
    Address::from_str(raw.trim()).map_err(|e| anyhow!("invalid address '{raw}': {e}"))
}

pub fn parse_decimal(field: &str, raw: &str) -> crate::Result<u64> {
    raw.parse::<u64>()
        .with_context(|| format!("{field} '{raw}' is not a decimal u64"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameDto {
    pub id: String,
    pub pool: String,
    pub winner: Option<String>,
    pub active: bool,
    pub clicked_mask: String,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl From<&Game> for GameDto {
    fn from(game: &Game) -> Self {
        Self {
            id: game.id.to_string(),
            pool: game.pool.to_string(),
            winner: game.winner.as_ref().map(format_address),
            active: game.active,
            clicked_mask: game.clicked_mask.to_string(),
            started_at: game.started_at.to_string(),
            ended_at: game.ended_at.map(|ended_at| ended_at.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClickDto {
    pub id: String,
    pub game_id: String,
    pub request_id: String,
    pub player: String,
    pub tile_index: u8,
    pub target_block: String,
    pub clicked_at: String,
    pub revealed: bool,
    pub is_winner: bool,
    pub refunded: bool,
}

impl From<&Click> for ClickDto {
    fn from(click: &Click) -> Self {
        Self {
            id: click.id.to_string(),
            game_id: click.id.game_id.to_string(),
            request_id: click.id.request_id.to_string(),
            player: format_address(&click.player),
            tile_index: click.tile_index,
            target_block: click.target_block.to_string(),
            clicked_at: click.clicked_at.to_string(),
            revealed: click.revealed,
            is_winner: click.is_winner,
            refunded: click.refund.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingClickDto {
    pub id: String,
    pub game_id: String,
    pub player: String,
    pub tile_index: u8,
    pub target_block: String,
    pub created_at: String,
    /// Block and log index of the `ClickPending` log.
    pub commit_block: String,
    pub commit_log_index: String,
    /// The game already has a winner; the contract will refund this click.
    pub orphaned: bool,
}

impl PendingClickDto {
    fn new(pending: &PendingClick, orphaned: bool) -> Self {
        Self {
            id: pending.request_id.to_string(),
            game_id: pending.game_id.to_string(),
            player: format_address(&pending.player),
            tile_index: pending.tile_index,
            target_block: pending.target_block.to_string(),
            created_at: pending.created_at.to_string(),
            commit_block: pending.position.block_number.to_string(),
            commit_log_index: pending.position.log_index.to_string(),
            orphaned,
        }
    }

    pub fn request_id(&self) -> crate::Result<u64> {
        parse_decimal("request id", &self.id)
    }

    pub fn game_id(&self) -> crate::Result<u64> {
        parse_decimal("game id", &self.game_id)
    }

    pub fn target_block(&self) -> crate::Result<u64> {
        parse_decimal("target block", &self.target_block)
    }

    pub fn commit_position(&self) -> crate::Result<EventPosition> {
        Ok(EventPosition::new(
            parse_decimal("commit block", &self.commit_block)?,
            parse_decimal("commit log index", &self.commit_log_index)?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameDetailDto {
    pub game: GameDto,
    pub clicks: Vec<ClickDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserStatsDto {
    pub address: String,
    pub total_clicks: u64,
    pub wins: u64,
    pub total_spent: String,
    pub total_winnings: String,
    pub net_profit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntryDto {
    pub player: String,
    pub wins: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentGameDto {
    pub game: GameDto,
    pub clicks: Vec<ClickDto>,
    pub pending_clicks: Vec<PendingClickDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingSetDto {
    pub checkpoint: Option<String>,
    pub pending_clicks: Vec<PendingClickDto>,
}

impl PendingSetDto {
    pub fn checkpoint(&self) -> crate::Result<Option<u64>> {
        self.checkpoint
            .as_deref()
            .map(|raw| parse_decimal("checkpoint", raw))
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusDto {
    pub checkpoint: Option<String>,
    pub current_game_id: Option<String>,
    pub games: u64,
    pub clicks: u64,
    pub pending_clicks: u64,
    pub deferred_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDto {
    pub error: String,
}

fn pending_dto(projection: &Projection, pending: &PendingClick) -> PendingClickDto {
    PendingClickDto::new(pending, projection.is_orphaned(pending))
}

fn clicks_in_commit_order(projection: &Projection, game_id: u64) -> Vec<ClickDto> {
    let mut clicks: Vec<&Click> = projection.clicks_for_game(game_id).collect();
    clicks.sort_by_key(|click| (click.position, click.id.request_id));
    clicks.into_iter().map(ClickDto::from).collect()
}

/// Ended games, newest first.
pub fn history(projection: &Projection, limit: Option<usize>) -> Vec<GameDto> {
    let limit = limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    projection
        .games()
        .rev()
        .filter(|game| !game.active)
        .take(limit)
        .map(GameDto::from)
        .collect()
}

pub fn game_detail(projection: &Projection, game_id: u64) -> Option<GameDetailDto> {
    let game = projection.game(game_id)?;
    Some(GameDetailDto {
        game: GameDto::from(game),
        clicks: clicks_in_commit_order(projection, game_id),
    })
}

pub fn user_stats(projection: &Projection, player: Address, fee: U256) -> UserStatsDto {
    let mut total_clicks = 0u64;
    let mut wins = 0u64;
    let mut paid_clicks = 0u64;
    let mut total_winnings = U256::ZERO;
    for click in projection.clicks().filter(|click| click.player == player) {
        total_clicks += 1;
        if click.refund.is_none() {
            paid_clicks += 1;
        }
        if click.is_winner {
            wins += 1;
            if let Some(game) = projection.game(click.id.game_id) {
                total_winnings = total_winnings.saturating_add(game.pool);
            }
        }
    }
    let total_spent = fee.saturating_mul(U256::from(paid_clicks));
    let net_profit = if total_winnings >= total_spent {
        (total_winnings - total_spent).to_string()
    } else {
        format!("-{}", total_spent - total_winnings)
    };
    UserStatsDto {
        address: format_address(&player),
        total_clicks,
        wins,
        total_spent: total_spent.to_string(),
        total_winnings: total_winnings.to_string(),
        net_profit,
    }
}

/// Players by number of winning clicks, descending; ties by address.
pub fn leaderboard(projection: &Projection, limit: Option<usize>) -> Vec<LeaderboardEntryDto> {
    let limit = limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let mut wins_by_player: BTreeMap<Address, u64> = BTreeMap::new();
    for click in projection.clicks().filter(|click| click.is_winner) {
        *wins_by_player.entry(click.player).or_default() += 1;
    }
    let mut entries: Vec<(Address, u64)> = wins_by_player.into_iter().collect();
    entries.sort_by(|(a_player, a_wins), (b_player, b_wins)| {
        b_wins.cmp(a_wins).then(a_player.cmp(b_player))
    });
    entries
        .into_iter()
        .take(limit)
        .map(|(player, wins)| LeaderboardEntryDto {
            player: format_address(&player),
            wins,
        })
        .collect()
}

pub fn current_game(projection: &Projection) -> Option<CurrentGameDto> {
    let game = projection.games().rev().find(|game| game.active)?;
    let mut pending: Vec<&PendingClick> = projection.pending_for_game(game.id).collect();
    pending.sort_by_key(|pending| pending.position);
    Some(CurrentGameDto {
        game: GameDto::from(game),
        clicks: clicks_in_commit_order(projection, game.id),
        pending_clicks: pending
            .into_iter()
            .map(|pending| pending_dto(projection, pending))
            .collect(),
    })
}

/// Every outstanding request across all games, in commit order.
pub fn pending_set(projection: &Projection) -> PendingSetDto {
    let mut pending: Vec<&PendingClick> = projection.pending().collect();
    pending.sort_by_key(|pending| pending.position);
    PendingSetDto {
        checkpoint: projection.checkpoint().map(|block| block.to_string()),
        pending_clicks: pending
            .into_iter()
            .map(|pending| pending_dto(projection, pending))
            .collect(),
    }
}

pub fn status(projection: &Projection) -> StatusDto {
    StatusDto {
        checkpoint: projection.checkpoint().map(|block| block.to_string()),
        current_game_id: projection
            .games()
            .rev()
            .find(|game| game.active)
            .map(|game| game.id.to_string()),
        games: projection.games().count() as u64,
        clicks: projection.clicks().count() as u64,
        pending_clicks: projection.pending().count() as u64,
        deferred_events: projection.deferred().len() as u64,
    }
}
