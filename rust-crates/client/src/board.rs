use crate::cache::{
    ClientStateCache,
    TileBadge,
};
use alloy::primitives::utils::format_ether;
use keeper::phase::RevealPhase;
use std::fmt::Write;
use sweeper_abi::TILE_COUNT;

const COLUMNS: usize = 3;

fn badge_cell(badge: TileBadge) -> &'static str {
    match badge {
        TileBadge::Available => "[   ]",
        TileBadge::Clicked => "[ x ]",
        TileBadge::Pending(RevealPhase::Committed) => "[ . ]",
        TileBadge::Pending(RevealPhase::Revealable) => "[ ? ]",
        TileBadge::Pending(RevealPhase::Expired) => "[ ! ]",
        TileBadge::Won => "[ $ ]",
        TileBadge::Refunded => "[ r ]",
        TileBadge::Locked => "[ - ]",
    }
}

/// Plain-text board with one line per outstanding request.
pub fn render_board(cache: &ClientStateCache, head: u64, history_available: bool) -> String {
    let mut out = String::new();
    match cache.board() {
        Some(board) => {
            let status = match (board.active, board.winner) {
                (true, _) => "active".to_string(),
                (false, Some(winner)) => format!("won by {winner}"),
                (false, None) => "ended".to_string(),
            };
            let _ = writeln!(
                out,
                "game #{}  pool {} ETH  {}  (block {})",
                board.game_id,
                format_ether(board.pool),
                status,
                head
            );
        }
        None => {
            let _ = writeln!(out, "no game yet  (block {head})");
        }
    }

    let badges = cache.tile_badges(head);
    for row in badges.chunks(COLUMNS) {
        let cells: Vec<&str> = row.iter().map(|badge| badge_cell(*badge)).collect();
        let _ = writeln!(out, "  {}", cells.join(" "));
    }
    let _ = writeln!(
        out,
        "  tiles 0..{}  . committed  ? awaiting reveal  ! expired  x clicked  $ won  r refunded",
        TILE_COUNT - 1
    );

    for click in cache.pending() {
        let phase = RevealPhase::classify(head, click.target_block);
        let remaining = RevealPhase::blocks_remaining(head, click.target_block)
            .map(|blocks| format!(", {blocks} blocks left"))
            .unwrap_or_default();
        let transaction = match cache.in_flight(click.request_id) {
            Some(marker) if marker.failed() => format!(", {} failed, retrying", marker.action),
            Some(marker) => format!(", {} transaction pending", marker.action),
            None => String::new(),
        };
        let _ = writeln!(
            out,
            "  request {} tile {} game {}: {phase}{remaining}{transaction}",
            click.request_id, click.tile_index, click.game_id
        );
    }

    if !history_available {
        let _ = writeln!(out, "  history unavailable: indexer unreachable");
    }
    out
}
