use crate::views::{
    CurrentGameDto,
    GameDetailDto,
    GameDto,
    LeaderboardEntryDto,
    PendingSetDto,
    StatusDto,
    UserStatsDto,
};
use alloy::primitives::Address;
use tokio::sync::oneshot;

pub trait QueryAPI {
    fn query(&mut self) -> impl Future<Output = crate::Result<Query>>;
}

#[derive(Debug)]
pub enum Query {
    History {
        limit: Option<usize>,
        sender: oneshot::Sender<Vec<GameDto>>,
    },
    GameDetail {
        game_id: u64,
        sender: oneshot::Sender<Option<GameDetailDto>>,
    },
    UserStats {
        player: Address,
        sender: oneshot::Sender<UserStatsDto>,
    },
    Leaderboard {
        limit: Option<usize>,
        sender: oneshot::Sender<Vec<LeaderboardEntryDto>>,
    },
    CurrentGame(oneshot::Sender<Option<CurrentGameDto>>),
    PendingSet(oneshot::Sender<PendingSetDto>),
    Status(oneshot::Sender<StatusDto>),
}
