use crate::Result;
use keeper::chain::{
    AlloyChain,
    OnChainGame,
};

/// Authoritative reads of the live game.
pub trait BoardReader {
    fn current_game_id(&self) -> impl Future<Output = Result<u64>>;

    fn game_state(&self, game_id: u64) -> impl Future<Output = Result<OnChainGame>>;
}

impl BoardReader for AlloyChain {
    async fn current_game_id(&self) -> Result<u64> {
        AlloyChain::current_game_id(self).await
    }

    async fn game_state(&self, game_id: u64) -> Result<OnChainGame> {
        AlloyChain::game_state(self, game_id).await
    }
}

/// `getGameState(gameId())`.
pub async fn read_current_game(reader: &impl BoardReader) -> Result<OnChainGame> {
    let game_id = reader.current_game_id().await?;
    reader.game_state(game_id).await
}
