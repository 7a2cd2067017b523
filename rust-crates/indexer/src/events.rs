use alloy::primitives::{
    Address,
    U256,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// Where a log sits in the chain: events are applied in this order.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Copy, Clone, Default, Serialize, Deserialize,
)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub position: EventPosition,
    pub block_timestamp: u64,
    pub event: ContractEvent,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub enum ContractEvent {
    GameStarted(GameStartedEvent),
    ClickPending(ClickPendingEvent),
    TileClicked(TileClickedEvent),
    GameWon(GameWonEvent),
    ClickRefunded(ClickRefundedEvent),
}

impl ContractEvent {
    pub fn game_id(&self) -> u64 {
        match self {
            ContractEvent::GameStarted(inner) => inner.game_id,
            ContractEvent::ClickPending(inner) => inner.game_id,
            ContractEvent::TileClicked(inner) => inner.game_id,
            ContractEvent::GameWon(inner) => inner.game_id,
            ContractEvent::ClickRefunded(inner) => inner.game_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::GameStarted(_) => "GameStarted",
            ContractEvent::ClickPending(_) => "ClickPending",
            ContractEvent::TileClicked(_) => "TileClicked",
            ContractEvent::GameWon(_) => "GameWon",
            ContractEvent::ClickRefunded(_) => "ClickRefunded",
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct GameStartedEvent {
    pub game_id: u64,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct ClickPendingEvent {
    pub game_id: u64,
    pub request_id: u64,
    pub player: Address,
    pub tile_index: u8,
    pub target_block: u64,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct TileClickedEvent {
    pub game_id: u64,
    pub request_id: u64,
    pub player: Address,
    pub tile_index: u8,
    pub new_pool: U256,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct GameWonEvent {
    pub game_id: u64,
    pub request_id: u64,
    pub winner: Address,
    pub tile_index: u8,
    pub payout: U256,
}

// Carries no request id; see `Projection::settle_refunds`.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct ClickRefundedEvent {
    pub game_id: u64,
    pub tile_index: u8,
    pub player: Address,
}

impl LoggedEvent {
    pub fn new(position: EventPosition, block_timestamp: u64, event: ContractEvent) -> Self {
        Self {
            position,
            block_timestamp,
            event,
        }
    }

    pub fn game_started(position: EventPosition, timestamp: u64, game_id: u64) -> Self {
        let inner = GameStartedEvent { game_id };
        Self::new(position, timestamp, ContractEvent::GameStarted(inner))
    }

    pub fn click_pending(
        position: EventPosition,
        timestamp: u64,
        game_id: u64,
        request_id: u64,
        player: Address,
        tile_index: u8,
        target_block: u64,
    ) -> Self {
        let inner = ClickPendingEvent {
            game_id,
            request_id,
            player,
            tile_index,
            target_block,
        };
        Self::new(position, timestamp, ContractEvent::ClickPending(inner))
    }

    pub fn tile_clicked(
        position: EventPosition,
        timestamp: u64,
        game_id: u64,
        request_id: u64,
        player: Address,
        tile_index: u8,
        new_pool: U256,
    ) -> Self {
        let inner = TileClickedEvent {
            game_id,
            request_id,
            player,
            tile_index,
            new_pool,
        };
        Self::new(position, timestamp, ContractEvent::TileClicked(inner))
    }

    pub fn game_won(
        position: EventPosition,
        timestamp: u64,
        game_id: u64,
        request_id: u64,
        winner: Address,
        tile_index: u8,
        payout: U256,
    ) -> Self {
        let inner = GameWonEvent {
            game_id,
            request_id,
            winner,
            tile_index,
            payout,
        };
        Self::new(position, timestamp, ContractEvent::GameWon(inner))
    }

    pub fn click_refunded(
        position: EventPosition,
        timestamp: u64,
        game_id: u64,
        tile_index: u8,
        player: Address,
    ) -> Self {
        let inner = ClickRefundedEvent {
            game_id,
            tile_index,
            player,
        };
        Self::new(position, timestamp, ContractEvent::ClickRefunded(inner))
    }
}

/// Decoded events covering every block up to and including `through_block`.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<LoggedEvent>,
    pub through_block: u64,
}
