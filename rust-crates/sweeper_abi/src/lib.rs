use alloy::{
    network::Network,
    primitives::{
        Address,
        U256,
    },
    providers::Provider,
    sol,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

pub mod sweeper_types {
    use super::*;

    sol! {
        #[sol(rpc)]
        interface Basesweeper {
            event GameStarted(uint256 indexed gameId);
            event ClickPending(
                uint256 indexed gameId,
                uint256 requestId,
                address indexed player,
                uint256 tileIndex,
                uint256 targetBlock
            );
            event TileClicked(
                uint256 indexed gameId,
                uint256 requestId,
                address indexed player,
                uint256 tileIndex,
                uint256 newPool
            );
            event GameWon(
                uint256 indexed gameId,
                uint256 requestId,
                address indexed winner,
                uint256 tileIndex,
                uint256 payout
            );
            event ClickRefunded(
                uint256 indexed gameId,
                uint256 tileIndex,
                address indexed player
            );

            function click(uint256 tileIndex) external payable;
            function revealOutcome(uint256 requestId) external;
            function rescueExpiredClick(uint256 requestId) external;

            function gameId() external view returns (uint256);
            function getGameState(uint256 _gameId)
                external
                view
                returns (uint256 pool, address winner, bool active, uint256 clickedMask);
            function FEE() external view returns (uint256);
            function BLOCK_DELAY() external view returns (uint256);
        }
    }
}

pub use sweeper_types::Basesweeper;

/// Number of tiles on the board.
pub const TILE_COUNT: u8 = 9;

/// Blocks after the target block during which `blockhash(targetBlock)` is still
/// readable by the contract.
pub const REVEAL_WINDOW_BLOCKS: u64 = 256;

/// 0.0008 ETH, the fee the contract was deployed with.
pub const DEFAULT_CLICK_FEE_WEI: u128 = 800_000_000_000_000;

pub fn contract_instance<P, N>(
    address: Address,
    provider: P,
) -> Basesweeper::BasesweeperInstance<P, N>
where
    P: Provider<N>,
    N: Network,
{
    Basesweeper::new(address, provider)
}

/// Bit set over the board, one bit per tile revealed as non-winning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClickedMask(u16);

impl ClickedMask {
    const BOARD_BITS: u16 = (1 << TILE_COUNT) - 1;

    pub fn new(bits: u16) -> Self {
        Self(bits & Self::BOARD_BITS)
    }

    /// Reads the low board bits of the on-chain `clickedMask` word.
    pub fn from_word(word: U256) -> Self {
        let low = word & U256::from(Self::BOARD_BITS);
        Self::new(u16::try_from(low).unwrap_or_default())
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, tile_index: u8) -> bool {
        tile_index < TILE_COUNT && self.0 & (1 << tile_index) != 0
    }

    pub fn with_tile(self, tile_index: u8) -> Self {
        if tile_index >= TILE_COUNT {
            return self;
        }
        Self(self.0 | (1 << tile_index))
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Display for ClickedMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn from_word__ignores_bits_beyond_the_board() {
        // given
        let word = (U256::from(1u8) << 200usize) | U256::from(0b1_0000_0101u16);

        // when
        let mask = ClickedMask::from_word(word);

        // then
        assert_eq!(mask.bits(), 0b1_0000_0101);
        assert!(mask.contains(0));
        assert!(mask.contains(8));
        assert!(!mask.contains(1));
    }

    #[test]
    fn with_tile__out_of_range_index_is_ignored() {
        // given
        let mask = ClickedMask::default().with_tile(3);

        // when
        let unchanged = mask.with_tile(TILE_COUNT);

        // then
        assert_eq!(unchanged, mask);
        assert_eq!(unchanged.count(), 1);
    }
}
