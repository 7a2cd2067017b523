use std::fmt;
use sweeper_abi::REVEAL_WINDOW_BLOCKS;

/// Where a pending request sits relative to its target block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevealPhase {
    /// The target block has not been produced yet.
    Committed,
    /// `target_block <= head <= target_block + 256`: the blockhash is readable.
    Revealable,
    /// The blockhash has fallen out of the contract's reach; only a rescue resolves it.
    Expired,
}

impl RevealPhase {
    pub fn classify(head: u64, target_block: u64) -> Self {
        if head < target_block {
            RevealPhase::Committed
        } else if head <= target_block.saturating_add(REVEAL_WINDOW_BLOCKS) {
            RevealPhase::Revealable
        } else {
            RevealPhase::Expired
        }
    }

    pub fn action(self) -> Option<RevealAction> {
        match self {
            RevealPhase::Committed => None,
            RevealPhase::Revealable => Some(RevealAction::Reveal),
            RevealPhase::Expired => Some(RevealAction::Rescue),
        }
    }

    /// Blocks left before the phase changes, `None` once expired.
    pub fn blocks_remaining(head: u64, target_block: u64) -> Option<u64> {
        match Self::classify(head, target_block) {
            RevealPhase::Committed => Some(target_block - head),
            RevealPhase::Revealable => {
                Some(target_block.saturating_add(REVEAL_WINDOW_BLOCKS) - head)
            }
            RevealPhase::Expired => None,
        }
    }
}

impl fmt::Display for RevealPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RevealPhase::Committed => "committed",
            RevealPhase::Revealable => "revealable",
            RevealPhase::Expired => "expired",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevealAction {
    /// `revealOutcome(requestId)`
    Reveal,
    /// `rescueExpiredClick(requestId)`
    Rescue,
}

impl fmt::Display for RevealAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevealAction::Reveal => f.write_str("reveal"),
            RevealAction::Rescue => f.write_str("rescue"),
        }
    }
}
