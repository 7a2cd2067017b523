use crate::{
    Result,
    app::event_source::EventSource,
    events::{
        ClickPendingEvent,
        ClickRefundedEvent,
        ContractEvent,
        EventBatch,
        EventPosition,
        GameStartedEvent,
        GameWonEvent,
        LoggedEvent,
        TileClickedEvent,
    },
};
use alloy::{
    primitives::{
        Address,
        U256,
    },
    providers::{
        DynProvider,
        Provider,
    },
    rpc::types::{
        BlockNumberOrTag,
        Filter,
        Log,
    },
    sol_types::SolEvent,
};
use anyhow::{
    Context,
    anyhow,
};
use std::{
    collections::HashMap,
    time::Duration,
};
use sweeper_abi::{
    Basesweeper,
    TILE_COUNT,
};
use tokio::time::Instant;

#[cfg(test)]
mod tests;

pub const DEFAULT_RANGE_SIZE: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The chain reads the event source needs.
pub trait LogProvider {
    fn head_block(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Contract logs in `[from, to]`, inclusive.
    fn logs_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> impl Future<Output = Result<Vec<Log>>> + Send;

    fn block_timestamp(&self, block_number: u64) -> impl Future<Output = Result<u64>> + Send;
}

pub struct AlloyLogProvider {
    provider: DynProvider,
    contract: Address,
}

impl AlloyLogProvider {
    pub fn new(provider: DynProvider, contract: Address) -> Self {
        Self { provider, contract }
    }
}

impl LogProvider for AlloyLogProvider {
    async fn head_block(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .context("eth_blockNumber")
    }

    async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(self.contract)
            .from_block(from)
            .to_block(to);
        self.provider
            .get_logs(&filter)
            .await
            .with_context(|| format!("eth_getLogs {from}..={to}"))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .with_context(|| format!("eth_getBlockByNumber {block_number}"))?
            .ok_or_else(|| anyhow!("block {block_number} not found"))?;
        Ok(block.header.timestamp)
    }
}

#[derive(Debug, Clone)]
pub struct EventSourceConfig {
    pub range_size: u64,
    pub poll_interval: Duration,
    pub confirmations: u64,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            range_size: DEFAULT_RANGE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            confirmations: 0,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Backfills in bounded ranges from `next_block`, then tails the head by polling.
///
/// A range is only passed over once its logs were fetched and decoded; any
/// failure retries the same range after a doubling backoff. Waits are kept in
/// `wake_at` so a cancelled call resumes the same wait rather than restarting it.
pub struct RpcEventSource<P> {
    provider: P,
    config: EventSourceConfig,
    next_block: u64,
    backoff: Duration,
    wake_at: Option<Instant>,
}

impl<P: LogProvider + Sync> RpcEventSource<P> {
    pub fn new(provider: P, start_block: u64, config: EventSourceConfig) -> Self {
        let backoff = config.initial_backoff;
        Self {
            provider,
            config,
            next_block: start_block,
            backoff,
            wake_at: None,
        }
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    async fn try_next_batch(&mut self) -> Result<Option<EventBatch>> {
        let head = self.provider.head_block().await?;
        let safe_head = head.saturating_sub(self.config.confirmations);
        if safe_head < self.next_block {
            return Ok(None);
        }
        let from = self.next_block;
        let to = safe_head.min(from.saturating_add(self.config.range_size.max(1) - 1));
        let logs = self.provider.logs_in_range(from, to).await?;
        let events = self.decode_logs(logs).await?;
        tracing::debug!(from, to, "fetched {} events", events.len());
        self.next_block = to + 1;
        Ok(Some(EventBatch {
            events,
            through_block: to,
        }))
    }

    async fn decode_logs(&self, mut logs: Vec<Log>) -> Result<Vec<LoggedEvent>> {
        logs.retain(|log| !log.removed);
        let mut positioned = Vec::with_capacity(logs.len());
        for log in logs {
            let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index)
            else {
                return Err(anyhow!("log without a block position in a mined range"));
            };
            positioned.push((EventPosition::new(block_number, log_index), log));
        }
        positioned.sort_by_key(|(position, _)| *position);
        positioned.dedup_by_key(|(position, _)| *position);

        let mut timestamps: HashMap<u64, u64> = HashMap::new();
        let mut events = Vec::with_capacity(positioned.len());
        for (position, log) in positioned {
            let Some(event) = decode_log(&log) else {
                continue;
            };
            let timestamp = match log.block_timestamp {
                Some(timestamp) => timestamp,
                None => match timestamps.get(&position.block_number) {
                    Some(timestamp) => *timestamp,
                    None => {
                        let timestamp = self
                            .provider
                            .block_timestamp(position.block_number)
                            .await?;
                        timestamps.insert(position.block_number, timestamp);
                        timestamp
                    }
                },
            };
            events.push(LoggedEvent::new(position, timestamp, event));
        }
        Ok(events)
    }
}

impl<P: LogProvider + Send + Sync> EventSource for RpcEventSource<P> {
    async fn next_batch(&mut self) -> Result<EventBatch> {
        loop {
            if let Some(wake_at) = self.wake_at {
                tokio::time::sleep_until(wake_at).await;
                self.wake_at = None;
            }
            match self.try_next_batch().await {
                Ok(Some(batch)) => {
                    self.backoff = self.config.initial_backoff;
                    return Ok(batch);
                }
                Ok(None) => {
                    self.backoff = self.config.initial_backoff;
                    self.wake_at = Some(Instant::now() + self.config.poll_interval);
                }
                Err(e) => {
                    tracing::warn!(
                        from_block = self.next_block,
                        "log fetch failed, retrying in {:?}: {e:#}",
                        self.backoff
                    );
                    self.wake_at = Some(Instant::now() + self.backoff);
                    self.backoff = (self.backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }
}

fn narrow_u64(field: &str, value: U256) -> Option<u64> {
    let narrowed = u64::try_from(value).ok();
    if narrowed.is_none() {
        tracing::warn!("{field} {value} does not fit in 64 bits; skipping log");
    }
    narrowed
}

fn narrow_tile(value: U256) -> Option<u8> {
    let tile = u8::try_from(value).ok().filter(|tile| *tile < TILE_COUNT);
    if tile.is_none() {
        tracing::warn!("tile index {value} is off the board; skipping log");
    }
    tile
}

fn decode_as<E: SolEvent>(log: &Log) -> Option<E> {
    match log.log_decode::<E>() {
        Ok(decoded) => Some(decoded.inner.data),
        Err(e) => {
            tracing::warn!("failed to decode {} log: {e}", E::SIGNATURE);
            None
        }
    }
}

/// Typed event for a contract log; `None` for foreign topics and malformed values.
pub fn decode_log(log: &Log) -> Option<ContractEvent> {
    let topic0 = *log.topic0()?;
    let event = if topic0 == Basesweeper::GameStarted::SIGNATURE_HASH {
        let raw = decode_as::<Basesweeper::GameStarted>(log)?;
        ContractEvent::GameStarted(GameStartedEvent {
            game_id: narrow_u64("gameId", raw.gameId)?,
        })
    } else if topic0 == Basesweeper::ClickPending::SIGNATURE_HASH {
        let raw = decode_as::<Basesweeper::ClickPending>(log)?;
        ContractEvent::ClickPending(ClickPendingEvent {
            game_id: narrow_u64("gameId", raw.gameId)?,
            request_id: narrow_u64("requestId", raw.requestId)?,
            player: raw.player,
            tile_index: narrow_tile(raw.tileIndex)?,
            target_block: narrow_u64("targetBlock", raw.targetBlock)?,
        })
    } else if topic0 == Basesweeper::TileClicked::SIGNATURE_HASH {
        let raw = decode_as::<Basesweeper::TileClicked>(log)?;
        ContractEvent::TileClicked(TileClickedEvent {
            game_id: narrow_u64("gameId", raw.gameId)?,
            request_id: narrow_u64("requestId", raw.requestId)?,
            player: raw.player,
            tile_index: narrow_tile(raw.tileIndex)?,
            new_pool: raw.newPool,
        })
    } else if topic0 == Basesweeper::GameWon::SIGNATURE_HASH {
        let raw = decode_as::<Basesweeper::GameWon>(log)?;
        ContractEvent::GameWon(GameWonEvent {
            game_id: narrow_u64("gameId", raw.gameId)?,
            request_id: narrow_u64("requestId", raw.requestId)?,
            winner: raw.winner,
            tile_index: narrow_tile(raw.tileIndex)?,
            payout: raw.payout,
        })
    } else if topic0 == Basesweeper::ClickRefunded::SIGNATURE_HASH {
        let raw = decode_as::<Basesweeper::ClickRefunded>(log)?;
        ContractEvent::ClickRefunded(ClickRefundedEvent {
            game_id: narrow_u64("gameId", raw.gameId)?,
            tile_index: narrow_tile(raw.tileIndex)?,
            player: raw.player,
        })
    } else {
        tracing::trace!(topic = %topic0, "ignoring unrelated log");
        return None;
    };
    Some(event)
}
