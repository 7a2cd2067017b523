#![allow(non_snake_case)]

use super::*;
use alloy::primitives::{
    self,
    Address,
};
use std::sync::{
    Arc,
    Mutex,
};

fn contract() -> Address {
    Address::repeat_byte(0x5e)
}

#[derive(Default)]
struct ScriptedChain {
    head: u64,
    logs: Vec<Log>,
    failing_log_calls: usize,
    requested_ranges: Vec<(u64, u64)>,
    timestamp_lookups: Vec<u64>,
}

#[derive(Clone, Default)]
struct ScriptedLogProvider {
    chain: Arc<Mutex<ScriptedChain>>,
}

impl ScriptedLogProvider {
    fn new(head: u64, logs: Vec<Log>) -> Self {
        let provider = Self::default();
        {
            let mut chain = provider.chain.lock().unwrap();
            chain.head = head;
            chain.logs = logs;
        }
        provider
    }

    fn fail_next_log_calls(&self, count: usize) {
        self.chain.lock().unwrap().failing_log_calls = count;
    }

    fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.chain.lock().unwrap().requested_ranges.clone()
    }

    fn timestamp_lookups(&self) -> Vec<u64> {
        self.chain.lock().unwrap().timestamp_lookups.clone()
    }
}

impl LogProvider for ScriptedLogProvider {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.chain.lock().unwrap().head)
    }

    async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<Log>> {
        let mut chain = self.chain.lock().unwrap();
        chain.requested_ranges.push((from, to));
        if chain.failing_log_calls > 0 {
            chain.failing_log_calls -= 1;
            return Err(anyhow!("connection reset"));
        }
        Ok(chain
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or_default();
                (from..=to).contains(&block)
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        self.chain
            .lock()
            .unwrap()
            .timestamp_lookups
            .push(block_number);
        Ok(block_number * 2)
    }
}

fn instant_config(range_size: u64) -> EventSourceConfig {
    EventSourceConfig {
        range_size,
        poll_interval: Duration::ZERO,
        confirmations: 0,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    }
}

fn contract_log<E: SolEvent>(
    event: &E,
    block_number: u64,
    log_index: u64,
    block_timestamp: Option<u64>,
) -> Log {
    Log {
        inner: primitives::Log {
            address: contract(),
            data: event.encode_log_data(),
        },
        block_number: Some(block_number),
        log_index: Some(log_index),
        block_timestamp,
        ..Default::default()
    }
}

fn game_started(game_id: u64) -> Basesweeper::GameStarted {
    Basesweeper::GameStarted {
        gameId: U256::from(game_id),
    }
}

fn click_pending(game_id: u64, request_id: u64, tile_index: u64) -> Basesweeper::ClickPending {
    Basesweeper::ClickPending {
        gameId: U256::from(game_id),
        requestId: U256::from(request_id),
        player: Address::repeat_byte(0x11),
        tileIndex: U256::from(tile_index),
        targetBlock: U256::from(100u64),
    }
}

#[tokio::test]
async fn next_batch__backfill__walks_bounded_ranges_up_to_head() {
    // given
    let provider = ScriptedLogProvider::new(25, vec![]);
    let mut source = RpcEventSource::new(provider.clone(), 0, instant_config(10));

    // when
    let mut covered = Vec::new();
    for _ in 0..3 {
        covered.push(source.next_batch().await.unwrap().through_block);
    }

    // then
    assert_eq!(covered, vec![9, 19, 25]);
    assert_eq!(provider.requested_ranges(), vec![(0, 9), (10, 19), (20, 25)]);
    assert_eq!(source.next_block(), 26);
}

#[tokio::test]
async fn next_batch__failed_range__is_retried_rather_than_skipped() {
    // given
    let logs = vec![contract_log(&game_started(1), 5, 0, Some(10))];
    let provider = ScriptedLogProvider::new(9, logs);
    provider.fail_next_log_calls(2);
    let mut source = RpcEventSource::new(provider.clone(), 0, instant_config(10));

    // when
    let batch = source.next_batch().await.unwrap();

    // then
    assert_eq!(provider.requested_ranges(), vec![(0, 9), (0, 9), (0, 9)]);
    assert_eq!(batch.through_block, 9);
    assert_eq!(
        batch.events,
        vec![LoggedEvent::game_started(EventPosition::new(5, 0), 10, 1)]
    );
}

#[tokio::test]
async fn next_batch__unordered_logs__are_sorted_deduplicated_and_filtered() {
    // given
    let removed = Log {
        removed: true,
        ..contract_log(&click_pending(1, 8, 2), 4, 3, Some(8))
    };
    let logs = vec![
        contract_log(&click_pending(1, 7, 4), 4, 1, Some(8)),
        contract_log(&game_started(1), 3, 0, Some(6)),
        contract_log(&click_pending(1, 7, 4), 4, 1, Some(8)),
        removed,
    ];
    let provider = ScriptedLogProvider::new(5, logs);
    let mut source = RpcEventSource::new(provider, 0, instant_config(100));

    // when
    let batch = source.next_batch().await.unwrap();

    // then
    let positions: Vec<_> = batch.events.iter().map(|event| event.position).collect();
    assert_eq!(
        positions,
        vec![EventPosition::new(3, 0), EventPosition::new(4, 1)]
    );
    let expected = LoggedEvent::click_pending(
        EventPosition::new(4, 1),
        8,
        1,
        7,
        Address::repeat_byte(0x11),
        4,
        100,
    );
    assert_eq!(batch.events[1], expected);
}

#[tokio::test]
async fn next_batch__logs_without_timestamp__fetch_each_block_once() {
    // given
    let logs = vec![
        contract_log(&game_started(1), 7, 0, None),
        contract_log(&click_pending(1, 1, 0), 7, 1, None),
    ];
    let provider = ScriptedLogProvider::new(7, logs);
    let mut source = RpcEventSource::new(provider.clone(), 0, instant_config(100));

    // when
    let batch = source.next_batch().await.unwrap();

    // then
    assert_eq!(provider.timestamp_lookups(), vec![7]);
    assert!(batch.events.iter().all(|event| event.block_timestamp == 14));
}

#[tokio::test]
async fn next_batch__confirmations__hold_back_recent_blocks() {
    // given
    let provider = ScriptedLogProvider::new(20, vec![]);
    let config = EventSourceConfig {
        confirmations: 5,
        ..instant_config(100)
    };
    let mut source = RpcEventSource::new(provider.clone(), 10, config);

    // when
    let batch = source.next_batch().await.unwrap();

    // then
    assert_eq!(batch.through_block, 15);
    assert_eq!(provider.requested_ranges(), vec![(10, 15)]);
}

#[test]
fn decode_log__tile_off_the_board__is_skipped() {
    // given
    let log = contract_log(&click_pending(1, 1, 9), 3, 0, Some(1));

    // when
    let decoded = decode_log(&log);

    // then
    assert!(decoded.is_none());
}

#[test]
fn decode_log__refund__keeps_player_and_tile() {
    // given
    let refund = Basesweeper::ClickRefunded {
        gameId: U256::from(4u64),
        tileIndex: U256::from(8u64),
        player: Address::repeat_byte(0x22),
    };
    let log = contract_log(&refund, 3, 0, Some(1));

    // when
    let decoded = decode_log(&log).unwrap();

    // then
    assert_eq!(
        decoded,
        ContractEvent::ClickRefunded(ClickRefundedEvent {
            game_id: 4,
            tile_index: 8,
            player: Address::repeat_byte(0x22),
        })
    );
}
