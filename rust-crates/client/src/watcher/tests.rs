#![allow(non_snake_case)]

use super::*;
use crate::cache::TileBadge;
use alloy::primitives::{
    Address,
    TxHash,
    U256,
};
use anyhow::anyhow;
use indexer::{
    app::event_source::SpawnedEventSource,
    events::{
        EventBatch,
        EventPosition,
        LoggedEvent,
    },
    views::{
        PendingClickDto,
        PendingSetDto,
    },
};
use keeper::{
    chain::OnChainGame,
    phase::{
        RevealAction,
        RevealPhase,
    },
};
use std::{
    future::pending,
    sync::{
        Arc,
        Mutex,
    },
};
use sweeper_abi::ClickedMask;
use tokio::{
    sync::mpsc,
    time::Instant,
};

struct FakeEventSource {
    recv: mpsc::Receiver<EventBatch>,
}

impl FakeEventSource {
    fn new_with_sender() -> (Self, mpsc::Sender<EventBatch>) {
        let (send, recv) = mpsc::channel(10);
        (Self { recv }, send)
    }
}

impl EventSource for FakeEventSource {
    async fn next_batch(&mut self) -> Result<EventBatch> {
        match self.recv.recv().await {
            Some(batch) => Ok(batch),
            None => pending().await,
        }
    }
}

struct SlowEventSource {
    delay: Duration,
    through_block: u64,
}

impl EventSource for SlowEventSource {
    async fn next_batch(&mut self) -> Result<EventBatch> {
        tokio::time::sleep(self.delay).await;
        self.through_block += 1;
        Ok(EventBatch {
            events: vec![],
            through_block: self.through_block,
        })
    }
}

const GAME: u64 = 3;

struct ChainState {
    head: u64,
    game: OnChainGame,
    attempts: Vec<(u64, RevealAction)>,
}

#[derive(Clone)]
struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    fn at(head: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                head,
                game: OnChainGame {
                    game_id: GAME,
                    pool: U256::ZERO,
                    winner: None,
                    active: true,
                    clicked_mask: ClickedMask::default(),
                },
                attempts: Vec::new(),
            })),
        }
    }

    fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    fn set_mask(&self, bits: u16) {
        self.state.lock().unwrap().game.clicked_mask = ClickedMask::new(bits);
    }

    fn attempts(&self) -> Vec<(u64, RevealAction)> {
        self.state.lock().unwrap().attempts.clone()
    }
}

impl BoardReader for FakeChain {
    async fn current_game_id(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().game.game_id)
    }

    async fn game_state(&self, game_id: u64) -> Result<OnChainGame> {
        let game = self.state.lock().unwrap().game;
        if game.game_id != game_id {
            return Err(anyhow!("unknown game {game_id}"));
        }
        Ok(game)
    }
}

impl RevealSubmitter for FakeChain {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn submit(&self, request_id: u64, action: RevealAction) -> Result<TxHash> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push((request_id, action));
        Ok(TxHash::with_last_byte(state.attempts.len() as u8))
    }
}

#[derive(Clone, Default)]
struct FakeIndexer {
    pending: Arc<Mutex<Option<PendingSetDto>>>,
}

impl FakeIndexer {
    fn serving(set: PendingSetDto) -> Self {
        let indexer = Self::default();
        *indexer.pending.lock().unwrap() = Some(set);
        indexer
    }

    fn unreachable() -> Self {
        Self::default()
    }
}

impl PendingSource for FakeIndexer {
    async fn pending_set(&self) -> Result<PendingSetDto> {
        self.pending
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("connection refused"))
    }
}

fn player() -> Address {
    Address::repeat_byte(0x5a)
}

fn empty_projection(checkpoint: u64) -> PendingSetDto {
    PendingSetDto {
        checkpoint: Some(checkpoint.to_string()),
        pending_clicks: vec![],
    }
}

fn commit_batch() -> EventBatch {
    EventBatch {
        events: vec![
            LoggedEvent::game_started(EventPosition::new(40, 0), 1_000, GAME),
            LoggedEvent::click_pending(EventPosition::new(45, 2), 1_010, GAME, 11, player(), 6, 48),
        ],
        through_block: 46,
    }
}

type TestWatcher = Watcher<FakeEventSource, FakeChain, FakeIndexer>;

fn watcher(chain: &FakeChain, indexer: FakeIndexer) -> (TestWatcher, mpsc::Sender<EventBatch>) {
    let (events, sender) = FakeEventSource::new_with_sender();
    let watcher = Watcher::new(
        events,
        chain.clone(),
        indexer,
        ClientStateCache::default(),
        Duration::from_secs(60),
    );
    (watcher, sender)
}

#[tokio::test]
async fn run__event_batch__is_folded_into_the_cache() {
    // given
    let chain = FakeChain::at(46);
    let (mut watcher, sender) = watcher(&chain, FakeIndexer::serving(empty_projection(30)));
    watcher.take_frame();

    // when
    sender.send(commit_batch()).await.unwrap();
    let state = watcher.run(pending()).await.unwrap();

    // then
    assert_eq!(state, RunState::Continue);
    assert_eq!(watcher.cache().observed_through(), Some(46));
    assert_eq!(
        watcher.cache().tile_badges(watcher.head())[6],
        TileBadge::Pending(RevealPhase::Committed)
    );
    let frame = watcher.take_frame().unwrap();
    assert!(frame.contains("request 11 tile 6 game 3: committed"));
    assert!(watcher.take_frame().is_none());
}

#[tokio::test]
async fn reconcile_pass__due_reveal__is_sent_once() {
    // given
    let chain = FakeChain::at(48);
    let (mut watcher, sender) = watcher(&chain, FakeIndexer::serving(empty_projection(30)));
    sender.send(commit_batch()).await.unwrap();
    watcher.run(pending()).await.unwrap();

    // when
    watcher.reconcile_pass().await;
    chain.set_head(49);
    watcher.reconcile_pass().await;

    // then
    assert_eq!(chain.attempts(), vec![(11, RevealAction::Reveal)]);
    assert!(watcher.cache().in_flight(11).is_some());
}

#[tokio::test]
async fn reconcile_pass__tile_clicked_on_chain__drops_pending_without_an_event() {
    // given
    let chain = FakeChain::at(47);
    let (mut watcher, sender) = watcher(&chain, FakeIndexer::serving(empty_projection(30)));
    sender.send(commit_batch()).await.unwrap();
    watcher.run(pending()).await.unwrap();

    // when
    chain.set_mask(1 << 6);
    chain.set_head(48);
    watcher.reconcile_pass().await;

    // then
    assert!(watcher.cache().pending_click(11).is_none());
    assert!(chain.attempts().is_empty());
    assert_eq!(watcher.cache().tile_badges(48)[6], TileBadge::Clicked);
}

#[tokio::test]
async fn reconcile_pass__projected_pending__is_adopted_and_rescued() {
    // given
    let chain = FakeChain::at(500);
    let projected = PendingSetDto {
        checkpoint: Some("499".to_string()),
        pending_clicks: vec![PendingClickDto {
            id: "4".to_string(),
            game_id: GAME.to_string(),
            player: "0x5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a".to_string(),
            tile_index: 1,
            target_block: "200".to_string(),
            created_at: "900".to_string(),
            commit_block: "197".to_string(),
            commit_log_index: "0".to_string(),
            orphaned: false,
        }],
    };
    let (mut watcher, _sender) = watcher(&chain, FakeIndexer::serving(projected));

    // when
    watcher.reconcile_pass().await;

    // then
    assert_eq!(watcher.cache().pending_click(4).unwrap().player, player());
    assert_eq!(chain.attempts(), vec![(4, RevealAction::Rescue)]);
}

#[tokio::test]
async fn reconcile_pass__indexer_down__reports_history_unavailable() {
    // given
    let chain = FakeChain::at(48);
    let (mut watcher, _sender) = watcher(&chain, FakeIndexer::unreachable());

    // when
    watcher.reconcile_pass().await;

    // then
    assert!(!watcher.history_available());
    assert_eq!(watcher.cache().board().unwrap().game_id, GAME);
    let frame = watcher.take_frame().unwrap();
    assert!(frame.contains("history unavailable"));
}

#[tokio::test]
async fn reconcile_pass__read_only__never_sends() {
    // given
    let chain = FakeChain::at(48);
    let (watcher, sender) = watcher(&chain, FakeIndexer::serving(empty_projection(30)));
    let mut watcher = watcher.send_transactions(false);
    sender.send(commit_batch()).await.unwrap();
    watcher.run(pending()).await.unwrap();

    // when
    watcher.reconcile_pass().await;

    // then
    assert!(chain.attempts().is_empty());
    assert!(watcher.cache().pending_click(11).is_some());
}

#[tokio::test]
async fn run__interrupt__exits() {
    // given
    let chain = FakeChain::at(1);
    let (mut watcher, _sender) = watcher(&chain, FakeIndexer::unreachable());

    // when
    let state = watcher.run(async {}).await.unwrap();

    // then
    assert_eq!(state, RunState::Exit);
}

#[tokio::test]
async fn run__reconcile_ticks_during_slow_event_fetch__still_apply_batches() {
    // given
    let chain = FakeChain::at(46);
    let events = SpawnedEventSource::spawn(SlowEventSource {
        delay: Duration::from_millis(100),
        through_block: 46,
    });
    let mut watcher = Watcher::new(
        events,
        chain.clone(),
        FakeIndexer::serving(empty_projection(30)),
        ClientStateCache::default(),
        Duration::from_millis(20),
    );

    // when
    let deadline = Instant::now() + Duration::from_secs(5);
    while watcher.cache().observed_through().is_none() && Instant::now() < deadline {
        watcher.run(pending()).await.unwrap();
    }

    // then
    assert_eq!(watcher.cache().observed_through(), Some(47));
}
