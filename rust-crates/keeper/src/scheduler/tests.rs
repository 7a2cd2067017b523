#![allow(non_snake_case)]

use super::*;
use alloy::primitives::{
    Address,
    TxHash,
    U256,
};
use anyhow::anyhow;
use indexer::{
    events::{
        EventBatch,
        EventPosition,
        LoggedEvent,
    },
    projection::{
        ClickId,
        ClickOutcome,
        Projection,
    },
    views::{
        self,
        PendingSetDto,
    },
};
use std::sync::{
    Arc,
    Mutex,
};

#[derive(Default)]
struct ChainState {
    head: u64,
    attempts: Vec<(u64, RevealAction)>,
    failing_submissions: usize,
}

#[derive(Clone, Default)]
struct RecordingChain {
    state: Arc<Mutex<ChainState>>,
}

impl RecordingChain {
    fn at(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    fn fail_next_submissions(&self, count: usize) {
        self.state.lock().unwrap().failing_submissions = count;
    }

    fn attempts(&self) -> Vec<(u64, RevealAction)> {
        self.state.lock().unwrap().attempts.clone()
    }
}

impl RevealSubmitter for RecordingChain {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn submit(&self, request_id: u64, action: RevealAction) -> Result<TxHash> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push((request_id, action));
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(anyhow!("nonce too low"));
        }
        Ok(TxHash::with_last_byte(state.attempts.len() as u8))
    }
}

/// Serves the pending view straight from a projection the test drives.
#[derive(Clone, Default)]
struct ProjectedPending {
    projection: Arc<Mutex<Projection>>,
}

impl ProjectedPending {
    fn apply(&self, events: Vec<LoggedEvent>, through_block: u64) {
        self.projection.lock().unwrap().apply_batch(&EventBatch {
            events,
            through_block,
        });
    }
}

impl PendingSource for ProjectedPending {
    async fn pending_set(&self) -> Result<PendingSetDto> {
        Ok(views::pending_set(&self.projection.lock().unwrap()))
    }
}

const GAME: u64 = 1;
const REQUEST: u64 = 7;
const TILE: u8 = 4;
const TARGET: u64 = 110;

fn player() -> Address {
    Address::repeat_byte(0x42)
}

fn committed_click() -> ProjectedPending {
    let pending = ProjectedPending::default();
    pending.apply(
        vec![
            LoggedEvent::game_started(EventPosition::new(100, 0), 1_000, GAME),
            LoggedEvent::click_pending(
                EventPosition::new(105, 0),
                1_010,
                GAME,
                REQUEST,
                player(),
                TILE,
                TARGET,
            ),
        ],
        105,
    );
    pending
}

fn scheduler(
    chain: &RecordingChain,
    pending: &ProjectedPending,
) -> Scheduler<RecordingChain, ProjectedPending> {
    Scheduler::new(chain.clone(), pending.clone(), InFlightTracker::default())
}

#[tokio::test]
async fn tick__before_target_block__sends_nothing() {
    // given
    let chain = RecordingChain::at(TARGET - 1);
    let mut scheduler = scheduler(&chain, &committed_click());

    // when
    let report = scheduler.tick().await.unwrap();

    // then
    assert_eq!(report.outstanding, 1);
    assert!(report.due.is_empty());
    assert!(chain.attempts().is_empty());
}

#[tokio::test]
async fn tick__head_reaches_target__sends_exactly_one_reveal() {
    // given
    let chain = RecordingChain::at(TARGET);
    let pending = committed_click();
    let mut scheduler = scheduler(&chain, &pending);

    // when
    let first = scheduler.tick().await.unwrap();
    chain.set_head(TARGET + 1);
    let second = scheduler.tick().await.unwrap();

    // then
    assert_eq!(
        first.submitted,
        vec![DueAction {
            request_id: REQUEST,
            action: RevealAction::Reveal
        }]
    );
    assert!(second.due.is_empty());
    assert_eq!(chain.attempts(), vec![(REQUEST, RevealAction::Reveal)]);
    assert!(scheduler.tracker().marker(REQUEST).is_some());
}

#[tokio::test]
async fn tick__tile_clicked_projected__clears_marker_without_resending() {
    // given
    let chain = RecordingChain::at(TARGET);
    let pending = committed_click();
    let mut scheduler = scheduler(&chain, &pending);
    scheduler.tick().await.unwrap();

    // when
    pending.apply(
        vec![LoggedEvent::tile_clicked(
            EventPosition::new(111, 0),
            1_022,
            GAME,
            REQUEST,
            player(),
            TILE,
            U256::from(800u64),
        )],
        111,
    );
    chain.set_head(TARGET + 20);
    let report = scheduler.tick().await.unwrap();

    // then
    assert_eq!(report.resolved, vec![REQUEST]);
    assert_eq!(report.outstanding, 0);
    assert!(scheduler.tracker().is_empty());
    assert_eq!(chain.attempts().len(), 1);
}

#[tokio::test]
async fn tick__window_expired__rescues_and_refund_resolves_the_click() {
    // given
    let chain = RecordingChain::at(TARGET + 257);
    let pending = committed_click();
    let mut scheduler = scheduler(&chain, &pending);

    // when
    let report = scheduler.tick().await.unwrap();
    pending.apply(
        vec![LoggedEvent::click_refunded(
            EventPosition::new(TARGET + 258, 0),
            1_600,
            GAME,
            TILE,
            player(),
        )],
        TARGET + 258,
    );
    chain.set_head(TARGET + 259);
    let after_refund = scheduler.tick().await.unwrap();

    // then
    assert_eq!(chain.attempts(), vec![(REQUEST, RevealAction::Rescue)]);
    assert_eq!(report.submitted[0].action, RevealAction::Rescue);
    assert_eq!(after_refund.resolved, vec![REQUEST]);
    let projection = pending.projection.lock().unwrap();
    let click = projection.click(ClickId::new(GAME, REQUEST)).unwrap();
    assert_eq!(click.outcome(), ClickOutcome::Refunded);
    assert!(click.revealed && click.refund.is_some() && !click.is_winner);
    assert!(projection.pending_click(REQUEST).is_none());
}

#[tokio::test]
async fn tick__submission_lost__is_resent_once_indexer_passes_the_buffer() {
    // given
    let chain = RecordingChain::at(TARGET);
    let pending = committed_click();
    let mut scheduler = scheduler(&chain, &pending);
    scheduler.tick().await.unwrap();

    // when
    chain.set_head(TARGET + 10);
    pending.apply(vec![], TARGET + 4);
    let lagging = scheduler.tick().await.unwrap();
    pending.apply(vec![], TARGET + 5);
    let stale = scheduler.tick().await.unwrap();

    // then
    assert!(lagging.due.is_empty());
    assert_eq!(stale.submitted.len(), 1);
    assert_eq!(
        chain.attempts(),
        vec![
            (REQUEST, RevealAction::Reveal),
            (REQUEST, RevealAction::Reveal)
        ]
    );
}

#[tokio::test]
async fn tick__failed_submission__retries_on_next_block_only() {
    // given
    let chain = RecordingChain::at(TARGET);
    chain.fail_next_submissions(1);
    let mut scheduler = scheduler(&chain, &committed_click());

    // when
    let failed = scheduler.tick().await.unwrap();
    let same_block = scheduler.tick().await.unwrap();
    chain.set_head(TARGET + 1);
    let next_block = scheduler.tick().await.unwrap();

    // then
    assert_eq!(failed.failed.len(), 1);
    assert!(same_block.due.is_empty());
    assert_eq!(next_block.submitted.len(), 1);
    assert_eq!(chain.attempts().len(), 2);
}

#[tokio::test]
async fn tick__reveal_in_flight_when_window_closes__switches_to_rescue() {
    // given
    let chain = RecordingChain::at(TARGET + 250);
    let mut scheduler = scheduler(&chain, &committed_click());
    scheduler.tick().await.unwrap();

    // when
    chain.set_head(TARGET + 257);
    let report = scheduler.tick().await.unwrap();

    // then
    assert_eq!(report.submitted[0].action, RevealAction::Rescue);
    assert_eq!(
        chain.attempts(),
        vec![
            (REQUEST, RevealAction::Reveal),
            (REQUEST, RevealAction::Rescue)
        ]
    );
}

#[tokio::test]
async fn tick__orphaned_click__is_still_driven_and_never_marked_won() {
    // given
    let chain = RecordingChain::at(TARGET);
    let pending = committed_click();
    pending.apply(
        vec![
            LoggedEvent::click_pending(
                EventPosition::new(106, 0),
                1_012,
                GAME,
                REQUEST + 1,
                Address::repeat_byte(0x43),
                TILE + 1,
                TARGET + 1,
            ),
            LoggedEvent::game_won(
                EventPosition::new(111, 0),
                1_022,
                GAME,
                REQUEST + 1,
                Address::repeat_byte(0x43),
                TILE + 1,
                U256::from(1_600u64),
            ),
        ],
        111,
    );
    let mut scheduler = scheduler(&chain, &pending);

    // when
    let report = scheduler.tick().await.unwrap();

    // then
    assert_eq!(report.outstanding, 1);
    assert_eq!(chain.attempts(), vec![(REQUEST, RevealAction::Reveal)]);
    let projection = pending.projection.lock().unwrap();
    let orphan = projection.click(ClickId::new(GAME, REQUEST)).unwrap();
    assert_eq!(orphan.outcome(), ClickOutcome::Pending);
}

#[tokio::test]
async fn tick__dry_run__reports_due_actions_without_sending() {
    // given
    let chain = RecordingChain::at(TARGET);
    let mut scheduler = scheduler(&chain, &committed_click()).dry_run(true);

    // when
    let report = scheduler.tick().await.unwrap();

    // then
    assert_eq!(report.due.len(), 1);
    assert!(report.submitted.is_empty());
    assert!(chain.attempts().is_empty());
    assert!(scheduler.tracker().is_empty());
}
