use crate::{
    Result,
    app::{
        event_source::EventSource,
        projection_storage::ProjectionStorage,
        query_api::{
            Query,
            QueryAPI,
        },
    },
    events::EventBatch,
    projection::Projection,
    views,
};
use alloy::primitives::U256;
use anyhow::Context;
use std::future::Future;
use tracing_subscriber::EnvFilter;

pub mod actix_query_api;
pub mod event_source;
pub mod in_memory_projection_storage;
pub mod projection_storage;
pub mod query_api;
pub mod rpc_event_source;
pub mod sled_storage;


pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Continue,
    Exit,
}

/// Single writer over the projection: applies event batches, commits them and
/// answers read queries between batches.
pub struct App<Events, API, Storage> {
    events: Events,
    api: API,
    storage: Storage,
    projection: Projection,
    click_fee: U256,
}

impl<Events, API, Storage: ProjectionStorage> App<Events, API, Storage> {
    pub fn new(events: Events, api: API, storage: Storage, click_fee: U256) -> Result<Self> {
        let projection = storage.load().context("loading persisted projection")?;
        if let Some(checkpoint) = projection.checkpoint() {
            tracing::info!(
                checkpoint,
                games = projection.games().count(),
                pending = projection.pending().count(),
                "restored projection"
            );
        }
        Ok(Self {
            events,
            api,
            storage,
            projection,
            click_fee,
        })
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }
}

impl<Events: EventSource, API: QueryAPI, Storage: ProjectionStorage>
    App<Events, API, Storage>
{
    pub async fn run<I: Future<Output = ()>>(&mut self, interrupt: I) -> Result<RunState> {
        tokio::select! {
            batch = self.events.next_batch() => {
                let batch = batch.context("reading next event batch")?;
                self.handle_batch(batch)?;
                Ok(RunState::Continue)
            }
            query = self.api.query() => {
                let query = query.context("receiving query")?;
                self.handle_query(query);
                Ok(RunState::Continue)
            }
            _ = interrupt => {
                tracing::info!("interrupt received, stopping");
                Ok(RunState::Exit)
            }
        }
    }

    fn handle_batch(&mut self, batch: EventBatch) -> Result<()> {
        let changes = self.projection.apply_batch(&batch);
        self.storage
            .commit(&changes, self.projection.meta())
            .with_context(|| format!("committing batch through block {}", batch.through_block))?;
        if batch.events.is_empty() {
            tracing::trace!(through_block = batch.through_block, "empty batch");
        } else {
            tracing::info!(
                through_block = batch.through_block,
                "applied {} events ({} entity changes)",
                batch.events.len(),
                changes.len()
            );
        }
        Ok(())
    }

    fn handle_query(&self, query: Query) {
        let projection = &self.projection;
        let delivered = match query {
            Query::History { limit, sender } => {
                sender.send(views::history(projection, limit)).is_ok()
            }
            Query::GameDetail { game_id, sender } => sender
                .send(views::game_detail(projection, game_id))
                .is_ok(),
            Query::UserStats { player, sender } => sender
                .send(views::user_stats(projection, player, self.click_fee))
                .is_ok(),
            Query::Leaderboard { limit, sender } => {
                sender.send(views::leaderboard(projection, limit)).is_ok()
            }
            Query::CurrentGame(sender) => {
                sender.send(views::current_game(projection)).is_ok()
            }
            Query::PendingSet(sender) => sender.send(views::pending_set(projection)).is_ok(),
            Query::Status(sender) => sender.send(views::status(projection)).is_ok(),
        };
        if !delivered {
            tracing::warn!("query responder dropped before the answer was sent");
        }
    }
}
