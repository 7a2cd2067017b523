use crate::{
    app::projection_storage::ProjectionStorage,
    projection::{
        Click,
        ClickId,
        EntityChange,
        Game,
        PendingClick,
        Projection,
        ProjectionMeta,
    },
};
use anyhow::anyhow;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

#[derive(Debug, Default)]
pub struct StoredEntities {
    pub games: BTreeMap<u64, Game>,
    pub clicks: BTreeMap<ClickId, Click>,
    pub pending: BTreeMap<u64, PendingClick>,
    pub meta: ProjectionMeta,
}

/// Shared-handle store; clones see the same entities.
#[derive(Clone, Default)]
pub struct InMemoryProjectionStorage {
    entities: Arc<Mutex<StoredEntities>>,
}

impl InMemoryProjectionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entities(&self) -> Arc<Mutex<StoredEntities>> {
        self.entities.clone()
    }

    fn lock(&self) -> crate::Result<MutexGuard<'_, StoredEntities>> {
        self.entities
            .lock()
            .map_err(|_| anyhow!("in-memory projection lock poisoned"))
    }
}

impl ProjectionStorage for InMemoryProjectionStorage {
    fn load(&self) -> crate::Result<Projection> {
        let guard = self.lock()?;
        Ok(Projection::from_parts(
            guard.games.values().cloned(),
            guard.clicks.values().cloned(),
            guard.pending.values().cloned(),
            guard.meta.clone(),
        ))
    }

    fn commit(
        &mut self,
        changes: &[EntityChange],
        meta: &ProjectionMeta,
    ) -> crate::Result<()> {
        let mut guard = self.lock()?;
        for change in changes {
            match change {
                EntityChange::UpsertGame(game) => {
                    guard.games.insert(game.id, game.clone());
                }
                EntityChange::UpsertClick(click) => {
                    guard.clicks.insert(click.id, click.clone());
                }
                EntityChange::UpsertPending(pending) => {
                    guard.pending.insert(pending.request_id, pending.clone());
                }
                EntityChange::DeletePending(request_id) => {
                    guard.pending.remove(request_id);
                }
            }
        }
        guard.meta = meta.clone();
        Ok(())
    }

    fn checkpoint(&self) -> crate::Result<Option<u64>> {
        Ok(self.lock()?.meta.checkpoint)
    }

    fn reset(&mut self) -> crate::Result<()> {
        *self.lock()? = StoredEntities::default();
        Ok(())
    }
}
