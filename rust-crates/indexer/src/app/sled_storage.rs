// Sled-backed persistence for the projected games, clicks and pending clicks.
use crate::{
    app::projection_storage::ProjectionStorage,
    projection::{
        Click,
        EntityChange,
        Game,
        PendingClick,
        Projection,
        ProjectionMeta,
    },
};
use anyhow::{
    Context,
    anyhow,
};
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use sled::{
    Config,
    Db,
    Transactional,
    Tree,
    transaction::ConflictableTransactionError,
};
use std::path::Path;

const META_KEY: &[u8] = b"meta";

#[derive(Clone)]
pub struct SledProjectionStorage {
    db: Db,
    games: Tree,
    clicks: Tree,
    pending: Tree,
    meta: Tree,
}

enum Write {
    Insert(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

impl SledProjectionStorage {
    pub fn new(db: &Db) -> crate::Result<Self> {
        let games = db.open_tree("games").context("open games tree")?;
        let clicks = db.open_tree("clicks").context("open clicks tree")?;
        let pending = db
            .open_tree("pending_clicks")
            .context("open pending_clicks tree")?;
        let meta = db
            .open_tree("projection_meta")
            .context("open projection_meta tree")?;
        Ok(Self {
            db: db.clone(),
            games,
            clicks,
            pending,
            meta,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = Config::default()
            .path(path)
            .open()
            .context("open sled database")?;
        Self::new(&db)
    }

    fn game_key(game_id: u64) -> Vec<u8> {
        game_id.to_be_bytes().to_vec()
    }

    fn click_key(click: &Click) -> Vec<u8> {
        click.id.to_string().into_bytes()
    }

    fn pending_key(request_id: u64) -> Vec<u8> {
        request_id.to_be_bytes().to_vec()
    }

    fn load_tree<T: DeserializeOwned>(tree: &Tree, label: &str) -> crate::Result<Vec<T>> {
        let mut values = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry.with_context(|| format!("iterate {label}"))?;
            values.push(deserialize::<T>(value.as_ref())?);
        }
        Ok(values)
    }

    fn load_meta(&self) -> crate::Result<ProjectionMeta> {
        match self.meta.get(META_KEY).context("read projection meta")? {
            Some(value) => deserialize(value.as_ref()),
            None => Ok(ProjectionMeta::default()),
        }
    }
}

impl ProjectionStorage for SledProjectionStorage {
    fn load(&self) -> crate::Result<Projection> {
        let games = Self::load_tree::<Game>(&self.games, "games")?;
        let clicks = Self::load_tree::<Click>(&self.clicks, "clicks")?;
        let pending = Self::load_tree::<PendingClick>(&self.pending, "pending clicks")?;
        let meta = self.load_meta()?;
        Ok(Projection::from_parts(games, clicks, pending, meta))
    }

    fn commit(
        &mut self,
        changes: &[EntityChange],
        meta: &ProjectionMeta,
    ) -> crate::Result<()> {
        let mut game_writes = Vec::new();
        let mut click_writes = Vec::new();
        let mut pending_writes = Vec::new();
        for change in changes {
            match change {
                EntityChange::UpsertGame(game) => game_writes.push(Write::Insert(
                    Self::game_key(game.id),
                    serialize(game, "game")?,
                )),
                EntityChange::UpsertClick(click) => click_writes.push(Write::Insert(
                    Self::click_key(click),
                    serialize(click, "click")?,
                )),
                EntityChange::UpsertPending(pending) => {
                    pending_writes.push(Write::Insert(
                        Self::pending_key(pending.request_id),
                        serialize(pending, "pending click")?,
                    ))
                }
                EntityChange::DeletePending(request_id) => {
                    pending_writes.push(Write::Remove(Self::pending_key(*request_id)))
                }
            }
        }
        let meta_bytes = serialize(meta, "projection meta")?;

        (&self.games, &self.clicks, &self.pending, &self.meta)
            .transaction(|(games, clicks, pending, meta_tree)| {
                for (tree, writes) in [
                    (games, &game_writes),
                    (clicks, &click_writes),
                    (pending, &pending_writes),
                ] {
                    for write in writes.iter() {
                        match write {
                            Write::Insert(key, value) => {
                                tree.insert(key.as_slice(), value.as_slice())?;
                            }
                            Write::Remove(key) => {
                                tree.remove(key.as_slice())?;
                            }
                        }
                    }
                }
                meta_tree.insert(META_KEY, meta_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| anyhow!("commit projection transaction: {e:?}"))?;
        self.db.flush().context("flush projection")?;
        Ok(())
    }

    fn checkpoint(&self) -> crate::Result<Option<u64>> {
        Ok(self.load_meta()?.checkpoint)
    }

    fn reset(&mut self) -> crate::Result<()> {
        for (tree, label) in [
            (&self.games, "games"),
            (&self.clicks, "clicks"),
            (&self.pending, "pending clicks"),
            (&self.meta, "projection meta"),
        ] {
            tree.clear().with_context(|| format!("clear {label}"))?;
        }
        self.db.flush().context("flush projection reset")?;
        Ok(())
    }
}

fn serialize<T: Serialize>(value: &T, label: &str) -> crate::Result<Vec<u8>> {
    serde_json::to_vec(value).with_context(|| format!("serialize {label}"))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    serde_json::from_slice(bytes).context("deserialize sled record")
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::SledProjectionStorage;
    use crate::{
        app::projection_storage::ProjectionStorage,
        events::{
            EventBatch,
            EventPosition,
            LoggedEvent,
        },
        projection::{
            ClickId,
            Projection,
        },
    };
    use alloy::primitives::{
        Address,
        U256,
    };
    use tempdir::TempDir;

    fn sled_db(temp_dir: &TempDir) -> sled::Db {
        sled::Config::default()
            .path(temp_dir.path())
            .open()
            .expect("open sled db")
    }

    fn player() -> Address {
        Address::repeat_byte(0x42)
    }

    fn commit_batch(
        storage: &mut SledProjectionStorage,
        projection: &mut Projection,
        events: Vec<LoggedEvent>,
        through_block: u64,
    ) {
        let changes = projection.apply_batch(&EventBatch {
            events,
            through_block,
        });
        storage.commit(&changes, projection.meta()).unwrap();
    }

    #[test]
    fn commit__then_load__restores_entities_and_checkpoint() {
        // given
        let temp_dir = TempDir::new("sled_projection_storage").unwrap();
        let db = sled_db(&temp_dir);
        let mut storage = SledProjectionStorage::new(&db).unwrap();
        let mut projection = Projection::new();

        // when
        commit_batch(
            &mut storage,
            &mut projection,
            vec![
                LoggedEvent::game_started(EventPosition::new(5, 0), 50, 1),
                LoggedEvent::click_pending(EventPosition::new(6, 0), 60, 1, 9, player(), 3, 9),
            ],
            8,
        );

        // then
        let loaded = storage.load().unwrap();
        assert_eq!(loaded, projection);
        assert_eq!(storage.checkpoint().unwrap(), Some(8));
        assert!(loaded.click(ClickId::new(1, 9)).is_some());
    }

    #[test]
    fn commit__resolving_event__deletes_pending_row() {
        // given
        let temp_dir = TempDir::new("sled_projection_storage_delete").unwrap();
        let db = sled_db(&temp_dir);
        let mut storage = SledProjectionStorage::new(&db).unwrap();
        let mut projection = Projection::new();
        commit_batch(
            &mut storage,
            &mut projection,
            vec![
                LoggedEvent::game_started(EventPosition::new(5, 0), 50, 1),
                LoggedEvent::click_pending(EventPosition::new(6, 0), 60, 1, 9, player(), 3, 9),
            ],
            8,
        );

        // when
        commit_batch(
            &mut storage,
            &mut projection,
            vec![LoggedEvent::tile_clicked(
                EventPosition::new(9, 0),
                90,
                1,
                9,
                player(),
                3,
                U256::from(800u64),
            )],
            9,
        );

        // then
        let loaded = storage.load().unwrap();
        assert!(loaded.pending_click(9).is_none());
        assert!(loaded.game(1).unwrap().clicked_mask.contains(3));
        assert_eq!(loaded, projection);
    }

    #[test]
    fn reset__clears_entities_and_checkpoint() {
        // given
        let temp_dir = TempDir::new("sled_projection_storage_reset").unwrap();
        let db = sled_db(&temp_dir);
        let mut storage = SledProjectionStorage::new(&db).unwrap();
        let mut projection = Projection::new();
        commit_batch(
            &mut storage,
            &mut projection,
            vec![LoggedEvent::game_started(EventPosition::new(5, 0), 50, 1)],
            5,
        );

        // when
        storage.reset().unwrap();

        // then
        assert_eq!(storage.checkpoint().unwrap(), None);
        assert_eq!(storage.load().unwrap(), Projection::new());
    }
}
