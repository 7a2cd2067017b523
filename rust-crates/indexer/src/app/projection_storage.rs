use crate::projection::{
    EntityChange,
    Projection,
    ProjectionMeta,
};

pub trait ProjectionStorage {
    /// Rebuild the projection from what was last committed; empty for a fresh store.
    fn load(&self) -> crate::Result<Projection>;

    /// Write entity upserts/deletes together with the metadata they lead to.
    fn commit(
        &mut self,
        changes: &[EntityChange],
        meta: &ProjectionMeta,
    ) -> crate::Result<()>;

    /// Last block whose events are all reflected in storage.
    fn checkpoint(&self) -> crate::Result<Option<u64>>;

    /// Drop every entity and the checkpoint.
    fn reset(&mut self) -> crate::Result<()>;
}
