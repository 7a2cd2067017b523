use crate::{
    Result,
    events::EventBatch,
};
use anyhow::anyhow;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};

const BATCH_BUFFER: usize = 16;

pub trait EventSource {
    /// Next run of decoded events, in chain order, with the block it covers up to.
    fn next_batch(&mut self) -> impl Future<Output = Result<EventBatch>> + Send;
}

/// Drives an [`EventSource`] on its own task and hands out its batches over a
/// channel. Dropping `next_batch` midway (a `select!` branch losing) only drops
/// a channel receive, so a slow fetch keeps running to completion.
pub struct SpawnedEventSource {
    recv: mpsc::Receiver<Result<EventBatch>>,
    task: JoinHandle<()>,
}

impl SpawnedEventSource {
    pub fn spawn<Source>(mut source: Source) -> Self
    where
        Source: EventSource + Send + 'static,
    {
        let (send, recv) = mpsc::channel(BATCH_BUFFER);
        let task = tokio::spawn(async move {
            loop {
                let batch = source.next_batch().await;
                let failed = batch.is_err();
                if send.send(batch).await.is_err() || failed {
                    break;
                }
            }
        });
        Self { recv, task }
    }
}

impl EventSource for SpawnedEventSource {
    async fn next_batch(&mut self) -> Result<EventBatch> {
        match self.recv.recv().await {
            Some(batch) => batch,
            None => Err(anyhow!("event source task stopped")),
        }
    }
}

impl Drop for SpawnedEventSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}
