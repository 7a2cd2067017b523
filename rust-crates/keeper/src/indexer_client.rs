use crate::Result;
use anyhow::{
    Context,
    anyhow,
};
use indexer::{
    app::actix_query_api::DEFAULT_QUERY_PORT,
    views::PendingSetDto,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::fmt;

pub fn default_indexer_url() -> String {
    format!("http://127.0.0.1:{DEFAULT_QUERY_PORT}")
}

/// Projected pending requests, as of the checkpoint the projection reached.
pub trait PendingSource {
    fn pending_set(&self) -> impl Future<Output = Result<PendingSetDto>>;
}

#[derive(Clone)]
pub struct IndexerClient {
    base_url: String,
    http: reqwest::Client,
}

impl IndexerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client for indexer")?;
        Ok(Self { base_url, http })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("indexer request to {url} failed"))?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = res
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable body>".to_string());
            return Err(anyhow!("indexer responded with {status} for {path}: {body}"));
        }
        let parsed = res
            .json()
            .await
            .with_context(|| format!("invalid indexer payload for {path}"))?;
        Ok(Some(parsed))
    }
}

impl PendingSource for IndexerClient {
    async fn pending_set(&self) -> Result<PendingSetDto> {
        self.get_json("/api/pending")
            .await?
            .ok_or_else(|| anyhow!("indexer at {} has no pending endpoint", self.base_url))
    }
}

impl fmt::Display for IndexerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use indexer::{
        app::{
            actix_query_api::ActixQueryApi,
            query_api::{
                Query,
                QueryAPI,
            },
        },
        views::PendingClickDto,
    };

    #[tokio::test]
    async fn pending_set__reads_the_indexer_pending_view() {
        // given
        let mut api = ActixQueryApi::new(None).await.unwrap();
        let client = IndexerClient::new(format!("{}/", api.base_url())).unwrap();
        let expected = PendingSetDto {
            checkpoint: Some("500".to_string()),
            pending_clicks: vec![PendingClickDto {
                id: "12".to_string(),
                game_id: "3".to_string(),
                player: "0x2222222222222222222222222222222222222222".to_string(),
                tile_index: 7,
                target_block: "498".to_string(),
                created_at: "1700000100".to_string(),
                commit_block: "496".to_string(),
                commit_log_index: "0".to_string(),
                orphaned: false,
            }],
        };

        let request = tokio::spawn(async move { client.pending_set().await.unwrap() });

        // when
        match api.query().await.unwrap() {
            Query::PendingSet(sender) => sender.send(expected.clone()).unwrap(),
            other => panic!("expected pending set query got {:?}", other),
        }

        // then
        let received = request.await.unwrap();
        assert_eq!(received, expected);
        assert_eq!(received.pending_clicks[0].request_id().unwrap(), 12);
    }

    #[tokio::test]
    async fn pending_set__unreachable_indexer__is_an_error() {
        // given
        let client = IndexerClient::new("http://127.0.0.1:9").unwrap();

        // when
        let result = client.pending_set().await;

        // then
        assert!(result.is_err());
    }
}
