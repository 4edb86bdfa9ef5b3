//! Catalog API paging.

use crate::error::FetchError;
use crate::types::SyncConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

/// Header carrying the API key.
pub(crate) const API_KEY_HEADER: &str = "x-api-key";

/// Position of a page in the catalog's result set (1-based page number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor(pub u32);

impl PageCursor {
    /// The first page of any series.
    pub fn first() -> Self {
        PageCursor(1)
    }

    fn next(self) -> Self {
        PageCursor(self.0 + 1)
    }
}

/// One API response, kept verbatim for the snapshot.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub cursor: PageCursor,
    /// Raw response body.
    pub body: Value,
    /// Total number of matching records reported by the API, if any.
    pub total: Option<u64>,
}

impl CatalogPage {
    pub(crate) fn from_body(cursor: PageCursor, body: Value) -> Option<Self> {
        body.pointer("/body/hits/hits")?.as_array()?;
        let total = body
            .pointer("/body/hits/total/value")
            .or_else(|| body.pointer("/body/hits/total"))
            .and_then(Value::as_u64);
        Some(Self {
            cursor,
            body,
            total,
        })
    }

    /// Raw record payloads in catalog order.
    pub fn hits(&self) -> &[Value] {
        self.body
            .pointer("/body/hits/hits")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Drops hits beyond `max`, returning how many remain.
    fn truncate_hits(&mut self, max: usize) -> usize {
        match self.body.pointer_mut("/body/hits/hits") {
            Some(Value::Array(hits)) => {
                hits.truncate(max);
                hits.len()
            }
            _ => 0,
        }
    }
}

/// Authenticated client for the catalog's series endpoint.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    config: Arc<SyncConfig>,
}

impl CatalogClient {
    pub fn new(http: reqwest::Client, config: Arc<SyncConfig>) -> Self {
        Self { http, config }
    }

    /// URL listing the children of a series.
    pub fn series_url(&self, series_id: &str) -> String {
        format!(
            "{}/records/parentNaId/{}",
            self.config.endpoint.trim_end_matches('/'),
            series_id
        )
    }

    /// Fetches one page, retrying transient failures with bounded backoff.
    ///
    /// # Returns
    ///
    /// The page and the cursor of the following page, or `None` when the API
    /// has nothing more to give.
    pub async fn fetch_page(
        &self,
        series_id: &str,
        cursor: PageCursor,
    ) -> Result<(CatalogPage, Option<PageCursor>), FetchError> {
        let retries = self.config.max_fetch_retries.max(1);
        let retry_strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.retry_base_delay_ms.max(1))
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(retries);

        let page = Retry::spawn(retry_strategy, || async move {
            match self.fetch_once(series_id, cursor).await {
                Ok(page) => Ok(page),
                Err(e) if e.is_transient() => {
                    warn!("Catalog page {} failed, will retry: {}", cursor.0, e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        })
        .await?;

        let next = self.next_cursor(&page);
        Ok((page, next))
    }

    async fn fetch_once(
        &self,
        series_id: &str,
        cursor: PageCursor,
    ) -> Result<CatalogPage, FetchError> {
        let url = self.series_url(series_id);
        debug!("Requesting {} page {}", url, cursor.0);

        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &self.config.credential)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .query(&[
                ("limit", self.page_size().to_string()),
                ("page", cursor.0.to_string()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::Transient {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchError::Transient {
                url,
                reason: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Fatal {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.json::<Value>().await.map_err(|e| {
            if e.is_decode() {
                FetchError::InvalidResponse {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            } else {
                FetchError::Transient {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        CatalogPage::from_body(cursor, body).ok_or_else(|| FetchError::InvalidResponse {
            url,
            reason: "missing body.hits.hits array".to_string(),
        })
    }

    /// Requested page size; the catalog treats `limit=0` as a bad request.
    fn page_size(&self) -> usize {
        self.config.page_size.max(1)
    }

    fn next_cursor(&self, page: &CatalogPage) -> Option<PageCursor> {
        let received = page.hits().len();
        if received == 0 || received < self.page_size() {
            return None;
        }
        if let Some(total) = page.total {
            let seen = u64::from(page.cursor.0) * self.page_size() as u64;
            if seen >= total {
                return None;
            }
        }
        Some(page.cursor.next())
    }
}

#[derive(Debug, Clone, Copy)]
enum PagerState {
    Pending { cursor: PageCursor, remaining: usize },
    Exhausted,
}

/// Lazy, sequential producer of the pages of one series.
///
/// Each page's cursor depends on the previous response, so pages are pulled
/// one at a time. The record budget is applied here: the page that crosses
/// `limit` is trimmed and nothing after it is requested.
pub struct CatalogPager<'a> {
    client: &'a CatalogClient,
    series_id: &'a str,
    state: PagerState,
}

impl<'a> CatalogPager<'a> {
    pub fn new(client: &'a CatalogClient, series_id: &'a str, limit: usize) -> Self {
        Self {
            client,
            series_id,
            state: PagerState::Pending {
                cursor: PageCursor::first(),
                remaining: limit,
            },
        }
    }

    /// Pulls the next page, or `None` once the series or the budget is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<CatalogPage>, FetchError> {
        let (cursor, remaining) = match self.state {
            PagerState::Exhausted => return Ok(None),
            PagerState::Pending { remaining: 0, .. } => {
                self.state = PagerState::Exhausted;
                return Ok(None);
            }
            PagerState::Pending { cursor, remaining } => (cursor, remaining),
        };

        let (mut page, next) = match self.client.fetch_page(self.series_id, cursor).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.state = PagerState::Exhausted;
                return Err(e);
            }
        };

        let kept = page.truncate_hits(remaining);
        let remaining = remaining - kept;
        self.state = match next {
            Some(cursor) if remaining > 0 => PagerState::Pending { cursor, remaining },
            _ => PagerState::Exhausted,
        };
        Ok(Some(page))
    }

    /// Drains the pager into a vector of pages in fetch order.
    pub async fn collect_pages(mut self) -> Result<Vec<CatalogPage>, FetchError> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            info!(
                "Fetched catalog page {} ({} records)",
                page.cursor.0,
                page.hits().len()
            );
            pages.push(page);
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hits(range: std::ops::Range<u32>) -> Value {
        let hits: Vec<Value> = range
            .map(|id| json!({ "_source": { "record": { "naId": id, "title": "t" } } }))
            .collect();
        json!({ "body": { "hits": { "total": { "value": 5 }, "hits": hits } } })
    }

    fn client_for(server: &MockServer, page_size: usize) -> CatalogClient {
        let config = SyncConfig {
            endpoint: format!("{}/api/v2", server.uri()),
            page_size,
            credential: "secret".to_string(),
            retry_base_delay_ms: 1,
            ..SyncConfig::default()
        };
        CatalogClient::new(reqwest::Client::new(), Arc::new(config))
    }

    #[tokio::test]
    async fn test_fetch_page_sends_credential_and_paging_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/records/parentNaId/42"))
            .and(header("x-api-key", "secret"))
            .and(query_param("limit", "2"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(1..3)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let (page, next) = client.fetch_page("42", PageCursor::first()).await.unwrap();

        assert_eq!(page.hits().len(), 2);
        assert_eq!(page.total, Some(5));
        assert_eq!(next, Some(PageCursor(2)));
    }

    #[tokio::test]
    async fn test_zero_page_size_requests_one_record_per_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(1..2)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 0);
        let (page, next) = client.fetch_page("42", PageCursor::first()).await.unwrap();
        assert_eq!(page.hits().len(), 1);
        assert_eq!(next, Some(PageCursor(2)));
    }

    #[tokio::test]
    async fn test_short_page_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(1..2)))
            .mount(&server)
            .await;

        let client = client_for(&server, 3);
        let (_, next) = client.fetch_page("42", PageCursor::first()).await.unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let err = client
            .fetch_page("42", PageCursor::first())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Fatal { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(1..2)))
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let (page, _) = client.fetch_page("42", PageCursor::first()).await.unwrap();
        assert_eq!(page.hits().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_server_error_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let err = client
            .fetch_page("42", PageCursor::first())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // One initial attempt plus the configured retries.
        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1 + SyncConfig::default().max_fetch_retries);
    }

    #[tokio::test]
    async fn test_pager_stops_at_limit_and_trims_last_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(1..3)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(3..5)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(5..6)))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let pages = CatalogPager::new(&client, "42", 3)
            .collect_pages()
            .await
            .unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].hits().len(), 2);
        assert_eq!(pages[1].hits().len(), 1);
    }

    #[tokio::test]
    async fn test_pager_with_zero_limit_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(1..3)))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let pages = CatalogPager::new(&client, "42", 0)
            .collect_pages()
            .await
            .unwrap();
        assert!(pages.is_empty());
    }

    #[test]
    fn test_page_without_hits_array_is_rejected() {
        let body = json!({ "body": { "hits": { "total": 0 } } });
        assert!(CatalogPage::from_body(PageCursor::first(), body).is_none());
    }
}
