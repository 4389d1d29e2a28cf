//! Paginated fetching for cursor (search-after) and offset list endpoints.
//!
//! A [`PageStream`] is single-pass: pages come out in order, each request
//! depends on the previous page, and a finished stream stays finished. The
//! scan ends once the records received reach the declared total count. Under
//! [`TotalCountPolicy::FirstPage`] the total seen on the first page is kept
//! for the whole scan, so records added or removed upstream mid-scan can
//! cause an under- or over-fetch.

use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::{PaginationConfig, TotalCountPolicy};
use crate::transport::{ApiRequest, RequestBody, RetryingTransport};
use crate::{IdnError, IdnResult};

/// How successive pages are addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAddressing {
    /// `searchAfter` taken from `sort_field` of the previous page's last record.
    Cursor { sort_field: String },
    /// `offset` advanced by the number of records actually received.
    Offset,
}

/// Where a page was requested from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePosition {
    /// Cursor sent with the request; `None` for the first page.
    Cursor(Option<String>),
    /// Offset sent with the request.
    Offset(u64),
}

/// One page of raw upstream records.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<Value>,
    /// Total the scan is terminating against.
    pub total_count: u64,
    pub position: PagePosition,
}

/// Lazy, single-pass sequence of pages.
#[derive(Debug)]
pub struct PageStream<'a> {
    transport: &'a RetryingTransport,
    template: ApiRequest,
    addressing: PageAddressing,
    config: PaginationConfig,
    received: u64,
    total: Option<u64>,
    next_cursor: Option<String>,
    next_offset: u64,
    pages_fetched: u32,
    done: bool,
}

impl<'a> PageStream<'a> {
    /// Stream over a search endpoint. `template` must carry a JSON body.
    pub fn cursor(
        transport: &'a RetryingTransport,
        template: ApiRequest,
        sort_field: impl Into<String>,
        config: PaginationConfig,
    ) -> Self {
        Self::new(
            transport,
            template,
            PageAddressing::Cursor {
                sort_field: sort_field.into(),
            },
            config,
        )
    }

    /// Stream over a `limit`/`offset` list endpoint.
    pub fn offset(transport: &'a RetryingTransport, template: ApiRequest, config: PaginationConfig) -> Self {
        Self::new(transport, template, PageAddressing::Offset, config)
    }

    fn new(
        transport: &'a RetryingTransport,
        template: ApiRequest,
        addressing: PageAddressing,
        config: PaginationConfig,
    ) -> Self {
        Self {
            transport,
            template,
            addressing,
            config,
            received: 0,
            total: None,
            next_cursor: None,
            next_offset: 0,
            pages_fetched: 0,
            done: false,
        }
    }

    /// Records received so far.
    #[must_use]
    pub fn records_received(&self) -> u64 {
        self.received
    }

    /// Page requests issued so far.
    #[must_use]
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Whether the stream has ended.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetches the next page, or `None` once the scan is complete.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; the stream is finished afterwards.
    #[instrument(skip(self), fields(url = %self.template.url, page = self.pages_fetched + 1))]
    pub async fn next_page(&mut self) -> IdnResult<Option<Page>> {
        if self.done {
            return Ok(None);
        }

        if self.pages_fetched > 0 && self.config.page_delay_ms > 0 {
            tokio::time::sleep(self.config.page_delay()).await;
        }

        let (records, declared, position) = match self.fetch().await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        self.pages_fetched += 1;
        let count = records.len() as u64;
        self.received += count;
        self.next_offset += count;

        self.total = match self.config.total_count_policy {
            TotalCountPolicy::FirstPage => self.total.or(declared),
            TotalCountPolicy::EveryPage => declared.or(self.total),
        };

        if let PageAddressing::Cursor { ref sort_field } = self.addressing {
            self.next_cursor = records.last().and_then(|r| cursor_value(r, sort_field));
        }

        let limit = u64::from(self.config.page_size);
        self.done = count == 0
            || match self.total {
                Some(total) => self.received >= total,
                None => count < limit,
            }
            || (matches!(self.addressing, PageAddressing::Cursor { .. }) && self.next_cursor.is_none());

        debug!(
            records = count,
            received = self.received,
            total = ?self.total,
            done = self.done,
            "Fetched page"
        );

        Ok(Some(Page {
            records,
            total_count: self.total.unwrap_or(self.received),
            position,
        }))
    }

    /// Drains the stream into one list of records.
    ///
    /// # Errors
    ///
    /// Propagates the first page error.
    pub async fn collect_records(mut self) -> IdnResult<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page.records);
        }
        Ok(all)
    }

    async fn fetch(&self) -> IdnResult<(Vec<Value>, Option<u64>, PagePosition)> {
        let (request, position) = self.page_request()?;
        let response = self.transport.execute(request).await?;
        let declared = response.total_count();
        Ok((response.into_records()?, declared, position))
    }

    fn page_request(&self) -> IdnResult<(ApiRequest, PagePosition)> {
        let mut request = self
            .template
            .clone()
            .query("limit", self.config.page_size)
            .query("count", true);

        let position = match self.addressing {
            PageAddressing::Offset => {
                request = request.query("offset", self.next_offset);
                PagePosition::Offset(self.next_offset)
            }
            PageAddressing::Cursor { .. } => {
                if let Some(ref cursor) = self.next_cursor {
                    match request.body {
                        Some(RequestBody::Json(Value::Object(ref mut body))) => {
                            body.insert(
                                "searchAfter".to_string(),
                                Value::Array(vec![Value::String(cursor.clone())]),
                            );
                        }
                        _ => {
                            return Err(IdnError::Validation(
                                "Cursor pagination requires a JSON object body".to_string(),
                            ))
                        }
                    }
                }
                PagePosition::Cursor(self.next_cursor.clone())
            }
        };

        Ok((request, position))
    }
}

/// Cursor value for a record: its sort field rendered as a string.
fn cursor_value(record: &Value, sort_field: &str) -> Option<String> {
    match record.get(sort_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
