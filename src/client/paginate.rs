//! Cursor pagination over list endpoints.
//!
//! List endpoints respond with `{items: [...], hasMore: bool}` and take
//! `offset`/`limit` query parameters. The pagination stream drives
//! repeated GETs and re-emits each page's items in order until the
//! server reports no more data. Each call owns its own cursor; two
//! streams over the same endpoint never share state.

use async_stream::try_stream;
use futures_util::Stream;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::Error;

use super::{ConnectionManager, Query};

/// Default page size. One legacy endpoint uses 50; override via
/// [`PageOptions`] when needed.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// What a pagination stream does when a page fetch is rejected with
/// HTTP 429.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Swallow the rejection and fetch the same page again without
    /// advancing the offset. The retried GET goes back through the verb
    /// pipeline, so the limiter's own backoff still paces it.
    RetrySamePage,
    /// Surface the rejection to the caller and end the stream.
    Propagate,
}

/// Pagination tuning for one `list` call.
#[derive(Clone, Copy, Debug)]
pub struct PageOptions {
    /// Items requested per page.
    pub limit: u32,
    /// Behavior on a rate-limited page fetch.
    pub on_rate_limit: RateLimitPolicy,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            on_rate_limit: RateLimitPolicy::RetrySamePage,
        }
    }
}

impl ConnectionManager {
    /// Lazily page through a list endpoint, yielding items in order.
    ///
    /// Caller-supplied params are sent with every page; `offset` and
    /// `limit` are appended by the cursor. Uses [`PageOptions::default`]:
    /// pages of 100, retrying rate-limited fetches without advancing.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use futures_util::TryStreamExt;
    /// # async fn example(conn: &espalier::ConnectionManager) -> Result<(), espalier::Error> {
    /// let mut stream = std::pin::pin!(conn.list("/core/projects", &[]));
    /// while let Some(project) = stream.try_next().await? {
    ///     println!("{project}");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn list<'a>(
        &'a self,
        endpoint: &'a str,
        params: &'a Query,
    ) -> impl Stream<Item = Result<Value, Error>> + 'a {
        self.list_with_options(endpoint, params, PageOptions::default())
    }

    /// [`list`](Self::list) with explicit page size and rate-limit
    /// behavior.
    pub fn list_with_options<'a>(
        &'a self,
        endpoint: &'a str,
        params: &'a Query,
        options: PageOptions,
    ) -> impl Stream<Item = Result<Value, Error>> + 'a {
        try_stream! {
            let limit = u64::from(options.limit);
            let mut offset: u64 = 0;

            loop {
                let mut query: Vec<(String, String)> = params.to_vec();
                query.push(("offset".into(), offset.to_string()));
                query.push(("limit".into(), limit.to_string()));

                let page = match self.get(endpoint, Some(&query), None).await {
                    Ok(page) => page,
                    Err(Error::RateLimitExceeded { .. })
                        if options.on_rate_limit == RateLimitPolicy::RetrySamePage =>
                    {
                        // Same page again; the offset does not advance.
                        debug!(endpoint, offset, "rate limited, retrying page");
                        continue;
                    }
                    Err(e) => Err(e)?,
                };

                let has_more = page
                    .get("hasMore")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::UnexpectedResponse {
                        endpoint: endpoint.to_string(),
                        message: "missing 'hasMore' boolean".into(),
                    })?;
                let items = page
                    .get("items")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::UnexpectedResponse {
                        endpoint: endpoint.to_string(),
                        message: "missing 'items' array".into(),
                    })?;

                trace!(endpoint, offset, count = items.len(), has_more, "page received");

                for item in items {
                    yield item.clone();
                }

                if !has_more {
                    break;
                }
                offset += limit;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_api_contract() {
        let options = PageOptions::default();
        assert_eq!(options.limit, 100);
        assert_eq!(options.on_rate_limit, RateLimitPolicy::RetrySamePage);
    }
}
