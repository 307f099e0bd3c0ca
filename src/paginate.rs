//! Bounded, paged extraction of one table's rows.

use crate::error::ApiError;
use crate::platform::Instance;
use serde_json::Value;
use tracing::{debug, info};

/// Pages between progress log lines.
const LOG_EVERY_PAGES: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRows {
    pub rows: Vec<Value>,
    /// Exact row count reported by the server.
    pub total: Option<u64>,
    /// The ceiling was reached with rows left behind.
    pub truncated: bool,
    pub pages: u32,
}

/// Fetch every row of `table` in pages of `page_size`, stopping at `ceiling` rows.
///
/// Extraction ends on a short page, once the fetched rows reach the exact
/// count, or at the ceiling. A table of exactly `k * page_size` rows with a
/// known count therefore costs `k` requests.
pub async fn fetch_all_rows(
    instance: &dyn Instance,
    table: &str,
    page_size: u64,
    ceiling: u64,
) -> Result<TableRows, ApiError> {
    let page_size = page_size.max(1);
    let mut out = TableRows::default();

    loop {
        let fetched = out.rows.len() as u64;
        let limit = page_size.min(ceiling - fetched);
        let page = instance.fetch_page(table, fetched, limit).await?;
        out.pages += 1;
        if page.total.is_some() {
            out.total = page.total;
        }
        let got = page.rows.len() as u64;
        out.rows.extend(page.rows);
        let fetched = out.rows.len() as u64;

        if got < limit {
            break;
        }
        if out.total.is_some_and(|total| fetched >= total) {
            break;
        }
        if fetched >= ceiling {
            // Without a count we cannot tell whether rows remain; assume they do.
            out.truncated = out.total.map_or(true, |total| total > ceiling);
            break;
        }
        if out.pages % LOG_EVERY_PAGES == 0 {
            info!(table, fetched, total = ?out.total, "extracting table");
        }
    }

    debug!(table, rows = out.rows.len(), pages = out.pages, truncated = out.truncated, "table extracted");
    Ok(out)
}
