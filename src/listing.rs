//! Directory listing order and pagination
//!
//! Every backend collects `FileEntry` values its own way and hands them to
//! [`paginate`], so ordering and page boundaries are identical across
//! backends.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_LIST_LIMIT;
use crate::error::{GatewayError, Result};

/// Sort key for directory listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    /// Lexicographic ascending by name
    #[default]
    Filename,
    /// Most recently modified first
    Datetime,
}

/// A regular file found in a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Modification time in milliseconds since the Unix epoch
    pub modified_ms: i64,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, modified_ms: i64) -> Self {
        Self {
            name: name.into(),
            modified_ms,
        }
    }
}

/// Parameters of a `list_files` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    /// Directory to list; empty means the handler's current directory
    pub directory: String,
    pub limit: usize,
    pub offset: usize,
    pub order_by: OrderBy,
}

impl ListRequest {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            order_by: OrderBy::Filename,
        }
    }

    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn ordered_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(GatewayError::invalid_params("limit must be at least 1"));
        }
        Ok(())
    }
}

/// One page of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListing {
    pub items: Vec<String>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub total_pages: usize,
    pub response_id: String,
}

/// Sort entries in place by the requested key.
///
/// Datetime ties fall back to name order so repeated listings page the same
/// way.
pub fn sort_entries(entries: &mut [FileEntry], order_by: OrderBy) {
    match order_by {
        OrderBy::Filename => entries.sort_by(|a, b| a.name.cmp(&b.name)),
        OrderBy::Datetime => entries.sort_by(|a, b| {
            b.modified_ms
                .cmp(&a.modified_ms)
                .then_with(|| a.name.cmp(&b.name))
        }),
    }
}

/// Sort `entries` and cut the page `[offset, offset + limit)`.
///
/// A zero limit yields an empty page with no pages in total.
pub fn paginate(mut entries: Vec<FileEntry>, request: &ListRequest) -> FileListing {
    let limit = request.limit;
    let total = entries.len();

    sort_entries(&mut entries, request.order_by);

    let items = entries
        .into_iter()
        .skip(request.offset)
        .take(limit)
        .map(|entry| entry.name)
        .collect();

    FileListing {
        items,
        total,
        limit,
        offset: request.offset,
        total_pages: if limit == 0 { 0 } else { total.div_ceil(limit) },
        response_id: Uuid::new_v4().to_string(),
    }
}
