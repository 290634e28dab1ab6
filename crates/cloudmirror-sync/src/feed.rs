//! Lazy feed of remote records for one synchronization pass
//!
//! A [`RecordFeed`] pages through the remote on demand and yields one
//! [`FeedItem`] at a time. Two modes:
//!
//! - **Full listing** (no continuation token): fetch the change marker
//!   *first*, then the root record through the `root` alias, then every
//!   listing page. Trashed records are skipped. Changes made while the
//!   listing runs are picked up by the next incremental pass, because the
//!   marker predates them.
//! - **Incremental** (continuation token): page through the change feed. A
//!   live record with `trashed` set is a tombstone. The last page's new
//!   marker becomes the next continuation token.
//!
//! Every page is fetched through the [`RetryingInvoker`].

use std::collections::VecDeque;

use cloudmirror_core::domain::{ContinuationToken, EntryId, MirrorError};
use cloudmirror_core::ports::{ChangeRecord, RemoteRecord, RECORD_FIELDS};
use cloudmirror_remote::RetryingInvoker;
use tracing::{debug, warn};

/// Which kind of pass a feed drives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    #[default]
    Full,
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// One element yielded by the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    /// Current state of an entry
    Live(RemoteRecord),
    /// The entry no longer exists
    Tombstone(EntryId),
}

impl FeedItem {
    pub fn id(&self) -> &EntryId {
        match self {
            FeedItem::Live(record) => &record.id,
            FeedItem::Tombstone(id) => id,
        }
    }
}

#[derive(Debug)]
enum Cursor {
    /// Marker and root not fetched yet
    FullStart,
    /// Next listing page; `None` is the first page
    Listing(Option<String>),
    /// Next change page
    Changes(String),
    Done,
}

/// Async pager over the listing or the change feed
#[derive(Debug)]
pub struct RecordFeed {
    invoker: RetryingInvoker,
    mode: SyncMode,
    cursor: Cursor,
    pending: VecDeque<FeedItem>,
    start_token: Option<ContinuationToken>,
    final_token: Option<ContinuationToken>,
    pages_fetched: u32,
    trashed_skipped: usize,
}

impl RecordFeed {
    /// Feed for a full listing
    pub fn full(invoker: RetryingInvoker) -> Self {
        Self::with_cursor(invoker, SyncMode::Full, Cursor::FullStart, None)
    }

    /// Feed of the changes since `token`
    pub fn incremental(invoker: RetryingInvoker, token: ContinuationToken) -> Self {
        let cursor = Cursor::Changes(token.as_str().to_string());
        Self::with_cursor(invoker, SyncMode::Incremental, cursor, Some(token))
    }

    fn with_cursor(
        invoker: RetryingInvoker,
        mode: SyncMode,
        cursor: Cursor,
        start_token: Option<ContinuationToken>,
    ) -> Self {
        Self {
            invoker,
            mode,
            cursor,
            pending: VecDeque::new(),
            start_token,
            final_token: None,
            pages_fetched: 0,
            trashed_skipped: 0,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Continuation token for the next pass, known once the feed is exhausted
    pub fn final_token(&self) -> Option<&ContinuationToken> {
        self.final_token.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.cursor, Cursor::Done) && self.pending.is_empty()
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Trashed records dropped from a full listing
    pub fn trashed_skipped(&self) -> usize {
        self.trashed_skipped
    }

    /// Next item, fetching pages as needed. `Ok(None)` once exhausted.
    pub async fn next(&mut self) -> Result<Option<FeedItem>, MirrorError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }

            match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::FullStart => self.fetch_marker_and_root().await?,
                Cursor::Listing(page_token) => self.fetch_listing_page(page_token).await?,
                Cursor::Changes(page_token) => self.fetch_change_page(page_token).await?,
                Cursor::Done => return Ok(None),
            }
        }
    }

    async fn fetch_marker_and_root(&mut self) -> Result<(), MirrorError> {
        let remote = self.invoker.remote();

        let marker = self
            .invoker
            .invoke_required("get_change_marker", "change marker", || {
                remote.get_change_marker()
            })
            .await?;
        debug!(marker = %marker, "Captured change marker before listing");
        self.final_token = Some(marker);

        let root_alias = EntryId::root_alias();
        let root = self
            .invoker
            .invoke_required("get_entry", &root_alias, || {
                remote.get_entry(&root_alias, RECORD_FIELDS)
            })
            .await?;
        self.pending.push_back(FeedItem::Live(root));

        self.cursor = Cursor::Listing(None);
        Ok(())
    }

    async fn fetch_listing_page(&mut self, page_token: Option<String>) -> Result<(), MirrorError> {
        let remote = self.invoker.remote();
        let label = page_token.as_deref().unwrap_or("first page").to_string();

        let page = self
            .invoker
            .invoke_required("list_entries", &label, || {
                remote.list_entries(page_token.as_deref(), RECORD_FIELDS)
            })
            .await?;
        self.pages_fetched += 1;

        let total = page.records.len();
        for record in page.records {
            if record.trashed {
                self.trashed_skipped += 1;
                continue;
            }
            self.pending.push_back(FeedItem::Live(record));
        }
        debug!(
            page = self.pages_fetched,
            records = total,
            has_more = page.next_page_token.is_some(),
            "Fetched listing page"
        );

        self.cursor = match page.next_page_token {
            Some(next) => Cursor::Listing(Some(next)),
            None => Cursor::Done,
        };
        Ok(())
    }

    async fn fetch_change_page(&mut self, page_token: String) -> Result<(), MirrorError> {
        let remote = self.invoker.remote();

        let page = self
            .invoker
            .invoke_required("list_changes", &page_token, || {
                remote.list_changes(&page_token, RECORD_FIELDS)
            })
            .await?;
        self.pages_fetched += 1;

        let total = page.changes.len();
        for change in page.changes {
            let item = match change {
                ChangeRecord::Tombstone(id) => FeedItem::Tombstone(id),
                ChangeRecord::Live(record) if record.trashed => FeedItem::Tombstone(record.id),
                ChangeRecord::Live(record) => FeedItem::Live(record),
            };
            self.pending.push_back(item);
        }
        debug!(
            page = self.pages_fetched,
            changes = total,
            has_more = page.next_page_token.is_some(),
            "Fetched change page"
        );

        match page.next_page_token {
            Some(next) => self.cursor = Cursor::Changes(next),
            None => {
                self.final_token = match page.new_marker {
                    Some(marker) => Some(marker),
                    None => {
                        warn!("Last change page carried no new marker, keeping the previous token");
                        self.start_token.clone()
                    }
                };
                self.cursor = Cursor::Done;
            }
        }
        Ok(())
    }
}
