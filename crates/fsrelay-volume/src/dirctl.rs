//! Directory enumeration
//!
//! A query is answered from a snapshot of the whole directory when the
//! DirInfo cache can hold one. The snapshot is pinned on the handle, so a
//! scan keeps reading the listing it started with while a cursor walks
//! it. Queries the snapshot cannot serve (single-name lookups, patterns
//! the remote filters, scans resuming after a partial listing) go to the
//! remote and copy straight out of the reply.
//!
//! ```text
//!   query ──▶ pinned hint? ──yes──▶ copy from cursor
//!                 │no
//!                 ▼
//!            owner slot hit? ──yes──▶ pin, copy after marker
//!                 │no
//!                 ▼
//!            fetch from start ──complete──▶ cache, pin, copy
//!                 │partial
//!                 ▼
//!            copy directly, resume from the remote by marker
//! ```

use crate::answer::{AnswerWriter, DirInfoClass};
use crate::node::Node;
use crate::pattern::{Pattern, dir_order};
use crate::sizing::SizingRule;
use crate::volume::Volume;
use bytes::Bytes;
use fsrelay_common::{Error, MetaKind, OpKind, Result};
use fsrelay_meta::{BorrowedItem, MetaCache};
use fsrelay_proto::{DIR_TERMINATOR_SIZE, DirEntries, DirEntry, RequestBuilder, Response};
use fsrelay_transact::SubmitTimeout;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Query flag: field 1 holds the name to resume after
pub const QUERY_MARKER_NAME: u64 = 0x1;
/// Query flag: param 1 holds the token to resume after
pub const QUERY_MARKER_OFFSET: u64 = 0x2;

/// Where a scan resumes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Marker {
    /// The last name returned
    Name(String),
    /// The remote's resume token for the entry after the last one returned
    Offset(u64),
}

impl Marker {
    fn of(entry: &DirEntry<'_>, as_offset: bool) -> Self {
        if as_offset {
            Self::Offset(entry.next_offset)
        } else {
            Self::Name(entry.name.to_string())
        }
    }

    /// Whether `entry` sorts after this marker
    fn is_before(&self, entry: &DirEntry<'_>, case_sensitive: bool) -> bool {
        match self {
            Self::Name(name) => dir_order(entry.name, name, case_sensitive) == Ordering::Greater,
            Self::Offset(token) => entry.next_offset > *token,
        }
    }
}

/// One directory query call
#[derive(Clone, Copy, Debug)]
pub struct DirQuery<'a> {
    /// Filter; taken on the first call of a scan or on restart
    pub pattern: Option<&'a str>,
    /// Rewind the scan to the first entry
    pub restart: bool,
    /// Return at most one entry
    pub single_entry: bool,
    pub class: DirInfoClass,
}

impl Default for DirQuery<'_> {
    fn default() -> Self {
        Self {
            pattern: None,
            restart: false,
            single_entry: false,
            class: DirInfoClass::Directory,
        }
    }
}

#[derive(Debug)]
enum Snapshot {
    Cached(BorrowedItem),
    /// A complete listing that could not be cached
    Fetched(Bytes),
}

impl Snapshot {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Cached(item) => item,
            Self::Fetched(bytes) => bytes,
        }
    }
}

/// A snapshot pinned by a scan
#[derive(Debug)]
struct CacheHint {
    snapshot: Snapshot,
    /// Offset of the next entry; `None` until the marker was applied
    cursor: Option<usize>,
}

/// Scan state of one open directory handle
#[derive(Debug)]
pub struct DirHandle {
    node: Arc<Node>,
    pattern: Option<Pattern>,
    marker: Option<Marker>,
    hint: Option<CacheHint>,
    matched: bool,
    consecutive_misses: u32,
    primed: bool,
}

impl DirHandle {
    const fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            pattern: None,
            marker: None,
            hint: None,
            matched: false,
            consecutive_misses: 0,
            primed: false,
        }
    }

    #[must_use]
    pub const fn node(&self) -> &Arc<Node> {
        &self.node
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(Pattern::as_str)
    }

    #[must_use]
    pub const fn marker(&self) -> Option<&Marker> {
        self.marker.as_ref()
    }

    /// Whether the scan holds a snapshot
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.hint.is_some()
    }

    fn restart(&mut self) {
        self.marker = None;
        self.hint = None;
        self.matched = false;
    }
}

/// Result of walking a listing into an answer buffer
#[derive(Debug, Default)]
struct Copied {
    entries: usize,
    /// Size of the first matching entry that did not fit
    required: Option<usize>,
    cursor: usize,
    /// The walk reached the listing terminator
    complete: bool,
    last: Option<Marker>,
    /// Marker of the last entry looked at, matched or not
    last_seen: Option<Marker>,
}

impl Copied {
    /// Nothing was delivered but the listing has more beyond what was fetched
    const fn ran_dry(&self) -> bool {
        self.entries == 0 && self.required.is_none() && !self.complete
    }
}

struct CopyParams<'p> {
    pattern: &'p Pattern,
    case_sensitive: bool,
    as_offset: bool,
    single_entry: bool,
}

/// Copy matching entries from `listing` into `answer`, starting at byte
/// `start` and skipping entries up to `after`
fn copy_out(
    listing: &[u8],
    start: usize,
    mut after: Option<&Marker>,
    params: &CopyParams<'_>,
    answer: &mut AnswerWriter<'_>,
) -> Copied {
    let mut entries = DirEntries::starting_at(listing, start);
    let mut out = Copied {
        cursor: start,
        ..Copied::default()
    };
    loop {
        let entry = match entries.next() {
            Some(Ok(entry)) => entry,
            Some(Err(e)) => {
                warn!("directory listing ends early: {e}");
                break;
            }
            None => break,
        };
        if let Some(marker) = after {
            if !marker.is_before(&entry, params.case_sensitive) {
                out.cursor = entries.position();
                continue;
            }
            after = None;
        }
        out.last_seen = Some(Marker::of(&entry, params.as_offset));
        if !params.pattern.is_match(entry.name) {
            out.cursor = entries.position();
            continue;
        }
        if !answer.push(&entry) {
            out.required = Some(answer.class().entry_size(entry.name));
            return out;
        }
        out.entries += 1;
        out.last = Some(Marker::of(&entry, params.as_offset));
        out.cursor = entries.position();
        if params.single_entry {
            return out;
        }
    }
    out.complete = entries.is_complete();
    out
}

fn is_complete_listing(listing: &[u8]) -> bool {
    let mut entries = DirEntries::new(listing);
    for _ in &mut entries {}
    entries.is_complete()
}

/// Settle a call once entries were copied (or none could be)
fn conclude(handle: &mut DirHandle, copied: Copied, answer: &AnswerWriter<'_>) -> Result<usize> {
    if let Some(last) = copied.last {
        handle.marker = Some(last);
    }
    if copied.entries > 0 {
        handle.matched = true;
        return Ok(answer.len());
    }
    if let Some(required) = copied.required {
        handle.matched = true;
        return Err(Error::BufferTooSmall {
            required,
            available: answer.capacity(),
        });
    }
    Err(if handle.matched {
        Error::NoMoreEntries
    } else {
        Error::NoSuchEntry
    })
}

impl Volume {
    /// Open a directory for enumeration
    pub fn open_directory(&self, path: &str) -> DirHandle {
        DirHandle::new(self.open_node(path))
    }

    /// Close an enumeration handle, releasing any pinned snapshot
    pub fn close_directory(&self, handle: DirHandle) {
        let DirHandle { node, hint, .. } = handle;
        drop(hint);
        self.close_node(&node);
    }

    /// Copy the next entries of a scan into `target`.
    ///
    /// Returns the bytes written. Fails with `BufferTooSmall` if not even
    /// one entry fits, and with `NoMoreEntries` at the end of the scan
    /// (`NoSuchEntry` if the scan never matched anything).
    pub fn query_directory(&self, handle: &mut DirHandle, query: &DirQuery<'_>, target: &mut [u8]) -> Result<usize> {
        let case_sensitive = self.config().volume.case_sensitive_search;
        if query.restart {
            handle.restart();
        }
        if let Some(text) = query.pattern
            && (query.restart || handle.pattern.is_none())
        {
            handle.pattern = Some(Pattern::new(text, case_sensitive));
        }
        let pattern = handle
            .pattern
            .get_or_insert_with(|| Pattern::new("*", case_sensitive))
            .clone();

        let directory = &self.config().directory;
        let lookup = directory.allow_name_lookup && !pattern.has_wildcards();
        let pass_pattern = lookup || (directory.pass_query_pattern && !pattern.matches_all());
        let params = CopyParams {
            pattern: &pattern,
            case_sensitive,
            as_offset: directory.marker_as_next_offset,
            single_entry: query.single_entry,
        };
        let mut answer = AnswerWriter::new(target, query.class);

        match self.cache(MetaKind::DirInfo) {
            Some(cache) if !pass_pattern => self.scan_cached(handle, cache, &params, &mut answer),
            _ => {
                let rule = if lookup {
                    SizingRule::Lookup
                } else {
                    Self::miss_rule(handle, pass_pattern)
                };
                let passed = pass_pattern.then_some(pattern.as_str());
                self.scan_remote(handle, rule, passed, &params, &mut answer)
            }
        }
    }

    const fn miss_rule(handle: &DirHandle, pass_pattern: bool) -> SizingRule {
        if pass_pattern || (handle.primed && handle.consecutive_misses == 1) {
            SizingRule::Scaled
        } else {
            SizingRule::Full
        }
    }

    fn scan_cached(
        &self,
        handle: &mut DirHandle,
        cache: &MetaCache,
        params: &CopyParams<'_>,
        answer: &mut AnswerWriter<'_>,
    ) -> Result<usize> {
        let mut hint = match handle.hint.take() {
            Some(hint) => hint,
            None => {
                if let Some(item) = handle.node.cached(cache, MetaKind::DirInfo) {
                    handle.consecutive_misses = 0;
                    handle.primed = true;
                    CacheHint {
                        snapshot: Snapshot::Cached(item),
                        cursor: None,
                    }
                } else {
                    handle.consecutive_misses += 1;
                    let rule = Self::miss_rule(handle, false);
                    if handle.marker.is_some() {
                        // a snapshot taken now would not match what was already returned
                        return self.scan_remote(handle, rule, None, params, answer);
                    }
                    match self.fetch_snapshot(handle, cache, rule, answer)? {
                        Ok(hint) => hint,
                        Err(partial) => return self.copy_partial(handle, rule, &partial, params, answer),
                    }
                }
            }
        };

        let (start, after) = match hint.cursor {
            Some(cursor) => (cursor, None),
            None => (0, handle.marker.as_ref()),
        };
        let copied = copy_out(hint.snapshot.as_slice(), start, after, params, answer);
        hint.cursor = Some(copied.cursor);
        handle.hint = Some(hint);
        conclude(handle, copied, answer)
    }

    /// Fetch the whole directory; a complete listing becomes the node's
    /// cached snapshot, a partial one is handed back
    fn fetch_snapshot(
        &self,
        handle: &mut DirHandle,
        cache: &MetaCache,
        rule: SizingRule,
        answer: &AnswerWriter<'_>,
    ) -> Result<std::result::Result<CacheHint, Bytes>> {
        let node = &handle.node;
        let size = self.sizing().request_size(rule, answer.capacity(), answer.class());
        let seen = node.change_number(MetaKind::DirInfo);
        let listing = self.fetch_listing(node, size, None, None)?;
        if !is_complete_listing(&listing) {
            trace!("listing of {} is partial ({} bytes); not cached", node.path(), listing.len());
            return Ok(Err(listing));
        }

        let snapshot = match node.populate(cache, MetaKind::DirInfo, seen, listing.clone()) {
            Ok(Some(item)) => {
                handle.primed = true;
                Snapshot::Cached(item)
            }
            Ok(None) => {
                debug!("{} changed while listing; snapshot not cached", node.path());
                Snapshot::Fetched(listing)
            }
            Err(e) => {
                debug!("listing of {} not cached: {e}", node.path());
                Snapshot::Fetched(listing)
            }
        };
        Ok(Ok(CacheHint {
            snapshot,
            cursor: None,
        }))
    }

    /// Serve from a partial listing fetched from the start of the directory
    fn copy_partial(
        &self,
        handle: &mut DirHandle,
        rule: SizingRule,
        listing: &[u8],
        params: &CopyParams<'_>,
        answer: &mut AnswerWriter<'_>,
    ) -> Result<usize> {
        let copied = copy_out(listing, 0, None, params, answer);
        if copied.ran_dry()
            && let Some(seen) = copied.last_seen
        {
            handle.marker = Some(seen);
            return self.scan_remote(handle, rule, None, params, answer);
        }
        conclude(handle, copied, answer)
    }

    /// Serve by asking the remote for entries after the handle's marker
    fn scan_remote(
        &self,
        handle: &mut DirHandle,
        rule: SizingRule,
        pattern: Option<&str>,
        params: &CopyParams<'_>,
        answer: &mut AnswerWriter<'_>,
    ) -> Result<usize> {
        let size = self.sizing().request_size(rule, answer.capacity(), answer.class());
        loop {
            let listing = self.fetch_listing(&handle.node, size, pattern, handle.marker.as_ref())?;
            let copied = copy_out(&listing, 0, handle.marker.as_ref(), params, answer);
            if copied.ran_dry() {
                match copied.last_seen {
                    // every entry returned was filtered out; ask for the next batch
                    Some(seen) if handle.marker.as_ref() != Some(&seen) => {
                        handle.marker = Some(seen);
                        continue;
                    }
                    _ => warn!("listing of {} did not advance; ending scan", handle.node.path()),
                }
            }
            return conclude(handle, copied, answer);
        }
    }

    fn fetch_listing(&self, node: &Node, size: usize, pattern: Option<&str>, marker: Option<&Marker>) -> Result<Bytes> {
        let mut request = RequestBuilder::new(OpKind::QueryDirectory)
            .user_context(node.key().as_u64(), 0)
            .file_name(node.path())
            .param(0, size as u64);
        if let Some(pattern) = pattern {
            request = request.field(0, pattern.to_string());
        }
        match marker {
            Some(Marker::Name(name)) => {
                request = request.param(2, QUERY_MARKER_NAME).field(1, name.clone());
            }
            Some(Marker::Offset(token)) => {
                request = request.param(1, *token).param(2, QUERY_MARKER_OFFSET);
            }
            None => {}
        }

        trace!("querying {} for {size} bytes after {marker:?}", node.path());
        match self
            .submit(request.build()?, SubmitTimeout::Default)
            .and_then(Response::into_result)
        {
            Ok(response) => response.field_bytes(0),
            // an exhausted scan is an empty, complete listing
            Err(Error::NoMoreEntries) => Ok(Bytes::from_static(&[0; DIR_TERMINATOR_SIZE])),
            Err(e) => Err(e),
        }
    }
}
