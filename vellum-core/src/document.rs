//! Authoritative document state: segments, versions, and the applied log.
//!
//! ```text
//! ResolvedOp ──► Document::apply() ──► version + 1
//!                      │
//!                      ├── splice segments (clamped, atomic, infallible)
//!                      └── append to the applied-operation log
//! ```
//!
//! A document is an ordered sequence of [`Segment`]s — contiguous runs of a
//! single element kind. `apply` is the only mutator: it advances the version
//! by exactly one per operation and appends the operation, tagged with its
//! resulting version, to an append-only log. Replaying that log from the
//! empty document reproduces the live state exactly (replay determinism).
//!
//! Everything here is synchronous and allocation-light; the coordinator owns
//! one `Document` per live document and readers get [`DocumentSnapshot`]s.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{ElementKind, ElementPayload, OperationId};
use crate::transform::{clamp_resolved, ResolvedKind, ResolvedOp, Span};

/// Per-kind content of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentContent {
    /// A run of characters, one logical unit each.
    Text(String),
    /// A run of image references, one logical unit each.
    Images(Vec<String>),
    /// A repeat count for NewLine / TabSpace runs.
    Run(u64),
}

/// A contiguous run of one element kind.
///
/// Invariant (maintained by `Document`): no two adjacent segments share an
/// element kind, and no segment is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: ElementKind,
    pub content: SegmentContent,
}

impl Segment {
    pub fn text(s: impl Into<String>) -> Self {
        Self { kind: ElementKind::Text, content: SegmentContent::Text(s.into()) }
    }

    pub fn image(source: impl Into<String>) -> Self {
        Self { kind: ElementKind::Image, content: SegmentContent::Images(vec![source.into()]) }
    }

    pub fn newlines(count: u64) -> Self {
        Self { kind: ElementKind::NewLine, content: SegmentContent::Run(count) }
    }

    pub fn tab_spaces(count: u64) -> Self {
        Self { kind: ElementKind::TabSpace, content: SegmentContent::Run(count) }
    }

    /// The segment materializing a single payload.
    pub fn from_payload(payload: &ElementPayload) -> Self {
        match payload {
            ElementPayload::Text(s) => Segment::text(s.clone()),
            ElementPayload::Image(src) => Segment::image(src.clone()),
            ElementPayload::NewLine => Segment::newlines(1),
            ElementPayload::TabSpace => Segment::tab_spaces(1),
        }
    }

    /// Length in logical units.
    pub fn unit_len(&self) -> u64 {
        match &self.content {
            SegmentContent::Text(s) => s.chars().count() as u64,
            SegmentContent::Images(sources) => sources.len() as u64,
            SegmentContent::Run(count) => *count,
        }
    }

    /// Sub-segment covering units `[from, to)` of this segment, or `None`
    /// if the range is empty. `from`/`to` are clamped to the segment.
    fn slice(&self, from: u64, to: u64) -> Option<Segment> {
        let len = self.unit_len();
        let from = from.min(len);
        let to = to.min(len);
        if from >= to {
            return None;
        }
        let content = match &self.content {
            SegmentContent::Text(s) => SegmentContent::Text(
                s.chars()
                    .skip(from as usize)
                    .take((to - from) as usize)
                    .collect(),
            ),
            SegmentContent::Images(sources) => {
                SegmentContent::Images(sources[from as usize..to as usize].to_vec())
            }
            SegmentContent::Run(_) => SegmentContent::Run(to - from),
        };
        Some(Segment { kind: self.kind, content })
    }

    /// Absorb `other` into this segment. Caller guarantees matching kinds.
    fn merge(&mut self, other: Segment) {
        match (&mut self.content, other.content) {
            (SegmentContent::Text(a), SegmentContent::Text(b)) => a.push_str(&b),
            (SegmentContent::Images(a), SegmentContent::Images(b)) => a.extend(b),
            (SegmentContent::Run(a), SegmentContent::Run(b)) => *a += b,
            _ => unreachable!("segment kinds matched but content shapes differ"),
        }
    }
}

/// A log entry: an applied operation tagged with the version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOp {
    pub version: u64,
    pub op: ResolvedOp,
}

/// Published, versioned, read-only view of a document.
///
/// The only way components outside the owning coordinator may observe
/// document state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document_id: Uuid,
    pub version: u64,
    pub segments: Vec<Segment>,
}

impl DocumentSnapshot {
    /// Total length in logical units.
    pub fn unit_len(&self) -> u64 {
        self.segments.iter().map(Segment::unit_len).sum()
    }
}

/// The authoritative state of one document.
pub struct Document {
    id: Uuid,
    version: u64,
    segments: Vec<Segment>,
    /// Append-only; entry `i` produced version `log_start + i + 1`.
    log: Vec<AppliedOp>,
    /// Version of the state preceding the first in-memory log entry.
    /// Non-zero after restoring from a persisted snapshot.
    log_start: u64,
    /// Operation id → version it produced, for idempotent acknowledgment.
    applied_index: HashMap<OperationId, u64>,
}

impl Document {
    /// A fresh, empty document at version 0.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            segments: Vec::new(),
            log: Vec::new(),
            log_start: 0,
            applied_index: HashMap::new(),
        }
    }

    /// Rebuild from a persisted snapshot. The in-memory log tail starts at
    /// `version`; operations based earlier need a client resync.
    pub fn restore(id: Uuid, version: u64, segments: Vec<Segment>) -> Self {
        Self {
            id,
            version,
            segments,
            log: Vec::new(),
            log_start: version,
            applied_index: HashMap::new(),
        }
    }

    /// Replay a log from the empty document.
    pub fn replay(id: Uuid, log: &[AppliedOp]) -> Self {
        let mut doc = Document::new(id);
        for entry in log {
            doc.apply(entry.op.clone());
        }
        doc
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Total length in logical units.
    pub fn unit_len(&self) -> u64 {
        self.segments.iter().map(Segment::unit_len).sum()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn log(&self) -> &[AppliedOp] {
        &self.log
    }

    /// Version of the oldest state the in-memory log can rebase against.
    pub fn log_start_version(&self) -> u64 {
        self.log_start
    }

    /// Log entries with version > `base_version`, in log order — the
    /// transform basis for a late-arriving operation.
    ///
    /// Caller must ensure `base_version >= log_start_version()`.
    pub fn log_since(&self, base_version: u64) -> &[AppliedOp] {
        let skip = base_version.saturating_sub(self.log_start) as usize;
        &self.log[skip.min(self.log.len())..]
    }

    /// The version a previously applied operation produced, if any.
    pub fn applied_version_of(&self, id: &OperationId) -> Option<u64> {
        self.applied_index.get(id).copied()
    }

    /// The log entry for a previously applied operation, if still in memory.
    pub fn applied(&self, id: &OperationId) -> Option<&AppliedOp> {
        let version = self.applied_version_of(id)?;
        if version <= self.log_start {
            return None;
        }
        self.log.get((version - self.log_start - 1) as usize)
    }

    /// Published, versioned snapshot for external readers.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: self.id,
            version: self.version,
            segments: self.segments.clone(),
        }
    }

    /// Apply one already-transformed, already-ordered operation.
    ///
    /// The only mutator of document content. Atomic (no suspension points),
    /// infallible (residual out-of-range positions are clamped), advances
    /// the version by exactly one and appends the clamped operation to the
    /// log. Returns the new version.
    pub fn apply(&mut self, op: ResolvedOp) -> u64 {
        let kind = clamp_resolved(&op.kind, self.unit_len());
        match &kind {
            ResolvedKind::Insert { position, payload } => self.splice_insert(*position, payload),
            ResolvedKind::Update { position, payload } => self.splice_update(*position, payload),
            ResolvedKind::Delete { spans } => self.splice_delete(spans),
            ResolvedKind::Noop => {}
        }
        self.version += 1;
        log::debug!(
            "doc {} applied op {} -> version {}",
            self.id,
            op.id,
            self.version
        );
        let stored = ResolvedOp { kind, ..op };
        self.applied_index.insert(stored.id, self.version);
        self.log.push(AppliedOp { version: self.version, op: stored });
        self.version
    }

    fn splice_insert(&mut self, position: u64, payload: &ElementPayload) {
        let new_segment = Segment::from_payload(payload);
        let mut out: Vec<Segment> = Vec::with_capacity(self.segments.len() + 2);
        let mut remaining = position;
        let mut inserted = false;

        for segment in self.segments.drain(..) {
            if inserted {
                push_merged(&mut out, segment);
                continue;
            }
            let len = segment.unit_len();
            if remaining >= len {
                remaining -= len;
                push_merged(&mut out, segment);
                continue;
            }
            if let Some(prefix) = segment.slice(0, remaining) {
                push_merged(&mut out, prefix);
            }
            push_merged(&mut out, new_segment.clone());
            if let Some(suffix) = segment.slice(remaining, len) {
                push_merged(&mut out, suffix);
            }
            inserted = true;
        }
        if !inserted {
            push_merged(&mut out, new_segment);
        }
        self.segments = out;
    }

    fn splice_delete(&mut self, spans: &[Span]) {
        let mut out: Vec<Segment> = Vec::with_capacity(self.segments.len());
        let mut offset = 0u64;

        for segment in self.segments.drain(..) {
            let seg_start = offset;
            let seg_end = offset + segment.unit_len();
            offset = seg_end;

            // Subtract every overlapping span from this segment's range.
            let mut kept: Vec<(u64, u64)> = vec![(seg_start, seg_end)];
            for span in spans {
                if span.position >= seg_end || span.end() <= seg_start {
                    continue;
                }
                let mut next = Vec::with_capacity(kept.len() + 1);
                for (a, b) in kept {
                    let cut_start = a.max(span.position);
                    let cut_end = b.min(span.end());
                    if cut_start >= cut_end {
                        next.push((a, b));
                        continue;
                    }
                    if a < cut_start {
                        next.push((a, cut_start));
                    }
                    if cut_end < b {
                        next.push((cut_end, b));
                    }
                }
                kept = next;
            }

            for (a, b) in kept {
                if let Some(piece) = segment.slice(a - seg_start, b - seg_start) {
                    push_merged(&mut out, piece);
                }
            }
        }
        self.segments = out;
    }

    fn splice_update(&mut self, position: u64, payload: &ElementPayload) {
        self.splice_delete(&[Span::new(position, 1)]);
        self.splice_insert(position, payload);
    }
}

/// Append, merging into the previous segment when kinds match so the
/// no-adjacent-same-kind invariant holds without a separate pass.
fn push_merged(out: &mut Vec<Segment>, segment: Segment) {
    if segment.unit_len() == 0 {
        return;
    }
    match out.last_mut() {
        Some(last) if last.kind == segment.kind => last.merge(segment),
        _ => out.push(segment),
    }
}
