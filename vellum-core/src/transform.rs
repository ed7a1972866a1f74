//! Operational transformation of concurrent edits.
//!
//! Rebasing model:
//! ```text
//! client op (base_version = V)
//!        │
//!        ▼
//! ResolvedOp::from_operation()
//!        │
//!        ▼  for each log entry with version > V, in log order
//! transform(incoming, applied) ──► new ResolvedOp (derived value)
//!        │
//!        ▼
//! Document::apply()  (clamps residual out-of-range positions)
//! ```
//!
//! `transform(A, B)` rewrites A — not yet applied — against the already
//! applied B so that both arrival orders of a concurrent pair produce the
//! same document. It is pure and total: for well-formed same-base inputs it
//! never fails, and positions that drift out of range after repeated
//! rebasing are clamped at apply time rather than rejected.
//!
//! Conflict policy: positional transformation for Insert/Delete (all element
//! kinds — positions are kind-agnostic), Last-Write-Wins for Update/Update
//! conflicts on the same unit. Replacing an atomic reference (an image
//! source) is not composable, so intent preservation buys nothing there.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{ElementKind, ElementPayload, OpKind, Operation, OperationId};

/// A contiguous range of logical units: `[position, position + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub position: u64,
    pub length: u64,
}

impl Span {
    pub fn new(position: u64, length: u64) -> Self {
        Self { position, length }
    }

    /// One past the last covered unit.
    pub fn end(&self) -> u64 {
        self.position + self.length
    }
}

/// The rebased form of an operation.
///
/// A delete may have been split into several disjoint spans by concurrent
/// inserts landing inside its range; the spans are applied atomically as one
/// operation so the version still advances by exactly one. An operation
/// whose effect was entirely cancelled becomes `Noop` — still applied and
/// logged, so both arrival orders agree on the final version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolvedKind {
    Insert { position: u64, payload: ElementPayload },
    Update { position: u64, payload: ElementPayload },
    Delete { spans: Vec<Span> },
    Noop,
}

/// An operation after rebasing — a new derived value, never a mutation of
/// the original [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOp {
    pub id: OperationId,
    pub document_id: Uuid,
    pub element_kind: ElementKind,
    pub timestamp: u64,
    pub kind: ResolvedKind,
}

impl ResolvedOp {
    /// Lift a freshly validated client operation into resolved form.
    pub fn from_operation(op: &Operation) -> Self {
        let kind = match &op.kind {
            OpKind::Insert(payload) => ResolvedKind::Insert {
                position: op.position,
                payload: payload.clone(),
            },
            OpKind::Update(payload) => ResolvedKind::Update {
                position: op.position,
                payload: payload.clone(),
            },
            OpKind::Delete { length } => ResolvedKind::Delete {
                spans: vec![Span::new(op.position, *length)],
            },
        };
        Self {
            id: op.id,
            document_id: op.document_id,
            element_kind: op.element_kind,
            timestamp: op.timestamp,
            kind,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.id.client_id
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.kind, ResolvedKind::Noop)
    }
}

/// Transform `incoming` (not yet applied) against `applied` (already in the
/// log). Returns a new derived operation; neither argument is mutated.
pub fn transform(incoming: &ResolvedOp, applied: &ResolvedOp) -> ResolvedOp {
    let kind = match &incoming.kind {
        ResolvedKind::Noop => ResolvedKind::Noop,
        _ if applied.is_noop() => incoming.kind.clone(),
        ResolvedKind::Insert { position, payload } => {
            transform_insert(*position, payload, incoming, applied)
        }
        ResolvedKind::Update { position, payload } => {
            transform_update(*position, payload, incoming, applied)
        }
        ResolvedKind::Delete { spans } => transform_delete(spans, applied),
    };
    ResolvedOp {
        kind,
        ..incoming.clone()
    }
}

fn transform_insert(
    position: u64,
    payload: &ElementPayload,
    incoming: &ResolvedOp,
    applied: &ResolvedOp,
) -> ResolvedKind {
    let position = match &applied.kind {
        ResolvedKind::Insert { position: other, payload: other_payload } => {
            let shift = other_payload.unit_len();
            if *other < position {
                position + shift
            } else if *other > position {
                position
            } else if applied.id < incoming.id {
                // Equal positions: the operation earlier in (client_id, seq)
                // order wins priority — its content ends up first, the other
                // shifts past it. Never arrival order.
                position + shift
            } else {
                position
            }
        }
        ResolvedKind::Delete { spans } => insert_position_after_delete(position, spans),
        // Updates replace a unit in place; positions are unaffected.
        ResolvedKind::Update { .. } | ResolvedKind::Noop => position,
    };
    ResolvedKind::Insert {
        position,
        payload: payload.clone(),
    }
}

fn transform_update(
    position: u64,
    payload: &ElementPayload,
    incoming: &ResolvedOp,
    applied: &ResolvedOp,
) -> ResolvedKind {
    match &applied.kind {
        ResolvedKind::Insert { position: other, payload: other_payload } => {
            let position = if *other <= position {
                position + other_payload.unit_len()
            } else {
                position
            };
            ResolvedKind::Update { position, payload: payload.clone() }
        }
        ResolvedKind::Delete { spans } => match unit_position_after_delete(position, spans) {
            // The target unit survived; follow it.
            Some(position) => ResolvedKind::Update { position, payload: payload.clone() },
            // The target was deleted concurrently; a timestamp cannot
            // resurrect deleted content.
            None => ResolvedKind::Noop,
        },
        ResolvedKind::Update { position: other, .. } => {
            if *other == position && lww_wins(applied, incoming) {
                ResolvedKind::Noop
            } else {
                // Either a different unit, or the incoming update is the
                // later write and will overwrite the applied one.
                ResolvedKind::Update { position, payload: payload.clone() }
            }
        }
        ResolvedKind::Noop => ResolvedKind::Update { position, payload: payload.clone() },
    }
}

fn transform_delete(spans: &[Span], applied: &ResolvedOp) -> ResolvedKind {
    match &applied.kind {
        ResolvedKind::Insert { position, payload } => {
            let shift = payload.unit_len();
            let mut out = Vec::with_capacity(spans.len() + 1);
            for span in spans {
                if *position <= span.position {
                    out.push(Span::new(span.position + shift, span.length));
                } else if *position >= span.end() {
                    out.push(*span);
                } else {
                    // The insert landed inside this span. Split around it so
                    // the inserted (and relocated, in the other arrival
                    // order) content survives the delete.
                    out.push(Span::new(span.position, *position - span.position));
                    out.push(Span::new(*position + shift, span.end() - *position));
                }
            }
            ResolvedKind::Delete { spans: out }
        }
        ResolvedKind::Delete { spans: other } => {
            let mut out = Vec::with_capacity(spans.len());
            for span in spans {
                let mut fragments = vec![*span];
                for b in other {
                    let mut next = Vec::with_capacity(fragments.len() + 1);
                    for frag in fragments {
                        next.extend(subtract_span(frag, b));
                    }
                    fragments = next;
                }
                // Fragments no longer overlap any applied span; shift each
                // left by the applied length removed before it.
                for frag in fragments {
                    let removed_before: u64 = other
                        .iter()
                        .filter(|b| b.end() <= frag.position)
                        .map(|b| b.length)
                        .sum();
                    out.push(Span::new(frag.position - removed_before, frag.length));
                }
            }
            if out.is_empty() {
                // Entirely subsumed by the applied delete: the union of both
                // ranges was already removed exactly once.
                ResolvedKind::Noop
            } else {
                ResolvedKind::Delete { spans: out }
            }
        }
        ResolvedKind::Update { .. } | ResolvedKind::Noop => {
            ResolvedKind::Delete { spans: spans.to_vec() }
        }
    }
}

/// Where an insertion point lands after a (possibly multi-span) delete.
///
/// A point inside a deleted span relocates to the span's start — inserted
/// content is preserved, never discarded. Boundary points (at a span start
/// or end) are unaffected by that span.
fn insert_position_after_delete(position: u64, spans: &[Span]) -> u64 {
    let mut removed = 0u64;
    for span in spans {
        if position <= span.position {
            break;
        }
        if position < span.end() {
            return span.position - removed;
        }
        removed += span.length;
    }
    position - removed
}

/// Where the unit at `position` lands after a delete, or `None` if the unit
/// itself was removed.
fn unit_position_after_delete(position: u64, spans: &[Span]) -> Option<u64> {
    let mut removed = 0u64;
    for span in spans {
        if position < span.position {
            break;
        }
        if position < span.end() {
            return None;
        }
        removed += span.length;
    }
    Some(position - removed)
}

/// Whether the already-applied update `applied` beats the incoming one under
/// Last-Write-Wins: strictly later timestamp; on an exact tie the lower
/// client id wins; the same client's later op wins.
fn lww_wins(applied: &ResolvedOp, incoming: &ResolvedOp) -> bool {
    if applied.timestamp != incoming.timestamp {
        return applied.timestamp > incoming.timestamp;
    }
    if applied.id.client_id != incoming.id.client_id {
        return applied.id.client_id < incoming.id.client_id;
    }
    applied.id.seq > incoming.id.seq
}

/// Remove the overlap of `b` from `a`, keeping coordinates unshifted.
/// Returns zero, one or two fragments.
fn subtract_span(a: Span, b: &Span) -> Vec<Span> {
    let start = a.position.max(b.position);
    let end = a.end().min(b.end());
    if start >= end {
        return vec![a]; // no overlap
    }
    let mut out = Vec::with_capacity(2);
    if a.position < start {
        out.push(Span::new(a.position, start - a.position));
    }
    if end < a.end() {
        out.push(Span::new(end, a.end() - end));
    }
    out
}

/// Clamp a resolved operation to the current document bounds.
///
/// Deliberately lossy-but-safe: after repeated rebasing a position can end
/// up past the live bounds; progress is guaranteed by clamping instead of
/// failing. Called by `Document::apply` just before splicing.
pub fn clamp_resolved(kind: &ResolvedKind, doc_len: u64) -> ResolvedKind {
    match kind {
        ResolvedKind::Insert { position, payload } => ResolvedKind::Insert {
            position: (*position).min(doc_len),
            payload: payload.clone(),
        },
        ResolvedKind::Update { position, payload } => {
            if doc_len == 0 {
                ResolvedKind::Noop
            } else {
                ResolvedKind::Update {
                    position: (*position).min(doc_len - 1),
                    payload: payload.clone(),
                }
            }
        }
        ResolvedKind::Delete { spans } => {
            let clamped: Vec<Span> = spans
                .iter()
                .filter_map(|span| {
                    let start = span.position.min(doc_len);
                    let end = span.end().min(doc_len);
                    (end > start).then(|| Span::new(start, end - start))
                })
                .collect();
            if clamped.is_empty() {
                ResolvedKind::Noop
            } else {
                ResolvedKind::Delete { spans: clamped }
            }
        }
        ResolvedKind::Noop => ResolvedKind::Noop,
    }
}
