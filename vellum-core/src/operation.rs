//! Edit operations and their construction-time validation.
//!
//! An [`Operation`] is a single edit intent plus the causal metadata needed
//! to reconcile it against concurrent edits: which document it targets, which
//! document version the client last observed (`base_version`), and a unique,
//! sortable [`OperationId`]. Operations are immutable once constructed —
//! rebasing produces a new [`crate::transform::ResolvedOp`], never a mutation.
//!
//! Validation happens before an operation enters the coordinator's state
//! machine. A failed validation yields a [`MalformedOperation`] reason code
//! and the operation never touches document state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, sortable identifier for an operation.
///
/// `(client_id, seq)` lexicographic order is the system-wide deterministic
/// tie-break order: every replica agrees on it regardless of arrival order.
/// `seq` is monotonically increasing per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId {
    pub client_id: Uuid,
    pub seq: u64,
}

impl OperationId {
    pub fn new(client_id: Uuid, seq: u64) -> Self {
        Self { client_id, seq }
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.client_id, self.seq)
    }
}

/// Closed set of element kinds a document can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Text,
    Image,
    NewLine,
    TabSpace,
}

/// Content carried by an Insert or Update.
///
/// One logical unit per text character; images, newlines and tab stops are
/// one unit each. Positions and lengths everywhere in the engine are counted
/// in these units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementPayload {
    /// A run of characters.
    Text(String),
    /// A single image reference (path or URL).
    Image(String),
    /// A single line break.
    NewLine,
    /// A single tab stop.
    TabSpace,
}

impl ElementPayload {
    /// The element kind this payload materializes as.
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementPayload::Text(_) => ElementKind::Text,
            ElementPayload::Image(_) => ElementKind::Image,
            ElementPayload::NewLine => ElementKind::NewLine,
            ElementPayload::TabSpace => ElementKind::TabSpace,
        }
    }

    /// Length in logical units.
    pub fn unit_len(&self) -> u64 {
        match self {
            ElementPayload::Text(s) => s.chars().count() as u64,
            ElementPayload::Image(_) | ElementPayload::NewLine | ElementPayload::TabSpace => 1,
        }
    }

    /// Whether the payload carries no content at all.
    pub fn is_empty(&self) -> bool {
        match self {
            ElementPayload::Text(s) => s.is_empty(),
            ElementPayload::Image(src) => src.is_empty(),
            ElementPayload::NewLine | ElementPayload::TabSpace => false,
        }
    }
}

/// What an operation does at its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert the payload before the unit at `position`.
    Insert(ElementPayload),
    /// Replace the single unit at `position` with the payload.
    Update(ElementPayload),
    /// Remove `length` units starting at `position`.
    Delete { length: u64 },
}

/// A single edit intent with its causal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub document_id: Uuid,
    /// The document version the client last observed when creating this op.
    pub base_version: u64,
    /// Zero-based offset into the document's logical unit sequence.
    pub position: u64,
    pub kind: OpKind,
    pub element_kind: ElementKind,
    /// Client wall-clock, milliseconds since the Unix epoch. Used only by
    /// the Last-Write-Wins fallback, never for ordering inserts.
    pub timestamp: u64,
}

impl Operation {
    /// Build an insert. `element_kind` is derived from the payload.
    pub fn insert(
        document_id: Uuid,
        client_id: Uuid,
        seq: u64,
        base_version: u64,
        position: u64,
        payload: ElementPayload,
        timestamp: u64,
    ) -> Self {
        let element_kind = payload.kind();
        Self {
            id: OperationId::new(client_id, seq),
            document_id,
            base_version,
            position,
            kind: OpKind::Insert(payload),
            element_kind,
            timestamp,
        }
    }

    /// Build an update. `element_kind` is derived from the payload.
    pub fn update(
        document_id: Uuid,
        client_id: Uuid,
        seq: u64,
        base_version: u64,
        position: u64,
        payload: ElementPayload,
        timestamp: u64,
    ) -> Self {
        let element_kind = payload.kind();
        Self {
            id: OperationId::new(client_id, seq),
            document_id,
            base_version,
            position,
            kind: OpKind::Update(payload),
            element_kind,
            timestamp,
        }
    }

    /// Build a delete. Deletes are kind-agnostic over the range; the
    /// `element_kind` records the kind at the range start when created.
    #[allow(clippy::too_many_arguments)]
    pub fn delete(
        document_id: Uuid,
        client_id: Uuid,
        seq: u64,
        base_version: u64,
        position: u64,
        length: u64,
        element_kind: ElementKind,
        timestamp: u64,
    ) -> Self {
        Self {
            id: OperationId::new(client_id, seq),
            document_id,
            base_version,
            position,
            kind: OpKind::Delete { length },
            element_kind,
            timestamp,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.id.client_id
    }

    /// Position-independent validation: payload emptiness, kind mismatch,
    /// zero-length deletes, oversized updates.
    ///
    /// This is the whole check for a stale operation (base_version behind
    /// the document): its position refers to a document state the server has
    /// moved past, so bounds are meaningless until the transform engine has
    /// rebased it — residual skew is absorbed by apply-time clamping.
    pub fn validate_structure(&self) -> Result<(), MalformedOperation> {
        match &self.kind {
            OpKind::Insert(payload) => {
                if payload.is_empty() {
                    return Err(MalformedOperation::EmptyPayload);
                }
                if payload.kind() != self.element_kind {
                    return Err(MalformedOperation::PayloadKindMismatch {
                        expected: self.element_kind,
                        got: payload.kind(),
                    });
                }
            }
            OpKind::Update(payload) => {
                if payload.is_empty() {
                    return Err(MalformedOperation::EmptyPayload);
                }
                if payload.kind() != self.element_kind {
                    return Err(MalformedOperation::PayloadKindMismatch {
                        expected: self.element_kind,
                        got: payload.kind(),
                    });
                }
                if payload.unit_len() != 1 {
                    return Err(MalformedOperation::OversizedUpdate {
                        units: payload.unit_len(),
                    });
                }
            }
            OpKind::Delete { length } => {
                if *length == 0 {
                    return Err(MalformedOperation::EmptyDelete);
                }
            }
        }
        Ok(())
    }

    /// Full validation for an up-to-date operation: structural checks plus
    /// position bounds against the document length the client observed.
    pub fn validate(&self, doc_len: u64) -> Result<(), MalformedOperation> {
        self.validate_structure()?;
        let out_of_bounds = match &self.kind {
            OpKind::Insert(_) => self.position > doc_len,
            OpKind::Update(_) | OpKind::Delete { .. } => self.position >= doc_len,
        };
        if out_of_bounds {
            return Err(MalformedOperation::PositionOutOfBounds {
                position: self.position,
                doc_len,
            });
        }
        Ok(())
    }
}

/// Construction-time validation failures.
///
/// Carried back to the client as a typed reason code; the operation is
/// rejected before it enters the state machine and no document state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MalformedOperation {
    /// Insert or update with no content.
    EmptyPayload,
    /// Declared element kind does not match the payload.
    PayloadKindMismatch { expected: ElementKind, got: ElementKind },
    /// Position beyond the document length at validation time.
    PositionOutOfBounds { position: u64, doc_len: u64 },
    /// Delete of zero units.
    EmptyDelete,
    /// Update payloads replace exactly one logical unit.
    OversizedUpdate { units: u64 },
}

impl std::fmt::Display for MalformedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedOperation::EmptyPayload => write!(f, "Empty payload"),
            MalformedOperation::PayloadKindMismatch { expected, got } => {
                write!(f, "Payload kind mismatch: declared {expected:?}, got {got:?}")
            }
            MalformedOperation::PositionOutOfBounds { position, doc_len } => {
                write!(f, "Position {position} out of bounds (document length {doc_len})")
            }
            MalformedOperation::EmptyDelete => write!(f, "Delete of zero length"),
            MalformedOperation::OversizedUpdate { units } => {
                write!(f, "Update payload spans {units} units, expected exactly 1")
            }
        }
    }
}

impl std::error::Error for MalformedOperation {}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_id() -> Uuid {
        Uuid::from_u128(0xD0C)
    }

    #[test]
    fn test_operation_id_ordering() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        assert!(OperationId::new(low, 9) < OperationId::new(high, 0));
        assert!(OperationId::new(low, 1) < OperationId::new(low, 2));
        assert_eq!(OperationId::new(low, 1), OperationId::new(low, 1));
    }

    #[test]
    fn test_payload_unit_lengths() {
        assert_eq!(ElementPayload::Text("hello".into()).unit_len(), 5);
        assert_eq!(ElementPayload::Text("héllo".into()).unit_len(), 5); // chars, not bytes
        assert_eq!(ElementPayload::Image("a.png".into()).unit_len(), 1);
        assert_eq!(ElementPayload::NewLine.unit_len(), 1);
        assert_eq!(ElementPayload::TabSpace.unit_len(), 1);
    }

    #[test]
    fn test_payload_kinds() {
        assert_eq!(ElementPayload::Text("x".into()).kind(), ElementKind::Text);
        assert_eq!(ElementPayload::Image("x".into()).kind(), ElementKind::Image);
        assert_eq!(ElementPayload::NewLine.kind(), ElementKind::NewLine);
        assert_eq!(ElementPayload::TabSpace.kind(), ElementKind::TabSpace);
    }

    #[test]
    fn test_insert_constructor_derives_kind() {
        let op = Operation::insert(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            0,
            ElementPayload::Image("cat.png".into()),
            1000,
        );
        assert_eq!(op.element_kind, ElementKind::Image);
        assert_eq!(op.client_id(), Uuid::from_u128(1));
    }

    #[test]
    fn test_validate_insert_ok() {
        let op = Operation::insert(
            doc_id(),
            Uuid::from_u128(1),
            1,
            5,
            3,
            ElementPayload::Text("hi".into()),
            1000,
        );
        assert!(op.validate(3).is_ok()); // position == len is a valid append
    }

    #[test]
    fn test_validate_insert_empty_payload() {
        let op = Operation::insert(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            0,
            ElementPayload::Text(String::new()),
            1000,
        );
        assert_eq!(op.validate(10), Err(MalformedOperation::EmptyPayload));
    }

    #[test]
    fn test_validate_insert_out_of_bounds() {
        let op = Operation::insert(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            11,
            ElementPayload::Text("x".into()),
            1000,
        );
        assert_eq!(
            op.validate(10),
            Err(MalformedOperation::PositionOutOfBounds { position: 11, doc_len: 10 })
        );
    }

    #[test]
    fn test_validate_kind_mismatch() {
        let mut op = Operation::insert(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            0,
            ElementPayload::Text("x".into()),
            1000,
        );
        op.element_kind = ElementKind::Image;
        assert!(matches!(
            op.validate(10),
            Err(MalformedOperation::PayloadKindMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_delete() {
        let zero = Operation::delete(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            0,
            0,
            ElementKind::Text,
            1000,
        );
        assert_eq!(zero.validate(10), Err(MalformedOperation::EmptyDelete));

        let past_end = Operation::delete(
            doc_id(),
            Uuid::from_u128(1),
            2,
            0,
            10,
            1,
            ElementKind::Text,
            1000,
        );
        assert!(matches!(
            past_end.validate(10),
            Err(MalformedOperation::PositionOutOfBounds { .. })
        ));

        let ok = Operation::delete(
            doc_id(),
            Uuid::from_u128(1),
            3,
            0,
            9,
            1,
            ElementKind::Text,
            1000,
        );
        assert!(ok.validate(10).is_ok());
    }

    #[test]
    fn test_validate_delete_on_empty_document() {
        let op = Operation::delete(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            0,
            1,
            ElementKind::Text,
            1000,
        );
        assert!(matches!(
            op.validate(0),
            Err(MalformedOperation::PositionOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_validate_update() {
        let op = Operation::update(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            2,
            ElementPayload::Image("new.png".into()),
            1000,
        );
        assert!(op.validate(5).is_ok());
        assert!(matches!(
            op.validate(2),
            Err(MalformedOperation::PositionOutOfBounds { .. })
        ));

        let wide = Operation::update(
            doc_id(),
            Uuid::from_u128(1),
            2,
            0,
            0,
            ElementPayload::Text("ab".into()),
            1000,
        );
        assert_eq!(
            wide.validate(5),
            Err(MalformedOperation::OversizedUpdate { units: 2 })
        );
    }

    #[test]
    fn test_validate_structure_skips_bounds() {
        let op = Operation::insert(
            doc_id(),
            Uuid::from_u128(1),
            1,
            0,
            99,
            ElementPayload::Text("x".into()),
            1000,
        );
        assert!(op.validate_structure().is_ok());
        assert!(op.validate(10).is_err());

        let empty = Operation::insert(
            doc_id(),
            Uuid::from_u128(1),
            2,
            0,
            0,
            ElementPayload::Text(String::new()),
            1000,
        );
        assert_eq!(empty.validate_structure(), Err(MalformedOperation::EmptyPayload));
    }

    #[test]
    fn test_reason_code_display() {
        let err = MalformedOperation::PositionOutOfBounds { position: 7, doc_len: 3 };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains('3'));

        assert!(MalformedOperation::EmptyDelete.to_string().contains("zero"));
    }
}
