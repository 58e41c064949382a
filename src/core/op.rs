//! Operations: the unit of causality.
//!
//! An [`Operation`] is never mutated after creation. Later operations
//! supersede earlier ones by referencing them (deletes) or by winning the
//! last-writer-wins order (metadata).

use super::clock::VersionVector;
use super::ids::{AuthorId, OpId};

/// One captured sample of a stroke.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplePoint {
    /// Horizontal position in page units.
    pub x: f32,
    /// Vertical position in page units.
    pub y: f32,
    /// Milliseconds since the first sample of the stroke.
    pub t_offset_ms: u32,
    /// Normalized pen pressure.
    pub pressure: f32,
    /// Pen tilt along x, in radians.
    pub tilt_x: f32,
    /// Pen tilt along y, in radians.
    pub tilt_y: f32,
}

impl SamplePoint {
    /// Point with position and pressure only.
    pub fn new(x: f32, y: f32, t_offset_ms: u32, pressure: f32) -> Self {
        Self {
            x,
            y,
            t_offset_ms,
            pressure,
            tilt_x: 0.0,
            tilt_y: 0.0,
        }
    }
}

/// Geometry carried by an insert-stroke operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StrokeData {
    /// Ordered samples.
    pub points: Vec<SamplePoint>,
    /// Opaque brush/tool identifier assigned by the capture layer.
    pub brush: u32,
}

impl StrokeData {
    /// Create stroke geometry.
    pub fn new(points: Vec<SamplePoint>, brush: u32) -> Self {
        Self { points, brush }
    }
}

/// Value of a page metadata field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// Field removed.
    Cleared,
    /// UTF-8 text.
    Text(String),
    /// Signed integer.
    Integer(i64),
    /// Boolean flag.
    Boolean(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl MetadataValue {
    /// Text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Check if the field has been cleared.
    pub fn is_cleared(&self) -> bool {
        matches!(self, MetadataValue::Cleared)
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

/// Kind-specific operation payload.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Create a stroke identified by this operation's id.
    InsertStroke(StrokeData),
    /// Tombstone the stroke created by `target`.
    DeleteStroke {
        /// Op id of the insert that created the stroke.
        target: OpId,
    },
    /// Set one metadata field of the page.
    UpdateMetadata {
        /// Field name.
        key: String,
        /// New value.
        value: MetadataValue,
    },
}

impl OpKind {
    /// Wire tag for this kind.
    pub fn tag(&self) -> u8 {
        match self {
            OpKind::InsertStroke(_) => 1,
            OpKind::DeleteStroke { .. } => 2,
            OpKind::UpdateMetadata { .. } => 3,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::InsertStroke(_) => "insert-stroke",
            OpKind::DeleteStroke { .. } => "delete-stroke",
            OpKind::UpdateMetadata { .. } => "update-metadata",
        }
    }
}

/// A causally identified edit.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Unique id and Lamport timestamp.
    pub id: OpId,
    /// Everything the author had observed when generating this operation.
    pub causal_context: VersionVector,
    /// Payload.
    pub kind: OpKind,
}

impl Operation {
    /// Create an operation.
    pub fn new(id: OpId, causal_context: VersionVector, kind: OpKind) -> Self {
        Self {
            id,
            causal_context,
            kind,
        }
    }

    /// Author of this operation.
    pub fn author(&self) -> AuthorId {
        self.id.author
    }

    /// Stroke this operation touches, if any.
    pub fn stroke_target(&self) -> Option<OpId> {
        match &self.kind {
            OpKind::InsertStroke(_) => Some(self.id),
            OpKind::DeleteStroke { target } => Some(*target),
            OpKind::UpdateMetadata { .. } => None,
        }
    }

    /// Check the Lamport rule: the counter exceeds every observed counter.
    pub fn is_well_formed(&self) -> bool {
        self.id.counter > self.causal_context.max_counter()
    }

    /// Check if `self` causally follows `other`.
    pub fn happens_after(&self, other: &Operation) -> bool {
        self.causal_context.contains(other.id)
    }

    /// Check if neither operation causally follows the other.
    pub fn is_concurrent_with(&self, other: &Operation) -> bool {
        self.id != other.id && !self.happens_after(other) && !other.happens_after(self)
    }
}
