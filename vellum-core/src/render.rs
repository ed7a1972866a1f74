//! Rendering contract for materialized documents.
//!
//! The engine only produces segment sequences; turning them into user-facing
//! output is the job of an external collaborator implementing
//! [`DocumentRenderer`]. Element polymorphism is a closed tag set, so a
//! renderer is a match over [`ElementKind`] — no virtual dispatch inside the
//! engine.

use crate::document::{Segment, SegmentContent};
use crate::operation::ElementKind;

/// Converts a materialized segment sequence into user-facing output.
pub trait DocumentRenderer {
    fn render(&self, segments: &[Segment]) -> String;
}

/// Reference renderer producing plain text.
///
/// Text renders verbatim, newlines as `\n`, tab stops as `\t`, and image
/// references as `[image:<source>]` placeholders.
#[derive(Debug, Clone, Default)]
pub struct PlainTextRenderer;

impl DocumentRenderer for PlainTextRenderer {
    fn render(&self, segments: &[Segment]) -> String {
        let mut out = String::new();
        for segment in segments {
            match (&segment.kind, &segment.content) {
                (ElementKind::Text, SegmentContent::Text(s)) => out.push_str(s),
                (ElementKind::Image, SegmentContent::Images(sources)) => {
                    for source in sources {
                        out.push_str("[image:");
                        out.push_str(source);
                        out.push(']');
                    }
                }
                (ElementKind::NewLine, SegmentContent::Run(count)) => {
                    for _ in 0..*count {
                        out.push('\n');
                    }
                }
                (ElementKind::TabSpace, SegmentContent::Run(count)) => {
                    for _ in 0..*count {
                        out.push('\t');
                    }
                }
                // A segment whose tag and content disagree cannot be built
                // through the public constructors; render nothing for it.
                _ => {}
            }
        }
        out
    }
}
