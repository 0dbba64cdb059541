//! Operational transform algebra: `Delta`, the composite op sequence
//! clients and the Reconciler exchange, plus `transform`/`apply`/`compose`.
//!
//! A `Delta` is a sequence of `DeltaOp` primitives (`Retain`/`Insert`/`Delete`)
//! that together span the full length of the document it is applied to,
//! mirroring Quill/ShareDB-style delta composition. `transform` resolves
//! two deltas produced concurrently against the same base version into a
//! pair that converge to the same document regardless of application
//! order; `Side` replaces client-id comparison as the tie-break for
//! concurrent inserts at the same position.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Formatting attributes carried by a `Retain` (format change) or
/// `Insert` (inline formatting at insertion point) op. Opaque to the
/// OT engine itself; interpreted by rich-text renderers downstream.
pub type Attrs = serde_json::Map<String, serde_json::Value>;

/// Errors raised while applying or transforming deltas.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OtError {
    /// The delta's retain/delete span ran past the end of the document.
    #[error("operation out of bounds: document length {doc_len}, op requires {required}")]
    OutOfBounds { doc_len: usize, required: usize },

    /// A delta's ops did not cover the whole base document, or overshot it.
    #[error("delta length {delta_len} does not match base length {base_len}")]
    LengthMismatch { delta_len: usize, base_len: usize },
}

/// Tie-break applied when two concurrent operations insert at the same
/// position. The operation belonging to the side with priority is kept
/// first; the other is shifted after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// This delta was received first by the Reconciler and wins ties.
    Left,
    /// This delta was received second and yields on ties.
    Right,
}

/// What an `Insert` op contributes to the document: plain text, or a
/// single opaque embed (an image, a mention, anything non-textual a
/// richer client renders specially). An embed always has length 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InsertContent {
    /// Literal text to splice in
    Text(String),
    /// An opaque embed payload, interpreted by the client
    Embed(serde_json::Value),
}

impl InsertContent {
    fn len(&self) -> usize {
        match self {
            InsertContent::Text(s) => s.chars().count(),
            InsertContent::Embed(_) => 1,
        }
    }

    /// Placeholder rendered into plain text when a document containing
    /// an embed is read as a flat string.
    const EMBED_PLACEHOLDER: char = '\u{FFFC}';
}

/// One primitive step of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeltaOp {
    /// Leave the next `len` characters of the base document unchanged,
    /// optionally applying a formatting change over that span.
    Retain {
        len: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attrs: Option<Attrs>,
    },
    /// Insert `content` at the current cursor position, with optional
    /// inline formatting.
    Insert {
        content: InsertContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attrs: Option<Attrs>,
    },
    /// Remove the next `len` characters of the base document.
    Delete { len: usize },
}

impl DeltaOp {
    /// Length this op consumes from the base document (0 for inserts).
    fn base_len(&self) -> usize {
        match self {
            DeltaOp::Retain { len, .. } => *len,
            DeltaOp::Delete { len } => *len,
            DeltaOp::Insert { .. } => 0,
        }
    }

    /// Length this op contributes to the resulting document (0 for deletes).
    fn target_len(&self) -> usize {
        match self {
            DeltaOp::Retain { len, .. } => *len,
            DeltaOp::Insert { content, .. } => content.len(),
            DeltaOp::Delete { .. } => 0,
        }
    }
}

/// A composite operation: an ordered sequence of `DeltaOp`s spanning the
/// whole base document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Delta {
    /// The op sequence, applied left to right.
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// An empty delta (applying it is a no-op on a zero-length document).
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Convenience constructor: insert `text` at character offset `at` in
    /// an otherwise-untouched document of unknown trailing length.
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        let mut ops = Vec::new();
        if at > 0 {
            ops.push(DeltaOp::Retain { len: at, attrs: None });
        }
        ops.push(DeltaOp::Insert { content: InsertContent::Text(text.into()), attrs: None });
        Self { ops }
    }

    /// Convenience constructor: insert `text` at `at` carrying inline
    /// formatting attributes (e.g. `{"bold": true}`).
    pub fn insert_with_attrs(at: usize, text: impl Into<String>, attrs: Attrs) -> Self {
        let mut ops = Vec::new();
        if at > 0 {
            ops.push(DeltaOp::Retain { len: at, attrs: None });
        }
        ops.push(DeltaOp::Insert {
            content: InsertContent::Text(text.into()),
            attrs: Some(attrs),
        });
        Self { ops }
    }

    /// Convenience constructor: insert a single embed at `at`.
    pub fn insert_embed(at: usize, embed: serde_json::Value) -> Self {
        let mut ops = Vec::new();
        if at > 0 {
            ops.push(DeltaOp::Retain { len: at, attrs: None });
        }
        ops.push(DeltaOp::Insert { content: InsertContent::Embed(embed), attrs: None });
        Self { ops }
    }

    /// Convenience constructor: delete `len` characters starting at `at`.
    pub fn delete(at: usize, len: usize) -> Self {
        let mut ops = Vec::new();
        if at > 0 {
            ops.push(DeltaOp::Retain { len: at, attrs: None });
        }
        ops.push(DeltaOp::Delete { len });
        Self { ops }
    }

    /// Sum of base-document characters this delta consumes.
    pub fn base_length(&self) -> usize {
        self.ops.iter().map(DeltaOp::base_len).sum()
    }

    /// Sum of characters this delta produces in the resulting document.
    pub fn target_length(&self) -> usize {
        self.ops.iter().map(DeltaOp::target_len).sum()
    }

    /// True if this delta performs no retains, inserts, or deletes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
            || self
                .ops
                .iter()
                .all(|op| matches!(op, DeltaOp::Retain { attrs: None, .. }))
    }

    /// Apply this delta to `base`, producing the resulting document text.
    /// Embeds are rendered as the Unicode object-replacement character
    /// since the canonical document is plain text.
    pub fn apply(&self, base: &str) -> Result<String, OtError> {
        let base_chars: Vec<char> = base.chars().collect();
        if self.base_length() > base_chars.len() {
            return Err(OtError::OutOfBounds {
                doc_len: base_chars.len(),
                required: self.base_length(),
            });
        }

        let mut result = String::new();
        let mut cursor = 0usize;
        for op in &self.ops {
            match op {
                DeltaOp::Retain { len, .. } => {
                    let end = cursor + len;
                    result.extend(&base_chars[cursor..end]);
                    cursor = end;
                }
                DeltaOp::Insert { content, .. } => match content {
                    InsertContent::Text(text) => result.push_str(text),
                    InsertContent::Embed(_) => result.push(InsertContent::EMBED_PLACEHOLDER),
                },
                DeltaOp::Delete { len } => {
                    cursor += len;
                }
            }
        }
        result.extend(&base_chars[cursor..]);
        Ok(result)
    }

    /// Compose two sequential deltas (`self` then `other`) into one
    /// equivalent delta, the way a client coalesces consecutive edits
    /// before the Reconciler transforms them against concurrent peers.
    pub fn compose(&self, other: &Delta) -> Result<Delta, OtError> {
        if self.target_length() != other.base_length() {
            return Err(OtError::LengthMismatch {
                delta_len: other.base_length(),
                base_len: self.target_length(),
            });
        }

        let mut result_ops: Vec<DeltaOp> = Vec::new();
        let mut a_iter = self.ops.iter().cloned().peekable();
        let mut b_iter = other.ops.iter().cloned().peekable();
        let mut a_rem: Option<DeltaOp> = a_iter.next();
        let mut b_rem: Option<DeltaOp> = b_iter.next();

        while a_rem.is_some() || b_rem.is_some() {
            match (&a_rem, &b_rem) {
                (Some(DeltaOp::Delete { .. }), _) => {
                    result_ops.push(a_rem.take().unwrap());
                    a_rem = a_iter.next();
                }
                (_, Some(DeltaOp::Insert { .. })) => {
                    result_ops.push(b_rem.take().unwrap());
                    b_rem = b_iter.next();
                }
                (Some(a), Some(b)) => {
                    let a_len = a.target_len();
                    let b_len = b.base_len();
                    let take = a_len.min(b_len);
                    let op = combine_op(a, b, take);
                    if let Some(op) = op {
                        push_merged(&mut result_ops, op);
                    }
                    a_rem = shrink(a.clone(), take, true, &mut a_iter);
                    b_rem = shrink(b.clone(), take, false, &mut b_iter);
                }
                (Some(a), None) => {
                    result_ops.push(a.clone());
                    a_rem = a_iter.next();
                }
                (None, Some(b)) => {
                    result_ops.push(b.clone());
                    b_rem = b_iter.next();
                }
                (None, None) => break,
            }
        }

        Ok(Delta { ops: result_ops })
    }

    /// Transform `self` against a concurrent `other`, both produced
    /// against the same base version, returning the delta `self`'s
    /// author should apply on top of a document `other` has already
    /// been applied to. `side` breaks ties when both deltas insert at
    /// the same position.
    pub fn transform(&self, other: &Delta, side: Side) -> Result<Delta, OtError> {
        let mut result_ops: Vec<DeltaOp> = Vec::new();
        let mut a_iter = self.ops.iter().cloned().peekable();
        let mut b_iter = other.ops.iter().cloned().peekable();
        let mut a_rem = a_iter.next();
        let mut b_rem = b_iter.next();

        while a_rem.is_some() || b_rem.is_some() {
            if let Some(DeltaOp::Insert { content, attrs }) = &a_rem {
                if side == Side::Left || !matches!(b_rem, Some(DeltaOp::Insert { .. })) {
                    result_ops.push(DeltaOp::Insert { content: content.clone(), attrs: attrs.clone() });
                    a_rem = a_iter.next();
                    continue;
                }
            }
            if let Some(DeltaOp::Insert { content, .. }) = &b_rem {
                result_ops.push(DeltaOp::Retain { len: content.len(), attrs: None });
                b_rem = b_iter.next();
                continue;
            }

            match (&a_rem, &b_rem) {
                (Some(a), Some(b)) => {
                    let a_len = a.base_len();
                    let b_len = b.base_len();
                    let take = a_len.min(b_len);
                    match a {
                        DeltaOp::Delete { .. } => {}
                        DeltaOp::Retain { attrs, .. } => {
                            result_ops.push(DeltaOp::Retain { len: take, attrs: attrs.clone() })
                        }
                        DeltaOp::Insert { .. } => unreachable!("inserts handled above"),
                    }
                    a_rem = shrink(a.clone(), take, true, &mut a_iter);
                    b_rem = shrink(b.clone(), take, false, &mut b_iter);
                }
                (Some(a), None) => {
                    if !matches!(a, DeltaOp::Delete { .. }) {
                        result_ops.push(a.clone());
                    }
                    a_rem = a_iter.next();
                }
                (None, Some(_)) => {
                    b_rem = b_iter.next();
                }
                (None, None) => break,
            }
        }

        Ok(Delta { ops: merge_retains(result_ops) })
    }
}

fn slice_content(content: &InsertContent, skip: usize, take: usize) -> InsertContent {
    match content {
        InsertContent::Text(s) => InsertContent::Text(s.chars().skip(skip).take(take).collect()),
        // An embed is a single atomic unit; any non-empty slice keeps it whole.
        InsertContent::Embed(v) => InsertContent::Embed(v.clone()),
    }
}

fn combine_op(a: &DeltaOp, b: &DeltaOp, take: usize) -> Option<DeltaOp> {
    match (a, b) {
        (DeltaOp::Retain { .. }, DeltaOp::Retain { attrs: b_attrs, .. }) => {
            Some(DeltaOp::Retain { len: take, attrs: b_attrs.clone() })
        }
        (DeltaOp::Retain { .. }, DeltaOp::Delete { .. }) => Some(DeltaOp::Delete { len: take }),
        (DeltaOp::Insert { content, attrs }, DeltaOp::Retain { attrs: b_attrs, .. }) => {
            let merged_attrs = b_attrs.clone().or_else(|| attrs.clone());
            Some(DeltaOp::Insert { content: slice_content(content, 0, take), attrs: merged_attrs })
        }
        (DeltaOp::Insert { .. }, DeltaOp::Delete { .. }) => None,
        _ => None,
    }
}

fn shrink(
    op: DeltaOp,
    take: usize,
    is_a: bool,
    iter: &mut std::iter::Peekable<std::vec::IntoIter<DeltaOp>>,
) -> Option<DeltaOp> {
    let len = if is_a { op.target_len() } else { op.base_len() };
    if take >= len {
        return iter.next();
    }
    match op {
        DeltaOp::Retain { len, attrs } => Some(DeltaOp::Retain { len: len - take, attrs }),
        DeltaOp::Delete { len } => Some(DeltaOp::Delete { len: len - take }),
        DeltaOp::Insert { content, attrs } => {
            Some(DeltaOp::Insert { content: slice_content(&content, take, usize::MAX), attrs })
        }
    }
}

fn push_merged(ops: &mut Vec<DeltaOp>, op: DeltaOp) {
    if let Some(last) = ops.last_mut() {
        match (last, &op) {
            (DeltaOp::Retain { len: a, attrs: a_attrs }, DeltaOp::Retain { len: b, attrs: b_attrs })
                if a_attrs == b_attrs =>
            {
                *a += b;
                return;
            }
            (DeltaOp::Delete { len: a }, DeltaOp::Delete { len: b }) => {
                *a += b;
                return;
            }
            (
                DeltaOp::Insert { content: InsertContent::Text(a), attrs: a_attrs },
                DeltaOp::Insert { content: InsertContent::Text(b), attrs: b_attrs },
            ) if a_attrs == b_attrs => {
                a.push_str(b);
                return;
            }
            _ => {}
        }
    }
    ops.push(op);
}

fn merge_retains(ops: Vec<DeltaOp>) -> Vec<DeltaOp> {
    let mut merged = Vec::with_capacity(ops.len());
    for op in ops {
        push_merged(&mut merged, op);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_insert() {
        let delta = Delta::insert(5, " world");
        assert_eq!(delta.apply("hello").unwrap(), "hello world");
    }

    #[test]
    fn test_apply_delete() {
        let delta = Delta::delete(0, 5);
        assert_eq!(delta.apply("hello world").unwrap(), " world");
    }

    #[test]
    fn test_apply_out_of_bounds() {
        let delta = Delta::delete(0, 100);
        assert!(matches!(delta.apply("hi"), Err(OtError::OutOfBounds { .. })));
    }

    #[test]
    fn test_apply_embed_renders_placeholder() {
        let delta = Delta::insert_embed(0, serde_json::json!({"image": "cat.png"}));
        assert_eq!(delta.apply("").unwrap(), "\u{FFFC}");
    }

    #[test]
    fn test_transform_concurrent_inserts_converge() {
        let base = "hello";
        let a = Delta::insert(0, "A");
        let b = Delta::insert(0, "B");

        let a_prime = a.transform(&b, Side::Left).unwrap();
        let b_prime = b.transform(&a, Side::Right).unwrap();

        let via_a_then_b = a.apply(base).unwrap();
        let via_a_then_b = b_prime.apply(&via_a_then_b).unwrap();

        let via_b_then_a = b.apply(base).unwrap();
        let via_b_then_a = a_prime.apply(&via_b_then_a).unwrap();

        assert_eq!(via_a_then_b, via_b_then_a);
    }

    #[test]
    fn test_transform_insert_against_delete() {
        let base = "hello world";
        let insert = Delta::insert(11, "!");
        let delete = Delta::delete(0, 6);

        let insert_prime = insert.transform(&delete, Side::Right).unwrap();
        let delete_prime = delete.transform(&insert, Side::Left).unwrap();

        let via_delete_then_insert = delete.apply(base).unwrap();
        let via_delete_then_insert = insert_prime.apply(&via_delete_then_insert).unwrap();

        let via_insert_then_delete = insert.apply(base).unwrap();
        let via_insert_then_delete = delete_prime.apply(&via_insert_then_delete).unwrap();

        assert_eq!(via_delete_then_insert, via_insert_then_delete);
        assert_eq!(via_delete_then_insert, "world!");
    }

    #[test]
    fn test_compose_insert_then_insert() {
        let a = Delta::insert(0, "hello");
        let b = Delta::insert(5, " world");
        let composed = a.compose(&b).unwrap();
        assert_eq!(composed.apply("").unwrap(), "hello world");
    }

    #[test]
    fn test_insert_with_attrs_preserved_through_transform() {
        let mut attrs = Attrs::new();
        attrs.insert("bold".to_string(), serde_json::Value::Bool(true));
        let a = Delta::insert_with_attrs(0, "hi", attrs.clone());
        let b = Delta::insert(0, "x");

        let a_prime = a.transform(&b, Side::Left).unwrap();
        match &a_prime.ops[0] {
            DeltaOp::Insert { attrs: Some(got), .. } => assert_eq!(got, &attrs),
            other => panic!("expected formatted insert, got {other:?}"),
        }
    }

    #[test]
    fn test_delta_is_empty() {
        assert!(Delta::new().is_empty());
        assert!(Delta { ops: vec![DeltaOp::Retain { len: 3, attrs: None }] }.is_empty());
        assert!(!Delta::insert(0, "x").is_empty());
    }
}
