//! Rich-document tree as produced by the editor
//!
//! Nodes follow the ProseMirror/Tiptap JSON shape: `{type, attrs, content,
//! text, marks}`. Attribute maps are `serde_json::Map`, which is key-ordered
//! (no `preserve_order` feature), so serialization is deterministic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A node in the rich-document tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RichNode {
    /// Missing on malformed input
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<RichNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

/// Inline formatting mark (bold, link, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub mark_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

impl Mark {
    pub fn new(mark_type: impl Into<String>) -> Self {
        Self {
            mark_type: mark_type.into(),
            attrs: Map::new(),
        }
    }
}

impl RichNode {
    /// Create a node of the given type
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: Some(node_type.into()),
            ..Default::default()
        }
    }

    /// Root document node
    pub fn doc(content: Vec<RichNode>) -> Self {
        Self::new("doc").with_content(content)
    }

    /// Text leaf
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            node_type: Some("text".to_string()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Paragraph holding a single text leaf (no leaf when `text` is empty)
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::new("paragraph").with_content(text_content(text.into()))
    }

    pub fn heading(level: u64, text: impl Into<String>) -> Self {
        Self::new("heading")
            .with_attr("level", Value::from(level))
            .with_content(text_content(text.into()))
    }

    pub fn with_attr(mut self, key: &str, value: Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn with_content(mut self, content: Vec<RichNode>) -> Self {
        self.content = content;
        self
    }

    pub fn with_mark(mut self, mark: Mark) -> Self {
        self.marks.push(mark);
        self
    }

    pub fn is_type(&self, node_type: &str) -> bool {
        self.node_type.as_deref() == Some(node_type)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attrs.get(key).and_then(Value::as_u64)
    }

    /// Concatenated text of every descendant leaf; hard breaks become newlines
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if self.is_type("hardBreak") {
            out.push('\n');
            return;
        }
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.content {
            child.collect_text(out);
        }
    }

    /// Whether any inline descendant carries formatting that plain text would lose
    pub fn has_inline_formatting(&self) -> bool {
        self.content
            .iter()
            .any(|child| !child.marks.is_empty() || child.is_type("hardBreak") || child.has_inline_formatting())
    }
}

/// Inline content for a text value: one leaf, or nothing for empty text
pub(crate) fn text_content(text: String) -> Vec<RichNode> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![RichNode::text(text)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_editor_json() {
        let json = r#"{
            "type": "doc",
            "content": [
                {"type": "heading", "attrs": {"level": 2}, "content": [{"type": "text", "text": "Setup"}]},
                {"type": "paragraph", "content": [
                    {"type": "text", "text": "Run "},
                    {"type": "text", "text": "cargo", "marks": [{"type": "code"}]}
                ]}
            ]
        }"#;
        let doc: RichNode = serde_json::from_str(json).unwrap();

        assert!(doc.is_type("doc"));
        assert_eq!(doc.content[0].attr_u64("level"), Some(2));
        assert_eq!(doc.content[1].plain_text(), "Run cargo");
        assert!(doc.content[1].has_inline_formatting());
        assert!(!doc.content[0].has_inline_formatting());
    }

    #[test]
    fn test_missing_type_is_tolerated() {
        let node: RichNode = serde_json::from_str(r#"{"content": []}"#).unwrap();
        assert!(node.node_type.is_none());
    }

    #[test]
    fn test_hard_break_becomes_newline() {
        let node = RichNode::new("paragraph").with_content(vec![
            RichNode::text("one"),
            RichNode::new("hardBreak"),
            RichNode::text("two"),
        ]);
        assert_eq!(node.plain_text(), "one\ntwo");
    }
}
