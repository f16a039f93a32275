//! Course content model: blocks, lessons and the blob that carries them

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::rich_doc::RichNode;
use crate::error::{Result, StorageError};

/// Current blob layout version
pub const SCHEMA_VERSION: u32 = 2;

/// Block type tag
///
/// Serialized as a short string (`p`, `h1`, `img`, ...). Tags this build does
/// not know survive decoding as `Unknown` so they can be degraded, not dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BlockType {
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    Image,
    Code,
    Quote,
    List,
    Divider,
    Quiz,
    Video,
    Embed,
    Unknown(String),
}

impl BlockType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Paragraph => "p",
            Self::Heading1 => "h1",
            Self::Heading2 => "h2",
            Self::Heading3 => "h3",
            Self::Image => "img",
            Self::Code => "code",
            Self::Quote => "quote",
            Self::List => "list",
            Self::Divider => "divider",
            Self::Quiz => "quiz",
            Self::Video => "video",
            Self::Embed => "embed",
            Self::Unknown(tag) => tag,
        }
    }

    /// Heading type for a rich-document heading level (levels past 3 clamp to h3)
    pub fn heading(level: u64) -> Self {
        match level {
            0 | 1 => Self::Heading1,
            2 => Self::Heading2,
            _ => Self::Heading3,
        }
    }

    pub fn heading_level(&self) -> Option<u64> {
        match self {
            Self::Heading1 => Some(1),
            Self::Heading2 => Some(2),
            Self::Heading3 => Some(3),
            _ => None,
        }
    }

    fn carries_source(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Embed)
    }

    fn carries_style(&self) -> bool {
        matches!(
            self,
            Self::Paragraph | Self::Heading1 | Self::Heading2 | Self::Heading3 | Self::Quote
        )
    }
}

impl From<String> for BlockType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "p" => Self::Paragraph,
            "h1" => Self::Heading1,
            "h2" => Self::Heading2,
            "h3" => Self::Heading3,
            "img" => Self::Image,
            "code" => Self::Code,
            "quote" => Self::Quote,
            "list" => Self::List,
            "divider" => Self::Divider,
            "quiz" => Self::Quiz,
            "video" => Self::Video,
            "embed" => Self::Embed,
            _ => Self::Unknown(tag),
        }
    }
}

impl From<BlockType> for String {
    fn from(block_type: BlockType) -> Self {
        match block_type {
            BlockType::Unknown(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation overrides. Only non-default values are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<String>,
}

impl StyleOverrides {
    pub fn is_default(&self) -> bool {
        self.align.is_none() && self.color.is_none() && self.font_size.is_none()
    }
}

/// Quiz question with its answer key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizPayload {
    pub question: String,
    pub options: Vec<String>,
    #[serde(rename = "correct")]
    pub correct_index: usize,
}

/// Smallest addressable content unit
///
/// `block_type` decides which optional fields mean anything; absent fields
/// inherit presentation defaults at render time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "t")]
    pub block_type: BlockType,
    #[serde(rename = "v", default)]
    pub value: String,
    #[serde(rename = "src", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(rename = "lang", default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,
    /// `value` holds serialized inline rich content instead of plain text
    #[serde(default, skip_serializing_if = "is_false")]
    pub rich: bool,
    #[serde(rename = "s", default, skip_serializing_if = "StyleOverrides::is_default")]
    pub style: StyleOverrides,
    #[serde(rename = "q", default, skip_serializing_if = "Option::is_none")]
    pub quiz: Option<QuizPayload>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Block {
    pub fn new(id: impl Into<String>, block_type: BlockType, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            block_type,
            value: value.into(),
            source: None,
            alt: None,
            language: None,
            ordered: None,
            rich: false,
            style: StyleOverrides::default(),
            quiz: None,
        }
    }

    /// Drop optional fields the block type gives no meaning to
    pub fn normalized(mut self) -> Self {
        if !self.block_type.carries_source() {
            self.source = None;
        }
        if self.block_type != BlockType::Image {
            self.alt = None;
        }
        if self.block_type != BlockType::Code {
            self.language = None;
        }
        if self.block_type != BlockType::List {
            self.ordered = None;
        }
        if self.block_type != BlockType::Quiz {
            self.quiz = None;
        }
        if !self.block_type.carries_style() {
            self.style = StyleOverrides::default();
        }
        self
    }
}

/// Lesson content mode
///
/// A rich-document lesson owns its tree; `block_ids` is the derived read view
/// and is regenerated on every edit. A blocks-only lesson has no tree and its
/// blocks are authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum LessonBody {
    RichDoc {
        #[serde(rename = "richDoc")]
        rich_doc: RichNode,
        #[serde(rename = "blockIds", default)]
        block_ids: Vec<String>,
    },
    Blocks {
        #[serde(rename = "blockIds", default)]
        block_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub title: String,
    #[serde(rename = "durationMinutes", default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub position: u32,
    pub body: LessonBody,
}

impl Lesson {
    /// Rich-document lesson with no derived blocks yet
    pub fn rich_doc(id: impl Into<String>, title: impl Into<String>, rich_doc: RichNode) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            duration_minutes: None,
            position: 0,
            body: LessonBody::RichDoc {
                rich_doc,
                block_ids: Vec::new(),
            },
        }
    }

    /// Blocks-only lesson
    pub fn legacy(id: impl Into<String>, title: impl Into<String>, block_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            duration_minutes: None,
            position: 0,
            body: LessonBody::Blocks { block_ids },
        }
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub fn block_ids(&self) -> &[String] {
        match &self.body {
            LessonBody::RichDoc { block_ids, .. } | LessonBody::Blocks { block_ids } => block_ids,
        }
    }

    pub fn rich_doc_tree(&self) -> Option<&RichNode> {
        match &self.body {
            LessonBody::RichDoc { rich_doc, .. } => Some(rich_doc),
            LessonBody::Blocks { .. } => None,
        }
    }
}

/// Immutable snapshot of one course: every lesson and every block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseBlob {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub lessons: BTreeMap<String, Lesson>,
    pub blocks: BTreeMap<String, Block>,
}

impl Default for CourseBlob {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            lessons: BTreeMap::new(),
            blocks: BTreeMap::new(),
        }
    }
}

impl CourseBlob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order-stable serialization; these are the bytes that get hashed and sent.
    ///
    /// Maps are `BTreeMap`s and struct fields serialize in declaration order,
    /// so equal blobs always produce equal bytes.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let blob: CourseBlob = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Serialization(format!("course blob: {}", e)))?;
        Ok(blob)
    }

    pub fn insert_lesson(&mut self, lesson: Lesson) {
        self.lessons.insert(lesson.id.clone(), lesson);
    }

    pub fn insert_block(&mut self, block: Block) {
        self.blocks.insert(block.id.clone(), block);
    }

    /// Lessons sorted by position, then id
    pub fn ordered_lessons(&self) -> Vec<&Lesson> {
        let mut lessons: Vec<&Lesson> = self.lessons.values().collect();
        lessons.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        lessons
    }

    /// A lesson's blocks in display order; dangling ids are skipped
    pub fn lesson_blocks(&self, lesson_id: &str) -> Vec<&Block> {
        self.lessons
            .get(lesson_id)
            .map(|lesson| {
                lesson
                    .block_ids()
                    .iter()
                    .filter_map(|id| self.blocks.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove blocks no lesson references. Returns how many were dropped.
    pub fn prune_orphans(&mut self) -> usize {
        let referenced: BTreeSet<&String> = self
            .lessons
            .values()
            .flat_map(|lesson| lesson.block_ids().iter())
            .collect();
        let orphans: Vec<String> = self
            .blocks
            .keys()
            .filter(|id| !referenced.contains(id))
            .cloned()
            .collect();
        for id in &orphans {
            self.blocks.remove(id);
        }
        orphans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_wire_names_are_compact() {
        let block = Block::new("b1", BlockType::Heading1, "Intro");
        let json = serde_json::to_string(&block).unwrap();
        assert_eq!(json, r#"{"id":"b1","t":"h1","v":"Intro"}"#);
    }

    #[test]
    fn test_unknown_block_type_survives_decoding() {
        let block: Block = serde_json::from_str(r#"{"id":"b9","t":"table","v":"a|b"}"#).unwrap();
        assert_eq!(block.block_type, BlockType::Unknown("table".to_string()));
        let back = serde_json::to_string(&block).unwrap();
        assert!(back.contains(r#""t":"table""#));
    }

    #[test]
    fn test_normalized_drops_meaningless_fields() {
        let mut block = Block::new("b1", BlockType::Paragraph, "text");
        block.language = Some("rust".into());
        block.source = Some("https://cdn/x.png".into());
        block.style.align = Some("center".into());

        let block = block.normalized();
        assert!(block.language.is_none());
        assert!(block.source.is_none());
        assert_eq!(block.style.align.as_deref(), Some("center"));
    }

    #[test]
    fn test_canonical_bytes_are_order_stable() {
        let mut a = CourseBlob::new();
        a.insert_block(Block::new("z", BlockType::Paragraph, "last"));
        a.insert_block(Block::new("a", BlockType::Paragraph, "first"));

        let mut b = CourseBlob::new();
        b.insert_block(Block::new("a", BlockType::Paragraph, "first"));
        b.insert_block(Block::new("z", BlockType::Paragraph, "last"));

        assert_eq!(a.to_canonical_bytes().unwrap(), b.to_canonical_bytes().unwrap());
    }

    #[test]
    fn test_lesson_body_is_tagged() {
        let lesson = Lesson::legacy("l1", "Basics", vec!["b1".into()]);
        let json = serde_json::to_value(&lesson).unwrap();
        assert_eq!(json["body"]["mode"], "blocks");
        assert_eq!(json["body"]["blockIds"][0], "b1");

        let decoded: Lesson = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, lesson);
    }

    #[test]
    fn test_prune_orphans() {
        let mut blob = CourseBlob::new();
        blob.insert_lesson(Lesson::legacy("l1", "One", vec!["b1".into()]));
        blob.insert_block(Block::new("b1", BlockType::Paragraph, "kept"));
        blob.insert_block(Block::new("b2", BlockType::Paragraph, "orphan"));

        assert_eq!(blob.prune_orphans(), 1);
        assert!(blob.blocks.contains_key("b1"));
        assert!(!blob.blocks.contains_key("b2"));
    }

    #[test]
    fn test_ordered_lessons_by_position() {
        let mut blob = CourseBlob::new();
        blob.insert_lesson(Lesson::legacy("a", "Second", vec![]).with_position(2));
        blob.insert_lesson(Lesson::legacy("b", "First", vec![]).with_position(1));

        let titles: Vec<&str> = blob.ordered_lessons().iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
    }
}
