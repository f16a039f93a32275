//! Rich document <-> block list conversion

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::model::{Block, BlockType, CourseBlob, Lesson, LessonBody, QuizPayload, StyleOverrides};
use super::rich_doc::{text_content, RichNode};

/// Output of [`BlockCodec::to_blocks`]
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedBlocks {
    pub blocks: Vec<Block>,
    /// Block ids in document order
    pub unit_ids: Vec<String>,
}

/// Converts between the editor tree and flat blocks for one course.
///
/// Fresh block ids look like `{courseSuffix}_{timestampMs}_{ordinal}` and
/// never repeat an id the codec knows is in use in the course.
#[derive(Debug, Clone)]
pub struct BlockCodec {
    course_suffix: String,
    fixed_timestamp_ms: Option<i64>,
    reserved: BTreeSet<String>,
}

const COURSE_SUFFIX_LEN: usize = 6;

impl BlockCodec {
    pub fn new(course_id: &str) -> Self {
        let chars: Vec<char> = course_id.chars().collect();
        let start = chars.len().saturating_sub(COURSE_SUFFIX_LEN);
        Self {
            course_suffix: chars[start..].iter().collect(),
            fixed_timestamp_ms: None,
            reserved: BTreeSet::new(),
        }
    }

    /// Ids already used elsewhere in the course
    pub fn with_reserved_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.reserve(ids);
        self
    }

    pub fn reserve(&mut self, ids: impl IntoIterator<Item = String>) {
        self.reserved.extend(ids);
    }

    /// Pin the timestamp used for fresh ids
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.fixed_timestamp_ms = Some(timestamp_ms);
        self
    }

    /// First free id at or after `ordinal`
    fn fresh_id(&self, timestamp_ms: i64, ordinal: usize, taken: impl Fn(&str) -> bool) -> String {
        let mut ordinal = ordinal;
        loop {
            let candidate = format!("{}_{}_{}", self.course_suffix, timestamp_ms, ordinal);
            if !self.reserved.contains(&candidate) && !taken(&candidate) {
                return candidate;
            }
            ordinal += 1;
        }
    }

    /// Flatten a rich document into blocks.
    ///
    /// Ids come positionally from `existing_unit_ids` while they last, so
    /// re-deriving an unchanged document keeps its ids.
    pub fn to_blocks(&self, doc: &RichNode, existing_unit_ids: Option<&[String]>) -> DerivedBlocks {
        let timestamp_ms = self
            .fixed_timestamp_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let existing = existing_unit_ids.unwrap_or(&[]);

        let top_level: &[RichNode] = if doc.is_type("doc") {
            &doc.content
        } else {
            std::slice::from_ref(doc)
        };

        let mut blocks: Vec<Block> = Vec::new();
        for node in top_level {
            let ordinal = blocks.len();
            let id = existing.get(ordinal).cloned().unwrap_or_else(|| {
                self.fresh_id(timestamp_ms, ordinal, |candidate| {
                    existing.iter().any(|id| id == candidate)
                        || blocks.iter().any(|block| block.id == candidate)
                })
            });
            if let Some(block) = node_to_block(node, id) {
                blocks.push(block.normalized());
            }
        }

        let unit_ids = blocks.iter().map(|b| b.id.clone()).collect();
        DerivedBlocks { blocks, unit_ids }
    }

    /// Rebuild an editor tree from blocks
    pub fn to_rich_doc(&self, blocks: &[Block]) -> RichNode {
        RichNode::doc(blocks.iter().map(block_to_node).collect())
    }

    /// Regenerate a rich-document lesson's derived blocks in place.
    /// Blocks-only lessons return `None`.
    pub fn rederive_lesson(&self, lesson: &mut Lesson) -> Option<Vec<Block>> {
        match &mut lesson.body {
            LessonBody::RichDoc { rich_doc, block_ids } => {
                let derived = self.to_blocks(rich_doc, Some(block_ids.as_slice()));
                *block_ids = derived.unit_ids;
                Some(derived.blocks)
            }
            LessonBody::Blocks { .. } => None,
        }
    }

    /// Ids of rich-document lessons whose stored blocks drift from what
    /// their tree derives to
    pub fn inconsistent_lessons(&self, blob: &CourseBlob) -> Vec<String> {
        blob.lessons
            .values()
            .filter(|lesson| !self.lesson_consistent(lesson, &blob.blocks))
            .map(|lesson| lesson.id.clone())
            .collect()
    }

    fn lesson_consistent(&self, lesson: &Lesson, blocks: &BTreeMap<String, Block>) -> bool {
        let LessonBody::RichDoc { rich_doc, block_ids } = &lesson.body else {
            return true;
        };
        let derived = self.to_blocks(rich_doc, Some(block_ids.as_slice()));
        if &derived.unit_ids != block_ids {
            return false;
        }
        derived
            .blocks
            .iter()
            .all(|block| blocks.get(&block.id).is_some_and(|stored| !differs(stored, block)))
    }
}

/// Field-by-field comparison, ignoring the id.
///
/// Structurally equal blocks never differ, whatever their identity.
pub fn differs(a: &Block, b: &Block) -> bool {
    a.block_type != b.block_type
        || a.value != b.value
        || a.source != b.source
        || a.alt != b.alt
        || a.language != b.language
        || a.ordered != b.ordered
        || a.rich != b.rich
        || serialized(&a.style) != serialized(&b.style)
        || serialized(&a.quiz) != serialized(&b.quiz)
}

fn serialized<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Ids in `next` that are new or changed relative to `previous`
pub fn dirty_set(previous: &BTreeMap<String, Block>, next: &[Block]) -> Vec<String> {
    next.iter()
        .filter(|block| {
            previous
                .get(&block.id)
                .map_or(true, |prev| differs(prev, block))
        })
        .map(|block| block.id.clone())
        .collect()
}

fn node_to_block(node: &RichNode, id: String) -> Option<Block> {
    let Some(node_type) = node.node_type.as_deref() else {
        debug!(block_id = %id, "Skipping rich node without type");
        return None;
    };

    let block = match node_type {
        "paragraph" => text_block(node, id, BlockType::Paragraph)?,
        "heading" => {
            let level = node.attr_u64("level").unwrap_or(1);
            text_block(node, id, BlockType::heading(level))?
        }
        "image" => {
            let mut block = Block::new(id, BlockType::Image, node.attr_str("title").unwrap_or(""));
            block.source = node.attr_str("src").map(str::to_string);
            block.alt = node.attr_str("alt").map(str::to_string);
            block
        }
        "codeBlock" | "code" => {
            let mut block = Block::new(id, BlockType::Code, node.plain_text());
            block.language = node.attr_str("language").map(str::to_string);
            block
        }
        "blockquote" => {
            let lines: Vec<String> = node.content.iter().map(RichNode::plain_text).collect();
            let mut block = Block::new(id, BlockType::Quote, lines.join("\n"));
            block.style = style_from_attrs(node);
            block
        }
        "bulletList" | "orderedList" => {
            let items: Vec<String> = node.content.iter().map(RichNode::plain_text).collect();
            let mut block = Block::new(id, BlockType::List, items.join("\n"));
            block.ordered = Some(node_type == "orderedList");
            block
        }
        "horizontalRule" => Block::new(id, BlockType::Divider, ""),
        "quiz" => {
            let quiz = QuizPayload {
                question: node.attr_str("question").unwrap_or_default().to_string(),
                options: node
                    .attrs
                    .get("options")
                    .and_then(Value::as_array)
                    .map(|options| {
                        options
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                correct_index: node.attr_u64("correctIndex").unwrap_or(0) as usize,
            };
            let mut block = Block::new(id, BlockType::Quiz, quiz.question.clone());
            block.quiz = Some(quiz);
            block
        }
        "video" => {
            let mut block = Block::new(id, BlockType::Video, node.attr_str("title").unwrap_or(""));
            block.source = node.attr_str("src").map(str::to_string);
            block
        }
        "embed" | "iframe" => {
            let mut block = Block::new(id, BlockType::Embed, node.attr_str("title").unwrap_or(""));
            block.source = node
                .attr_str("src")
                .or_else(|| node.attr_str("url"))
                .map(str::to_string);
            block
        }
        other => {
            warn!(node_type = %other, "Unmapped rich node type, flattening to paragraph");
            text_block(node, id, BlockType::Paragraph)?
        }
    };

    Some(block)
}

/// Paragraph-like block; `None` when the node holds no text
fn text_block(node: &RichNode, id: String, block_type: BlockType) -> Option<Block> {
    let text = node.plain_text();
    if text.trim().is_empty() {
        return None;
    }

    let mut block = if node.has_inline_formatting() {
        let mut block = Block::new(id, block_type, serialized(&node.content));
        block.rich = true;
        block
    } else {
        Block::new(id, block_type, text)
    };
    block.style = style_from_attrs(node);
    Some(block)
}

fn style_from_attrs(node: &RichNode) -> StyleOverrides {
    StyleOverrides {
        align: node
            .attr_str("textAlign")
            .filter(|align| *align != "left")
            .map(str::to_string),
        color: node.attr_str("color").map(str::to_string),
        font_size: node.attr_str("fontSize").map(str::to_string),
    }
}

fn apply_style(mut node: RichNode, style: &StyleOverrides) -> RichNode {
    if let Some(align) = &style.align {
        node = node.with_attr("textAlign", Value::from(align.as_str()));
    }
    if let Some(color) = &style.color {
        node = node.with_attr("color", Value::from(color.as_str()));
    }
    if let Some(size) = &style.font_size {
        node = node.with_attr("fontSize", Value::from(size.as_str()));
    }
    node
}

fn inline_content(block: &Block) -> Vec<RichNode> {
    if block.rich {
        match serde_json::from_str::<Vec<RichNode>>(&block.value) {
            Ok(content) => return content,
            Err(e) => {
                warn!(block_id = %block.id, error = %e, "Rich block payload unreadable, using raw text");
            }
        }
    }
    text_content(block.value.clone())
}

fn lines_as_paragraphs(value: &str) -> Vec<RichNode> {
    value.lines().map(RichNode::paragraph).collect()
}

fn block_to_node(block: &Block) -> RichNode {
    match &block.block_type {
        BlockType::Paragraph => {
            apply_style(RichNode::new("paragraph").with_content(inline_content(block)), &block.style)
        }
        BlockType::Heading1 | BlockType::Heading2 | BlockType::Heading3 => {
            let level = block.block_type.heading_level().unwrap_or(1);
            apply_style(
                RichNode::new("heading")
                    .with_attr("level", Value::from(level))
                    .with_content(inline_content(block)),
                &block.style,
            )
        }
        BlockType::Image => {
            let mut node = RichNode::new("image");
            if let Some(src) = &block.source {
                node = node.with_attr("src", Value::from(src.as_str()));
            }
            if let Some(alt) = &block.alt {
                node = node.with_attr("alt", Value::from(alt.as_str()));
            }
            if !block.value.is_empty() {
                node = node.with_attr("title", Value::from(block.value.as_str()));
            }
            node
        }
        BlockType::Code => {
            let mut node = RichNode::new("codeBlock").with_content(text_content(block.value.clone()));
            if let Some(language) = &block.language {
                node = node.with_attr("language", Value::from(language.as_str()));
            }
            node
        }
        BlockType::Quote => apply_style(
            RichNode::new("blockquote").with_content(lines_as_paragraphs(&block.value)),
            &block.style,
        ),
        BlockType::List => {
            let list_type = if block.ordered.unwrap_or(false) {
                "orderedList"
            } else {
                "bulletList"
            };
            let items = block
                .value
                .lines()
                .map(|line| RichNode::new("listItem").with_content(vec![RichNode::paragraph(line)]))
                .collect();
            RichNode::new(list_type).with_content(items)
        }
        BlockType::Divider => RichNode::new("horizontalRule"),
        BlockType::Quiz => {
            let quiz = block.quiz.clone().unwrap_or_else(|| QuizPayload {
                question: block.value.clone(),
                options: Vec::new(),
                correct_index: 0,
            });
            RichNode::new("quiz")
                .with_attr("question", Value::from(quiz.question))
                .with_attr("options", Value::from(quiz.options))
                .with_attr("correctIndex", Value::from(quiz.correct_index as u64))
        }
        BlockType::Video | BlockType::Embed => {
            let node_type = if block.block_type == BlockType::Video { "video" } else { "embed" };
            let mut node = RichNode::new(node_type);
            if let Some(src) = &block.source {
                node = node.with_attr("src", Value::from(src.as_str()));
            }
            if !block.value.is_empty() {
                node = node.with_attr("title", Value::from(block.value.as_str()));
            }
            node
        }
        BlockType::Unknown(tag) => {
            warn!(
                block_id = %block.id,
                block_type = %tag,
                "Unknown block type, degrading to plain-text paragraph"
            );
            RichNode::paragraph(block.value.clone())
        }
    }
}
