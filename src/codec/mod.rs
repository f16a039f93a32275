//! Block codec
//!
//! Compresses editor documents into a flat list of typed blocks grouped into
//! lessons, and back. Pure and synchronous; no I/O.
//!
//! ```text
//! RichNode (doc)
//!   ├── heading "Intro"        ──►  Block { t: h1, v: "Intro" }
//!   ├── paragraph ""           ──►  (dropped)
//!   └── paragraph "Hello"      ──►  Block { t: p,  v: "Hello" }
//! ```

mod convert;
mod model;
mod rich_doc;

pub use convert::{differs, dirty_set, BlockCodec, DerivedBlocks};
pub use model::{
    Block, BlockType, CourseBlob, Lesson, LessonBody, QuizPayload, StyleOverrides, SCHEMA_VERSION,
};
pub use rich_doc::{Mark, RichNode};
