//! Buffered update elements and their line codec.
//!
//! Buffer blocks and sorted runs store one element per line:
//!
//! ```text
//! <key>;<logical_time>;<action>\n
//! ```
//!
//! where `<action>` is `i` for insert and `d` for delete.

use arbor_common::{ArborError, Key, LogicalTime, Result};

/// Field separator of the element line format.
pub const FIELD_SEPARATOR: char = ';';

/// Whether a buffered element inserts or deletes its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Delete,
}

impl Action {
    /// Single-character tag used on disk.
    #[inline]
    pub fn tag(&self) -> char {
        match self {
            Action::Insert => 'i',
            Action::Delete => 'd',
        }
    }

    /// Parses a single-character tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "i" => Some(Action::Insert),
            "d" => Some(Action::Delete),
            _ => None,
        }
    }
}

/// One buffered update travelling down the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferElement {
    pub key: Key,
    pub time: LogicalTime,
    pub action: Action,
}

impl BufferElement {
    pub fn new(key: Key, time: LogicalTime, action: Action) -> Self {
        Self { key, time, action }
    }

    pub fn insert(key: Key, time: LogicalTime) -> Self {
        Self::new(key, time, Action::Insert)
    }

    pub fn delete(key: Key, time: LogicalTime) -> Self {
        Self::new(key, time, Action::Delete)
    }

    #[inline]
    pub fn is_insert(&self) -> bool {
        self.action == Action::Insert
    }

    /// Appends the encoded line, including the trailing newline, to `out`.
    pub fn encode_into(&self, out: &mut String) {
        use std::fmt::Write;
        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "{}{}{}{}{}",
            self.key,
            FIELD_SEPARATOR,
            self.time.0,
            FIELD_SEPARATOR,
            self.action.tag()
        );
    }

    /// Encodes the element as a single line with a trailing newline.
    pub fn encode_line(&self) -> String {
        let mut line = String::with_capacity(32);
        self.encode_into(&mut line);
        line
    }

    /// Parses one line, with or without its trailing line break.
    pub fn parse_line(line: &str) -> Result<Self> {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        let mut fields = trimmed.split(FIELD_SEPARATOR);

        let (Some(key), Some(time), Some(action), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(parse_error(trimmed, "expected exactly three fields"));
        };

        let key = key
            .parse::<Key>()
            .map_err(|e| parse_error(trimmed, &format!("bad key: {}", e)))?;
        let time = time
            .parse::<u64>()
            .map_err(|e| parse_error(trimmed, &format!("bad logical time: {}", e)))?;
        let action = Action::from_tag(action)
            .ok_or_else(|| parse_error(trimmed, "action tag must be 'i' or 'd'"))?;

        Ok(Self::new(key, LogicalTime(time), action))
    }
}

fn parse_error(line: &str, reason: &str) -> ArborError {
    ArborError::ElementParse {
        line: line.to_string(),
        reason: reason.to_string(),
    }
}

/// Encodes a slice of elements into one string, one element per line.
pub fn encode_elements(elements: &[BufferElement]) -> String {
    let mut out = String::with_capacity(elements.len() * 24);
    for element in elements {
        element.encode_into(&mut out);
    }
    out
}

/// Decodes every non-empty line of `text`.
pub fn decode_elements(text: &str) -> Result<Vec<BufferElement>> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(BufferElement::parse_line)
        .collect()
}

/// Sorts by `(key, logical_time)` and keeps only the latest element per key.
///
/// An older insert is cancelled by a newer delete for the same key and vice versa.
pub fn sort_and_collapse(mut elements: Vec<BufferElement>) -> Vec<BufferElement> {
    elements.sort_unstable_by_key(|e| (e.key, e.time));
    collapse_sorted(elements)
}

/// Collapses runs of equal keys in an already sorted vector, keeping the last.
pub fn collapse_sorted(elements: Vec<BufferElement>) -> Vec<BufferElement> {
    let mut out: Vec<BufferElement> = Vec::with_capacity(elements.len());
    for element in elements {
        match out.last_mut() {
            Some(last) if last.key == element.key => *last = element,
            _ => out.push(element),
        }
    }
    out
}

/// Resolves two elements for the same key: the later logical time wins.
#[inline]
pub fn newer(left: BufferElement, right: BufferElement) -> BufferElement {
    if left.time < right.time {
        right
    } else {
        left
    }
}
