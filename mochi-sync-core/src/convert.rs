//! Built-in converters from markdown documents to cards.
//!
//! The engine only depends on the [`Converter`] trait; these implementations
//! cover the common layouts:
//!
//! - [`NoteConverter`]: one card per file, named after the file stem.
//! - [`HeadingsConverter`]: one card per `## ` section.
//! - [`VocabularyConverter`]: one templated card per `- term: meaning` line.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::contract::{ConvertError, Converter, ParsedCard};
use crate::operation::Attachment;

/// Types of built-in converter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParserKind {
    #[default]
    Note,
    Headings,
    Vocabulary,
}

/// A parser name outside the built-in set.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unsupported parser: {0} (expected note, headings or vocabulary)")]
pub struct UnknownParser(pub String);

impl FromStr for ParserKind {
    type Err = UnknownParser;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(ParserKind::Note),
            "headings" => Ok(ParserKind::Headings),
            "vocabulary" => Ok(ParserKind::Vocabulary),
            other => Err(UnknownParser(other.to_string())),
        }
    }
}

impl ParserKind {
    pub fn converter(self) -> Box<dyn Converter> {
        match self {
            ParserKind::Note => Box::new(NoteConverter),
            ParserKind::Headings => Box::new(HeadingsConverter),
            ParserKind::Vocabulary => Box::new(VocabularyConverter),
        }
    }
}

fn image_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("valid image link regex"))
}

fn vocabulary_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*[-*]\s+(.+?)\s*(?::| - | — )\s*(.+?)\s*$").expect("valid vocabulary regex")
    })
}

fn is_local_link(target: &str) -> bool {
    !(target.contains("://") || target.starts_with("data:") || target.starts_with("@media/"))
}

/// Local image paths referenced by markdown `content`.
pub fn attachment_refs(content: &str) -> BTreeSet<String> {
    image_link()
        .captures_iter(content)
        .map(|c| c[2].to_string())
        .filter(|target| is_local_link(target))
        .collect()
}

/// Point image links at uploaded media: `![x](img/a.png)` → `![x](@media/<name>)`.
pub fn rewrite_media_links(content: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return content.to_string();
    }
    let names: BTreeMap<&str, &str> = attachments
        .iter()
        .map(|a| (a.path.as_str(), a.name.as_str()))
        .collect();
    image_link()
        .replace_all(content, |c: &regex::Captures<'_>| match names.get(&c[2]) {
            Some(name) => format!("![{}](@media/{})", &c[1], name),
            None => c[0].to_string(),
        })
        .into_owned()
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// One card per file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoteConverter;

impl Converter for NoteConverter {
    fn convert(&self, path: &str, source: &[u8]) -> Result<Vec<ParsedCard>, ConvertError> {
        let text = std::str::from_utf8(source)?;
        if text.trim().is_empty() {
            debug!(path, "Empty note, no card");
            return Ok(Vec::new());
        }
        Ok(vec![ParsedCard {
            name: file_stem(path),
            content: text.trim().to_string(),
            fields: BTreeMap::new(),
            pos: None,
            filename: file_name(path),
            attachments: attachment_refs(text),
        }])
    }
}

/// One card per level-two heading. A file without such headings becomes a
/// single card, as with [`NoteConverter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadingsConverter;

impl Converter for HeadingsConverter {
    fn convert(&self, path: &str, source: &[u8]) -> Result<Vec<ParsedCard>, ConvertError> {
        let text = std::str::from_utf8(source)?;
        let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
        let mut in_fence = false;
        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            match line.strip_prefix("## ") {
                Some(heading) if !in_fence => sections.push((heading.trim().to_string(), vec![line])),
                _ => {
                    if let Some((_, lines)) = sections.last_mut() {
                        lines.push(line);
                    }
                }
            }
        }
        if sections.is_empty() {
            return NoteConverter.convert(path, source);
        }
        let filename = file_name(path);
        Ok(sections
            .into_iter()
            .enumerate()
            .filter(|(_, (heading, _))| !heading.is_empty())
            .map(|(idx, (heading, lines))| {
                let content = lines.join("\n").trim().to_string();
                ParsedCard {
                    name: heading,
                    attachments: attachment_refs(&content),
                    content,
                    fields: BTreeMap::new(),
                    pos: Some(format!("{idx:04}")),
                    filename: filename.clone(),
                }
            })
            .collect())
    }
}

/// One card per `- term: meaning` list item, with `name` and `meaning` fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct VocabularyConverter;

impl Converter for VocabularyConverter {
    fn convert(&self, path: &str, source: &[u8]) -> Result<Vec<ParsedCard>, ConvertError> {
        let text = std::str::from_utf8(source)?;
        let filename = file_name(path);
        let mut seen = BTreeSet::new();
        let mut cards = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let Some(captures) = vocabulary_line().captures(line) else {
                continue;
            };
            let term = captures[1].trim().to_string();
            let meaning = captures[2].trim().to_string();
            if !seen.insert(term.clone()) {
                warn!(path, line = line_no + 1, term = %term, "Duplicate vocabulary term");
            }
            let fields = BTreeMap::from([
                ("name".to_string(), term.clone()),
                ("meaning".to_string(), meaning.clone()),
            ]);
            cards.push(ParsedCard {
                content: format!("# {term}\n---\n{meaning}"),
                name: term,
                fields,
                pos: Some(format!("{:04}", cards.len())),
                filename: filename.clone(),
                attachments: BTreeSet::new(),
            });
        }
        if cards.is_empty() && !text.trim().is_empty() {
            return Err(ConvertError::Invalid {
                path: path.to_string(),
                message: "no `- term: meaning` entries found".to_string(),
            });
        }
        Ok(cards)
    }
}
