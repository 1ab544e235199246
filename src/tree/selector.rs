//! Selector grammar for [`MemoryTree`](super::MemoryTree).
//!
//! Supported subset:
//! - type selectors (`div`) and the universal selector (`*`)
//! - `.class`, `#id`, `[attr]`, `[attr=value]` (quoted values may hold spaces and commas)
//! - the descendant combinator (whitespace)
//! - selector lists (`a, b`)

use std::sync::OnceLock;

use regex::Regex;

use super::TreeError;

const COMPOUND_PATTERN: &str = r#"^(\*|[A-Za-z][\w-]*)?((?:\.[\w-]+|#[\w-]+|\[[\w-]+(?:=(?:"[^"]*"|'[^']*'|[^\]\s"']*))?\])*)$"#;
const SIMPLE_PATTERN: &str = r#"\.([\w-]+)|#([\w-]+)|\[([\w-]+)(?:=("[^"]*"|'[^']*'|[^\]\s"']*))?\]"#;

static COMPOUND_RE: OnceLock<Option<Regex>> = OnceLock::new();
static SIMPLE_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Result<&'static Regex, TreeError> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| TreeError::InvalidSelector {
            selector: pattern.to_string(),
            reason: "selector grammar failed to compile".to_string(),
        })
}

/// Attribute view the matcher needs from a node.
pub trait ElementView {
    /// Lower-case tag name.
    fn tag(&self) -> &str;

    /// Attribute value, if present.
    fn attribute(&self, name: &str) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrTest {
    Present(String),
    Equals(String, String),
}

/// One compound selector: tag plus ids, classes and attribute tests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompoundSelector {
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attributes: Vec<AttrTest>,
}

impl CompoundSelector {
    fn parse(source: &str, token: &str) -> Result<Self, TreeError> {
        let invalid = |reason: &str| TreeError::InvalidSelector {
            selector: source.to_string(),
            reason: reason.to_string(),
        };

        let caps = compiled(&COMPOUND_RE, COMPOUND_PATTERN)?
            .captures(token)
            .ok_or_else(|| invalid(&format!("unsupported token '{token}'")))?;

        let mut out = Self {
            tag: caps
                .get(1)
                .map(|m| m.as_str())
                .filter(|t| *t != "*")
                .map(str::to_ascii_lowercase),
            ..Self::default()
        };

        let rest = caps.get(2).map_or("", |m| m.as_str());
        for part in compiled(&SIMPLE_RE, SIMPLE_PATTERN)?.captures_iter(rest) {
            if let Some(class) = part.get(1) {
                out.classes.push(class.as_str().to_string());
            } else if let Some(id) = part.get(2) {
                out.ids.push(id.as_str().to_string());
            } else if let Some(name) = part.get(3) {
                let name = name.as_str().to_string();
                match part.get(4) {
                    Some(value) => out.attributes.push(AttrTest::Equals(name, unquote(value.as_str()))),
                    None => out.attributes.push(AttrTest::Present(name)),
                }
            }
        }

        Ok(out)
    }

    /// Returns true if `element` satisfies every test of this compound.
    pub fn matches<E: ElementView + ?Sized>(&self, element: &E) -> bool {
        if let Some(tag) = &self.tag {
            if !element.tag().eq_ignore_ascii_case(tag) {
                return false;
            }
        }

        if !self.ids.is_empty() {
            let Some(id) = element.attribute("id") else {
                return false;
            };
            if self.ids.iter().any(|want| want.as_str() != id) {
                return false;
            }
        }

        if !self.classes.is_empty() {
            let classes = element.attribute("class").unwrap_or("");
            let has = |want: &String| classes.split_whitespace().any(|c| c == want.as_str());
            if !self.classes.iter().all(has) {
                return false;
            }
        }

        self.attributes.iter().all(|test| match test {
            AttrTest::Present(name) => element.attribute(name).is_some(),
            AttrTest::Equals(name, value) => element.attribute(name) == Some(value.as_str()),
        })
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// A descendant chain; the last compound is the subject.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ComplexSelector {
    compounds: Vec<CompoundSelector>,
}

impl ComplexSelector {
    /// `lineage[0]` is the candidate node, followed by its ancestors nearest first.
    fn matches<E: ElementView + ?Sized>(&self, lineage: &[&E]) -> bool {
        let Some((subject, ancestors)) = self.compounds.split_last() else {
            return false;
        };
        let Some((node, above)) = lineage.split_first() else {
            return false;
        };
        if !subject.matches(*node) {
            return false;
        }

        let mut remaining = above.iter();
        ancestors
            .iter()
            .rev()
            .all(|compound| remaining.any(|el| compound.matches(*el)))
    }
}

/// Splits `text` at every `sep` character outside a quoted attribute value.
fn split_unquoted(text: &str, sep: impl Fn(char) -> bool) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut quote = None;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if sep(c) => {
                pieces.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            None => {}
        }
    }
    pieces.push(&text[start..]);
    pieces
}

/// A parsed, comma-separated selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList {
    alternatives: Vec<ComplexSelector>,
}

impl SelectorList {
    /// Parses selector text.
    pub fn parse(source: &str) -> Result<Self, TreeError> {
        let mut alternatives = Vec::new();

        for group in split_unquoted(source, |c| c == ',') {
            let compounds = split_unquoted(group, char::is_whitespace)
                .into_iter()
                .filter(|token| !token.is_empty())
                .map(|token| CompoundSelector::parse(source, token))
                .collect::<Result<Vec<_>, _>>()?;

            if compounds.is_empty() {
                return Err(TreeError::InvalidSelector {
                    selector: source.to_string(),
                    reason: "empty selector group".to_string(),
                });
            }

            alternatives.push(ComplexSelector { compounds });
        }

        Ok(Self { alternatives })
    }

    /// Matches the node at `lineage[0]`, whose ancestors follow nearest first.
    pub fn matches<E: ElementView + ?Sized>(&self, lineage: &[&E]) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(lineage))
    }
}
