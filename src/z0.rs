//! The Z0 configuration format: a minimal, line-oriented, hierarchical
//! key/value syntax. Used both for the on-disk `gitlive.z0` file and
//! for the provenance blocks embedded in LIVE commit messages.
//!
//! The parser is forward-only: once navigation leaves a subtree, that
//! subtree is locked and later assignments into it are rejected. This
//! keeps the combination of dotted keys, sections and implicit arrays
//! unambiguous.

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use std::collections::HashSet;

#[derive(Debug, Error)]
#[error("line {line}: {message}")]
pub struct Z0Error {
    pub line: usize,
    pub message: String,
}

fn z0_error(line: usize, message: impl Into<String>) -> Z0Error {
    Z0Error {
        line,
        message: message.into(),
    }
}

/// Key comparison is case-insensitive and treats `-` and `_` as the
/// same character; this is the canonical form used for lookups,
/// hashing and lock bookkeeping.
pub fn canonical_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// No child seen yet.
    Unknown,
    /// Elements are scalar values.
    Value,
    /// Elements are objects.
    Dictionary,
}

/// A node is exactly one of: scalar value, object, array. Assigning
/// across kinds is a parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Value(String),
    Object(Object),
    Array(Array),
}

impl Node {
    fn empty_object() -> Node {
        Node::Object(Object {
            entries: Vec::new(),
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Value(s) => Some(s),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Node::Value(_) => "value",
            Node::Object(_) => "object",
            Node::Array(_) => "array",
        }
    }
}

/// Ordered mapping of child name to node; names are unique under
/// `canonical_key`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Object {
    entries: Vec<(String, Node)>,
}

impl Object {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        let canon = canonical_key(key);
        self.entries
            .iter()
            .find(|(k, _)| canonical_key(k) == canon)
            .map(|(_, node)| node)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        let canon = canonical_key(key);
        self.entries
            .iter_mut()
            .find(|(k, _)| canonical_key(k) == canon)
            .map(|(_, node)| node)
    }

    fn insert(&mut self, key: String, node: Node) {
        self.entries.push((key, node));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, n)| (k.as_str(), n))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Array {
    pub kind: ArrayKind,
    pub items: Vec<Node>,
}

lazy_static! {
    static ref SEGMENT_RE: Regex =
        Regex::new("^([A-Za-z_-][A-Za-z0-9_-]*|[0-9]+)$").expect("static pattern");
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn parse_path(s: &str, line: usize) -> Result<Vec<String>, Z0Error> {
    if s.is_empty() {
        return Err(z0_error(line, "empty path"));
    }
    if s.starts_with('.') || s.ends_with('.') {
        return Err(z0_error(
            line,
            format!("path {s:?} may not start or end with '.'"),
        ));
    }
    if s.contains("..") {
        return Err(z0_error(line, format!("path {s:?} contains '..'")));
    }
    let segments: Vec<String> = s.split('.').map(|seg| seg.to_owned()).collect();
    for segment in &segments {
        if segment != "#" && !SEGMENT_RE.is_match(segment) {
            return Err(z0_error(line, format!("invalid path segment {segment:?}")));
        }
    }
    Ok(segments)
}

/// Whether a segment of a new path matches a concrete segment of the
/// current-node path. `#` is matched by any numeric (array index)
/// segment.
fn segment_matches(new_segment: &str, concrete: &str) -> bool {
    if new_segment == "#" {
        is_numeric(concrete)
    } else {
        canonical_key(new_segment) == canonical_key(concrete)
    }
}

fn canonical_path(concrete: &[String]) -> Vec<String> {
    concrete.iter().map(|s| canonical_key(s)).collect()
}

/// What the final segment of a navigation produces.
enum Target<'v> {
    /// Assignment: the last segment becomes a scalar with this value.
    Value(&'v str),
    /// Section header: the last segment becomes (or already is) a
    /// container node.
    Section,
}

struct Parser {
    root: Node,
    /// Concrete path (array indices resolved) of the node reached by
    /// the previous assignment or section header.
    current_path: Vec<String>,
    /// Raw segments of the current section, prefixed to assignment
    /// keys. May contain `#`.
    section: Vec<String>,
    locked: HashSet<Vec<String>>,
}

impl Parser {
    fn new() -> Self {
        Parser {
            root: Node::empty_object(),
            current_path: Vec::new(),
            section: Vec::new(),
            locked: HashSet::new(),
        }
    }

    fn line(&mut self, line: usize, raw: &str) -> Result<(), Z0Error> {
        let text = raw.trim();
        if text.is_empty() || text.starts_with("//") {
            return Ok(());
        }
        if let Some((left, right)) = text.split_once('=') {
            let key_path = parse_path(left.trim(), line)?;
            if let (Some(section_first), Some(key_first)) = (self.section.first(), key_path.first())
            {
                // Guard against the `a.a...` mirage: assigning `a = v`
                // inside a section starting with `a` almost certainly
                // means a section reset is missing.
                if canonical_key(section_first) == canonical_key(key_first) {
                    return Err(z0_error(
                        line,
                        format!(
                            "assignment to {key_first:?} inside section starting with \
                             {section_first:?} would nest the name inside itself \
                             (missing section reset?)"
                        ),
                    ));
                }
            }
            let mut target = self.section.clone();
            target.extend(key_path);
            self.navigate(line, &target, Target::Value(right.trim()))
        } else if let Some(before) = text.strip_suffix(':') {
            let path = parse_path(before.trim(), line)?;
            self.navigate(line, &path, Target::Section)?;
            self.section = path;
            Ok(())
        } else {
            Err(z0_error(
                line,
                format!("expected `key = value` or `section:`, got {text:?}"),
            ))
        }
    }

    fn navigate(&mut self, line: usize, target: &[String], what: Target) -> Result<(), Z0Error> {
        // Longest common prefix of the target and the current-node
        // path, under canonical key equality with `#` matching any
        // concrete index.
        let mut lcp = 0;
        while lcp < target.len()
            && lcp < self.current_path.len()
            && segment_matches(&target[lcp], &self.current_path[lcp])
        {
            lcp += 1;
        }
        // A `#` always produces a new array element: when the whole
        // target was consumed by the prefix and ends in `#`, back up
        // one level so the walk down appends instead of re-entering
        // the previous element.
        if lcp == target.len() && target.last().map(String::as_str) == Some("#") {
            lcp -= 1;
        }
        // Walk up, locking every node left behind.
        for depth in (lcp + 1..=self.current_path.len()).rev() {
            self.locked
                .insert(canonical_path(&self.current_path[..depth]));
        }
        // Walk down from the join point, creating nodes as needed.
        let mut concrete: Vec<String> = self.current_path[..lcp].to_vec();
        let remaining = &target[lcp..];
        for (i, segment) in remaining.iter().enumerate() {
            let last = i + 1 == remaining.len();
            let child = self.step(line, &concrete, segment, last, &what)?;
            concrete.push(child);
            if self.locked.contains(&canonical_path(&concrete)) {
                return Err(z0_error(
                    line,
                    format!(
                        "cannot assign into {:?}: this part of the document was already closed",
                        concrete.join(".")
                    ),
                ));
            }
        }
        if remaining.is_empty() {
            // Target is a (non-`#`) prefix of the current path: the
            // node already exists. Only re-assignments end up here.
            let node = node_at(&mut self.root, &concrete);
            match (&what, &node) {
                (Target::Section, _) => {}
                (Target::Value(_), node) => {
                    return Err(z0_error(
                        line,
                        format!(
                            "cannot assign a value to {:?}: already a {}",
                            concrete.join("."),
                            node.kind_name()
                        ),
                    ));
                }
            }
        }
        self.current_path = concrete;
        Ok(())
    }

    /// Perform one step of the walk down: resolve or create the child
    /// of the node at `parent_path` named by `segment`. Returns the
    /// concrete child key (the index for array elements).
    fn step(
        &mut self,
        line: usize,
        parent_path: &[String],
        segment: &str,
        last: bool,
        what: &Target,
    ) -> Result<String, Z0Error> {
        let shown_path = || {
            if parent_path.is_empty() {
                "the document root".to_owned()
            } else {
                format!("{:?}", parent_path.join("."))
            }
        };
        let parent = node_at(&mut self.root, parent_path);
        // An empty object can still become an array; one with named
        // children cannot.
        if segment == "#" || is_numeric(segment) {
            if let Node::Object(object) = parent {
                if object.is_empty() {
                    *parent = Node::Array(Array {
                        kind: ArrayKind::Unknown,
                        items: Vec::new(),
                    });
                }
            }
        }
        match parent {
            Node::Value(_) => Err(z0_error(
                line,
                format!("cannot navigate into {}: it is a value", shown_path()),
            )),
            Node::Array(array) => {
                let index = if segment == "#" {
                    array.items.len()
                } else if is_numeric(segment) {
                    let index: usize = segment.parse().map_err(|_| {
                        z0_error(line, format!("array index {segment:?} out of range"))
                    })?;
                    if index > array.items.len() {
                        return Err(z0_error(
                            line,
                            format!(
                                "array index {index} in {} skips over index {}",
                                shown_path(),
                                array.items.len()
                            ),
                        ));
                    }
                    index
                } else {
                    return Err(z0_error(
                        line,
                        format!(
                            "cannot add named child {segment:?} to {}: it is an array",
                            shown_path()
                        ),
                    ));
                };
                let element_kind = if last {
                    match what {
                        Target::Value(_) => ArrayKind::Value,
                        Target::Section => ArrayKind::Dictionary,
                    }
                } else {
                    ArrayKind::Dictionary
                };
                if index == array.items.len() {
                    match (array.kind, element_kind) {
                        (ArrayKind::Unknown, kind) => array.kind = kind,
                        (have, want) if have == want => {}
                        (have, want) => {
                            return Err(z0_error(
                                line,
                                format!(
                                    "array {} mixes {have:?} and {want:?} elements",
                                    shown_path()
                                ),
                            ));
                        }
                    }
                    array.items.push(match what {
                        Target::Value(value) if last => Node::Value((*value).to_owned()),
                        _ => Node::empty_object(),
                    });
                } else if last {
                    if let Target::Value(_) = what {
                        return Err(z0_error(
                            line,
                            format!("array element {index} in {} already exists", shown_path()),
                        ));
                    }
                }
                Ok(index.to_string())
            }
            Node::Object(object) => {
                if object.get(segment).is_some() {
                    if last {
                        if let Target::Value(_) = what {
                            let existing = object.get(segment).expect("just found");
                            return Err(z0_error(
                                line,
                                format!(
                                    "{segment:?} in {} is already assigned (a {})",
                                    shown_path(),
                                    existing.kind_name()
                                ),
                            ));
                        }
                    }
                } else {
                    let node = match what {
                        Target::Value(value) if last => Node::Value((*value).to_owned()),
                        _ => Node::empty_object(),
                    };
                    object.insert(segment.to_owned(), node);
                }
                Ok(segment.to_owned())
            }
        }
    }
}

/// Resolve the node at a concrete path. The path was produced by the
/// walk that created these nodes, so it always resolves.
fn node_at<'n>(root: &'n mut Node, path: &[String]) -> &'n mut Node {
    let mut node = root;
    for segment in path {
        node = match node {
            Node::Object(object) => object.get_mut(segment).expect("concrete path resolves"),
            Node::Array(array) => {
                let index: usize = segment.parse().expect("concrete array index");
                &mut array.items[index]
            }
            Node::Value(_) => unreachable!("concrete path never traverses a value"),
        };
    }
    node
}

/// Parse a Z0 document. The root is always an object.
pub fn parse(text: &str) -> Result<Node, Z0Error> {
    let mut parser = Parser::new();
    for (index, raw_line) in text.lines().enumerate() {
        parser.line(index + 1, raw_line)?;
    }
    Ok(parser.root)
}

/// Tolerant read access over a parse result. A missing child yields an
/// absent cursor rather than an error, so lookups chain without
/// intermediate checks; absent is falsy.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    node: Option<&'a Node>,
}

impl<'a> Cursor<'a> {
    pub fn new(root: &'a Node) -> Self {
        Cursor { node: Some(root) }
    }

    pub fn absent() -> Self {
        Cursor { node: None }
    }

    pub fn exists(&self) -> bool {
        self.node.is_some()
    }

    pub fn get(&self, key: &str) -> Cursor<'a> {
        let node = match self.node {
            Some(Node::Object(object)) => object.get(key),
            Some(Node::Array(array)) if is_numeric(key) => {
                key.parse::<usize>().ok().and_then(|i| array.items.get(i))
            }
            _ => None,
        };
        Cursor { node }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).exists()
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.node.and_then(|node| node.as_str())
    }

    /// The scalar value here, or `default` when missing or not a
    /// scalar.
    pub fn optional(&self, default: &str) -> String {
        self.as_str().unwrap_or(default).to_owned()
    }

    /// The scalar value here; an error naming the key when missing or
    /// not a scalar.
    pub fn required(&self, what: &str) -> Result<&'a str> {
        self.as_str()
            .ok_or_else(|| anyhow!("missing required configuration value {what:?}"))
    }

    /// The array elements here; empty for anything that is not an
    /// array.
    pub fn items(&self) -> impl Iterator<Item = Cursor<'a>> + 'a {
        let items: &[Node] = match self.node {
            Some(Node::Array(array)) => &array.items,
            _ => &[],
        };
        items.iter().map(|node| Cursor { node: Some(node) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(text: &str) -> Node {
        parse(text).unwrap()
    }

    fn parse_err(text: &str) -> Z0Error {
        parse(text).unwrap_err()
    }

    #[test]
    fn t_scalars_and_nesting() {
        let doc = root("a = 1\nb.c = two words  \n");
        let cursor = Cursor::new(&doc);
        assert_eq!(cursor.get("a").as_str(), Some("1"));
        assert_eq!(cursor.get("b").get("c").as_str(), Some("two words"));
    }

    #[test]
    fn t_comments_and_blank_lines() {
        let doc = root("\n  // comment\na = 1\n   \n// another\n");
        assert_eq!(Cursor::new(&doc).get("a").as_str(), Some("1"));
    }

    #[test]
    fn t_sections_prefix_assignments() {
        let doc = root("top:\nx = 1\ny = 2\n");
        let cursor = Cursor::new(&doc).get("top");
        assert_eq!(cursor.get("x").as_str(), Some("1"));
        assert_eq!(cursor.get("y").as_str(), Some("2"));
    }

    #[test]
    fn t_key_equality_case_and_separator() {
        let doc = root("Commit-Count = 7\n");
        let cursor = Cursor::new(&doc);
        assert_eq!(cursor.get("commit_count").as_str(), Some("7"));
        assert_eq!(cursor.get("COMMIT-COUNT").as_str(), Some("7"));
    }

    #[test]
    fn t_value_in_equals_sign() {
        let doc = root("k = a = b\n");
        assert_eq!(Cursor::new(&doc).get("k").as_str(), Some("a = b"));
    }

    #[test]
    fn t_value_array() {
        let doc = root("files:\n# = + *.md\n# = - secret.txt\n");
        let values: Vec<String> = Cursor::new(&doc)
            .get("files")
            .items()
            .map(|item| item.optional(""))
            .collect();
        assert_eq!(values, vec!["+ *.md", "- secret.txt"]);
    }

    #[test]
    fn t_dictionary_array_via_repeated_headers() {
        let doc = root(
            "entry.#:\nname = a\nvalue = 1\nentry.#:\nname = b\nvalue = 2\n",
        );
        let entries: Vec<(String, String)> = Cursor::new(&doc)
            .get("entry")
            .items()
            .map(|item| (item.get("name").optional(""), item.get("value").optional("")))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "2".to_owned())
            ]
        );
    }

    #[test]
    fn t_array_rejects_named_child() {
        let e = parse_err("a.# = 1\na.b = 2\n");
        assert_eq!(e.line, 2);
    }

    #[test]
    fn t_array_rejects_kind_mix() {
        let e = parse_err("a.# = 1\na.#.b = 2\n");
        assert_eq!(e.line, 2);
    }

    #[test]
    fn t_reopening_left_section_fails() {
        let e = parse_err("s:\nx = 1\nt:\ny = 2\ns:\nz = 3\n");
        assert_eq!(e.line, 5);
    }

    #[test]
    fn t_reopening_left_subtree_fails() {
        let e = parse_err("a.b.x = 1\nc = 2\na.b.y = 3\n");
        assert_eq!(e.line, 3);
    }

    #[test]
    fn t_sibling_assignments_stay_open() {
        let doc = root("a.b = 1\na.c = 2\n");
        let cursor = Cursor::new(&doc).get("a");
        assert_eq!(cursor.get("b").as_str(), Some("1"));
        assert_eq!(cursor.get("c").as_str(), Some("2"));
    }

    #[test]
    fn t_duplicate_assignment_fails() {
        let e = parse_err("a = 1\na = 2\n");
        assert_eq!(e.line, 2);
    }

    #[test]
    fn t_value_object_conflicts() {
        assert_eq!(parse_err("a = 1\na.b = 2\n").line, 2);
        assert_eq!(parse_err("a.b = 1\na = 2\n").line, 2);
    }

    #[test]
    fn t_cycle_mirage_guard() {
        let e = parse_err("a:\na = 1\n");
        assert_eq!(e.line, 2);
        // Different first segments are fine.
        let doc = root("a:\nb = 1\n");
        assert_eq!(Cursor::new(&doc).get("a").get("b").as_str(), Some("1"));
    }

    #[test]
    fn t_path_validation() {
        assert!(parse(".a = 1").is_err());
        assert!(parse("a. = 1").is_err());
        assert!(parse("a..b = 1").is_err());
        assert!(parse("a b = 1").is_err());
        assert!(parse("just a line").is_err());
    }

    #[test]
    fn t_error_carries_line_number() {
        let e = parse_err("a = 1\nb = 2\n???\n");
        assert_eq!(e.line, 3);
        assert!(e.to_string().starts_with("line 3:"));
    }

    #[test]
    fn t_cursor_chaining_over_missing() {
        let doc = root("a = 1\n");
        let cursor = Cursor::new(&doc).get("missing").get("deeper");
        assert!(!cursor.exists());
        assert_eq!(cursor.optional("fallback"), "fallback");
        assert!(cursor.required("deeper").is_err());
        assert_eq!(cursor.items().count(), 0);
    }

    #[test]
    fn t_contains_key() {
        let doc = root("a.b = 1\n");
        let cursor = Cursor::new(&doc);
        assert!(cursor.contains_key("a"));
        assert!(cursor.get("a").contains_key("b"));
        assert!(!cursor.contains_key("z"));
    }

    #[test]
    fn t_array_index_lookup() {
        let doc = root("files:\n# = one\n# = two\n");
        let files = Cursor::new(&doc).get("files");
        assert_eq!(files.get("0").as_str(), Some("one"));
        assert_eq!(files.get("1").as_str(), Some("two"));
        assert!(!files.get("2").exists());
    }
}
