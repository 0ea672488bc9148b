//! Ordered `+`/`-` glob rules applied to a git tree. The filtered
//! tree is materialized through plumbing only (`ls-tree`,
//! `read-tree --empty`, `update-index --cacheinfo`, `write-tree`), so
//! no working-tree checkout happens and file modes survive untouched.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

use run_git::git::GitRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Add,
    Remove,
}

/// One compiled rule from a `+ <glob>` / `- <glob>` specification.
#[derive(Debug)]
pub struct SelectionRule {
    pub kind: RuleKind,
    pub pattern: String,
    regex: Regex,
}

impl SelectionRule {
    pub fn parse(spec: &str) -> Result<SelectionRule> {
        let spec = spec.trim();
        let (kind, glob) = if let Some(rest) = spec.strip_prefix('+') {
            (RuleKind::Add, rest)
        } else if let Some(rest) = spec.strip_prefix('-') {
            (RuleKind::Remove, rest)
        } else {
            bail!("file rule {spec:?} must start with '+' or '-'");
        };
        let glob = glob.trim();
        if glob.is_empty() {
            bail!("file rule {spec:?} has no pattern");
        }
        let regex = Regex::new(&glob_to_regex(glob))
            .with_context(|| anyhow!("compiling file rule pattern {glob:?}"))?;
        Ok(SelectionRule {
            kind,
            pattern: glob.to_owned(),
            regex,
        })
    }

    /// Matching is case-sensitive; paths are normalized to forward
    /// slashes first.
    pub fn matches(&self, path: &str) -> bool {
        if path.contains('\\') {
            self.regex.is_match(&path.replace('\\', "/"))
        } else {
            self.regex.is_match(path)
        }
    }
}

pub fn parse_rules<S: AsRef<str>>(specs: &[S]) -> Result<Vec<SelectionRule>> {
    specs.iter().map(|s| SelectionRule::parse(s.as_ref())).collect()
}

/// Compile an Ant-style glob to an anchored regex: `**` spans path
/// segments, `*` and `?` stay within one segment, a trailing `/`
/// means the directory and everything below it.
fn glob_to_regex(glob: &str) -> String {
    let mut pattern = glob.replace('\\', "/");
    if pattern.ends_with('/') {
        pattern.push_str("**");
    }
    let pattern = pattern.strip_prefix('/').unwrap_or(&pattern);
    let segments: Vec<&str> = pattern.split('/').collect();
    let mut re = String::from("^");
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if *segment == "**" {
            if last {
                if i == 0 {
                    re.push_str(".*");
                } else {
                    re.pop(); // the '/' emitted after the previous segment
                    re.push_str("(?:/.*)?");
                }
            } else {
                re.push_str("(?:[^/]+/)*");
            }
        } else {
            for c in segment.chars() {
                match c {
                    '*' => re.push_str("[^/]*"),
                    '?' => re.push_str("[^/]"),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            if !last {
                re.push('/');
            }
        }
    }
    re.push('$');
    re
}

/// One `ls-tree -r` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: String,
    pub object_type: String,
    pub sha: String,
    pub path: String,
}

/// Parse `ls-tree -r -z` output: `<mode> <type> <sha>\t<path>`
/// records, NUL-separated.
pub fn parse_ls_tree(output: &str) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    for record in output.split('\0') {
        if record.is_empty() {
            continue;
        }
        let (meta, path) = record
            .split_once('\t')
            .ok_or_else(|| anyhow!("malformed ls-tree record {record:?}"))?;
        let mut fields = meta.split_whitespace();
        let (mode, object_type, sha) = match (fields.next(), fields.next(), fields.next()) {
            (Some(mode), Some(object_type), Some(sha)) => (mode, object_type, sha),
            _ => bail!("malformed ls-tree record {record:?}"),
        };
        entries.push(TreeEntry {
            mode: mode.to_owned(),
            object_type: object_type.to_owned(),
            sha: sha.to_owned(),
            path: path.to_owned(),
        });
    }
    Ok(entries)
}

/// Apply the rule list: start with everything when the first rule
/// removes, with nothing otherwise, then let each rule add or remove
/// its matches. Returns the selected entries sorted by path. An empty
/// selection is a valid outcome.
pub fn evaluate_rules<'e>(rules: &[SelectionRule], entries: &'e [TreeEntry]) -> Vec<&'e TreeEntry> {
    let by_path: BTreeMap<&str, &TreeEntry> = entries
        .iter()
        .map(|entry| (entry.path.as_str(), entry))
        .collect();
    let mut selected: BTreeMap<&str, &TreeEntry> = match rules.first() {
        Some(rule) if rule.kind == RuleKind::Remove => by_path.clone(),
        _ => BTreeMap::new(),
    };
    for rule in rules {
        match rule.kind {
            RuleKind::Add => {
                for (path, entry) in &by_path {
                    if rule.matches(path) {
                        selected.insert(path, entry);
                    }
                }
            }
            RuleKind::Remove => {
                selected.retain(|path, _| !rule.matches(path));
            }
        }
    }
    selected.into_values().collect()
}

/// Filter `tree_sha` through the rules inside the given repository,
/// returning the SHA of the new tree. With an empty selection this is
/// the empty tree.
pub fn filter_tree(git: &GitRunner, tree_sha: &str, rules: &[SelectionRule]) -> Result<String> {
    let listing = git
        .run(&["ls-tree", "-r", "-z", tree_sha])
        .with_context(|| anyhow!("listing tree {tree_sha}"))?;
    let entries = parse_ls_tree(&listing)?;
    let selected = evaluate_rules(rules, &entries);
    git.run(&["read-tree", "--empty"])?;
    for entry in &selected {
        let cacheinfo = format!("{},{},{}", entry.mode, entry.sha, entry.path);
        git.run(&["update-index", "--add", "--cacheinfo", &cacheinfo])
            .with_context(|| anyhow!("staging {:?}", entry.path))?;
    }
    let tree = git.run(&["write-tree"])?;
    Ok(tree)
}
