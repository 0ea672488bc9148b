//! The `// GitLive` provenance block embedded in every published
//! commit message. It is written once when grafting and parsed back
//! on every later run to recover which source commits LIVE already
//! carries; its stability is a wire contract.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use log::debug;

use run_git::git::GitRunner;

use crate::z0::{self, Cursor};

pub const MARKER: &str = "// GitLive";

/// What a squashed release commit records about its origin.
#[derive(Debug)]
pub struct ProvenanceRecord<'a> {
    /// Full 40-hex source commit SHA; the only key recovery matches
    /// by.
    pub source_sha: &'a str,
    /// Original tag name including the `live/` prefix.
    pub tag_name: &'a str,
    /// Number of source commits squashed into this release.
    pub commit_count: usize,
}

/// The full commit message: human-readable subject, blank line, then
/// the provenance block.
pub fn commit_message(display_tag: &str, short_sha: &str, record: &ProvenanceRecord) -> String {
    let date = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    format!(
        "GitLive: publish {display_tag} commit {short_sha}\n\
         \n\
         {MARKER}\n\
         commit = {}\n\
         tag = {}\n\
         date = {date}\n\
         commit-count = {}\n",
        record.source_sha, record.tag_name, record.commit_count
    )
}

/// Extract the source commit SHA a commit message claims to publish.
/// `None` when there is no marker or the block does not parse — such
/// commits (e.g. a hand-made seed commit) are simply not ours.
pub fn source_sha_from_message(message: &str) -> Option<String> {
    let start = message.find(MARKER)?;
    let root = z0::parse(&message[start..]).ok()?;
    let commit = Cursor::new(&root).get("commit").as_str()?.trim().to_owned();
    (!commit.is_empty()).then_some(commit)
}

/// The releases LIVE already carries: source commit SHA (matched
/// case-insensitively) to the LIVE commit publishing it.
#[derive(Debug, Default)]
pub struct PublishedSet {
    by_source: HashMap<String, String>,
    /// Largest committer time among the recovered LIVE commits.
    pub last_published_timestamp: Option<i64>,
}

impl PublishedSet {
    /// Scan the LIVE main branch newest-to-oldest and parse each
    /// commit's provenance block. A missing branch or an unparseable
    /// message is not an error; those commits are skipped. Scanning
    /// newest first and overwriting means the oldest entry wins on
    /// duplicate source SHAs.
    pub fn recover(git: &GitRunner, live_main_ref: &str) -> PublishedSet {
        let mut set = PublishedSet::default();
        let Some(listing) = git.try_run(&["log", "--pretty=format:%H %ct", live_main_ref]) else {
            return set;
        };
        for line in listing.lines() {
            let Some((live_sha, timestamp)) = line.trim().split_once(' ') else {
                continue;
            };
            let Some(body) = git.try_run(&["log", "-1", "--format=%B", live_sha]) else {
                continue;
            };
            let Some(source_sha) = source_sha_from_message(&body) else {
                debug!("LIVE commit {live_sha} carries no provenance; skipping");
                continue;
            };
            set.insert(&source_sha, live_sha.to_owned());
            if let Ok(t) = timestamp.trim().parse::<i64>() {
                set.last_published_timestamp = Some(set.last_published_timestamp.unwrap_or(t).max(t));
            }
        }
        set
    }

    pub fn insert(&mut self, source_sha: &str, live_sha: String) {
        self.by_source.insert(source_sha.to_lowercase(), live_sha);
    }

    pub fn contains(&self, source_sha: &str) -> bool {
        self.by_source.contains_key(&source_sha.to_lowercase())
    }

    pub fn live_sha(&self, source_sha: &str) -> Option<&str> {
        self.by_source
            .get(&source_sha.to_lowercase())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "ab12cd3ef4567890ab12cd3ef4567890ab12cd3e";

    #[test]
    fn t_message_round_trip() {
        let record = ProvenanceRecord {
            source_sha: SHA,
            tag_name: "live/1.0.0",
            commit_count: 7,
        };
        let message = commit_message("1.0.0", "ab12cd3", &record);
        assert!(message.starts_with("GitLive: publish 1.0.0 commit ab12cd3\n\n// GitLive\n"));
        assert_eq!(source_sha_from_message(&message).unwrap(), SHA);
        // The other keys are present and parseable too.
        let start = message.find(MARKER).unwrap();
        let root = z0::parse(&message[start..]).unwrap();
        let cursor = Cursor::new(&root);
        assert_eq!(cursor.get("tag").as_str(), Some("live/1.0.0"));
        assert_eq!(cursor.get("commit-count").as_str(), Some("7"));
        assert!(cursor.get("date").as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn t_message_without_marker() {
        assert_eq!(source_sha_from_message("initial seed commit\n"), None);
        assert_eq!(source_sha_from_message(""), None);
    }

    #[test]
    fn t_message_with_unparseable_block() {
        let message = format!("subject\n\n{MARKER}\n???\n");
        assert_eq!(source_sha_from_message(&message), None);
        let message = format!("subject\n\n{MARKER}\ntag = live/x\n");
        assert_eq!(source_sha_from_message(&message), None, "no commit key");
    }

    #[test]
    fn t_published_set_is_case_insensitive() {
        let mut set = PublishedSet::default();
        set.insert(&SHA.to_uppercase(), "live0".to_owned());
        assert!(set.contains(SHA));
        assert!(set.contains(&SHA.to_uppercase()));
        assert_eq!(set.live_sha(SHA), Some("live0"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn t_published_set_overwrite_keeps_latest_insert() {
        // `recover` scans newest to oldest, so the oldest (deepest)
        // entry is inserted last and wins.
        let mut set = PublishedSet::default();
        set.insert(SHA, "newest".to_owned());
        set.insert(SHA, "oldest".to_owned());
        assert_eq!(set.live_sha(SHA), Some("oldest"));
        assert_eq!(set.len(), 1);
    }
}
