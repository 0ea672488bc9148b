//! Collecting the source repository's `live/*` release tags and
//! putting them into publication order.

use anyhow::Result;
use log::warn;

use run_git::git::GitRunner;

pub const LIVE_TAG_PREFIX: &str = "live/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTag {
    /// Full tag name including the `live/` prefix.
    pub name: String,
    /// Committer time of the tagged commit.
    pub timestamp: i64,
    pub full_sha: String,
    pub short_sha: String,
}

impl SourceTag {
    /// The tag's name on LIVE: the local name with the `live/` prefix
    /// stripped. This is the only rename the tool performs.
    pub fn display_name(&self) -> &str {
        self.name
            .strip_prefix(LIVE_TAG_PREFIX)
            .unwrap_or(&self.name)
    }
}

/// Ascending committer time; ties broken by name so the resulting
/// history is a total order.
pub fn order_tags(tags: &mut [SourceTag]) {
    tags.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// List the `live/*` tags known to the given repository, resolved to
/// their commits and ordered for publication. A tag whose committer
/// timestamp cannot be read is skipped with a warning. An empty
/// result is not an error.
pub fn collect_live_tags(git: &GitRunner) -> Result<Vec<SourceTag>> {
    let listing = git.run(&["tag", "--list", "live/*"])?;
    let mut tags = Vec::new();
    for name in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        // ^{} peels annotated tags to the commit they point at.
        let peeled = format!("{name}^{{}}");
        let timestamp = git
            .try_run(&["log", "-1", "--format=%ct", name])
            .and_then(|out| out.trim().parse::<i64>().ok());
        let Some(timestamp) = timestamp else {
            warn!("skipping tag {name:?}: its committer timestamp cannot be read");
            continue;
        };
        let full_sha = git.run(&["rev-parse", &peeled])?;
        let short_sha = match git.try_run(&["rev-parse", "--short", &peeled]) {
            Some(short) if !short.is_empty() => short,
            _ => full_sha.chars().take(7).collect(),
        };
        tags.push(SourceTag {
            name: name.to_owned(),
            timestamp,
            full_sha,
            short_sha,
        });
    }
    order_tags(&mut tags);
    Ok(tags)
}
