//! The publishing engine. Reconciles the source's ordered `live/*`
//! tags against the releases already on LIVE's main branch, decides
//! where to (re)start under the chosen mode, grafts one squashed
//! commit per tag onto a temporary branch in a throwaway workspace,
//! and pushes branch and tags to LIVE.

use std::{
    collections::HashSet,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use thiserror::Error;

use run_git::git::{GitError, GitRunner};

use crate::{
    file_selector::{self, SelectionRule},
    provenance::{self, ProvenanceRecord, PublishedSet},
    source_tags::{self, SourceTag, LIVE_TAG_PREFIX},
    workspace::{Workspace, LIVE_REMOTE, SOURCE_REMOTE},
};

/// Remote-tracking ref of LIVE's main branch inside the workspace.
const LIVE_MAIN_REF: &str = "refs/remotes/LIVE/main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Publish only tags newer than the newest already-published one;
    /// refuse to run when the published prefix has gaps.
    #[default]
    Incremental,
    /// Publish every tag whose source commit LIVE does not carry,
    /// force-updating branch and tags.
    Repair,
    /// Rebuild LIVE from scratch: delete its tags, rewrite main as an
    /// orphan history.
    Nuke,
}

impl SyncMode {
    fn forces_push(self) -> bool {
        matches!(self, SyncMode::Repair | SyncMode::Nuke)
    }
}

#[derive(Debug)]
pub struct SyncOptions {
    /// Path of the private source repository (fetched from, never
    /// written to).
    pub source_repo: PathBuf,
    /// LIVE URL, already normalized and possibly carrying
    /// credentials.
    pub live_url: String,
    /// Ordered file-selection rules; empty means publish trees
    /// unfiltered.
    pub rules: Vec<SelectionRule>,
    pub mode: SyncMode,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub tags_published: usize,
}

/// The failure taxonomy; `exit_code` is the public CLI contract.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("repository detection failed: {0}")]
    Detection(String),
    #[error("no LIVE repository URL configured (give --url=…, set GITLIVE_URL, or put `url = …` into gitlive.z0)")]
    MissingUrl,
    #[error("LIVE remote is not usable: {0}")]
    LiveUnreachable(String),
    #[error("publishing {tag} failed: {cause:#}")]
    PublishStep { tag: String, cause: anyhow::Error },
    #[error("the published history on LIVE has a gap: {tag} is not published although later tags are; run again with --repair to fill the gaps, or --nuke to rebuild LIVE")]
    Divergence { tag: String },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Detection(_) => 1,
            SyncError::MissingUrl => 2,
            SyncError::LiveUnreachable(_) => 3,
            SyncError::PublishStep { .. } => 4,
            SyncError::Divergence { .. } => 5,
            SyncError::Git(_) => 10,
            SyncError::Other(_) => 11,
        }
    }
}

/// Where the publishing loop starts, per mode.
#[derive(Debug, PartialEq, Eq)]
pub enum StartDecision {
    Start(usize),
    NothingToDo,
}

/// The mode state machine over the ordered tag list and the
/// published-set. Pure; the divergence check is the only failure.
pub fn decide_start_index(
    tags: &[SourceTag],
    published: &PublishedSet,
    mode: SyncMode,
) -> Result<StartDecision, SyncError> {
    if mode == SyncMode::Nuke || published.is_empty() {
        return Ok(StartDecision::Start(0));
    }
    match mode {
        SyncMode::Nuke => unreachable!("handled above"),
        SyncMode::Repair => Ok(tags
            .iter()
            .position(|tag| !published.contains(&tag.full_sha))
            .map(StartDecision::Start)
            .unwrap_or(StartDecision::NothingToDo)),
        SyncMode::Incremental => {
            let Some(last) = tags
                .iter()
                .rposition(|tag| published.contains(&tag.full_sha))
            else {
                // LIVE carries releases but none of them corresponds
                // to a current tag; there is no published prefix to
                // contradict.
                return Ok(StartDecision::Start(0));
            };
            for tag in &tags[..=last] {
                if !published.contains(&tag.full_sha) {
                    return Err(SyncError::Divergence {
                        tag: tag.name.clone(),
                    });
                }
            }
            Ok(StartDecision::Start(last + 1))
        }
    }
}

pub struct Publisher {
    options: SyncOptions,
}

impl Publisher {
    pub fn new(options: SyncOptions) -> Self {
        Publisher { options }
    }

    /// Run one synchronization. All history construction happens in a
    /// workspace that is deleted on every exit path; LIVE is only
    /// touched in the push phase.
    pub fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let workspace = Workspace::create(&self.options.source_repo, &self.options.live_url)
            .map_err(SyncError::Other)?;
        let result = self.sync_in(workspace.git());
        sweep_temporary_branches(workspace.git());
        result
    }

    fn sync_in(&self, git: &GitRunner) -> Result<SyncOutcome, SyncError> {
        git.run(&["fetch", SOURCE_REMOTE, "--tags"])?;
        // LIVE may not have a main branch yet.
        git.try_run(&["fetch", LIVE_REMOTE, "main", "--tags"]);
        // The probe must answer; an empty answer from a reachable
        // virgin repository is fine.
        if git.try_run(&["ls-remote", LIVE_REMOTE]).is_none() {
            return Err(SyncError::LiveUnreachable(format!(
                "`git ls-remote` failed for {}",
                self.options.live_url
            )));
        }

        let published = PublishedSet::recover(git, LIVE_MAIN_REF);
        debug!("recovered {} published release(s) from LIVE", published.len());
        if let Some(timestamp) = published.last_published_timestamp {
            debug!("newest recovered release has committer time {timestamp}");
        }

        let tags = source_tags::collect_live_tags(git).map_err(SyncError::Other)?;
        if tags.is_empty() {
            info!("the source repository has no live/* tags; nothing to publish");
            return Ok(SyncOutcome { tags_published: 0 });
        }

        let start = match decide_start_index(&tags, &published, self.options.mode)? {
            StartDecision::NothingToDo => tags.len(),
            StartDecision::Start(start) => start,
        };
        if start >= tags.len() {
            info!("all {} release tag(s) are already published", tags.len());
            return Ok(SyncOutcome { tags_published: 0 });
        }

        let mut parent = match self.options.mode {
            SyncMode::Nuke => None,
            _ => Some(git.run(&["rev-parse", LIVE_MAIN_REF]).map_err(|e| {
                SyncError::LiveUnreachable(format!(
                    "LIVE has no main branch to continue from (only --nuke can start one): {e}"
                ))
            })?),
        };

        let branch = temporary_branch_name();
        if let Some(tip) = &parent {
            git.run(&["update-ref", &format!("refs/heads/{branch}"), tip])?;
        }

        let mut published_now: Vec<(String, String)> = Vec::new();
        let mut prev_sha: Option<&str> = (start > 0).then(|| tags[start - 1].full_sha.as_str());
        for tag in &tags[start..] {
            let new_sha = self
                .publish_one(git, tag, prev_sha, parent.as_deref(), &branch)
                .map_err(|cause| SyncError::PublishStep {
                    tag: tag.name.clone(),
                    cause,
                })?;
            info!("publishing {} as {} ({})", tag.name, tag.display_name(), &new_sha[..7.min(new_sha.len())]);
            published_now.push((tag.name.clone(), new_sha.clone()));
            parent = Some(new_sha);
            prev_sha = Some(tag.full_sha.as_str());
        }

        if self.options.dry_run {
            info!("dry run: would push {} tag(s) to LIVE", published_now.len());
            return Ok(SyncOutcome {
                tags_published: published_now.len(),
            });
        }

        self.push_phase(git, &tags, &published, &published_now, &branch)?;
        info!("published {} tag(s)", published_now.len());
        Ok(SyncOutcome {
            tags_published: published_now.len(),
        })
    }

    /// Graft one release: filter the tag's tree, build the squashed
    /// commit with its provenance block, advance the temporary branch
    /// and move the local tag onto the new commit.
    fn publish_one(
        &self,
        git: &GitRunner,
        tag: &SourceTag,
        prev_sha: Option<&str>,
        parent: Option<&str>,
        branch: &str,
    ) -> Result<String> {
        let mut tree = git.run(&["rev-parse", &format!("{}^{{tree}}", tag.full_sha)])?;
        if !self.options.rules.is_empty() {
            tree = file_selector::filter_tree(git, &tree, &self.options.rules)
                .with_context(|| anyhow!("filtering the tree of {}", tag.name))?;
        }
        let commit_count = count_range_commits(git, prev_sha, &tag.full_sha)?;
        let record = ProvenanceRecord {
            source_sha: &tag.full_sha,
            tag_name: &tag.name,
            commit_count,
        };
        let message = provenance::commit_message(tag.display_name(), &tag.short_sha, &record);
        let mut args = vec!["commit-tree", tree.as_str()];
        if let Some(parent) = parent {
            args.push("-p");
            args.push(parent);
        }
        let new_sha = git.run_with_input(&args, &message)?;
        git.run(&["update-ref", &format!("refs/heads/{branch}"), &new_sha])?;
        git.run(&["tag", "-f", &tag.name, &new_sha])?;
        Ok(new_sha)
    }

    /// Push branch and tags; in Nuke mode first delete every tag LIVE
    /// carries. Ends with the normalization pass that converges LIVE's
    /// tag set with the local release list, so a partially-failed
    /// earlier run heals here.
    fn push_phase(
        &self,
        git: &GitRunner,
        tags: &[SourceTag],
        published: &PublishedSet,
        published_now: &[(String, String)],
        branch: &str,
    ) -> Result<(), SyncError> {
        let force = if self.options.mode.forces_push() { "+" } else { "" };
        if self.options.mode == SyncMode::Nuke {
            if let Some(listing) = git.try_run(&["ls-remote", "--tags", LIVE_REMOTE]) {
                for name in remote_tag_names(&listing) {
                    debug!("deleting LIVE tag {name:?}");
                    let refname = format!("refs/tags/{name}");
                    if git.try_run(&["push", LIVE_REMOTE, "--delete", &refname]).is_none() {
                        warn!("could not delete tag {name:?} on LIVE");
                    }
                }
            }
        }

        let branch_refspec = format!("{force}refs/heads/{branch}:refs/heads/main");
        git.run(&["push", LIVE_REMOTE, &branch_refspec])?;

        for (local, _) in published_now {
            let remote = local.strip_prefix(LIVE_TAG_PREFIX).unwrap_or(local);
            let refspec = format!("{force}refs/tags/{local}:refs/tags/{remote}");
            git.run(&["push", LIVE_REMOTE, &refspec])?;
        }

        // Normalization: every local release tag whose source commit
        // is published must exist on LIVE, whether it was created this
        // run or by an earlier one. Failures here are not fatal; the
        // next run converges further.
        let remote_tags: HashSet<String> = git
            .try_run(&["ls-remote", "--tags", LIVE_REMOTE])
            .map(|listing| remote_tag_names(&listing).collect())
            .unwrap_or_default();
        for tag in tags {
            let remote = tag.display_name();
            if remote_tags.contains(remote) {
                continue;
            }
            let pushed = if published_now.iter().any(|(local, _)| *local == tag.name) {
                let refspec = format!("{force}refs/tags/{}:refs/tags/{remote}", tag.name);
                git.try_run(&["push", LIVE_REMOTE, &refspec])
            } else if let Some(live_sha) = published.live_sha(&tag.full_sha) {
                // Published by a prior run but its tag never made it
                // to LIVE.
                let refspec = format!("{force}{live_sha}:refs/tags/{remote}");
                git.try_run(&["push", LIVE_REMOTE, &refspec])
            } else {
                continue;
            };
            if pushed.is_none() {
                warn!("could not push tag {remote:?} to LIVE");
            }
        }
        Ok(())
    }
}

/// Source commits in this release's range: everything reachable from
/// `sha` but not from the previous release's source commit. The
/// recorded SHAs are used rather than the tag names because the loop
/// force-moves local tags as it grafts.
fn count_range_commits(git: &GitRunner, prev: Option<&str>, sha: &str) -> Result<usize> {
    let range = match prev {
        Some(prev) => format!("{prev}..{sha}"),
        None => sha.to_owned(),
    };
    let listing = git.run(&["log", "--pretty=format:%H", "--reverse", &range])?;
    Ok(listing.lines().filter(|line| !line.trim().is_empty()).count())
}

fn temporary_branch_name() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("tmp-sync-{}-{}", seconds, std::process::id())
}

/// Drop our temporary branch and any stray ones a crashed run left
/// behind.
fn sweep_temporary_branches(git: &GitRunner) {
    let Some(listing) = git.try_run(&[
        "for-each-ref",
        "--format=%(refname)",
        "refs/heads/tmp-sync-*",
    ]) else {
        return;
    };
    for refname in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        git.try_run(&["update-ref", "-d", refname]);
    }
}

/// Tag names from `ls-remote --tags` output, with the `^{}`
/// dereference entries folded into their tag.
fn remote_tag_names(listing: &str) -> impl Iterator<Item = String> + '_ {
    listing
        .lines()
        .filter_map(|line| {
            let (_sha, refname) = line.split_once('\t')?;
            let name = refname.strip_prefix("refs/tags/")?;
            let name = name.strip_suffix("^{}").unwrap_or(name);
            Some(name.to_owned())
        })
        .unique()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, index: usize) -> SourceTag {
        SourceTag {
            name: name.to_owned(),
            timestamp: index as i64 * 100,
            full_sha: format!("{index:0>40x}"),
            short_sha: format!("{index:0>7x}"),
        }
    }

    fn tags() -> Vec<SourceTag> {
        vec![
            tag("live/1.0.0", 1),
            tag("live/2.0.0", 2),
            tag("live/3.0.0", 3),
        ]
    }

    fn published(indices: &[usize]) -> PublishedSet {
        let mut set = PublishedSet::default();
        for index in indices {
            set.insert(&format!("{index:0>40x}"), format!("live-{index}"));
        }
        set
    }

    #[test]
    fn t_nuke_always_starts_at_zero() {
        let decision = decide_start_index(&tags(), &published(&[1, 2, 3]), SyncMode::Nuke).unwrap();
        assert_eq!(decision, StartDecision::Start(0));
    }

    #[test]
    fn t_empty_published_set_starts_at_zero() {
        for mode in [SyncMode::Incremental, SyncMode::Repair] {
            let decision = decide_start_index(&tags(), &published(&[]), mode).unwrap();
            assert_eq!(decision, StartDecision::Start(0));
        }
    }

    #[test]
    fn t_incremental_continues_after_published_prefix() {
        let decision =
            decide_start_index(&tags(), &published(&[1]), SyncMode::Incremental).unwrap();
        assert_eq!(decision, StartDecision::Start(1));
        let decision =
            decide_start_index(&tags(), &published(&[1, 2]), SyncMode::Incremental).unwrap();
        assert_eq!(decision, StartDecision::Start(2));
        let decision =
            decide_start_index(&tags(), &published(&[1, 2, 3]), SyncMode::Incremental).unwrap();
        assert_eq!(decision, StartDecision::Start(3));
    }

    #[test]
    fn t_incremental_detects_divergence() {
        // 1.0.0 and 3.0.0 are published, 2.0.0 is not: the prefix up
        // to the newest published tag has a gap.
        let err = decide_start_index(&tags(), &published(&[1, 3]), SyncMode::Incremental)
            .unwrap_err();
        match err {
            SyncError::Divergence { tag } => assert_eq!(tag, "live/2.0.0"),
            other => panic!("expected divergence, got {other:?}"),
        }
        assert_eq!(
            decide_start_index(&tags(), &published(&[1, 3]), SyncMode::Incremental)
                .unwrap_err()
                .exit_code(),
            5
        );
    }

    #[test]
    fn t_repair_starts_at_first_missing() {
        let decision = decide_start_index(&tags(), &published(&[1, 3]), SyncMode::Repair).unwrap();
        assert_eq!(decision, StartDecision::Start(1));
        let decision = decide_start_index(&tags(), &published(&[2, 3]), SyncMode::Repair).unwrap();
        assert_eq!(decision, StartDecision::Start(0));
    }

    #[test]
    fn t_repair_with_nothing_missing() {
        let decision =
            decide_start_index(&tags(), &published(&[1, 2, 3]), SyncMode::Repair).unwrap();
        assert_eq!(decision, StartDecision::NothingToDo);
    }

    #[test]
    fn t_incremental_without_overlap_starts_over() {
        let decision =
            decide_start_index(&tags(), &published(&[9]), SyncMode::Incremental).unwrap();
        assert_eq!(decision, StartDecision::Start(0));
    }

    #[test]
    fn t_exit_codes() {
        assert_eq!(SyncError::Detection(String::new()).exit_code(), 1);
        assert_eq!(SyncError::MissingUrl.exit_code(), 2);
        assert_eq!(SyncError::LiveUnreachable(String::new()).exit_code(), 3);
        assert_eq!(
            SyncError::PublishStep {
                tag: String::new(),
                cause: anyhow::anyhow!("x")
            }
            .exit_code(),
            4
        );
        assert_eq!(
            SyncError::Divergence {
                tag: String::new()
            }
            .exit_code(),
            5
        );
        assert_eq!(SyncError::Other(anyhow::anyhow!("x")).exit_code(), 11);
    }

    #[test]
    fn t_remote_tag_names_strips_deref_suffix() {
        let listing = "aaaa\trefs/tags/1.0.0\nbbbb\trefs/tags/1.0.0^{}\ncccc\trefs/tags/2.0.0\ndddd\trefs/heads/main\n";
        let names: Vec<String> = remote_tag_names(listing).collect();
        assert_eq!(names, vec!["1.0.0", "2.0.0"]);
    }

    #[test]
    fn t_temporary_branch_name_shape() {
        let name = temporary_branch_name();
        assert!(name.starts_with("tmp-sync-"));
        assert_eq!(name.split('-').count(), 4);
    }
}
