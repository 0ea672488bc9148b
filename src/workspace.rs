//! The throwaway repository in which the new LIVE history is
//! constructed. Nothing outside this directory is ever mutated until
//! the push phase, and the directory is removed on every exit path.

use std::{
    fs,
    path::{Path, PathBuf},
    thread::sleep,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use walkdir::WalkDir;

use run_git::git::GitRunner;

/// Remote name for the private source repository.
pub const SOURCE_REMOTE: &str = "REPO";
/// Remote name for the public target repository.
pub const LIVE_REMOTE: &str = "LIVE";

/// Fixed synthetic committer identity, so a LIVE commit SHA is a
/// function of tree, parents, message and nothing machine-specific.
const COMMITTER_NAME: &str = "GitLive Publisher";
const COMMITTER_EMAIL: &str = "gitlive@transient.local";

pub struct Workspace {
    dir: PathBuf,
    git: GitRunner,
}

impl Workspace {
    /// Create a unique `gitlive-publisher-*` temp directory holding a
    /// fresh repository with the two remotes configured.
    pub fn create(source_repo: &Path, live_url: &str) -> Result<Workspace> {
        let dir = tempfile::Builder::new()
            .prefix("gitlive-publisher-")
            .tempdir()
            .context("creating the workspace directory")?
            .into_path();
        debug!("workspace at {dir:?}");
        let git = GitRunner::new(&dir);
        let workspace = Workspace { dir, git };
        workspace.git.run(&["init", "--quiet"])?;
        workspace.git.run(&["config", "user.name", COMMITTER_NAME])?;
        workspace.git.run(&["config", "user.email", COMMITTER_EMAIL])?;
        let source = source_repo.to_string_lossy();
        workspace
            .git
            .run(&["remote", "add", SOURCE_REMOTE, source.as_ref()])?;
        workspace.git.run(&["remote", "add", LIVE_REMOTE, live_url])?;
        Ok(workspace)
    }

    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = remove_dir_all_robust(&self.dir) {
            warn!("could not remove workspace {:?}: {e:#}", self.dir);
        }
    }
}

const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_BACKOFF: Duration = Duration::from_millis(200);

/// Remove a directory tree, tolerating read-only entries: some
/// platforms mark `.git/objects/pack/*` read-only, which makes a
/// plain recursive delete fail there.
pub fn remove_dir_all_robust(dir: &Path) -> Result<()> {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match fs::remove_dir_all(dir) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                if attempt == REMOVE_ATTEMPTS {
                    return Err(e).with_context(|| {
                        anyhow!("removing {dir:?} (after {REMOVE_ATTEMPTS} attempts)")
                    });
                }
                clear_readonly(dir);
                sleep(REMOVE_BACKOFF);
            }
        }
    }
    unreachable!("loop returns on the last attempt")
}

fn clear_readonly(dir: &Path) {
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if let Ok(metadata) = entry.metadata() {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), permissions);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_workspace_is_removed_on_drop() {
        let workspace = Workspace::create(Path::new("."), "https://example.com/live.git").unwrap();
        let dir = workspace.path().to_owned();
        assert!(dir.join(".git").exists());
        drop(workspace);
        assert!(!dir.exists());
    }

    #[test]
    fn t_remove_tolerates_readonly_entries() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let file = dir.join("locked.pack");
        fs::write(&file, b"x").unwrap();
        let mut permissions = fs::metadata(&file).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&file, permissions).unwrap();
        remove_dir_all_robust(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn t_remove_of_missing_directory_is_ok() {
        remove_dir_all_robust(Path::new("/nonexistent/gitlive-test-void")).unwrap();
    }
}
