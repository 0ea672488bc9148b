//! Running the external "git" binary with a fixed working directory.

use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
};

use log::debug;
use thiserror::Error;

use crate::command::{run_captured, run_captured_with_input, CommandOutput};

/// A failed git invocation. `Exit` carries the exact arguments, the
/// exit status and both captured outputs so callers can both show a
/// useful message and inspect the failure.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("could not start `git` with arguments {args:?} in {dir:?}: {source}")]
    Start {
        args: Vec<String>,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`git` with arguments {args:?} in {dir:?}: {status}, stderr: {stderr:?}, stdout: {stdout:?}")]
    Exit {
        args: Vec<String>,
        dir: PathBuf,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    #[error("`git` with arguments {args:?} in {dir:?} produced output that is not valid UTF-8")]
    Utf8 { args: Vec<String>, dir: PathBuf },
}

impl GitError {
    /// The subprocess exit code, if the invocation got as far as
    /// exiting with one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitError::Exit { status, .. } => status.code(),
            _ => None,
        }
    }
}

/// Runs git commands with the working directory bound at
/// construction. Clearing `PAGER` keeps porcelain commands from
/// blocking on a pager when run from a terminal.
#[derive(Debug, Clone)]
pub struct GitRunner {
    working_dir: PathBuf,
}

const GIT_ENV: &[(&str, &str)] = &[("PAGER", "")];

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        GitRunner {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run git with the given arguments, requiring exit code 0.
    /// Returns stdout, UTF-8 decoded, with trailing newlines removed.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        self.run_inner(args, None)
    }

    /// Like `run`, but any failure (start, non-zero exit, bad
    /// encoding) yields `None` instead of an error. For probes and
    /// cleanup steps whose failure is an acceptable answer.
    pub fn try_run(&self, args: &[&str]) -> Option<String> {
        match self.run(args) {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                debug!("tolerated git failure: {e}");
                None
            }
        }
    }

    /// Like `run`, with `input` piped to git's stdin (e.g. the commit
    /// message for `commit-tree`).
    pub fn run_with_input(&self, args: &[&str], input: &str) -> Result<String, GitError> {
        self.run_inner(args, Some(input))
    }

    fn run_inner(&self, args: &[&str], input: Option<&str>) -> Result<String, GitError> {
        let owned_args = || -> Vec<String> { args.iter().map(|a| (*a).to_owned()).collect() };
        debug!("git {} (in {:?})", args.join(" "), self.working_dir);
        let result = match input {
            None => run_captured(&self.working_dir, "git", args, GIT_ENV),
            Some(input) => {
                run_captured_with_input(&self.working_dir, "git", args, GIT_ENV, input.as_bytes())
            }
        };
        let CommandOutput {
            status,
            stdout,
            stderr,
        } = result.map_err(|source| GitError::Start {
            args: owned_args(),
            dir: self.working_dir.clone(),
            source,
        })?;
        if !status.success() {
            return Err(GitError::Exit {
                args: owned_args(),
                dir: self.working_dir.clone(),
                status,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        let mut stdout = String::from_utf8(stdout).map_err(|_| GitError::Utf8 {
            args: owned_args(),
            dir: self.working_dir.clone(),
        })?;
        while stdout.ends_with('\n') || stdout.ends_with('\r') {
            stdout.pop();
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> GitRunner {
        GitRunner::new(std::env::temp_dir())
    }

    #[test]
    fn t_run_version() {
        let out = runner().run(&["version"]).unwrap();
        assert!(out.starts_with("git version"), "got: {out:?}");
    }

    #[test]
    fn t_run_failure_carries_outputs() {
        let err = runner().run(&["no-such-subcommand"]).unwrap_err();
        match err {
            GitError::Exit { status, stderr, .. } => {
                assert_ne!(status.code(), Some(0));
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn t_try_run_swallows_failure() {
        assert_eq!(runner().try_run(&["no-such-subcommand"]), None);
    }

    #[test]
    fn t_run_with_input() {
        // hash-object without -w works outside any repository
        let out = runner()
            .run_with_input(&["hash-object", "--stdin"], "line 1\n")
            .unwrap();
        assert_eq!(out.len(), 40);
        assert!(out.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
