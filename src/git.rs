//! Git operations over a `Runner`, so the same calls work locally and over SSH.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::subprocess::{RunOutput, Runner};

#[derive(Debug, Clone)]
pub struct Git {
    runner: Runner,
    dir: PathBuf,
}

/// What would be lost by deleting a worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UncommittedWork {
    pub has_changes: bool,
    pub stash_count: usize,
    pub unpushed_count: usize,
}

impl UncommittedWork {
    pub fn is_clean(&self) -> bool {
        !self.has_changes && self.stash_count == 0 && self.unpushed_count == 0
    }
}

impl std::fmt::Display for UncommittedWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.has_changes {
            parts.push("uncommitted changes".to_string());
        }
        if self.stash_count > 0 {
            parts.push(format!("{} stash(es)", self.stash_count));
        }
        if self.unpushed_count > 0 {
            parts.push(format!("{} unpushed commit(s)", self.unpushed_count));
        }
        if parts.is_empty() {
            f.write_str("clean")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict(String),
}

impl Git {
    pub fn new(runner: Runner, dir: &Path) -> Self {
        Self {
            runner,
            dir: dir.to_path_buf(),
        }
    }

    pub fn local(dir: &Path) -> Self {
        Self::new(Runner::Local, dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self, args: &[&str]) -> anyhow::Result<RunOutput> {
        self.runner
            .tool("git")
            .args(args)
            .current_dir(&self.dir)
            .run_ok()
            .with_context(|| format!("git {} in {}", args.join(" "), self.dir.display()))
    }

    fn git_stdout(&self, args: &[&str]) -> anyhow::Result<String> {
        Ok(self.git(args)?.stdout.trim().to_string())
    }

    pub fn fetch(&self, remote: &str) -> anyhow::Result<()> {
        self.git(&["fetch", remote]).map(drop)
    }

    /// `git worktree add -b <branch> <path> <start_point>`.
    pub fn worktree_add(&self, path: &Path, branch: &str, start_point: &str) -> anyhow::Result<()> {
        let path = path.to_string_lossy();
        self.git(&["worktree", "add", "-b", branch, &path, start_point])
            .map(drop)
    }

    pub fn worktree_remove(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let path = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path);
        self.git(&args).map(drop)
    }

    pub fn worktree_prune(&self) -> anyhow::Result<()> {
        self.git(&["worktree", "prune"]).map(drop)
    }

    pub fn current_branch(&self) -> anyhow::Result<String> {
        self.git_stdout(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn clone(runner: &Runner, url: &str, dest: &Path) -> anyhow::Result<Git> {
        let dest_str = dest.to_string_lossy();
        runner
            .tool("git")
            .args(&["clone", url, &dest_str])
            .run_ok()
            .with_context(|| format!("cloning {url}"))?;
        Ok(Git::new(runner.clone(), dest))
    }

    pub fn clone_with_branch(runner: &Runner, url: &str, dest: &Path, branch: &str) -> anyhow::Result<Git> {
        let dest_str = dest.to_string_lossy();
        runner
            .tool("git")
            .args(&["clone", "--branch", branch, url, &dest_str])
            .run_ok()
            .with_context(|| format!("cloning {url} at {branch}"))?;
        Ok(Git::new(runner.clone(), dest))
    }

    /// Local branches matching a glob such as `polecat/*`.
    pub fn list_branches(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let out = self.git_stdout(&[
            "branch",
            "--list",
            pattern,
            "--format=%(refname:short)",
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> anyhow::Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.git(&["branch", flag, branch]).map(drop)
    }

    pub fn check_uncommitted_work(&self) -> anyhow::Result<UncommittedWork> {
        let status = self.git_stdout(&["status", "--porcelain"])?;
        let stashes = self.git_stdout(&["stash", "list"])?;
        // Commits reachable from HEAD that no remote-tracking ref contains.
        let unpushed = self
            .git_stdout(&["rev-list", "--count", "HEAD", "--not", "--remotes"])
            .unwrap_or_default();
        Ok(UncommittedWork {
            has_changes: !status.is_empty(),
            stash_count: stashes.lines().filter(|l| !l.trim().is_empty()).count(),
            unpushed_count: unpushed.parse().unwrap_or(0),
        })
    }

    pub fn count_commits_behind(&self, reference: &str) -> anyhow::Result<usize> {
        let range = format!("HEAD..{reference}");
        let out = self.git_stdout(&["rev-list", "--count", &range])?;
        out.parse()
            .with_context(|| format!("parsing rev-list count '{out}'"))
    }

    pub fn rev_parse(&self, reference: &str) -> anyhow::Result<String> {
        self.git_stdout(&["rev-parse", reference])
    }

    pub fn checkout(&self, branch: &str) -> anyhow::Result<()> {
        self.git(&["checkout", branch]).map(drop)
    }

    pub fn fast_forward(&self, reference: &str) -> anyhow::Result<()> {
        self.git(&["merge", "--ff-only", reference]).map(drop)
    }

    /// Merge `branch` into the current branch; conflicts abort the merge.
    pub fn merge(&self, branch: &str, message: &str) -> anyhow::Result<MergeOutcome> {
        let out = self
            .runner
            .tool("git")
            .args(&["merge", "--no-ff", "-m", message, branch])
            .current_dir(&self.dir)
            .run()?;
        if out.success() {
            return Ok(MergeOutcome::Merged);
        }
        let detail = out.combined().trim().to_string();
        if detail.contains("CONFLICT") || detail.contains("Automatic merge failed") {
            let _ = self.git(&["merge", "--abort"]);
            return Ok(MergeOutcome::Conflict(detail));
        }
        anyhow::bail!("git merge {branch} failed: {detail}")
    }

    pub fn push(&self, remote: &str, refspec: &str) -> anyhow::Result<()> {
        self.git(&["push", remote, refspec]).map(drop)
    }

    pub fn delete_remote_branch(&self, remote: &str, branch: &str) -> anyhow::Result<()> {
        let refspec = format!(":{branch}");
        self.git(&["push", remote, &refspec]).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::Tool;

    fn git_in(dir: &Path, args: &[&str]) {
        Tool::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .run_ok()
            .unwrap();
    }

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git_in(dir.path(), &["init", "-q", "-b", "main"]);
        std::fs::write(dir.path().join("README"), "hi\n").unwrap();
        git_in(dir.path(), &["add", "README"]);
        git_in(dir.path(), &["commit", "-q", "-m", "init"]);
        dir
    }

    #[test]
    fn worktree_lifecycle() {
        let repo = repo();
        let git = Git::local(repo.path());
        let wt = repo.path().join("polecats/nux/rig");
        git.worktree_add(&wt, "polecat/nux", "main").unwrap();
        assert!(wt.join("README").exists());
        assert_eq!(Git::local(&wt).current_branch().unwrap(), "polecat/nux");
        assert_eq!(git.list_branches("polecat/*").unwrap(), vec!["polecat/nux"]);

        git.worktree_remove(&wt, true).unwrap();
        git.worktree_prune().unwrap();
        git.delete_branch("polecat/nux", true).unwrap();
        assert!(git.list_branches("polecat/*").unwrap().is_empty());
    }

    #[test]
    fn uncommitted_work_reports_changes_and_unpushed() {
        let repo = repo();
        let git = Git::local(repo.path());
        let work = git.check_uncommitted_work().unwrap();
        // No remotes: the initial commit counts as unpushed.
        assert!(!work.has_changes);
        assert_eq!(work.stash_count, 0);
        assert_eq!(work.unpushed_count, 1);

        std::fs::write(repo.path().join("README"), "changed\n").unwrap();
        let work = git.check_uncommitted_work().unwrap();
        assert!(work.has_changes);
        assert!(!work.is_clean());
        assert!(work.to_string().contains("uncommitted changes"));
    }

    #[test]
    fn clone_with_branch_checks_out_that_branch() {
        let src = repo();
        git_in(src.path(), &["branch", "polecat/nux"]);
        let dest = tempfile::tempdir().unwrap();
        let url = src.path().to_string_lossy().to_string();
        let clone = Git::clone_with_branch(&Runner::Local, &url, &dest.path().join("c"), "polecat/nux")
            .unwrap();
        assert_eq!(clone.current_branch().unwrap(), "polecat/nux");
        let plain = Git::clone(&Runner::Local, &url, &dest.path().join("p")).unwrap();
        assert_eq!(plain.current_branch().unwrap(), "main");
    }

    #[test]
    fn commits_behind() {
        let repo = repo();
        let git = Git::local(repo.path());
        git_in(repo.path(), &["branch", "old"]);
        std::fs::write(repo.path().join("NEW"), "x\n").unwrap();
        git_in(repo.path(), &["add", "NEW"]);
        git_in(repo.path(), &["commit", "-q", "-m", "second"]);
        git.checkout("old").unwrap();
        assert_eq!(git.count_commits_behind("main").unwrap(), 1);
    }

    #[test]
    fn clean_display() {
        assert_eq!(UncommittedWork::default().to_string(), "clean");
    }
}
