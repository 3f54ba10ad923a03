//! Refinery: merge polecat branches for a rig, one merge request at a time.
//!
//! The same code backs the refinery patrol step and `gt mq process`. The
//! rig's merge slot is held for the whole run so only one refinery merges
//! into a rig at once.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use super::Patrol;
use crate::address::AgentAddress;
use crate::beads::fields::{MrFields, parse_mr_fields, set_mr_fields};
use crate::beads::{BeadStore, Db, Issue, IssueType, ListOptions, Status, UpdateOptions};
use crate::error::ExitError;
use crate::feed::Feed;
use crate::git::{Git, MergeOutcome};
use crate::town::Town;

pub const PROCESS_MERGE_QUEUE: &str = "process-merge-queue";
pub const NEEDS_REBASE: &str = "needs-rebase";
const REMOTE: &str = "origin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStatus {
    Merged,
    Conflict,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub mr: String,
    pub status: MergeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MergeResult {
    fn new(mr: &Issue, status: MergeStatus) -> Self {
        Self {
            mr: mr.id.clone(),
            status,
            branch: None,
            commit: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub rig: String,
    pub results: Vec<MergeResult>,
    /// Another holder has the merge slot; nothing was attempted.
    pub slot_busy: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<String>,
}

impl MergeReport {
    pub fn merged(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == MergeStatus::Merged)
            .count()
    }
}

pub struct Refinery {
    rig: String,
    beads: Arc<dyn BeadStore>,
    git: Git,
    feed: Feed,
    holder: String,
}

impl Refinery {
    /// Merges run in the refinery's worktree, or the rig's source checkout
    /// when the refinery has none.
    pub fn new(town: &Town, rig: &str, beads: Arc<dyn BeadStore>) -> anyhow::Result<Self> {
        if !town.has_rig(rig) {
            return Err(ExitError::InvalidInput(format!("unknown rig '{rig}'")).into());
        }
        let addr = AgentAddress::Refinery {
            rig: rig.to_string(),
        };
        let worktree = town.agent_dir(&addr);
        let dir = if worktree.exists() {
            worktree
        } else {
            town.rig_repo_dir(rig)
        };
        Ok(Self {
            rig: rig.to_string(),
            beads,
            git: Git::local(&dir),
            feed: Feed::new(&town.feed_path()),
            holder: addr.to_string(),
        })
    }

    fn db(&self) -> Db {
        Db::Rig(self.rig.clone())
    }

    /// Open merge requests, highest priority (lowest number) first.
    pub fn pending(&self, only: Option<&str>) -> anyhow::Result<Vec<Issue>> {
        if let Some(id) = only {
            let mr = self.beads.show(id)?;
            if mr.issue_type != IssueType::MergeRequest {
                return Err(ExitError::InvalidInput(format!("{id} is not a merge request")).into());
            }
            if mr.status == Status::Closed {
                return Err(ExitError::InvalidInput(format!("{id} is already closed")).into());
            }
            return Ok(vec![mr]);
        }
        let mut open = self.beads.list(
            &self.db(),
            &ListOptions {
                status: Some(Status::Open),
                issue_type: Some(IssueType::MergeRequest),
                ..ListOptions::default()
            },
        )?;
        open.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(open)
    }

    pub fn process(&self, only: Option<&str>, dry_run: bool) -> anyhow::Result<MergeReport> {
        let mut report = MergeReport {
            rig: self.rig.clone(),
            ..MergeReport::default()
        };
        let pending = self.pending(only)?;
        if pending.is_empty() {
            return Ok(report);
        }
        if dry_run {
            report.plan = pending
                .iter()
                .map(|mr| match parse_mr_fields(&mr.description) {
                    Some(f) => format!("merge {} into {} ({})", f.branch, f.target, mr.id),
                    None => format!("skip {} (no branch recorded)", mr.id),
                })
                .collect();
            return Ok(report);
        }

        if !self.beads.merge_slot_acquire(&self.db(), &self.holder)? {
            tracing::info!(rig = %self.rig, "merge slot is held elsewhere");
            report.slot_busy = true;
            return Ok(report);
        }
        for mr in &pending {
            let result = self.merge_one(mr).unwrap_or_else(|e| {
                tracing::warn!(mr = %mr.id, error = %format!("{e:#}"), "merge failed");
                MergeResult {
                    detail: Some(format!("{e:#}")),
                    ..MergeResult::new(mr, MergeStatus::Failed)
                }
            });
            report.results.push(result);
        }
        if let Err(e) = self.beads.merge_slot_release(&self.db(), &self.holder) {
            tracing::warn!(rig = %self.rig, error = %e, "could not release merge slot");
        }
        Ok(report)
    }

    /// A local branch if present, else the remote-tracking one.
    fn merge_ref(&self, branch: &str) -> String {
        match self.git.list_branches(branch) {
            Ok(found) if found.iter().any(|b| b == branch) => branch.to_string(),
            _ => format!("{REMOTE}/{branch}"),
        }
    }

    fn merge_one(&self, mr: &Issue) -> anyhow::Result<MergeResult> {
        let Some(mut fields) = parse_mr_fields(&mr.description) else {
            return Ok(MergeResult {
                detail: Some("no branch recorded".into()),
                ..MergeResult::new(mr, MergeStatus::Skipped)
            });
        };
        let fetched = match self.git.fetch(REMOTE) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(mr = %mr.id, error = %format!("{e:#}"), "fetch failed, merging what is local");
                false
            }
        };
        self.git.checkout(&fields.target)?;
        if fetched {
            self.git
                .fast_forward(&format!("{REMOTE}/{}", fields.target))?;
        }
        let source = self.merge_ref(&fields.branch);
        let message = format!("Merge {} ({})", fields.branch, mr.id);
        match self.git.merge(&source, &message)? {
            MergeOutcome::Merged => self.land(mr, fields),
            MergeOutcome::Conflict(detail) => {
                fields.retry_count += 1;
                self.beads.update(
                    &mr.id,
                    &UpdateOptions {
                        description: Some(set_mr_fields(&mr.description, &fields)),
                        add_labels: vec![NEEDS_REBASE.to_string()],
                        ..UpdateOptions::default()
                    },
                )?;
                tracing::warn!(mr = %mr.id, branch = %fields.branch, retries = fields.retry_count, "merge conflict");
                self.feed.record(
                    "merge-conflict",
                    &self.holder,
                    json!({ "mr": mr.id, "branch": fields.branch, "worker": fields.worker }),
                );
                Ok(MergeResult {
                    branch: Some(fields.branch),
                    detail: Some(detail),
                    ..MergeResult::new(mr, MergeStatus::Conflict)
                })
            }
        }
    }

    /// Push the merge, close the MR and its source issue, drop the branch.
    fn land(&self, mr: &Issue, mut fields: MrFields) -> anyhow::Result<MergeResult> {
        self.git.push(REMOTE, &fields.target)?;
        let commit = self.git.rev_parse("HEAD")?;
        fields.merge_commit = Some(commit.clone());
        fields.close_reason = Some("merged".into());
        self.beads.update(
            &mr.id,
            &UpdateOptions {
                description: Some(set_mr_fields(&mr.description, &fields)),
                remove_labels: if mr.has_label(NEEDS_REBASE) {
                    vec![NEEDS_REBASE.to_string()]
                } else {
                    Vec::new()
                },
                ..UpdateOptions::default()
            },
        )?;
        self.beads.close(&mr.id, Some("merged"))?;
        if let Some(source) = &fields.source_issue
            && let Err(e) = self.beads.close(source, Some(&format!("merged in {}", mr.id)))
        {
            tracing::warn!(mr = %mr.id, source = %source, error = %e, "could not close source issue");
        }

        if self.git.list_branches(&fields.branch).is_ok_and(|b| !b.is_empty())
            && let Err(e) = self.git.delete_branch(&fields.branch, true)
        {
            tracing::warn!(branch = %fields.branch, error = %format!("{e:#}"), "could not delete local branch");
        }
        if let Err(e) = self.git.delete_remote_branch(REMOTE, &fields.branch) {
            tracing::warn!(branch = %fields.branch, error = %format!("{e:#}"), "could not delete remote branch");
        }

        tracing::info!(mr = %mr.id, branch = %fields.branch, commit = %commit, "merged");
        self.feed.record(
            "merged",
            &self.holder,
            json!({ "mr": mr.id, "branch": fields.branch, "commit": commit, "source": fields.source_issue }),
        );
        Ok(MergeResult {
            branch: Some(fields.branch),
            commit: Some(commit),
            ..MergeResult::new(mr, MergeStatus::Merged)
        })
    }
}

impl Patrol {
    pub(super) fn process_merge_queue(&self) -> anyhow::Result<usize> {
        let refinery = Refinery::new(&self.town, &self.rig, self.beads.clone())?;
        let report = refinery.process(None, false)?;
        // MRs without a branch are skipped every cycle and are not work.
        Ok(report
            .results
            .iter()
            .filter(|r| r.status != MergeStatus::Skipped)
            .count())
    }
}
