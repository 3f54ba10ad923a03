use clap::{Args, Subcommand};

use super::{TownArgs, print_json};
use crate::error::ExitError;
use crate::patrol::refinery::{MergeReport, MergeStatus, Refinery};

#[derive(Debug, Subcommand)]
pub enum MqCommand {
    /// Merge open merge requests for a rig
    Process(ProcessArgs),
}

impl MqCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            MqCommand::Process(args) => args.execute(),
        }
    }
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    #[command(flatten)]
    pub town: TownArgs,
    pub rig: String,
    /// Process only this merge request
    pub mr: Option<String>,
    /// Print what would be merged
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub json: bool,
}

impl ProcessArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let refinery = Refinery::new(&ctx.town, &self.rig, ctx.beads)?;
        let report = refinery.process(self.mr.as_deref(), self.dry_run)?;

        if self.json {
            print_json(&report)?;
        } else {
            print_report(&report);
        }

        let failed = report
            .results
            .iter()
            .filter(|r| r.status == MergeStatus::Failed)
            .count();
        if failed > 0 {
            return Err(ExitError::Other(format!("{failed} merge(s) failed")).into());
        }
        Ok(())
    }
}

fn print_report(report: &MergeReport) {
    if report.slot_busy {
        println!("Merge slot for {} is held elsewhere; try again later.", report.rig);
        return;
    }
    if !report.plan.is_empty() {
        println!("Dry run, nothing changed:");
        for step in &report.plan {
            println!("  {step}");
        }
        return;
    }
    if report.results.is_empty() {
        println!("No open merge requests in {}.", report.rig);
        return;
    }
    for r in &report.results {
        let status = match r.status {
            MergeStatus::Merged => "merged",
            MergeStatus::Conflict => "conflict",
            MergeStatus::Skipped => "skipped",
            MergeStatus::Failed => "FAILED",
        };
        let branch = r.branch.as_deref().unwrap_or("-");
        match (&r.commit, &r.detail) {
            (Some(commit), _) => println!("{status:9} {} {branch} @ {}", r.mr, short(commit)),
            (None, Some(detail)) => println!("{status:9} {} {branch}: {}", r.mr, first_line(detail)),
            (None, None) => println!("{status:9} {} {branch}", r.mr),
        }
    }
    println!("{} of {} merged", report.merged(), report.results.len());
}

fn short(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
