use clap::Args;

use super::{TownArgs, parse_key_val, print_json};
use crate::sling::{Sling, SlingError, SlingOutcome, SlingRequest};

#[derive(Debug, Args)]
pub struct SlingArgs {
    #[command(flatten)]
    pub town: TownArgs,
    /// Bead IDs or a formula, optionally followed by a target (rig, agent, or `self`)
    pub items: Vec<String>,
    /// Apply the formula to these beads instead of slinging it standalone
    #[arg(long, value_delimiter = ',', value_name = "BEAD")]
    pub on: Vec<String>,
    /// Formula variable (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub vars: Vec<(String, String)>,
    /// Instructions stored on the bead and included in the start prompt
    #[arg(long)]
    pub args: Option<String>,
    /// Short subject line for the start prompt
    #[arg(long)]
    pub subject: Option<String>,
    /// Extra message appended to the start prompt
    #[arg(long, short = 'm')]
    pub message: Option<String>,
    /// Start the target agent if it is not running
    #[arg(long)]
    pub create: bool,
    /// Re-sling beads that are already hooked or pinned
    #[arg(long)]
    pub force: bool,
    /// Account alias whose config dir the spawned agent uses
    #[arg(long)]
    pub account: Option<String>,
    /// Runtime alias to run instead of the role's default
    #[arg(long)]
    pub agent: Option<String>,
    /// Do not create a tracking convoy
    #[arg(long)]
    pub no_convoy: bool,
    /// Concurrent spawns for a batch
    #[arg(long = "parallel", value_name = "N")]
    pub parallel: Option<usize>,
    /// Maximum running polecats; the sling fails rather than exceed it
    #[arg(long, value_name = "N")]
    pub capacity: Option<usize>,
    /// Go through the dispatch queue; with no beads, drain it
    #[arg(long)]
    pub queue: bool,
    /// Print the plan without changing anything
    #[arg(long)]
    pub dry_run: bool,
    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

impl SlingArgs {
    fn request(&self) -> SlingRequest {
        SlingRequest {
            positionals: self.items.clone(),
            on: self.on.clone(),
            vars: self.vars.clone(),
            args: self.args.clone(),
            subject: self.subject.clone(),
            message: self.message.clone(),
            create: self.create,
            force: self.force,
            account: self.account.clone(),
            agent: self.agent.clone(),
            no_convoy: self.no_convoy,
            parallelism: self.parallel,
            capacity: self.capacity,
            queue: self.queue,
            dry_run: self.dry_run,
        }
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let sling =
            Sling::new(&ctx.town, ctx.beads, ctx.polecats, ctx.sessions).with_identity(ctx.me);
        let outcome = sling.run(&self.request())?;

        if self.json {
            print_json(&outcome)?;
        } else {
            print_outcome(&outcome, self.dry_run);
        }

        if !outcome.failed.is_empty() {
            return Err(SlingError::BatchFailed {
                failed: outcome.failed.len(),
                total: outcome.failed.len() + outcome.assigned.len(),
            }
            .into());
        }
        Ok(())
    }
}

fn print_outcome(outcome: &SlingOutcome, dry_run: bool) {
    if dry_run {
        println!("Dry run, nothing changed:");
        for step in &outcome.plan {
            println!("  {step}");
        }
        return;
    }
    for a in &outcome.assigned {
        println!("{} -> {} (session {})", a.bead, a.agent, a.session);
    }
    if let Some(convoy) = &outcome.convoy {
        println!("convoy: {convoy}");
    }
    if !outcome.queued.is_empty() {
        println!("queued ({}): {}", outcome.queued.len(), outcome.queued.join(", "));
    }
    for f in &outcome.failed {
        eprintln!("failed: {} in {}: {}", f.bead_id, f.rig, f.error);
    }
    if outcome.assigned.is_empty() && outcome.queued.is_empty() && outcome.failed.is_empty() {
        println!("nothing to dispatch");
    }
}
