use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Args;

use super::{TownArgs, print_json};
use crate::patrol::{CycleReport, LoopOptions, Patrol, PatrolRole};

#[derive(Debug, Args)]
pub struct PatrolArgs {
    #[command(flatten)]
    pub town: TownArgs,
    pub rig: String,
    #[arg(value_enum)]
    pub role: PatrolRole,
    /// Run one cycle and exit
    #[arg(long)]
    pub once: bool,
    /// Base seconds between cycles; idle cycles back off from here
    #[arg(long, default_value_t = 30)]
    pub interval: u64,
    /// Print each cycle report as JSON
    #[arg(long)]
    pub json: bool,
}

impl PatrolArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let patrol = Patrol::new(
            &ctx.town,
            &self.rig,
            self.role,
            ctx.beads,
            ctx.polecats,
            ctx.sessions,
        )?;

        if self.once {
            let report = patrol.run_cycle()?;
            return self.print(&report);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let _ = ctrlc::set_handler(move || {
            eprintln!("stopping after this cycle");
            flag.store(true, Ordering::SeqCst);
        });

        eprintln!("{} patrol for {} started (Ctrl-C to stop)", self.role, self.rig);
        patrol.run_loop(
            &LoopOptions {
                interval: Duration::from_secs(self.interval.max(1)),
                max_cycles: None,
            },
            &stop,
            |report| {
                if let Err(e) = self.print(report) {
                    tracing::warn!(error = %e, "could not print cycle report");
                }
            },
        )
    }

    fn print(&self, report: &CycleReport) -> anyhow::Result<()> {
        if self.json {
            return print_json(report);
        }
        let steps: Vec<String> = report
            .steps
            .iter()
            .map(|s| format!("{}={}", s.name, s.actions))
            .collect();
        println!(
            "{} {} patrol {}: {} (idle {})",
            report.rig,
            report.role,
            report.molecule,
            steps.join(" "),
            report.idle
        );
        Ok(())
    }
}
