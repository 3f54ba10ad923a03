use clap::Args;

use super::{TownArgs, print_json};
use crate::sling::Sling;

#[derive(Debug, Args)]
pub struct HookArgs {
    #[command(flatten)]
    pub town: TownArgs,
    /// Bead to attach to yourself; omit to show what is on your hook
    pub bead: Option<String>,
    /// Take the bead even if it is hooked or pinned elsewhere
    #[arg(long)]
    pub force: bool,
    #[arg(long)]
    pub json: bool,
}

impl HookArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.town.context()?;
        let sling =
            Sling::new(&ctx.town, ctx.beads, ctx.polecats, ctx.sessions).with_identity(ctx.me);

        let Some(bead) = &self.bead else {
            let current = sling.current_hook()?;
            if self.json {
                return print_json(&current);
            }
            match current {
                Some(issue) => println!("{}: {} [{}]", issue.id, issue.title, issue.status),
                None => println!("Nothing on your hook."),
            }
            return Ok(());
        };

        let assignment = sling.hook_to_self(bead, self.force)?;
        if self.json {
            print_json(&assignment)
        } else {
            println!("hooked {} to {}", assignment.bead, assignment.agent);
            Ok(())
        }
    }
}
