use std::process::ExitCode;

use clap::{Parser, Subcommand};

use gastown::commands::agents::AgentsCommand;
use gastown::commands::hook::HookArgs;
use gastown::commands::mq::MqCommand;
use gastown::commands::patrol::PatrolArgs;
use gastown::commands::polecats::PolecatsCommand;
use gastown::commands::sling::SlingArgs;
use gastown::commands::town::TownCommand;
use gastown::{commands, error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "gt",
    version,
    about = "Dispatch beads to agents across a town of rigs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Hook beads to an agent or rig and start the work
    Sling(SlingArgs),
    /// Attach a bead to yourself without starting anything, or show your hook
    Hook(HookArgs),
    /// Inspect and edit agent beads
    Agents {
        #[command(subcommand)]
        command: AgentsCommand,
    },
    /// Merge queue operations
    Mq {
        #[command(subcommand)]
        command: MqCommand,
    },
    /// Move between the town's sessions
    Town {
        #[command(subcommand)]
        command: TownCommand,
    },
    /// Manage polecats (add, remove, list)
    Polecats {
        #[command(subcommand)]
        command: PolecatsCommand,
    },
    /// Run the witness or refinery patrol loop for a rig
    Patrol(PatrolArgs),
    /// Print the JSON Schema for town.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Sling(_) => "sling",
            Self::Hook(_) => "hook",
            Self::Agents { .. } => "agents",
            Self::Mq { .. } => "mq",
            Self::Town { .. } => "town",
            Self::Polecats { .. } => "polecats",
            Self::Patrol(_) => "patrol",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Sling(args) => args.execute(),
        Commands::Hook(args) => args.execute(),
        Commands::Agents { command } => command.execute(),
        Commands::Mq { command } => command.execute(),
        Commands::Town { command } => command.execute(),
        Commands::Polecats { command } => command.execute(),
        Commands::Patrol(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
            } else {
                eprintln!("error: {e:#}");
            }
            ExitCode::from(error::code_for(&e))
        }
    }
}
