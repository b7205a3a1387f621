use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "studytimer", version, about = "Focus timer with per-topic time tracking")]
struct Cli {
    /// Log at debug level unless STUDYTIMER_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the timer in the foreground until the interval ends or Ctrl-C
    Run(commands::run::RunArgs),
    /// Inspect or adjust the saved timer
    Timer {
        #[command(subcommand)]
        action: commands::timer::TimerAction,
    },
    /// Topic time tracking
    Topic {
        #[command(subcommand)]
        action: commands::topic::TopicAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Close segments left open by a crashed client
    Janitor {
        /// Report what would be closed without writing
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "studytimer=debug" } else { "studytimer=info" };
    let filter = EnvFilter::try_from_env("STUDYTIMER_LOG").unwrap_or_else(|_| default.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Timer { action } => commands::timer::run(action),
        Commands::Topic { action } => commands::topic::run(action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Janitor { dry_run } => commands::janitor::run(dry_run),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
