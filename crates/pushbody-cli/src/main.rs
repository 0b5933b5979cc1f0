use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "pushbody",
    about = "pushbody — drive a push-style body producer through scripted scenarios",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file and print its transcript
    Run {
        /// Path to the scenario TOML file
        path: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Exit non-zero if any step or the background drain failed
        #[arg(long)]
        strict: bool,
    },
    /// Write a scaffold scenario file
    Init {
        /// Where to write the scenario
        #[arg(short, long, default_value = "scenario.toml")]
        path: String,
        /// Scenario name
        #[arg(short, long, default_value = "example")]
        name: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pushbody=info".parse()?)
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { path, format, strict } => commands::run::run(&path, &format, strict),
        Commands::Init { path, name } => commands::init::init(&path, &name),
    }
}
