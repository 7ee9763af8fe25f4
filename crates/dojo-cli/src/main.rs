mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use dojo_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_CONFIG: &str = "dojo.toml";

#[derive(Debug, Parser)]
#[command(
    name = "dojo",
    version,
    about = "Provision and reclaim ephemeral workshop environments"
)]
struct Cli {
    /// Path to the dojo config file [env: DOJO_CONFIG] [default: dojo.toml].
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the dojo store directory.
    #[arg(long, default_value = "~/.local/share/dojo", global = true)]
    store: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision a workshop session.
    Provision {
        /// Session id; also the namespace name and username prefix.
        #[arg(required_unless_present = "request")]
        session_id: Option<String>,
        /// Number of participant identities to create.
        #[arg(long, default_value_t = 1)]
        participants: u32,
        /// Start a chaos experiment in the session namespace.
        #[arg(long, default_value_t = false)]
        chaos: bool,
        /// Open a tracking ticket for the session.
        #[arg(long, default_value_t = false)]
        ticket: bool,
        /// Read the session request from a TOML file instead of flags.
        #[arg(long, conflicts_with_all = ["session_id", "participants", "chaos", "ticket"])]
        request: Option<PathBuf>,
    },
    /// Tear down every recorded resource of a session, newest first.
    Teardown { session_id: String },
    /// Ask an active provisioning run to stop and roll back.
    Stop { session_id: String },
    /// Print the lifecycle state of a session.
    Status { session_id: String },
    /// Show the full session record.
    Inspect { session_id: String },
    /// List all known sessions.
    List,
    /// Forget a closed session so its id can be reused.
    Purge { session_id: String },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[allow(clippy::too_many_lines)]
fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DOJO_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let store_path = expand_tilde(&cli.store);
    let config_path = resolve_config_path(cli.config);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Provision {
            session_id,
            participants,
            chaos,
            ticket,
            request,
        } => commands::provision::build_request(
            session_id.as_deref(),
            participants,
            chaos,
            ticket,
            request.as_deref(),
        )
        .and_then(|req| {
            let orch = commands::open_orchestrator(&store_path, &config_path)?;
            commands::provision::run(&orch, req, json_output)
        }),
        Commands::Teardown { session_id } => {
            commands::open_orchestrator(&store_path, &config_path)
                .and_then(|orch| commands::teardown::run(&orch, &session_id, json_output))
        }
        Commands::Stop { session_id } => commands::open_registry(&store_path)
            .and_then(|reg| commands::stop::run(&reg, &session_id, json_output)),
        Commands::Status { session_id } => commands::open_registry(&store_path)
            .and_then(|reg| commands::status::run(&reg, &session_id, json_output)),
        Commands::Inspect { session_id } => commands::open_registry(&store_path)
            .and_then(|reg| commands::inspect::run(&reg, &session_id, json_output)),
        Commands::List => commands::open_registry(&store_path)
            .and_then(|reg| commands::list::run(&reg, json_output)),
        Commands::Purge { session_id } => commands::open_registry(&store_path)
            .and_then(|reg| commands::purge::run(&reg, &session_id, json_output)),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config error:")
        || msg.starts_with("client setup error:")
        || msg.starts_with("invalid session request:")
    {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("DOJO_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_prefixes_map_to_exit_codes() {
        assert_eq!(
            exit_code_for("config error: failed to parse config: bad"),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(
            exit_code_for("client setup error: client config error: secret"),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(
            exit_code_for("invalid session request: participant_count must be at least 1"),
            EXIT_CONFIG_ERROR
        );
        assert_eq!(
            exit_code_for("store error: integrity check failed"),
            EXIT_STORE_ERROR
        );
        assert_eq!(exit_code_for("session not found: ws-1"), EXIT_FAILURE);
    }

    #[test]
    fn config_flag_wins() {
        let path = resolve_config_path(Some(PathBuf::from("/etc/dojo.toml")));
        assert_eq!(path, PathBuf::from("/etc/dojo.toml"));
    }

    #[test]
    fn tilde_is_expanded() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                expand_tilde("~/.local/share/dojo"),
                PathBuf::from(home).join(".local/share/dojo")
            );
        }
        assert_eq!(expand_tilde("/var/lib/dojo"), PathBuf::from("/var/lib/dojo"));
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
