use clap::Parser;
use dojo_sim::{Fault, Simulator};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "dojo-sim",
    about = "Simulated Keycloak, Kubernetes, Harness chaos and ServiceNow APIs for dojo"
)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8480)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Fail every request under this path prefix with HTTP 503 (repeatable).
    #[arg(long = "fail-prefix", value_name = "PATH")]
    fail_prefixes: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let sim = Arc::new(Simulator::new());
    for prefix in &cli.fail_prefixes {
        sim.inject(Fault {
            method: None,
            path_prefix: prefix.clone(),
            operation: None,
            status: 503,
            times: None,
        });
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("starting dojo-sim on {addr}");
    info!("keycloak: http://{addr}/keycloak  kubernetes: http://{addr}/k8s");
    info!("harness:  http://{addr}/harness   servicenow: http://{addr}/servicenow");

    match dojo_sim::run_server(&sim, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("dojo-sim failed: {e}");
            ExitCode::FAILURE
        }
    }
}
