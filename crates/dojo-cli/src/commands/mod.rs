pub mod completions;
pub mod inspect;
pub mod list;
pub mod provision;
pub mod purge;
pub mod status;
pub mod stop;
pub mod teardown;

use dojo_core::{Orchestrator, SessionRegistry};
use dojo_schema::{parse_config_file, ProvisioningLedger, SessionState};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_SESSION_FAILED: u8 = 4;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: SessionState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        SessionState::Ready => Style::new().green().apply_to(text).to_string(),
        SessionState::Provisioning | SessionState::TearingDown => {
            Style::new().cyan().bold().apply_to(text).to_string()
        }
        SessionState::Pending => Style::new().yellow().apply_to(text).to_string(),
        SessionState::Failed => Style::new().red().bold().apply_to(text).to_string(),
        SessionState::Closed => Style::new().dim().apply_to(text).to_string(),
    }
}

/// Exit code for a session that has settled in `state`.
pub fn exit_code_for_state(state: SessionState) -> u8 {
    match state {
        SessionState::Failed => EXIT_SESSION_FAILED,
        _ => EXIT_SUCCESS,
    }
}

pub fn print_ledger(title: &str, ledger: &ProvisioningLedger) {
    if ledger.is_empty() {
        return;
    }
    println!("{title}:");
    for handle in ledger {
        println!("  {handle}");
    }
}

/// Open the store without touching any external system.
pub fn open_registry(store_path: &Path) -> Result<SessionRegistry, String> {
    SessionRegistry::open(store_path).map_err(|e| e.to_string())
}

/// Load the config and build an orchestrator with live clients.
pub fn open_orchestrator(store_path: &Path, config_path: &Path) -> Result<Orchestrator, String> {
    let config = parse_config_file(config_path)
        .map_err(|e| format!("config error: {}: {e}", config_path.display()))?;
    Orchestrator::from_config(store_path, &config).map_err(|e| e.to_string())
}
