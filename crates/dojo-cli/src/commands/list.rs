use super::{colorize_state, json_pretty, EXIT_SUCCESS};
use dojo_core::SessionRegistry;

pub fn run(registry: &SessionRegistry, json: bool) -> Result<u8, String> {
    let sessions = registry.list().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&sessions)?);
    } else if sessions.is_empty() {
        println!("no sessions found");
    } else {
        println!(
            "{:<24} {:<14} {:<6} {:<10} UPDATED",
            "SESSION", "STATE", "USERS", "RESOURCES"
        );
        for s in &sessions {
            println!(
                "{:<24} {:<14} {:<6} {:<10} {}",
                s.session_id,
                colorize_state(s.state),
                s.request.participant_count,
                s.ledger.len(),
                s.updated_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
