use super::{colorize_state, json_pretty, EXIT_SUCCESS};
use dojo_core::SessionRegistry;

pub fn run(registry: &SessionRegistry, session_id: &str, json: bool) -> Result<u8, String> {
    let state = registry
        .get_state(session_id)
        .map_err(|e| e.to_string())?;
    if json {
        let out = serde_json::json!({ "session_id": session_id, "state": state });
        println!("{}", json_pretty(&out)?);
    } else {
        println!("{session_id}: {}", colorize_state(state));
    }
    Ok(EXIT_SUCCESS)
}
