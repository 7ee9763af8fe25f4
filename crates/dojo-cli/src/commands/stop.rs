use super::{json_pretty, EXIT_SUCCESS};
use dojo_core::SessionRegistry;

pub fn run(registry: &SessionRegistry, session_id: &str, json: bool) -> Result<u8, String> {
    registry
        .request_stop(session_id)
        .map_err(|e| e.to_string())?;
    if json {
        let out = serde_json::json!({ "session_id": session_id, "stop_requested": true });
        println!("{}", json_pretty(&out)?);
    } else {
        println!("stop requested for session {session_id}");
    }
    Ok(EXIT_SUCCESS)
}
