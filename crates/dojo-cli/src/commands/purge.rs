use super::{json_pretty, EXIT_SUCCESS};
use dojo_core::SessionRegistry;

pub fn run(registry: &SessionRegistry, session_id: &str, json: bool) -> Result<u8, String> {
    registry.purge(session_id).map_err(|e| e.to_string())?;
    if json {
        let out = serde_json::json!({ "session_id": session_id, "purged": true });
        println!("{}", json_pretty(&out)?);
    } else {
        println!("purged session {session_id}");
    }
    Ok(EXIT_SUCCESS)
}
