use super::{
    colorize_state, exit_code_for_state, json_pretty, print_ledger, spin_fail, spin_ok, spinner,
};
use dojo_core::Orchestrator;
use dojo_schema::SessionState;

pub fn run(orch: &Orchestrator, session_id: &str, json: bool) -> Result<u8, String> {
    let pb = (!json).then(|| spinner(&format!("tearing down session {session_id}...")));
    let state = match orch.teardown(session_id) {
        Ok(state) => state,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("teardown of {session_id} failed"));
            }
            return Err(e.to_string());
        }
    };
    let record = orch.inspect(session_id).map_err(|e| e.to_string())?;

    if json {
        let out = serde_json::json!({
            "session_id": session_id,
            "state": state,
            "ledger": record.ledger,
            "failure": record.failure,
        });
        println!("{}", json_pretty(&out)?);
        return Ok(exit_code_for_state(state));
    }

    if let Some(ref pb) = pb {
        match state {
            SessionState::Closed => spin_ok(pb, &format!("session {session_id} is closed")),
            SessionState::TearingDown => spin_ok(
                pb,
                &format!("session {session_id} is busy; stop requested for the active run"),
            ),
            other => spin_fail(
                pb,
                &format!("session {session_id} is {}", colorize_state(other)),
            ),
        }
    }
    if state == SessionState::Failed {
        if let Some(ref failure) = record.failure {
            println!("cause: {failure}");
        }
        print_ledger("still recorded (run `dojo teardown` again to retry)", &record.ledger);
    }
    Ok(exit_code_for_state(state))
}
