use super::{
    exit_code_for_state, json_pretty, print_ledger, spin_fail, spin_ok, spinner, EXIT_FAILURE,
};
use dojo_core::{Orchestrator, ProvisionOutcome};
use dojo_schema::{parse_request_file, Credential, SessionRequest, SessionState};
use std::path::Path;

/// Build the request either from a TOML file or from command-line flags.
pub fn build_request(
    session_id: Option<&str>,
    participants: u32,
    chaos: bool,
    ticket: bool,
    request_file: Option<&Path>,
) -> Result<SessionRequest, String> {
    if let Some(path) = request_file {
        return parse_request_file(path).map_err(|e| format!("invalid session request: {e}"));
    }
    let session_id = session_id.ok_or("a session id or --request file is required")?;
    let request = SessionRequest::new(session_id, participants)
        .with_chaos(chaos)
        .with_ticket(ticket);
    request
        .validate()
        .map_err(|e| format!("invalid session request: {e}"))?;
    Ok(request)
}

pub fn run(orch: &Orchestrator, request: SessionRequest, json: bool) -> Result<u8, String> {
    let session_id = request.session_id.clone();
    let pb = (!json).then(|| spinner(&format!("provisioning session {session_id}...")));

    let outcome = match orch.provision(request) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("provisioning {session_id} failed"));
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!("{}", json_pretty(&outcome)?);
        return Ok(outcome_code(&outcome));
    }

    if let Some(ref pb) = pb {
        match outcome.state {
            SessionState::Ready => spin_ok(pb, &format!("session {session_id} is ready")),
            _ => spin_fail(pb, &format!("session {session_id} is {}", outcome.state)),
        }
    }
    print_outcome(&outcome);
    Ok(outcome_code(&outcome))
}

/// A provision that was stopped ends `Closed` (or `TearingDown` while another
/// run reclaims it), which still means the session was not delivered.
fn outcome_code(outcome: &ProvisionOutcome) -> u8 {
    match outcome.state {
        SessionState::Closed | SessionState::TearingDown => EXIT_FAILURE,
        state => exit_code_for_state(state),
    }
}

fn print_outcome(outcome: &ProvisionOutcome) {
    if let Some(ref failure) = outcome.failure {
        println!("cause: {failure}");
        print_ledger("created before the failure", &outcome.created);
        print_ledger("still recorded (run `dojo teardown` to retry)", &outcome.ledger);
        return;
    }
    print_ledger("resources", &outcome.ledger);
    print_credentials(&outcome.credentials);
}

fn print_credentials(credentials: &[Credential]) {
    if credentials.is_empty() {
        return;
    }
    println!();
    println!("{:<24} {:<20} EXPIRES", "USERNAME", "PASSWORD");
    for c in credentials {
        println!(
            "{:<24} {:<20} {}",
            c.username,
            c.password,
            c.expires_at.to_rfc3339()
        );
    }
}
