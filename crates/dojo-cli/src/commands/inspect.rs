use super::{colorize_state, json_pretty, EXIT_SUCCESS};
use dojo_core::SessionRegistry;

pub fn run(registry: &SessionRegistry, session_id: &str, json: bool) -> Result<u8, String> {
    let record = registry.inspect(session_id).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&record)?);
        return Ok(EXIT_SUCCESS);
    }

    let req = &record.request;
    println!("session:      {}", record.session_id);
    println!("state:        {}", colorize_state(record.state));
    println!("participants: {}", req.participant_count);
    println!("chaos:        {}", req.chaos_enabled);
    println!("ticket:       {}", req.ticket_required);
    println!("created:      {}", record.created_at);
    println!("updated:      {}", record.updated_at);
    if let Some(ref failure) = record.failure {
        println!("failure:      {failure}");
        for handle in &failure.retained {
            println!("  retained:   {handle}");
        }
    }
    if record.ledger.is_empty() {
        println!("ledger:       (empty)");
    } else {
        println!("ledger:");
        for (i, handle) in record.ledger.iter().enumerate() {
            println!("  {}. {handle}", i + 1);
        }
    }
    Ok(EXIT_SUCCESS)
}
