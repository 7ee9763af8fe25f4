use crate::CoreError;
use dojo_schema::SessionState;

pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            SessionState::Pending,
            SessionState::Provisioning | SessionState::TearingDown
        ) | (
            SessionState::Provisioning,
            SessionState::Ready | SessionState::TearingDown
        ) | (
            SessionState::Ready | SessionState::Failed,
            SessionState::TearingDown
        ) | (
            SessionState::TearingDown,
            SessionState::Closed | SessionState::Failed
        )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
