use crate::http::{Auth, HttpTransport};
use crate::{ClientError, Removal, TicketMetadata, TicketProvider};
use dojo_schema::{SessionId, TicketId};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const INCIDENT_TABLE: &str = "/api/now/table/incident";
/// ServiceNow incident state "Closed".
const STATE_CLOSED: &str = "7";

#[derive(Debug, Deserialize)]
struct Record {
    sys_id: String,
}

#[derive(Debug, Deserialize)]
struct SingleResult {
    result: Record,
}

#[derive(Debug, Deserialize)]
struct ListResult {
    result: Vec<Record>,
}

/// ServiceNow table API client for the incident table.
pub struct ServiceNowClient {
    http: HttpTransport,
    auth: Auth,
}

impl ServiceNowClient {
    /// `base_url` is the instance root, e.g. `https://dev123.service-now.com`.
    pub fn new(base_url: &str, username: &str, password: &str, timeout: Duration) -> Self {
        Self {
            http: HttpTransport::new(base_url, timeout),
            auth: Auth::Basic {
                username: username.to_owned(),
                password: password.to_owned(),
            },
        }
    }

    fn find_active(&self, session_id: &SessionId) -> Result<Option<TicketId>, ClientError> {
        let query = format!("correlation_id={session_id}^active=true");
        let list: ListResult = self
            .http
            .get(
                INCIDENT_TABLE,
                &[("sysparm_query", query.as_str()), ("sysparm_limit", "1")],
                &self.auth,
            )?
            .json()?;
        Ok(list
            .result
            .into_iter()
            .next()
            .map(|r| TicketId::new(r.sys_id)))
    }
}

impl TicketProvider for ServiceNowClient {
    fn open_ticket(
        &self,
        session_id: &SessionId,
        metadata: &TicketMetadata,
    ) -> Result<TicketId, ClientError> {
        if let Some(existing) = self.find_active(session_id)? {
            tracing::info!("reusing open ticket {existing} for session {session_id}");
            return Ok(existing);
        }
        let mut body = json!({
            "short_description": metadata.short_description,
            "description": metadata.description,
            "correlation_id": session_id.as_str(),
            "category": "workshop",
        });
        if let Some(ref group) = metadata.assignment_group {
            body["assignment_group"] = json!(group);
        }
        let created: SingleResult = self
            .http
            .post_json(INCIDENT_TABLE, &body, &self.auth)?
            .json()?;
        tracing::info!(
            "opened ticket {} for session {session_id}",
            created.result.sys_id
        );
        Ok(TicketId::new(created.result.sys_id))
    }

    fn annotate_ticket(&self, ticket_id: &TicketId, note: &str) -> Result<(), ClientError> {
        self.http.patch_json(
            &format!("{INCIDENT_TABLE}/{ticket_id}"),
            &json!({ "work_notes": note }),
            &self.auth,
        )?;
        Ok(())
    }

    fn close_ticket(&self, ticket_id: &TicketId) -> Result<Removal, ClientError> {
        let body = json!({
            "state": STATE_CLOSED,
            "close_code": "Solved (Permanently)",
            "close_notes": "Workshop session torn down; all resources reclaimed.",
        });
        match self
            .http
            .patch_json(&format!("{INCIDENT_TABLE}/{ticket_id}"), &body, &self.auth)
        {
            Ok(_) => {
                tracing::info!("closed ticket {ticket_id}");
                Ok(Removal::Deleted)
            }
            Err(ClientError::NotFound(_)) => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        }
    }
}
