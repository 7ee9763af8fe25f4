use crate::http::{Auth, HttpTransport};
use crate::{ChaosProvider, ClientError, ExperimentSpec, Removal};
use dojo_schema::{ExperimentId, NamespaceName, SessionId};
use serde_json::{json, Value};
use std::time::Duration;

const QUERY_PATH: &str = "/gateway/chaos/manager/api/query";

/// GraphQL operations the client issues against the chaos manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosOperation {
    AddProbe,
    CreateExperiment,
    GetExperiment,
    RunExperiment,
    StopExperiment,
    DeleteExperiment,
}

struct OperationShape {
    kind: &'static str,
    field: &'static str,
    param: &'static str,
    param_type: &'static str,
    selection: &'static str,
}

impl ChaosOperation {
    fn shape(self) -> OperationShape {
        match self {
            ChaosOperation::AddProbe => OperationShape {
                kind: "mutation",
                field: "addProbe",
                param: "request",
                param_type: "ProbeRequest!",
                selection: "{ name type }",
            },
            ChaosOperation::CreateExperiment => OperationShape {
                kind: "mutation",
                field: "createChaosExperiment",
                param: "request",
                param_type: "ChaosExperimentRequest!",
                selection: "{ experimentID name }",
            },
            ChaosOperation::GetExperiment => OperationShape {
                kind: "query",
                field: "getExperiment",
                param: "experimentID",
                param_type: "String!",
                selection: "{ experimentID name tags }",
            },
            ChaosOperation::RunExperiment => OperationShape {
                kind: "mutation",
                field: "runChaosExperiment",
                param: "experimentID",
                param_type: "String!",
                selection: "{ notifyID experimentRunID }",
            },
            ChaosOperation::StopExperiment => OperationShape {
                kind: "mutation",
                field: "stopChaosExperiment",
                param: "experimentID",
                param_type: "String!",
                selection: "",
            },
            ChaosOperation::DeleteExperiment => OperationShape {
                kind: "mutation",
                field: "deleteChaosExperiment",
                param: "experimentID",
                param_type: "String!",
                selection: "",
            },
        }
    }

    pub fn field(self) -> &'static str {
        self.shape().field
    }

    /// The GraphQL document for this operation.
    pub fn document(self) -> String {
        let s = self.shape();
        format!(
            "{kind} {field}(${param}: {ptype}, $identifiers: IdentifiersRequest!) {{ {field}({param}: ${param}, identifiers: $identifiers) {sel} }}",
            kind = s.kind,
            field = s.field,
            param = s.param,
            ptype = s.param_type,
            sel = s.selection,
        )
    }
}

/// Chaos-platform identifier derived from a display name: spaces become
/// underscores and dashes are dropped.
pub fn generate_probe_id(name: &str) -> String {
    name.replace(' ', "_").replace('-', "")
}

/// Deterministic experiment id for a session, so a retried create finds its earlier attempt.
pub fn experiment_id_for(session_id: &SessionId) -> ExperimentId {
    ExperimentId::new(format!("dojo_{}", session_id.replace('-', "_")))
}

fn session_tag(session_id: &SessionId) -> String {
    format!("session:{session_id}")
}

/// Classify GraphQL-level `errors` returned with HTTP 200.
fn classify_graphql(field: &str, errors: &Value) -> ClientError {
    let message = errors
        .as_array()
        .map(|errs| {
            errs.iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| errors.to_string());
    let lower = message.to_lowercase();
    let msg = format!("{field}: {message}");
    if lower.contains("not found") {
        ClientError::NotFound(msg)
    } else if lower.contains("already exists") {
        ClientError::Conflict(msg)
    } else {
        ClientError::Rejected(msg)
    }
}

/// Harness chaos manager GraphQL client.
pub struct HarnessChaosClient {
    http: HttpTransport,
    auth: Auth,
    account_id: String,
    org_id: String,
    project_id: String,
    infra_id: String,
}

impl HarnessChaosClient {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        account_id: &str,
        org_id: &str,
        project_id: &str,
        infra_id: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            http: HttpTransport::new(endpoint, timeout),
            auth: Auth::ApiKey(api_key.to_owned()),
            account_id: account_id.to_owned(),
            org_id: org_id.to_owned(),
            project_id: project_id.to_owned(),
            infra_id: infra_id.to_owned(),
        }
    }

    fn call(&self, op: ChaosOperation, variables: Value) -> Result<Value, ClientError> {
        let shape = op.shape();
        let payload = json!({
            "query": op.document(),
            "variables": {
                shape.param: variables,
                "identifiers": {
                    "accountIdentifier": self.account_id,
                    "orgIdentifier": self.org_id,
                    "projectIdentifier": self.project_id,
                },
            },
        });
        let response: Value = self.http.post_json(QUERY_PATH, &payload, &self.auth)?.json()?;
        if let Some(errors) = response.get("errors") {
            return Err(classify_graphql(shape.field, errors));
        }
        response
            .get("data")
            .and_then(|d| d.get(shape.field))
            .cloned()
            .ok_or_else(|| ClientError::Protocol(format!("{}: response has no data", shape.field)))
    }

    fn add_probe(&self, session_id: &SessionId, url: &str) -> Result<String, ClientError> {
        let name = format!("dojo {session_id} health");
        let probe_id = generate_probe_id(&name);
        let request = json!({
            "name": name,
            "probeID": probe_id,
            "type": "httpProbe",
            "infrastructureType": "Kubernetes",
            "tags": ["dojo", session_tag(session_id)],
            "kubernetesHTTPProperties": {
                "probeTimeout": "10s",
                "interval": "5s",
                "retry": 3,
                "attempt": 3,
                "probePollingInterval": "1s",
                "initialDelay": "2s",
                "stopOnFailure": false,
                "url": url,
                "method": { "get": { "criteria": "==", "responseCode": "200" } },
            },
        });
        match self.call(ChaosOperation::AddProbe, request) {
            Ok(_) | Err(ClientError::Conflict(_)) => Ok(probe_id),
            Err(e) => Err(e),
        }
    }

    fn owned_by(&self, id: &ExperimentId, session_id: &SessionId) -> Result<bool, ClientError> {
        let experiment = self.call(ChaosOperation::GetExperiment, json!(id.as_str()))?;
        let tag = session_tag(session_id);
        Ok(experiment
            .get("tags")
            .and_then(Value::as_array)
            .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(tag.as_str()))))
    }
}

impl ChaosProvider for HarnessChaosClient {
    fn start_experiment(
        &self,
        session_id: &SessionId,
        namespace: &NamespaceName,
        spec: &ExperimentSpec,
    ) -> Result<ExperimentId, ClientError> {
        let probe = match spec.probe_url {
            Some(ref url) => Some(self.add_probe(session_id, url)?),
            None => None,
        };
        let id = experiment_id_for(session_id);
        let request = json!({
            "experimentID": id.as_str(),
            "name": format!("dojo-{session_id}-{}", spec.fault),
            "infraID": self.infra_id,
            "tags": ["dojo", session_tag(session_id)],
            "fault": spec.fault.to_string(),
            "namespace": namespace.as_str(),
            "appLabel": format!("app={}", spec.target_app),
            "durationSeconds": spec.duration_secs,
            "probes": probe.into_iter().collect::<Vec<_>>(),
        });

        match self.call(ChaosOperation::CreateExperiment, request) {
            Ok(_) => {}
            Err(ClientError::Conflict(msg)) => {
                if !self.owned_by(&id, session_id)? {
                    return Err(ClientError::Conflict(msg));
                }
                tracing::info!("adopted existing chaos experiment {id}");
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.call(ChaosOperation::RunExperiment, json!(id.as_str())) {
            // Not in the ledger yet, so it goes with the failed step.
            tracing::warn!("run of chaos experiment {id} failed, deleting it: {e}");
            if let Err(cleanup) = self.call(ChaosOperation::DeleteExperiment, json!(id.as_str())) {
                tracing::warn!("could not delete chaos experiment {id}: {cleanup}");
            }
            return Err(e);
        }
        tracing::info!("started chaos experiment {id} ({}) in {namespace}", spec.fault);
        Ok(id)
    }

    fn stop_experiment(&self, experiment_id: &ExperimentId) -> Result<Removal, ClientError> {
        match self.call(ChaosOperation::StopExperiment, json!(experiment_id.as_str())) {
            Ok(_) | Err(ClientError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.call(ChaosOperation::DeleteExperiment, json!(experiment_id.as_str())) {
            Ok(_) => {
                tracing::info!("stopped and deleted chaos experiment {experiment_id}");
                Ok(Removal::Deleted)
            }
            Err(ClientError::NotFound(_)) => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_id_replaces_spaces_and_drops_dashes() {
        assert_eq!(generate_probe_id("dojo ws-42 health"), "dojo_ws42_health");
        assert_eq!(generate_probe_id("plain"), "plain");
    }

    #[test]
    fn experiment_id_is_deterministic() {
        let sid = SessionId::new("ws-42");
        assert_eq!(experiment_id_for(&sid), "dojo_ws_42");
        assert_eq!(experiment_id_for(&sid), experiment_id_for(&sid));
    }

    #[test]
    fn document_shape() {
        let doc = ChaosOperation::CreateExperiment.document();
        assert!(doc.starts_with("mutation createChaosExperiment($request: ChaosExperimentRequest!"));
        assert!(doc.contains("createChaosExperiment(request: $request, identifiers: $identifiers)"));
        assert!(doc.contains("{ experimentID name }"));

        let doc = ChaosOperation::GetExperiment.document();
        assert!(doc.starts_with("query getExperiment($experimentID: String!"));
    }

    #[test]
    fn graphql_errors_are_classified() {
        let not_found = json!([{ "message": "experiment Not Found" }]);
        assert!(matches!(
            classify_graphql("deleteChaosExperiment", &not_found),
            ClientError::NotFound(_)
        ));
        let exists = json!([{ "message": "experiment already exists" }]);
        assert!(matches!(
            classify_graphql("createChaosExperiment", &exists),
            ClientError::Conflict(_)
        ));
        let other = json!([{ "message": "unauthorized" }]);
        assert!(matches!(
            classify_graphql("createChaosExperiment", &other),
            ClientError::Rejected(_)
        ));
    }
}
