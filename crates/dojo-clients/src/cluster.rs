use crate::http::{Auth, HttpTransport};
use crate::{ClientError, ClusterProvider, Removal};
use dojo_schema::{NamespaceName, QuotaSection, SessionId};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

/// Label tying a namespace to the session that created it.
pub const SESSION_LABEL: &str = "dojo.dev/session";
const QUOTA_NAME: &str = "dojo-quota";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NamespaceObject {
    metadata: ObjectMeta,
}

/// Kubernetes REST client authenticated with a bearer token.
pub struct KubeClient {
    http: HttpTransport,
    auth: Auth,
    cluster_role: String,
    user_prefix: String,
}

impl KubeClient {
    pub fn new(endpoint: &str, token: &str, timeout: Duration) -> Self {
        Self {
            http: HttpTransport::new(endpoint, timeout),
            auth: Auth::Bearer(token.to_owned()),
            cluster_role: "edit".to_owned(),
            user_prefix: String::new(),
        }
    }

    #[must_use]
    pub fn with_cluster_role(mut self, role: &str) -> Self {
        role.clone_into(&mut self.cluster_role);
        self
    }

    #[must_use]
    pub fn with_user_prefix(mut self, prefix: &str) -> Self {
        prefix.clone_into(&mut self.user_prefix);
        self
    }

    fn ensure_namespace(&self, session_id: &SessionId) -> Result<NamespaceName, ClientError> {
        let name = NamespaceName::new(session_id.as_str());
        let body = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name.as_str(),
                "labels": {
                    SESSION_LABEL: session_id.as_str(),
                    "app.kubernetes.io/managed-by": "dojo",
                },
            },
        });
        match self.http.post_json("/api/v1/namespaces", &body, &self.auth) {
            Ok(_) => Ok(name),
            Err(ClientError::Conflict(msg)) => {
                let existing: NamespaceObject = self
                    .http
                    .get(&format!("/api/v1/namespaces/{name}"), &[], &self.auth)?
                    .json()?;
                if existing.metadata.labels.get(SESSION_LABEL).map(String::as_str)
                    == Some(session_id.as_str())
                {
                    tracing::info!("adopted existing namespace {name}");
                    Ok(name)
                } else {
                    Err(ClientError::Conflict(format!(
                        "namespace '{name}' exists and is not owned by session {session_id}: {msg}"
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn apply_quota(&self, namespace: &NamespaceName, quota: &QuotaSection) -> Result<(), ClientError> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": { "name": QUOTA_NAME },
            "spec": {
                "hard": {
                    "limits.cpu": format!("{}m", quota.cpu_millis),
                    "limits.memory": format!("{}Mi", quota.memory_mb),
                    "pods": quota.pods.to_string(),
                },
            },
        });
        let path = format!("/api/v1/namespaces/{namespace}/resourcequotas");
        match self.http.post_json(&path, &body, &self.auth) {
            Ok(_) => Ok(()),
            Err(ClientError::Conflict(_)) => {
                self.http
                    .put_json(&format!("{path}/{QUOTA_NAME}"), &body, &self.auth)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl ClusterProvider for KubeClient {
    fn create_namespace(
        &self,
        session_id: &SessionId,
        quota: &QuotaSection,
    ) -> Result<NamespaceName, ClientError> {
        let name = self.ensure_namespace(session_id)?;
        if let Err(e) = self.apply_quota(&name, quota) {
            // The namespace is not in the ledger yet, so it has to go with the failed step.
            tracing::warn!("quota for {name} failed, removing namespace: {e}");
            if let Err(cleanup) = self.delete_namespace(&name) {
                tracing::warn!("could not remove namespace {name}: {cleanup}");
            }
            return Err(e);
        }
        tracing::info!(
            "created namespace {name} (cpu={}m memory={}Mi pods={})",
            quota.cpu_millis,
            quota.memory_mb,
            quota.pods
        );
        Ok(name)
    }

    fn bind_identity(&self, namespace: &NamespaceName, username: &str) -> Result<(), ClientError> {
        let body = json!({
            "apiVersion": format!("{RBAC_GROUP}/v1"),
            "kind": "RoleBinding",
            "metadata": {
                "name": format!("dojo-{username}"),
                "labels": { SESSION_LABEL: namespace.as_str() },
            },
            "roleRef": {
                "apiGroup": RBAC_GROUP,
                "kind": "ClusterRole",
                "name": self.cluster_role,
            },
            "subjects": [{
                "apiGroup": RBAC_GROUP,
                "kind": "User",
                "name": format!("{}{username}", self.user_prefix),
            }],
        });
        let path = format!("/apis/{RBAC_GROUP}/v1/namespaces/{namespace}/rolebindings");
        match self.http.post_json(&path, &body, &self.auth) {
            Ok(_) | Err(ClientError::Conflict(_)) => {
                tracing::debug!("bound {username} to {} in {namespace}", self.cluster_role);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn delete_namespace(&self, namespace: &NamespaceName) -> Result<Removal, ClientError> {
        match self
            .http
            .delete(&format!("/api/v1/namespaces/{namespace}"), &self.auth)
        {
            Ok(_) => {
                tracing::info!("deleted namespace {namespace}");
                Ok(Removal::Deleted)
            }
            Err(ClientError::NotFound(_)) => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(e),
        }
    }
}
