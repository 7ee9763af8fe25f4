use crate::types::{ExperimentId, NamespaceName, Realm, TicketId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The minimal identifiers needed to delete or stop one created resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceHandle {
    Identity {
        realm: Realm,
        user_id: UserId,
        username: String,
    },
    Namespace {
        name: NamespaceName,
    },
    ChaosExperiment {
        experiment_id: ExperimentId,
        namespace: NamespaceName,
    },
    Ticket {
        ticket_id: TicketId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Identity,
    Namespace,
    ChaosExperiment,
    Ticket,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Identity => write!(f, "identity"),
            ResourceKind::Namespace => write!(f, "namespace"),
            ResourceKind::ChaosExperiment => write!(f, "chaos_experiment"),
            ResourceKind::Ticket => write!(f, "ticket"),
        }
    }
}

impl ResourceHandle {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceHandle::Identity { .. } => ResourceKind::Identity,
            ResourceHandle::Namespace { .. } => ResourceKind::Namespace,
            ResourceHandle::ChaosExperiment { .. } => ResourceKind::ChaosExperiment,
            ResourceHandle::Ticket { .. } => ResourceKind::Ticket,
        }
    }

    /// Identifier of the resource within its own system.
    pub fn id(&self) -> &str {
        match self {
            ResourceHandle::Identity { user_id, .. } => user_id.as_str(),
            ResourceHandle::Namespace { name } => name.as_str(),
            ResourceHandle::ChaosExperiment { experiment_id, .. } => experiment_id.as_str(),
            ResourceHandle::Ticket { ticket_id } => ticket_id.as_str(),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHandle::Identity {
                realm, username, ..
            } => write!(f, "identity {username} ({}@{realm})", self.id()),
            ResourceHandle::Namespace { name } => write!(f, "namespace {name}"),
            ResourceHandle::ChaosExperiment {
                experiment_id,
                namespace,
            } => write!(f, "chaos experiment {experiment_id} in {namespace}"),
            ResourceHandle::Ticket { ticket_id } => write!(f, "ticket {ticket_id}"),
        }
    }
}

/// Ordered record of the resources created for one session.
///
/// Handles are appended in creation order while provisioning and only removed
/// once the matching delete has been confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisioningLedger {
    handles: Vec<ResourceHandle>,
}

impl ProvisioningLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ResourceHandle) {
        self.handles.push(handle);
    }

    /// Remove the handle at `index`, keeping the relative order of the rest.
    pub fn remove(&mut self, index: usize) -> Option<ResourceHandle> {
        if index < self.handles.len() {
            Some(self.handles.remove(index))
        } else {
            None
        }
    }

    pub fn get(&self, index: usize) -> Option<&ResourceHandle> {
        self.handles.get(index)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceHandle> {
        self.handles.iter()
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.handles.iter().map(ResourceHandle::kind).collect()
    }

    /// The most recently created namespace, if any.
    pub fn namespace(&self) -> Option<&NamespaceName> {
        self.handles.iter().rev().find_map(|h| match h {
            ResourceHandle::Namespace { name } => Some(name),
            _ => None,
        })
    }
}

impl From<Vec<ResourceHandle>> for ProvisioningLedger {
    fn from(handles: Vec<ResourceHandle>) -> Self {
        Self { handles }
    }
}

impl<'a> IntoIterator for &'a ProvisioningLedger {
    type Item = &'a ResourceHandle;
    type IntoIter = std::slice::Iter<'a, ResourceHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.handles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ResourceHandle {
        ResourceHandle::Identity {
            realm: Realm::new("workshop"),
            user_id: UserId::new("u-1"),
            username: "ws-42-p1".to_owned(),
        }
    }

    fn namespace() -> ResourceHandle {
        ResourceHandle::Namespace {
            name: NamespaceName::new("ws-42"),
        }
    }

    #[test]
    fn handle_json_is_tagged_by_kind() {
        let json = serde_json::to_value(namespace()).unwrap();
        assert_eq!(json["kind"], "namespace");
        assert_eq!(json["name"], "ws-42");

        let back: ResourceHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, namespace());
    }

    #[test]
    fn handle_kind_and_id() {
        assert_eq!(identity().kind(), ResourceKind::Identity);
        assert_eq!(identity().id(), "u-1");
        let exp = ResourceHandle::ChaosExperiment {
            experiment_id: ExperimentId::new("exp-9"),
            namespace: NamespaceName::new("ws-42"),
        };
        assert_eq!(exp.kind(), ResourceKind::ChaosExperiment);
        assert_eq!(exp.id(), "exp-9");
    }

    #[test]
    fn ledger_preserves_order_on_remove() {
        let ticket = ResourceHandle::Ticket {
            ticket_id: TicketId::new("t-1"),
        };
        let mut ledger = ProvisioningLedger::new();
        ledger.push(identity());
        ledger.push(namespace());
        ledger.push(ticket.clone());

        assert_eq!(ledger.remove(1), Some(namespace()));
        assert_eq!(ledger.handles(), &[identity(), ticket]);
        assert_eq!(ledger.remove(5), None);
    }

    #[test]
    fn ledger_serializes_as_array() {
        let ledger = ProvisioningLedger::from(vec![identity(), namespace()]);
        let json = serde_json::to_value(&ledger).unwrap();
        assert!(json.is_array());
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[test]
    fn ledger_namespace_lookup() {
        let mut ledger = ProvisioningLedger::new();
        assert!(ledger.namespace().is_none());
        ledger.push(identity());
        ledger.push(namespace());
        assert_eq!(ledger.namespace().map(NamespaceName::as_str), Some("ws-42"));
        assert_eq!(
            ledger.kinds(),
            vec![ResourceKind::Identity, ResourceKind::Namespace]
        );
    }

    #[test]
    fn handle_display() {
        assert_eq!(namespace().to_string(), "namespace ws-42");
        assert_eq!(identity().to_string(), "identity ws-42-p1 (u-1@workshop)");
    }
}
