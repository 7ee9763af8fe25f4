//! In-memory simulator for the four external systems dojo provisions against.
//!
//! One HTTP server answers all of them under fixed path prefixes:
//!
//! - `/keycloak`: admin token endpoint and realm user management
//! - `/k8s`: namespaces, resource quotas and role bindings
//! - `/harness`: the chaos manager GraphQL endpoint
//! - `/servicenow`: the incident table API
//!
//! State lives in memory only. Faults can be injected per route, either
//! through [`Simulator::inject`] or with `POST /_sim/faults`, so retry and
//! rollback paths can be driven end to end through the real HTTP clients.
//!
//! The [`TestServer`] helper starts a simulator on a random port for integration testing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tiny_http::{Header, Response, Server, StatusCode};
use tracing::{debug, info, warn};

pub const ADMIN_TOKEN: &str = "sim-admin-token";
const SESSION_LABEL: &str = "dojo.dev/session";
const INCIDENT_TABLE: [&str; 4] = ["api", "now", "table", "incident"];

/// A scripted failure for requests matching a method and path prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct Fault {
    /// HTTP method to match; any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Prefix of the full request path, including the system prefix (e.g. `/k8s/api/v1/namespaces`).
    pub path_prefix: String,
    /// GraphQL field to match, for faults on the chaos endpoint.
    #[serde(default)]
    pub operation: Option<String>,
    pub status: u16,
    /// Number of matching requests to fail; every one when absent.
    #[serde(default)]
    pub times: Option<u32>,
}

impl Fault {
    pub fn new(method: &str, path_prefix: &str, status: u16) -> Self {
        Self {
            method: Some(method.to_owned()),
            path_prefix: path_prefix.to_owned(),
            operation: None,
            status,
            times: None,
        }
    }

    #[must_use]
    pub fn times(mut self, n: u32) -> Self {
        self.times = Some(n);
        self
    }

    #[must_use]
    pub fn operation(mut self, field: &str) -> Self {
        self.operation = Some(field.to_owned());
        self
    }

    fn matches(&self, req: &SimRequest, operation: Option<&str>) -> bool {
        self.method
            .as_deref()
            .map_or(true, |m| m.eq_ignore_ascii_case(&req.method))
            && req.path.starts_with(&self.path_prefix)
            && match self.operation.as_deref() {
                Some(op) => operation == Some(op),
                None => true,
            }
    }
}

/// A request as the simulator sees it, detached from the transport.
#[derive(Debug, Clone, Default)]
pub struct SimRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub authorization: Option<String>,
    pub api_key: Option<String>,
    pub body: Vec<u8>,
}

impl SimRequest {
    pub fn new(method: &str, url: &str) -> Self {
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, parse_pairs(q)),
            None => (url, Vec::new()),
        };
        Self {
            method: method.to_ascii_uppercase(),
            path: percent_decode(path),
            query,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_auth(mut self, value: &str) -> Self {
        self.authorization = Some(value.to_owned());
        self
    }

    #[must_use]
    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = body.to_string().into_bytes();
        self
    }

    fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn json_body(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    fn bearer(&self) -> Option<&str> {
        self.authorization.as_deref()?.strip_prefix("Bearer ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub location: Option<String>,
}

impl SimResponse {
    fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            body: value.to_string().into_bytes(),
            location: None,
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            location: None,
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, &json!({ "error": message }))
    }

    pub fn body_json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 2;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `a=1&b=2` (query strings and form bodies).
fn parse_pairs(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

struct SimUser {
    realm: String,
    username: String,
    attributes: Value,
    password: Option<String>,
}

struct SimNamespace {
    labels: Value,
    quotas: BTreeMap<String, Value>,
    bindings: BTreeMap<String, Value>,
}

struct SimExperiment {
    name: String,
    tags: Vec<String>,
    namespace: String,
    running: bool,
}

#[derive(Default)]
struct World {
    users: BTreeMap<String, SimUser>,
    namespaces: BTreeMap<String, SimNamespace>,
    probes: BTreeMap<String, Value>,
    experiments: BTreeMap<String, SimExperiment>,
    incidents: BTreeMap<String, Value>,
    faults: Vec<Fault>,
    requests: Vec<String>,
    next_id: u64,
}

impl World {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn take_fault(&mut self, req: &SimRequest, operation: Option<&str>) -> Option<u16> {
        let index = self.faults.iter().position(|f| f.matches(req, operation))?;
        let fault = &mut self.faults[index];
        let status = fault.status;
        let exhausted = match fault.times.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(index);
        }
        Some(status)
    }
}

/// The simulated systems and their shared state.
#[derive(Default)]
pub struct Simulator {
    world: Mutex<World>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject(&self, fault: Fault) {
        info!(
            "injecting fault: {} {}{} -> {} ({})",
            fault.method.as_deref().unwrap_or("*"),
            fault.path_prefix,
            fault
                .operation
                .as_deref()
                .map(|o| format!(" [{o}]"))
                .unwrap_or_default(),
            fault.status,
            fault
                .times
                .map_or_else(|| "always".to_owned(), |n| format!("{n}x")),
        );
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// `METHOD /path` of every request handled so far.
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self, method: &str, path_prefix: &str) -> usize {
        let prefix = format!("{method} {path_prefix}");
        self.lock()
            .requests
            .iter()
            .filter(|r| r.starts_with(&prefix))
            .count()
    }

    /// Users, namespaces, experiments and open incidents still present.
    pub fn live_resources(&self) -> usize {
        let world = self.lock();
        world.users.len()
            + world.namespaces.len()
            + world.experiments.len()
            + world
                .incidents
                .values()
                .filter(|i| i["active"] == json!("true"))
                .count()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.lock()
            .users
            .values()
            .map(|u| u.username.clone())
            .collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(name)
    }

    pub fn role_bindings(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .namespaces
            .get(namespace)
            .map(|ns| ns.bindings.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn experiment_running(&self, experiment_id: &str) -> Option<bool> {
        self.lock().experiments.get(experiment_id).map(|e| e.running)
    }

    pub fn incident(&self, sys_id: &str) -> Option<Value> {
        self.lock().incidents.get(sys_id).cloned()
    }

    /// Pre-create a namespace labelled for `session`.
    pub fn seed_namespace(&self, name: &str, session: &str) {
        self.lock().namespaces.insert(
            name.to_owned(),
            SimNamespace {
                labels: json!({ SESSION_LABEL: session }),
                quotas: BTreeMap::new(),
                bindings: BTreeMap::new(),
            },
        );
    }

    /// Answer one request.
    pub fn handle(&self, req: &SimRequest) -> SimResponse {
        let mut world = self.lock();
        world.requests.push(format!("{} {}", req.method, req.path));

        if let Some(rest) = req.path.strip_prefix("/_sim") {
            drop(world);
            return self.control(req, rest);
        }
        if req.path == "/health" {
            return SimResponse::json(200, &json!({ "status": "ok" }));
        }

        let operation = if req.path.starts_with("/harness") {
            graphql_field(req)
        } else {
            None
        };
        if let Some(status) = world.take_fault(req, operation.as_deref()) {
            warn!("fault: {} {} -> {status}", req.method, req.path);
            return SimResponse::error(status, "injected fault");
        }

        let path = req.path.trim_start_matches('/');
        let (system, rest) = path.split_once('/').unwrap_or((path, ""));
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        match system {
            "keycloak" => keycloak(&mut world, req, &segments),
            "k8s" => kubernetes(&mut world, req, &segments),
            "harness" => harness(&mut world, req, &segments),
            "servicenow" => servicenow(&mut world, req, &segments),
            _ => SimResponse::error(404, "not found"),
        }
    }

    fn control(&self, req: &SimRequest, rest: &str) -> SimResponse {
        match (req.method.as_str(), rest) {
            ("POST", "/faults") => match serde_json::from_slice::<Fault>(&req.body) {
                Ok(fault) => {
                    self.inject(fault);
                    SimResponse::empty(204)
                }
                Err(e) => SimResponse::error(400, &format!("invalid fault: {e}")),
            },
            ("DELETE", "/faults") => {
                self.clear_faults();
                SimResponse::empty(204)
            }
            ("GET", "/state") => {
                let world = self.lock();
                SimResponse::json(
                    200,
                    &json!({
                        "users": world.users.values().map(|u| &u.username).collect::<Vec<_>>(),
                        "namespaces": world.namespaces.keys().collect::<Vec<_>>(),
                        "experiments": world.experiments.keys().collect::<Vec<_>>(),
                        "incidents": world.incidents.keys().collect::<Vec<_>>(),
                    }),
                )
            }
            _ => SimResponse::error(404, "not found"),
        }
    }
}

fn keycloak(world: &mut World, req: &SimRequest, segments: &[&str]) -> SimResponse {
    if let ("POST", ["realms", "master", "protocol", "openid-connect", "token"]) =
        (req.method.as_str(), segments)
    {
        let form = parse_pairs(&String::from_utf8_lossy(&req.body));
        let field = |k: &str| form.iter().find(|(f, _)| f == k).map(|(_, v)| v.as_str());
        if field("grant_type") != Some("password") || field("client_id") != Some("admin-cli") {
            return SimResponse::json(400, &json!({ "error": "unsupported_grant_type" }));
        }
        if field("username").unwrap_or("").is_empty() || field("password").unwrap_or("").is_empty()
        {
            return SimResponse::json(401, &json!({ "error": "invalid_grant" }));
        }
        return SimResponse::json(
            200,
            &json!({ "access_token": ADMIN_TOKEN, "expires_in": 60, "token_type": "Bearer" }),
        );
    }

    if req.bearer() != Some(ADMIN_TOKEN) {
        return SimResponse::error(401, "HTTP 401 Unauthorized");
    }

    match (req.method.as_str(), segments) {
        ("POST", ["admin", "realms", realm, "users"]) => {
            let Some(body) = req.json_body() else {
                return SimResponse::error(400, "invalid user representation");
            };
            let Some(username) = body["username"].as_str() else {
                return SimResponse::error(400, "username is required");
            };
            if world
                .users
                .values()
                .any(|u| u.realm == *realm && u.username == username)
            {
                return SimResponse::json(
                    409,
                    &json!({ "errorMessage": "User exists with same username" }),
                );
            }
            let id = world.next_id("user");
            let password = body["credentials"][0]["value"].as_str().map(str::to_owned);
            world.users.insert(
                id.clone(),
                SimUser {
                    realm: (*realm).to_owned(),
                    username: username.to_owned(),
                    attributes: body["attributes"].clone(),
                    password,
                },
            );
            debug!("keycloak: created user {username} ({id}) in {realm}");
            let mut reply = SimResponse::empty(201);
            reply.location = Some(format!("/keycloak/admin/realms/{realm}/users/{id}"));
            reply
        }
        ("GET", ["admin", "realms", realm, "users"]) => {
            let wanted = req.query_param("username");
            let exact = req.query_param("exact") == Some("true");
            let found: Vec<Value> = world
                .users
                .iter()
                .filter(|(_, u)| u.realm == *realm)
                .filter(|(_, u)| match wanted {
                    Some(w) if exact => u.username == w,
                    Some(w) => u.username.contains(w),
                    None => true,
                })
                .map(|(id, u)| user_json(id, u))
                .collect();
            SimResponse::json(200, &Value::Array(found))
        }
        ("GET", ["admin", "realms", realm, "users", id]) => match world.users.get(*id) {
            Some(u) if u.realm == *realm => SimResponse::json(200, &user_json(id, u)),
            _ => SimResponse::error(404, "User not found"),
        },
        ("PUT", ["admin", "realms", realm, "users", id, "reset-password"]) => {
            let value = req
                .json_body()
                .and_then(|b| b["value"].as_str().map(str::to_owned));
            match world.users.get_mut(*id) {
                Some(u) if u.realm == *realm => {
                    u.password = value;
                    SimResponse::empty(204)
                }
                _ => SimResponse::error(404, "User not found"),
            }
        }
        ("DELETE", ["admin", "realms", realm, "users", id]) => {
            if world.users.get(*id).is_some_and(|u| u.realm == *realm) {
                world.users.remove(*id);
                debug!("keycloak: deleted user {id}");
                SimResponse::empty(204)
            } else {
                SimResponse::error(404, "User not found")
            }
        }
        _ => SimResponse::error(404, "not found"),
    }
}

fn user_json(id: &str, user: &SimUser) -> Value {
    json!({
        "id": id,
        "username": user.username,
        "enabled": true,
        "attributes": user.attributes,
        "credentialsSet": user.password.is_some(),
    })
}

fn kubernetes(world: &mut World, req: &SimRequest, segments: &[&str]) -> SimResponse {
    if req.bearer().map_or(true, str::is_empty) {
        return SimResponse::json(401, &k8s_status(401, "Unauthorized", "Unauthorized"));
    }
    match (req.method.as_str(), segments) {
        ("POST", ["api", "v1", "namespaces"]) => {
            let Some(body) = req.json_body() else {
                return SimResponse::json(400, &k8s_status(400, "BadRequest", "invalid body"));
            };
            let Some(name) = body["metadata"]["name"].as_str() else {
                return SimResponse::json(400, &k8s_status(400, "Invalid", "name is required"));
            };
            if world.namespaces.contains_key(name) {
                return SimResponse::json(
                    409,
                    &k8s_status(409, "AlreadyExists", &format!("namespaces \"{name}\" already exists")),
                );
            }
            world.namespaces.insert(
                name.to_owned(),
                SimNamespace {
                    labels: body["metadata"]["labels"].clone(),
                    quotas: BTreeMap::new(),
                    bindings: BTreeMap::new(),
                },
            );
            debug!("k8s: created namespace {name}");
            SimResponse::json(201, &namespace_json(name, &body["metadata"]["labels"]))
        }
        ("GET", ["api", "v1", "namespaces", name]) => match world.namespaces.get(*name) {
            Some(ns) => SimResponse::json(200, &namespace_json(name, &ns.labels)),
            None => namespace_missing(name),
        },
        ("DELETE", ["api", "v1", "namespaces", name]) => match world.namespaces.remove(*name) {
            Some(_) => {
                debug!("k8s: deleted namespace {name}");
                SimResponse::json(200, &namespace_json(name, &json!({})))
            }
            None => namespace_missing(name),
        },
        ("POST", ["api", "v1", "namespaces", ns, "resourcequotas"]) => {
            namespaced_create(world, req, ns, "resourcequotas", |n| &mut n.quotas)
        }
        ("PUT", ["api", "v1", "namespaces", ns, "resourcequotas", name]) => {
            let Some(namespace) = world.namespaces.get_mut(*ns) else {
                return namespace_missing(ns);
            };
            let body = req.json_body().unwrap_or(Value::Null);
            namespace.quotas.insert((*name).to_owned(), body.clone());
            SimResponse::json(200, &body)
        }
        ("POST", ["apis", "rbac.authorization.k8s.io", "v1", "namespaces", ns, "rolebindings"]) => {
            namespaced_create(world, req, ns, "rolebindings", |n| &mut n.bindings)
        }
        _ => SimResponse::json(404, &k8s_status(404, "NotFound", "the server could not find the requested resource")),
    }
}

fn namespaced_create(
    world: &mut World,
    req: &SimRequest,
    ns: &str,
    resource: &str,
    collection: impl FnOnce(&mut SimNamespace) -> &mut BTreeMap<String, Value>,
) -> SimResponse {
    let Some(namespace) = world.namespaces.get_mut(ns) else {
        return namespace_missing(ns);
    };
    let Some(body) = req.json_body() else {
        return SimResponse::json(400, &k8s_status(400, "BadRequest", "invalid body"));
    };
    let Some(name) = body["metadata"]["name"].as_str().map(str::to_owned) else {
        return SimResponse::json(400, &k8s_status(400, "Invalid", "name is required"));
    };
    let items = collection(namespace);
    if items.contains_key(&name) {
        return SimResponse::json(
            409,
            &k8s_status(409, "AlreadyExists", &format!("{resource} \"{name}\" already exists")),
        );
    }
    items.insert(name.clone(), body.clone());
    debug!("k8s: created {resource}/{name} in {ns}");
    SimResponse::json(201, &body)
}

fn namespace_json(name: &str, labels: &Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name, "labels": labels },
        "status": { "phase": "Active" },
    })
}

fn namespace_missing(name: &str) -> SimResponse {
    SimResponse::json(
        404,
        &k8s_status(404, "NotFound", &format!("namespaces \"{name}\" not found")),
    )
}

fn k8s_status(code: u16, reason: &str, message: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code,
    })
}

/// The top-level field named by a GraphQL document such as
/// `mutation createChaosExperiment($request: ...) { ... }`.
fn graphql_field(req: &SimRequest) -> Option<String> {
    let body = req.json_body()?;
    let query = body["query"].as_str()?;
    let head = query.split_whitespace().nth(1)?;
    head.split('(').next().map(str::to_owned)
}

fn graphql_error(message: &str) -> SimResponse {
    SimResponse::json(200, &json!({ "data": null, "errors": [{ "message": message }] }))
}

fn harness(world: &mut World, req: &SimRequest, segments: &[&str]) -> SimResponse {
    if req.api_key.as_deref().map_or(true, str::is_empty) {
        return SimResponse::error(401, "missing x-api-key");
    }
    if req.method != "POST" || segments != ["gateway", "chaos", "manager", "api", "query"] {
        return SimResponse::error(404, "not found");
    }
    let Some(body) = req.json_body() else {
        return SimResponse::error(400, "invalid GraphQL payload");
    };
    let Some(field) = graphql_field(req) else {
        return SimResponse::error(400, "missing query");
    };
    let vars = &body["variables"];
    if vars["identifiers"]["accountIdentifier"].as_str().is_none() {
        return graphql_error("identifiers.accountIdentifier is required");
    }
    let experiment_id = vars["experimentID"].as_str().unwrap_or_default().to_owned();
    let request = &vars["request"];

    let data = match field.as_str() {
        "addProbe" => {
            let Some(probe_id) = request["probeID"].as_str() else {
                return graphql_error("probeID is required");
            };
            if world.probes.contains_key(probe_id) {
                return graphql_error(&format!("probe {probe_id} already exists"));
            }
            world.probes.insert(probe_id.to_owned(), request.clone());
            json!({ "name": request["name"], "type": request["type"] })
        }
        "createChaosExperiment" => {
            let Some(id) = request["experimentID"].as_str() else {
                return graphql_error("experimentID is required");
            };
            if world.experiments.contains_key(id) {
                return graphql_error(&format!("experiment {id} already exists"));
            }
            let name = request["name"].as_str().unwrap_or(id).to_owned();
            let tags = request["tags"]
                .as_array()
                .map(|t| t.iter().filter_map(Value::as_str).map(str::to_owned).collect())
                .unwrap_or_default();
            world.experiments.insert(
                id.to_owned(),
                SimExperiment {
                    name: name.clone(),
                    tags,
                    namespace: request["namespace"].as_str().unwrap_or_default().to_owned(),
                    running: false,
                },
            );
            debug!("harness: created experiment {id}");
            json!({ "experimentID": id, "name": name })
        }
        "getExperiment" => match world.experiments.get(&experiment_id) {
            Some(e) => json!({
                "experimentID": experiment_id,
                "name": e.name,
                "tags": e.tags,
                "namespace": e.namespace,
            }),
            None => return graphql_error(&format!("experiment {experiment_id} not found")),
        },
        "runChaosExperiment" => {
            let run_id = world.next_id("run");
            match world.experiments.get_mut(&experiment_id) {
                Some(e) => {
                    e.running = true;
                    json!({ "notifyID": run_id, "experimentRunID": run_id })
                }
                None => return graphql_error(&format!("experiment {experiment_id} not found")),
            }
        }
        "stopChaosExperiment" => match world.experiments.get_mut(&experiment_id) {
            Some(e) => {
                e.running = false;
                json!(true)
            }
            None => return graphql_error(&format!("experiment {experiment_id} not found")),
        },
        "deleteChaosExperiment" => match world.experiments.remove(&experiment_id) {
            Some(_) => {
                debug!("harness: deleted experiment {experiment_id}");
                json!(true)
            }
            None => return graphql_error(&format!("experiment {experiment_id} not found")),
        },
        other => return graphql_error(&format!("unknown field {other}")),
    };
    SimResponse::json(200, &json!({ "data": { field: data } }))
}

fn basic_credentials(req: &SimRequest) -> Option<(String, String)> {
    let encoded = req.authorization.as_deref()?.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

/// Evaluate a `field=value^field=value` encoded query against an incident.
fn incident_matches(incident: &Value, query: &str) -> bool {
    query.split('^').filter(|c| !c.is_empty()).all(|clause| {
        match clause.split_once('=') {
            Some((field, value)) => incident[field].as_str() == Some(value),
            None => true,
        }
    })
}

fn servicenow(world: &mut World, req: &SimRequest, segments: &[&str]) -> SimResponse {
    if basic_credentials(req).map_or(true, |(u, p)| u.is_empty() || p.is_empty()) {
        return SimResponse::json(
            401,
            &json!({ "error": { "message": "User Not Authenticated" }, "status": "failure" }),
        );
    }
    let Some(rest) = segments.strip_prefix(&INCIDENT_TABLE[..]) else {
        return SimResponse::error(404, "not found");
    };
    let record_missing = || {
        SimResponse::json(
            404,
            &json!({ "error": { "message": "No Record found" }, "status": "failure" }),
        )
    };

    match (req.method.as_str(), rest) {
        ("GET", []) => {
            let query = req.query_param("sysparm_query").unwrap_or_default();
            let limit = req
                .query_param("sysparm_limit")
                .and_then(|l| l.parse::<usize>().ok())
                .unwrap_or(usize::MAX);
            let result: Vec<Value> = world
                .incidents
                .values()
                .filter(|i| incident_matches(i, query))
                .take(limit)
                .cloned()
                .collect();
            SimResponse::json(200, &json!({ "result": result }))
        }
        ("POST", []) => {
            let Some(Value::Object(fields)) = req.json_body() else {
                return SimResponse::error(400, "invalid record");
            };
            let sys_id = world.next_id("inc");
            let number = format!("INC{:07}", world.next_id);
            let mut record = Value::Object(fields);
            record["sys_id"] = json!(sys_id);
            record["number"] = json!(number);
            record["state"] = json!("1");
            record["active"] = json!("true");
            record["work_notes_log"] = json!([]);
            world.incidents.insert(sys_id.clone(), record.clone());
            debug!("servicenow: opened {number} ({sys_id})");
            SimResponse::json(201, &json!({ "result": record }))
        }
        ("GET", [sys_id]) => match world.incidents.get(*sys_id) {
            Some(record) => SimResponse::json(200, &json!({ "result": record })),
            None => record_missing(),
        },
        ("PATCH" | "PUT", [sys_id]) => {
            let Some(record) = world.incidents.get_mut(*sys_id) else {
                return record_missing();
            };
            let Some(Value::Object(update)) = req.json_body() else {
                return SimResponse::error(400, "invalid record");
            };
            for (key, value) in update {
                if key == "work_notes" {
                    if let Some(log) = record["work_notes_log"].as_array_mut() {
                        log.push(value);
                    }
                    continue;
                }
                record[key.as_str()] = value;
            }
            if record["state"] == json!("7") {
                record["active"] = json!("false");
            }
            SimResponse::json(200, &json!({ "result": record }))
        }
        _ => SimResponse::error(404, "not found"),
    }
}

fn header_value(req: &tiny_http::Request, name: &str) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_owned())
}

/// Translate a tiny_http request, run it through the simulator and respond.
pub fn handle_request(sim: &Simulator, mut req: tiny_http::Request) {
    let mut sim_req = SimRequest::new(&req.method().to_string(), req.url());
    sim_req.authorization = header_value(&req, "Authorization");
    sim_req.api_key = header_value(&req, "x-api-key");
    if let Err(e) = req.as_reader().read_to_end(&mut sim_req.body) {
        warn!("failed to read request body: {e}");
        let _ = req.respond(Response::from_string("read error").with_status_code(StatusCode(500)));
        return;
    }
    debug!("{} {}", sim_req.method, req.url());

    let reply = sim.handle(&sim_req);
    let mut response =
        Response::from_data(reply.body).with_status_code(StatusCode(reply.status));
    if let Ok(h) = Header::from_bytes("Content-Type", "application/json") {
        response.add_header(h);
    }
    if let Some(location) = reply.location {
        if let Ok(h) = Header::from_bytes("Location", location.as_bytes()) {
            response.add_header(h);
        }
    }
    let _ = req.respond(response);
}

pub type ServeError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Start the server loop, blocking the current thread.
pub fn run_server(sim: &Arc<Simulator>, addr: &str) -> Result<(), ServeError> {
    let server = Server::http(addr)?;
    for request in server.incoming_requests() {
        handle_request(sim, request);
    }
    Ok(())
}

/// A simulator on `127.0.0.1` with a random port, served from a background thread.
///
/// Dropping the `TestServer` unblocks and stops the server thread.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub sim: Arc<Simulator>,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Result<Self, ServeError> {
        let server = Arc::new(Server::http("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .ok_or("simulator is not listening on an IP address")?
            .port();
        let url = format!("http://127.0.0.1:{port}");

        let sim = Arc::new(Simulator::new());
        let srv = Arc::clone(&server);
        let state = Arc::clone(&sim);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&state, request);
            }
        });

        Ok(Self {
            url,
            port,
            sim,
            server,
            handle: Some(handle),
        })
    }

    pub fn keycloak_url(&self) -> String {
        format!("{}/keycloak", self.url)
    }

    pub fn kubernetes_url(&self) -> String {
        format!("{}/k8s", self.url)
    }

    pub fn harness_url(&self) -> String {
        format!("{}/harness", self.url)
    }

    pub fn servicenow_url(&self) -> String {
        format!("{}/servicenow", self.url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION_ATTRIBUTE: &str = "dojo_session";

    fn admin(method: &str, url: &str) -> SimRequest {
        SimRequest::new(method, url).with_auth(&format!("Bearer {ADMIN_TOKEN}"))
    }

    fn basic() -> String {
        format!("Basic {}", STANDARD.encode("svc:secret"))
    }

    fn gql(field: &str, kind: &str, variables: Value) -> SimRequest {
        let mut req = SimRequest::new("POST", "/harness/gateway/chaos/manager/api/query")
            .with_json(&json!({
                "query": format!("{kind} {field}($x: String!) {{ {field} }}"),
                "variables": variables,
            }));
        req.api_key = Some("key".to_owned());
        req
    }

    fn ids() -> Value {
        json!({ "accountIdentifier": "acc", "orgIdentifier": "default", "projectIdentifier": "p" })
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("correlation_id%3Dws-1%5Eactive%3Dtrue"), "correlation_id=ws-1^active=true");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn keycloak_token_requires_password_grant() {
        let sim = Simulator::new();
        let mut req = SimRequest::new("POST", "/keycloak/realms/master/protocol/openid-connect/token");
        req.body = b"username=admin&password=pw&grant_type=password&client_id=admin-cli".to_vec();
        let reply = sim.handle(&req);
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body_json()["access_token"], ADMIN_TOKEN);

        req.body = b"grant_type=client_credentials".to_vec();
        assert_eq!(sim.handle(&req).status, 400);
    }

    #[test]
    fn keycloak_user_lifecycle() {
        let sim = Simulator::new();
        let create = admin("POST", "/keycloak/admin/realms/workshop/users").with_json(&json!({
            "username": "ws-1-p1",
            "attributes": { "dojo_session": ["ws-1"] },
            "credentials": [{ "type": "password", "value": "Abc123xyz" }],
        }));
        let reply = sim.handle(&create);
        assert_eq!(reply.status, 201);
        assert!(reply.location.unwrap().contains("/users/user-"));
        assert_eq!(sim.handle(&create).status, 409);

        let found = sim
            .handle(&admin("GET", "/keycloak/admin/realms/workshop/users?username=ws-1-p1&exact=true"))
            .body_json();
        let id = found[0]["id"].as_str().unwrap().to_owned();
        assert_eq!(found[0]["attributes"][SESSION_ATTRIBUTE][0], "ws-1");

        let path = format!("/keycloak/admin/realms/workshop/users/{id}");
        assert_eq!(sim.handle(&admin("DELETE", &path)).status, 204);
        assert_eq!(sim.handle(&admin("DELETE", &path)).status, 404);
    }

    #[test]
    fn keycloak_admin_routes_need_token() {
        let sim = Simulator::new();
        let reply = sim.handle(&SimRequest::new("GET", "/keycloak/admin/realms/workshop/users"));
        assert_eq!(reply.status, 401);
    }

    #[test]
    fn kubernetes_namespace_quota_and_binding() {
        let sim = Simulator::new();
        let ns = admin("POST", "/k8s/api/v1/namespaces")
            .with_json(&json!({ "metadata": { "name": "ws-1", "labels": { SESSION_LABEL: "ws-1" } } }));
        assert_eq!(sim.handle(&ns).status, 201);
        assert_eq!(sim.handle(&ns).status, 409);

        let quota = admin("POST", "/k8s/api/v1/namespaces/ws-1/resourcequotas")
            .with_json(&json!({ "metadata": { "name": "dojo-quota" } }));
        assert_eq!(sim.handle(&quota).status, 201);
        assert_eq!(sim.handle(&quota).status, 409);

        let binding = admin(
            "POST",
            "/k8s/apis/rbac.authorization.k8s.io/v1/namespaces/ws-1/rolebindings",
        )
        .with_json(&json!({ "metadata": { "name": "dojo-ws-1-p1" } }));
        assert_eq!(sim.handle(&binding).status, 201);
        assert_eq!(sim.role_bindings("ws-1"), vec!["dojo-ws-1-p1"]);

        let got = sim.handle(&admin("GET", "/k8s/api/v1/namespaces/ws-1")).body_json();
        assert_eq!(got["metadata"]["labels"][SESSION_LABEL], "ws-1");

        assert_eq!(sim.handle(&admin("DELETE", "/k8s/api/v1/namespaces/ws-1")).status, 200);
        assert_eq!(sim.handle(&admin("DELETE", "/k8s/api/v1/namespaces/ws-1")).status, 404);
        assert!(sim.role_bindings("ws-1").is_empty());
    }

    #[test]
    fn harness_experiment_lifecycle() {
        let sim = Simulator::new();
        let create = gql(
            "createChaosExperiment",
            "mutation",
            json!({ "request": { "experimentID": "dojo_ws_1", "tags": ["session:ws-1"] }, "identifiers": ids() }),
        );
        let reply = sim.handle(&create).body_json();
        assert_eq!(reply["data"]["createChaosExperiment"]["experimentID"], "dojo_ws_1");

        let again = sim.handle(&create).body_json();
        assert!(again["errors"][0]["message"].as_str().unwrap().contains("already exists"));

        let run = gql("runChaosExperiment", "mutation", json!({ "experimentID": "dojo_ws_1", "identifiers": ids() }));
        assert!(sim.handle(&run).body_json()["errors"].is_null());
        assert_eq!(sim.experiment_running("dojo_ws_1"), Some(true));

        let get = gql("getExperiment", "query", json!({ "experimentID": "dojo_ws_1", "identifiers": ids() }));
        assert_eq!(sim.handle(&get).body_json()["data"]["getExperiment"]["tags"][0], "session:ws-1");

        let delete = gql("deleteChaosExperiment", "mutation", json!({ "experimentID": "dojo_ws_1", "identifiers": ids() }));
        assert!(sim.handle(&delete).body_json()["errors"].is_null());
        let gone = sim.handle(&delete).body_json();
        assert!(gone["errors"][0]["message"].as_str().unwrap().contains("not found"));
    }

    #[test]
    fn servicenow_incident_lifecycle() {
        let sim = Simulator::new();
        let open = SimRequest::new("POST", "/servicenow/api/now/table/incident")
            .with_auth(&basic())
            .with_json(&json!({ "short_description": "Workshop session ws-1", "correlation_id": "ws-1" }));
        let created = sim.handle(&open).body_json();
        let sys_id = created["result"]["sys_id"].as_str().unwrap().to_owned();

        let search = SimRequest::new(
            "GET",
            "/servicenow/api/now/table/incident?sysparm_query=correlation_id%3Dws-1%5Eactive%3Dtrue&sysparm_limit=1",
        )
        .with_auth(&basic());
        assert_eq!(sim.handle(&search).body_json()["result"][0]["sys_id"], sys_id.as_str());

        let close = SimRequest::new("PATCH", &format!("/servicenow/api/now/table/incident/{sys_id}"))
            .with_auth(&basic())
            .with_json(&json!({ "state": "7", "close_notes": "done" }));
        assert_eq!(sim.handle(&close).status, 200);
        assert_eq!(sim.incident(&sys_id).unwrap()["active"], "false");
        assert!(sim.handle(&search).body_json()["result"].as_array().unwrap().is_empty());
        assert_eq!(sim.live_resources(), 0);
    }

    #[test]
    fn servicenow_requires_basic_auth() {
        let sim = Simulator::new();
        let req = SimRequest::new("GET", "/servicenow/api/now/table/incident");
        assert_eq!(sim.handle(&req).status, 401);
    }

    #[test]
    fn faults_fire_then_expire() {
        let sim = Simulator::new();
        sim.inject(Fault::new("POST", "/k8s/api/v1/namespaces", 503).times(2));
        let ns = admin("POST", "/k8s/api/v1/namespaces")
            .with_json(&json!({ "metadata": { "name": "ws-1" } }));
        assert_eq!(sim.handle(&ns).status, 503);
        assert_eq!(sim.handle(&ns).status, 503);
        assert_eq!(sim.handle(&ns).status, 201);
        assert_eq!(sim.request_count("POST", "/k8s/api/v1/namespaces"), 3);
    }

    #[test]
    fn graphql_faults_match_operation() {
        let sim = Simulator::new();
        sim.inject(
            Fault::new("POST", "/harness", 500).operation("runChaosExperiment"),
        );
        let create = gql(
            "createChaosExperiment",
            "mutation",
            json!({ "request": { "experimentID": "e1" }, "identifiers": ids() }),
        );
        assert_eq!(sim.handle(&create).status, 200);
        let run = gql("runChaosExperiment", "mutation", json!({ "experimentID": "e1", "identifiers": ids() }));
        assert_eq!(sim.handle(&run).status, 500);
    }

    #[test]
    fn control_endpoint_injects_faults() {
        let sim = Simulator::new();
        let req = SimRequest::new("POST", "/_sim/faults")
            .with_json(&json!({ "path_prefix": "/keycloak", "status": 502, "times": 1 }));
        assert_eq!(sim.handle(&req).status, 204);
        let token = SimRequest::new("POST", "/keycloak/realms/master/protocol/openid-connect/token");
        assert_eq!(sim.handle(&token).status, 502);
        assert_eq!(sim.handle(&SimRequest::new("DELETE", "/_sim/faults")).status, 204);
    }
}
