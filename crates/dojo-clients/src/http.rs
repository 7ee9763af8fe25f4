use crate::ClientError;
use base64::Engine;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::time::Duration;

/// How a request authenticates against the target system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    ApiKey(String),
}

impl Auth {
    fn header(&self) -> Option<(&'static str, String)> {
        match self {
            Auth::None => None,
            Auth::Bearer(token) => Some(("Authorization", format!("Bearer {token}"))),
            Auth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                Some(("Authorization", format!("Basic {encoded}")))
            }
            Auth::ApiKey(key) => Some(("x-api-key", key.clone())),
        }
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::Protocol(format!("invalid JSON body: {e}")))
    }
}

/// Map a non-success HTTP status onto the client error taxonomy.
pub fn classify_status(code: u16, context: &str) -> ClientError {
    let msg = format!("HTTP {code} for {context}");
    match code {
        404 => ClientError::NotFound(msg),
        409 => ClientError::Conflict(msg),
        408 | 429 | 500..=599 => ClientError::Transient(msg),
        400..=499 => ClientError::Rejected(msg),
        _ => ClientError::Protocol(msg),
    }
}

fn classify(err: ureq::Error, context: &str) -> ClientError {
    match err {
        ureq::Error::StatusCode(code) => classify_status(code, context),
        ureq::Error::BadUri(uri) => ClientError::Config(format!("bad URI '{uri}'")),
        other => ClientError::Transient(format!("{context}: {other}")),
    }
}

/// Blocking JSON-over-HTTP transport shared by the concrete clients.
///
/// Every call is bounded by the agent's global timeout.
pub struct HttpTransport {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            agent: ureq::Agent::new_with_config(config),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize<B>(req: ureq::RequestBuilder<B>, auth: &Auth) -> ureq::RequestBuilder<B> {
        match auth.header() {
            Some((name, value)) => req.header(name, &value),
            None => req,
        }
    }

    fn finish(
        result: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
        context: &str,
    ) -> Result<HttpReply, ClientError> {
        let resp = result.map_err(|e| classify(e, context))?;
        let status = resp.status().as_u16();
        if status >= 300 {
            return Err(classify_status(status, context));
        }
        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| ClientError::Transient(format!("{context}: {e}")))?;
        Ok(HttpReply {
            status,
            location,
            body,
        })
    }

    pub fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        auth: &Auth,
    ) -> Result<HttpReply, ClientError> {
        let url = self.url(path);
        let context = format!("GET {url}");
        tracing::debug!("{context}");
        let mut req = Self::authorize(self.agent.get(&url), auth).header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        Self::finish(req.call(), &context)
    }

    pub fn delete(&self, path: &str, auth: &Auth) -> Result<HttpReply, ClientError> {
        let url = self.url(path);
        let context = format!("DELETE {url}");
        tracing::debug!("{context}");
        let req = Self::authorize(self.agent.delete(&url), auth);
        Self::finish(req.call(), &context)
    }

    pub fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        auth: &Auth,
    ) -> Result<HttpReply, ClientError> {
        let url = self.url(path);
        let context = format!("POST {url}");
        tracing::debug!("{context}");
        let req = Self::authorize(self.agent.post(&url), auth)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        let data = body.to_string();
        Self::finish(req.send(data.as_bytes()), &context)
    }

    pub fn put_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        auth: &Auth,
    ) -> Result<HttpReply, ClientError> {
        let url = self.url(path);
        let context = format!("PUT {url}");
        tracing::debug!("{context}");
        let req = Self::authorize(self.agent.put(&url), auth)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        let data = body.to_string();
        Self::finish(req.send(data.as_bytes()), &context)
    }

    pub fn patch_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        auth: &Auth,
    ) -> Result<HttpReply, ClientError> {
        let url = self.url(path);
        let context = format!("PATCH {url}");
        tracing::debug!("{context}");
        let req = Self::authorize(self.agent.patch(&url), auth)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        let data = body.to_string();
        Self::finish(req.send(data.as_bytes()), &context)
    }

    pub fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<HttpReply, ClientError> {
        let url = self.url(path);
        let context = format!("POST {url}");
        tracing::debug!("{context}");
        Self::finish(
            self.agent.post(&url).send_form(form.iter().copied()),
            &context,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// Serves `responses` in order, one per connection, capturing request heads.
    struct ScriptedServer {
        addr: String,
        heads: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedServer {
        fn start(responses: Vec<(u16, &'static str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let heads = Arc::new(Mutex::new(Vec::new()));
            let heads_clone = Arc::clone(&heads);
            std::thread::spawn(move || {
                for (status, body) in responses {
                    let Ok((mut stream, _)) = listener.accept() else {
                        break;
                    };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut head = String::new();
                    let mut content_length = 0usize;
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                            break;
                        }
                        if let Some(v) = line.to_lowercase().strip_prefix("content-length: ") {
                            content_length = v.trim().parse().unwrap_or(0);
                        }
                        head.push_str(&line);
                    }
                    let mut body_in = vec![0u8; content_length];
                    let _ = reader.read_exact(&mut body_in);
                    head.push_str(&String::from_utf8_lossy(&body_in));
                    heads_clone.lock().unwrap().push(head);

                    let resp = format!(
                        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(resp.as_bytes());
                }
            });
            Self { addr, heads }
        }
    }

    fn transport(server: &ScriptedServer) -> HttpTransport {
        HttpTransport::new(&server.addr, Duration::from_secs(5))
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(404, "x"), ClientError::NotFound(_)));
        assert!(matches!(classify_status(409, "x"), ClientError::Conflict(_)));
        assert!(classify_status(408, "x").is_transient());
        assert!(classify_status(429, "x").is_transient());
        assert!(classify_status(503, "x").is_transient());
        assert!(matches!(classify_status(401, "x"), ClientError::Rejected(_)));
        assert!(matches!(classify_status(422, "x"), ClientError::Rejected(_)));
    }

    #[test]
    fn basic_auth_header_is_base64() {
        let auth = Auth::Basic {
            username: "admin".to_owned(),
            password: "secret".to_owned(),
        };
        let (name, value) = auth.header().unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Basic YWRtaW46c2VjcmV0");
        assert!(Auth::None.header().is_none());
    }

    #[test]
    fn get_parses_json_and_sends_bearer() {
        let server = ScriptedServer::start(vec![(200, r#"{"ok":true}"#)]);
        let reply = transport(&server)
            .get("/things", &[("q", "a")], &Auth::Bearer("tok".to_owned()))
            .unwrap();
        let value: serde_json::Value = reply.json().unwrap();
        assert_eq!(value["ok"], true);

        let heads = server.heads.lock().unwrap();
        assert!(heads[0].starts_with("GET /things?q=a"));
        assert!(heads[0].to_lowercase().contains("authorization: bearer tok"));
    }

    #[test]
    fn server_errors_are_transient() {
        let server = ScriptedServer::start(vec![(503, "{}")]);
        let err = transport(&server)
            .delete("/things/1", &Auth::None)
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn conflict_maps_to_conflict() {
        let server = ScriptedServer::start(vec![(409, "{}")]);
        let err = transport(&server)
            .post_json("/things", &serde_json::json!({"a": 1}), &Auth::None)
            .unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));
        assert!(server.heads.lock().unwrap()[0].contains(r#"{"a":1}"#));
    }

    #[test]
    fn connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let err = HttpTransport::new(&addr, Duration::from_secs(2))
            .get("/", &[], &Auth::None)
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[test]
    fn invalid_body_is_protocol_error() {
        let server = ScriptedServer::start(vec![(200, "not json")]);
        let reply = transport(&server).get("/", &[], &Auth::None).unwrap();
        assert!(matches!(
            reply.json::<serde_json::Value>(),
            Err(ClientError::Protocol(_))
        ));
    }
}
