use crate::http::{Auth, HttpTransport};
use crate::{ClientError, IdentityGrant, IdentityProvider, Removal};
use chrono::{Duration as ChronoDuration, Utc};
use dojo_schema::{
    generate_password, Credential, CredentialSection, Realm, SessionId, UserId,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// User attribute carrying the owning session id.
pub const SESSION_ATTRIBUTE: &str = "dojo_session";
/// User attribute carrying the credential expiry (RFC 3339).
pub const EXPIRY_ATTRIBUTE: &str = "dojo_expires_at";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserRepresentation {
    id: String,
    username: String,
    #[serde(default)]
    attributes: std::collections::HashMap<String, Vec<String>>,
}

/// Keycloak admin REST client.
///
/// Authenticates with the `admin-cli` password grant against the master realm
/// and manages participant users in the workshop realm.
pub struct KeycloakClient {
    http: HttpTransport,
    admin_user: String,
    admin_password: String,
    email_domain: String,
    password_length: usize,
    ttl_hours: u32,
}

impl KeycloakClient {
    pub fn new(endpoint: &str, admin_user: &str, admin_password: &str, timeout: Duration) -> Self {
        let defaults = CredentialSection::default();
        Self {
            http: HttpTransport::new(endpoint, timeout),
            admin_user: admin_user.to_owned(),
            admin_password: admin_password.to_owned(),
            email_domain: "workshop.local".to_owned(),
            password_length: defaults.password_length,
            ttl_hours: defaults.ttl_hours,
        }
    }

    #[must_use]
    pub fn with_email_domain(mut self, domain: &str) -> Self {
        domain.clone_into(&mut self.email_domain);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, section: &CredentialSection) -> Self {
        self.password_length = section.password_length;
        self.ttl_hours = section.ttl_hours;
        self
    }

    fn token(&self) -> Result<Auth, ClientError> {
        let reply = self.http.post_form(
            "/realms/master/protocol/openid-connect/token",
            &[
                ("username", self.admin_user.as_str()),
                ("password", self.admin_password.as_str()),
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
            ],
        )?;
        let token: TokenResponse = reply.json()?;
        token
            .access_token
            .map(Auth::Bearer)
            .ok_or_else(|| ClientError::Protocol("token response has no access_token".to_owned()))
    }

    fn fresh_credential(&self, username: &str) -> Result<Credential, ClientError> {
        let password = generate_password(self.password_length)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(Credential {
            username: username.to_owned(),
            password,
            expires_at: Utc::now() + ChronoDuration::hours(i64::from(self.ttl_hours)),
        })
    }

    fn find_user(
        &self,
        realm: &Realm,
        username: &str,
        auth: &Auth,
    ) -> Result<Option<UserRepresentation>, ClientError> {
        let reply = self.http.get(
            &format!("/admin/realms/{realm}/users"),
            &[
                ("username", username),
                ("exact", "true"),
                ("briefRepresentation", "false"),
            ],
            auth,
        )?;
        let users: Vec<UserRepresentation> = reply.json()?;
        Ok(users.into_iter().find(|u| u.username == username))
    }

    fn reset_password(
        &self,
        realm: &Realm,
        user_id: &str,
        credential: &Credential,
        auth: &Auth,
    ) -> Result<(), ClientError> {
        self.http.put_json(
            &format!("/admin/realms/{realm}/users/{user_id}/reset-password"),
            &json!({
                "type": "password",
                "value": credential.password,
                "temporary": false,
            }),
            auth,
        )?;
        Ok(())
    }
}

impl IdentityProvider for KeycloakClient {
    fn create_user(
        &self,
        realm: &Realm,
        session_id: &SessionId,
        username: &str,
    ) -> Result<IdentityGrant, ClientError> {
        let auth = self.token()?;
        let credential = self.fresh_credential(username)?;
        let body = json!({
            "username": username,
            "email": format!("{username}@{}", self.email_domain),
            "firstName": username,
            "lastName": "Participant",
            "enabled": true,
            "emailVerified": true,
            "requiredActions": [],
            "groups": [],
            "attributes": {
                SESSION_ATTRIBUTE: [session_id.as_str()],
                EXPIRY_ATTRIBUTE: [credential.expires_at.to_rfc3339()],
            },
            "credentials": [{
                "type": "password",
                "value": credential.password,
                "temporary": false,
            }],
        });

        match self
            .http
            .post_json(&format!("/admin/realms/{realm}/users"), &body, &auth)
        {
            Ok(_) => {
                let user = self.find_user(realm, username, &auth)?.ok_or_else(|| {
                    ClientError::Protocol(format!("user '{username}' missing right after creation"))
                })?;
                tracing::info!("created identity {username} ({}) in realm {realm}", user.id);
                Ok(IdentityGrant {
                    user_id: UserId::new(user.id),
                    username: username.to_owned(),
                    credential,
                })
            }
            Err(ClientError::Conflict(msg)) => {
                let Some(user) = self.find_user(realm, username, &auth)? else {
                    return Err(ClientError::Conflict(msg));
                };
                let owned = user
                    .attributes
                    .get(SESSION_ATTRIBUTE)
                    .is_some_and(|v| v.iter().any(|s| s == session_id.as_str()));
                if !owned {
                    return Err(ClientError::Conflict(format!(
                        "user '{username}' already exists and belongs to another session"
                    )));
                }
                self.reset_password(realm, &user.id, &credential, &auth)?;
                tracing::info!("adopted existing identity {username} ({})", user.id);
                Ok(IdentityGrant {
                    user_id: UserId::new(user.id),
                    username: username.to_owned(),
                    credential,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn delete_user(&self, realm: &Realm, user_id: &UserId) -> Result<Removal, ClientError> {
        let auth = self.token()?;
        match self
            .http
            .delete(&format!("/admin/realms/{realm}/users/{user_id}"), &auth)
        {
            Ok(_) => {
                tracing::info!("deleted identity {user_id} from realm {realm}");
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
    fn credential_settings_are_applied() {
        let client = KeycloakClient::new("http://127.0.0.1:1", "admin", "pw", Duration::from_secs(1))
            .with_credentials(&CredentialSection {
                ttl_hours: 2,
                password_length: 20,
            });
        let before = Utc::now();
        let cred = client.fresh_credential("ws-1-p1").unwrap();
        assert_eq!(cred.password.len(), 20);
        assert_eq!(cred.username, "ws-1-p1");
        assert!(cred.expires_at > before + ChronoDuration::minutes(119));
        assert!(cred.expires_at <= Utc::now() + ChronoDuration::hours(2));
    }

    #[test]
    fn unreachable_keycloak_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let client = KeycloakClient::new(&addr, "admin", "pw", Duration::from_secs(1));
        let err = client
            .delete_user(&Realm::new("workshop"), &UserId::new("u-1"))
            .unwrap_err();
        assert!(err.is_transient());
    }
}
