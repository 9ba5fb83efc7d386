//! Authentication for Docker registry access
//!
//! Registries announce their scheme in the `WWW-Authenticate` header of a `/v2/` ping.
//! Bearer registries hand out tokens from a separate realm, scoped to repositories and
//! actions; Basic registries take credentials on every request.

use crate::error::RegistryError;
use crate::error::handlers::{NetworkErrorHandler, ResponseErrorHandler};
use crate::registry::credentials::Credentials;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Access requested on one repository, rendered as `repository:<name>:<actions>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub repository: String,
    pub actions: Vec<String>,
}

impl Scope {
    pub fn new(repository: &str, actions: &[&str]) -> Self {
        Self {
            repository: repository.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repository:{}:{}", self.repository, self.actions.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
    },
    Basic,
    /// The registry answered the ping without asking for credentials
    Anonymous,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => {
                let params = parse_params(params);
                match params.get("realm") {
                    Some(realm) => Challenge::Bearer {
                        realm: realm.clone(),
                        service: params.get("service").cloned(),
                    },
                    None => Challenge::Anonymous,
                }
            }
            "basic" => Challenge::Basic,
            _ => Challenge::Anonymous,
        }
    }
}

/// Split `key="value",key2=value2` respecting quotes, since scopes contain commas
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Auth {
    client: Client,
}

impl Auth {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Request a bearer token from `realm` covering every scope in `scopes`
    pub async fn get_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scopes: &[Scope],
        credentials: Option<&Credentials>,
    ) -> Result<String, RegistryError> {
        let mut url = url::Url::parse(realm)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            for scope in scopes {
                query.append_pair("scope", &scope.to_string());
            }
        }

        tracing::debug!(realm, scopes = scopes.len(), "requesting registry token");

        let mut request = self.client.get(url.clone());
        if let Some(credentials) = credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token request"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match ResponseErrorHandler::handle(status, &body, "token request") {
                RegistryError::Registry { status, .. } => RegistryError::Unauthorized(format!(
                    "token request to {} failed with status {}",
                    realm, status
                )),
                other => other,
            });
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Unauthorized(format!("no token returned by {}", realm)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:a/b:pull,push""#,
        );
        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_other_challenges() {
        assert_eq!(Challenge::parse(r#"Basic realm="Registry""#), Challenge::Basic);
        assert_eq!(Challenge::parse("Bearer service=x"), Challenge::Anonymous);
        assert_eq!(Challenge::parse(""), Challenge::Anonymous);
    }

    #[test]
    fn test_quoted_params_keep_commas() {
        let params = parse_params(r#"realm="r", scope="repository:x:pull,push",service=svc"#);
        assert_eq!(params["scope"], "repository:x:pull,push");
        assert_eq!(params["service"], "svc");
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(Scope::new("ns/app", &["pull", "push"]).to_string(), "repository:ns/app:pull,push");
    }

    #[tokio::test]
    async fn test_get_token_sends_every_scope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/token")
            .match_query(mockito::Matcher::Regex(
                "service=reg&scope=repository%3Aa%3Apull&scope=repository%3Ab%3Apull%2Cpush$".into(),
            ))
            .match_header("authorization", mockito::Matcher::Regex("^Basic ".into()))
            .with_status(200)
            .with_body(r#"{"token":"abc"}"#)
            .create_async()
            .await;

        let auth = Auth::new(Client::new());
        let credentials = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let token = auth
            .get_token(
                &format!("{}/token", server.url()),
                Some("reg"),
                &[Scope::new("a", &["pull"]), Scope::new("b", &["pull", "push"])],
                Some(&credentials),
            )
            .await
            .unwrap();
        assert_eq!(token, "abc");
        mock.assert_async().await;
    }
}
