//! HTTP repository connector for the Docker Registry API v2
//!
//! [`RegistryContext`] pings each registry once, remembers its endpoint and auth challenge,
//! and opens [`HttpRepository`] handles whose requests carry a token covering the
//! context's actions and scopes. Tokens are shared between repositories that request the
//! same scope set.

use crate::error::RegistryError;
use crate::error::handlers::{NetworkErrorHandler, ResponseErrorHandler};
use crate::reference::ImageReference;
use crate::registry::auth::{Auth, Challenge, Scope};
use crate::registry::blobs::HttpBlobStore;
use crate::registry::credentials::{CredentialStore, Credentials};
use crate::registry::manifests::{HttpManifestService, HttpTagService};
use crate::registry::{BlobStore, ManifestService, Repository, RepositoryConnector, TagService};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RegistryContextBuilder {
    credentials: CredentialStore,
    timeout: Duration,
}

impl RegistryContextBuilder {
    pub fn new() -> Self {
        Self {
            credentials: CredentialStore::empty(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RegistryContext, RegistryError> {
        let user_agent = concat!("image-mirror/", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(self.timeout)
            .build()
            .map_err(|e| RegistryError::Network(format!("failed to create HTTP client: {}", e)))?;
        let insecure_client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| RegistryError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(RegistryContext {
            inner: Arc::new(ContextInner {
                auth: Auth::new(client.clone()),
                client,
                insecure_client,
                credentials: self.credentials,
                endpoints: tokio::sync::Mutex::new(HashMap::new()),
                tokens: Mutex::new(HashMap::new()),
            }),
            actions: vec!["pull".to_string()],
            scopes: Vec::new(),
        })
    }
}

impl Default for RegistryContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    base: Url,
    challenge: Challenge,
    insecure: bool,
}

struct ContextInner {
    client: Client,
    insecure_client: Client,
    auth: Auth,
    credentials: CredentialStore,
    endpoints: tokio::sync::Mutex<HashMap<(String, bool), Endpoint>>,
    tokens: Mutex<HashMap<String, String>>,
}

/// Connector for plain registries
#[derive(Clone)]
pub struct RegistryContext {
    inner: Arc<ContextInner>,
    actions: Vec<String>,
    scopes: Vec<Scope>,
}

impl RegistryContext {
    pub fn builder() -> RegistryContextBuilder {
        RegistryContextBuilder::new()
    }

    pub fn new(credentials: CredentialStore) -> Result<Self, RegistryError> {
        Self::builder().with_credentials(credentials).build()
    }

    pub fn with_actions(&self, actions: &[&str]) -> Self {
        let mut ctx = self.clone();
        ctx.actions = actions.iter().map(|a| a.to_string()).collect();
        ctx
    }

    pub fn with_scopes(&self, scopes: &[Scope]) -> Self {
        let mut ctx = self.clone();
        for scope in scopes {
            if !ctx.scopes.contains(scope) {
                ctx.scopes.push(scope.clone());
            }
        }
        ctx
    }

    /// Ping `/v2/` once per host, preferring HTTPS. Insecure hosts may use an invalid
    /// certificate or plain HTTP.
    async fn endpoint(&self, host: &str, insecure: bool) -> Result<Endpoint, RegistryError> {
        let mut endpoints = self.inner.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get(&(host.to_string(), insecure)) {
            return Ok(endpoint.clone());
        }

        let client = if insecure {
            &self.inner.insecure_client
        } else {
            &self.inner.client
        };

        let https = Url::parse(&format!("https://{}/", host))?;
        let endpoint = match self.ping(client, &https).await {
            Ok(challenge) => Endpoint {
                base: https,
                challenge,
                insecure,
            },
            Err(err) if insecure => {
                tracing::debug!(host, error = %err, "HTTPS ping failed, falling back to HTTP");
                let http = Url::parse(&format!("http://{}/", host))?;
                let challenge = self.ping(client, &http).await?;
                Endpoint {
                    base: http,
                    challenge,
                    insecure,
                }
            }
            Err(err) => return Err(err),
        };

        tracing::debug!(host, base = %endpoint.base, challenge = ?endpoint.challenge, "registry endpoint");
        endpoints.insert((host.to_string(), insecure), endpoint.clone());
        Ok(endpoint)
    }

    async fn ping(&self, client: &Client, base: &Url) -> Result<Challenge, RegistryError> {
        let url = base.join("v2/")?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &format!("ping {}", base)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Ok(response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .map(Challenge::parse)
                .unwrap_or(Challenge::Anonymous)),
            status if status.is_success() => Ok(Challenge::Anonymous),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ResponseErrorHandler::handle(status, &body, &format!("ping {}", base)))
            }
        }
    }
}

#[async_trait]
impl RepositoryConnector for RegistryContext {
    async fn repository(
        &self,
        reference: &ImageReference,
        insecure: bool,
    ) -> Result<Arc<dyn Repository>, RegistryError> {
        let host = reference.registry_host();
        let endpoint = self.endpoint(host, insecure).await?;

        let name = reference.repository_name().to_string();
        let actions: Vec<&str> = self.actions.iter().map(String::as_str).collect();
        let mut scopes = vec![Scope::new(&name, &actions)];
        for scope in &self.scopes {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }

        let session = Arc::new(Session {
            client: if endpoint.insecure {
                self.inner.insecure_client.clone()
            } else {
                self.inner.client.clone()
            },
            context: self.inner.clone(),
            credentials: self.inner.credentials.basic(host).cloned(),
            host: host.to_string(),
            base: endpoint.base.clone(),
            challenge: endpoint.challenge.clone(),
            name,
            scopes,
        });

        Ok(Arc::new(HttpRepository {
            named: reference.as_repository(),
            session,
        }))
    }

    fn scoped(&self, actions: &[&str], scopes: &[Scope]) -> Arc<dyn RepositoryConnector> {
        Arc::new(self.with_actions(actions).with_scopes(scopes))
    }
}

/// Authenticated access to one repository
pub(crate) struct Session {
    pub(crate) client: Client,
    context: Arc<ContextInner>,
    credentials: Option<Credentials>,
    host: String,
    base: Url,
    challenge: Challenge,
    pub(crate) name: String,
    scopes: Vec<Scope>,
}

impl Session {
    /// `<base>/v2/<name>/<path>`
    pub(crate) fn url(&self, path: &str) -> Result<Url, RegistryError> {
        Ok(self.base.join(&format!("v2/{}/{}", self.name, path))?)
    }

    /// Resolve a `Location` header against the registry base
    pub(crate) fn resolve_location(&self, response: &Response) -> Result<Url, RegistryError> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| RegistryError::Parse("missing Location header in upload response".to_string()))?;
        Ok(self.base.join(location)?)
    }

    fn token_key(&self) -> String {
        let mut scopes: Vec<String> = self.scopes.iter().map(|s| s.to_string()).collect();
        scopes.sort();
        format!("{} {}", self.host, scopes.join(" "))
    }

    fn cached_token(&self) -> Option<String> {
        self.context
            .tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(&self.token_key()).cloned())
    }

    async fn fetch_token(&self) -> Result<Option<String>, RegistryError> {
        let Challenge::Bearer { realm, service } = &self.challenge else {
            return Ok(None);
        };
        let token = self
            .context
            .auth
            .get_token(realm, service.as_deref(), &self.scopes, self.credentials.as_ref())
            .await?;
        if let Ok(mut tokens) = self.context.tokens.lock() {
            tokens.insert(self.token_key(), token.clone());
        }
        Ok(Some(token))
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, RegistryError> {
        match &self.challenge {
            Challenge::Bearer { .. } => {
                let token = match self.cached_token() {
                    Some(token) => Some(token),
                    None => self.fetch_token().await?,
                };
                Ok(match token {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                })
            }
            Challenge::Basic => Ok(match &self.credentials {
                Some(c) => request.basic_auth(&c.username, Some(&c.password)),
                None => request,
            }),
            Challenge::Anonymous => Ok(request),
        }
    }

    /// Send a request that can be rebuilt; a 401 refreshes the token once and retries
    pub(crate) async fn execute<F>(&self, context: &str, build: F) -> Result<Response, RegistryError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            let request = self.authorize(build(&self.client)).await?;
            let response = request
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, context))?;
            if response.status() == StatusCode::UNAUTHORIZED
                && !refreshed
                && matches!(self.challenge, Challenge::Bearer { .. })
            {
                tracing::debug!(context, "received 401, refreshing token");
                self.fetch_token().await?;
                refreshed = true;
                continue;
            }
            return Ok(response);
        }
    }

    /// Send a request whose body cannot be replayed
    pub(crate) async fn execute_once(
        &self,
        context: &str,
        request: RequestBuilder,
    ) -> Result<Response, RegistryError> {
        self.authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, context))
    }
}

/// Turn a non-success response into an error
pub(crate) async fn check(response: Response, context: &str) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ResponseErrorHandler::handle(status, &body, context))
}

pub struct HttpRepository {
    named: ImageReference,
    session: Arc<Session>,
}

impl Repository for HttpRepository {
    fn named(&self) -> &ImageReference {
        &self.named
    }

    fn blobs(&self) -> Arc<dyn BlobStore> {
        Arc::new(HttpBlobStore::new(self.session.clone()))
    }

    fn manifests(&self) -> Arc<dyn ManifestService> {
        Arc::new(HttpManifestService::new(self.session.clone()))
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(HttpTagService::new(self.session.clone()))
    }
}
