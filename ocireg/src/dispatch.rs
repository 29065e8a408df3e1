use std::collections::HashMap;

use log::debug;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};

use crate::auth::Credentials;
use crate::client::Client;
use crate::errors::{Error, Result};
use crate::hosts::HostConfig;
use crate::retry::{BlobReader, BodyFactory, MirrorFn, ReqSpec, UrlTarget};

/// One concrete distribution endpoint: everything below `/v2/` plus the
/// request shape. Requests carry one endpoint per registry API flavor; the
/// empty flavor is the fallback.
pub(crate) struct ApiEndpoint {
    pub method: Method,
    pub repository: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<BodyFactory>,
    pub content_length: Option<u64>,
    pub expect_digest: Option<String>,
    /// Scope actions requested for the repository, e.g. `pull` or
    /// `pull,push`.
    pub actions: &'static str,
    /// Additional full scopes, e.g. source-repository pull for a mount.
    pub extra_scopes: Vec<String>,
}

impl ApiEndpoint {
    pub fn new(method: Method, repository: &str, path: impl Into<String>) -> ApiEndpoint {
        ApiEndpoint {
            method,
            repository: repository.to_string(),
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            content_length: None,
            expect_digest: None,
            actions: "pull",
            extra_scopes: Vec::new(),
        }
    }

    fn scope(&self) -> String {
        let mut scope = if self.repository.is_empty() {
            if self.path.starts_with("_catalog") {
                "registry:catalog:*".to_string()
            } else {
                String::new()
            }
        } else {
            format!("repository:{}:{}", self.repository, self.actions)
        };
        for extra in &self.extra_scopes {
            if !scope.is_empty() {
                scope.push(' ');
            }
            scope.push_str(extra);
        }
        scope
    }
}

pub(crate) struct ApiRequest {
    pub host: String,
    pub apis: HashMap<String, ApiEndpoint>,
    pub no_mirrors: bool,
    pub mirror_fn: Option<MirrorFn>,
}

impl ApiRequest {
    /// Request with a single endpoint under the default flavor.
    pub fn single(host: &str, endpoint: ApiEndpoint) -> ApiRequest {
        let mut apis = HashMap::new();
        apis.insert(String::new(), endpoint);
        ApiRequest {
            host: host.to_string(),
            apis,
            no_mirrors: false,
            mirror_fn: None,
        }
    }
}

impl Client {
    /// Credentials for a host, falling back to the defaults stored under
    /// the empty host name.
    pub(crate) fn creds_for(&self, host: &HostConfig) -> Credentials {
        if !host.user.is_empty() || !host.token.is_empty() {
            return Credentials {
                user: host.user.clone(),
                pass: host.pass.clone(),
                token: host.token.clone(),
            };
        }
        let fallback = self.hosts.get("");
        Credentials {
            user: fallback.user,
            pass: fallback.pass,
            token: fallback.token,
        }
    }

    pub(crate) fn target_for_url(&self, url: Url, host: &HostConfig) -> UrlTarget {
        UrlTarget {
            url,
            creds: self.creds_for(host),
            host: host.clone(),
        }
    }

    /// Resolve the candidate host list (mirrors first, priority descending,
    /// upstream last on ties), synthesize per-host URLs, and hand off to
    /// the retry engine.
    pub(crate) async fn run_api(&self, mut req: ApiRequest) -> Result<BlobReader> {
        let upstream = self.hosts.get(&req.host);
        let mut candidates: Vec<HostConfig> = Vec::new();
        if !req.no_mirrors {
            for mirror in &upstream.mirrors {
                candidates.push(self.hosts.get(mirror));
            }
        }
        candidates.push(upstream.clone());
        // stable by descending priority, so the upstream entry appended
        // last stays last among equals
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut targets = Vec::new();
        for host in &candidates {
            let Some(endpoint) = req.apis.get(&host.api).or_else(|| req.apis.get("")) else {
                debug!("no endpoint for host {} flavor {:?}", host.name, host.api);
                continue;
            };
            targets.push(self.target_for_url(synthesize_url(host, endpoint)?, host));
        }
        if targets.is_empty() {
            return Err(Error::ApiNotFound(format!(
                "{} (flavor {:?})",
                req.host, upstream.api
            )));
        }

        // the upstream flavor's endpoint supplies the request shape
        let key = if req.apis.contains_key(&upstream.api) {
            upstream.api.clone()
        } else {
            String::new()
        };
        let endpoint = req
            .apis
            .remove(&key)
            .ok_or_else(|| Error::ApiNotFound(req.host.clone()))?;

        let mut spec = ReqSpec::new(endpoint.method.clone(), targets, endpoint.scope());
        spec.headers = endpoint.headers;
        spec.body = endpoint.body;
        spec.content_length = endpoint.content_length;
        spec.expect_digest = endpoint.expect_digest;
        spec.mirror_fn = req.mirror_fn;
        self.transport.run(spec).await
    }

    /// Run a request against one absolute URL, e.g. a server-assigned
    /// upload session.
    pub(crate) async fn run_url(
        &self,
        host: &HostConfig,
        endpoint: ApiEndpoint,
        url: Url,
    ) -> Result<BlobReader> {
        let targets = vec![self.target_for_url(url, host)];
        let mut spec = ReqSpec::new(endpoint.method.clone(), targets, endpoint.scope());
        spec.headers = endpoint.headers;
        spec.body = endpoint.body;
        spec.content_length = endpoint.content_length;
        spec.expect_digest = endpoint.expect_digest;
        self.transport.run(spec).await
    }
}

/// `scheme://hostname/v2/[pathPrefix/]<repo>/<apiPath>` plus query values;
/// http only when TLS is disabled for the host.
fn synthesize_url(host: &HostConfig, endpoint: &ApiEndpoint) -> Result<Url> {
    let mut s = format!("{}://{}/v2/", host.scheme(), host.hostname);
    if !host.path_prefix.is_empty() {
        s.push_str(&host.path_prefix);
        s.push('/');
    }
    if !endpoint.repository.is_empty() {
        s.push_str(&endpoint.repository);
        s.push('/');
    }
    s.push_str(&endpoint.path);
    let mut url = Url::parse(&s)
        .map_err(|e| Error::ParsingFailed(format!("bad url {:?}: {}", s, e)))?;
    if !endpoint.query.is_empty() {
        url.query_pairs_mut().extend_pairs(endpoint.query.iter());
    }
    Ok(url)
}
