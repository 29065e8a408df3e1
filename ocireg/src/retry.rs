use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use log::{debug, trace, warn};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, RANGE};
use reqwest::{Method, StatusCode, Url};

use crate::auth::{Auther, Credentials};
use crate::digest::Digester;
use crate::errors::{Error, Result};
use crate::hosts::{HostConfig, TlsMode};

// exponential on the backoff counter: min(1s << n, 30s), at most 5 waits
// per request state
const BACKOFF_INIT_SECS: u64 = 1;
const BACKOFF_MAX_SECS: u64 = 30;
const BACKOFF_LIMIT: u32 = 5;

/// Produces a fresh request body for every attempt so retries can rewind.
pub(crate) type BodyFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<reqwest::Body>> + Send + Sync>;

/// Rewrites the candidate list before the first attempt.
pub(crate) type MirrorFn = Box<dyn FnOnce(Vec<UrlTarget>) -> Vec<UrlTarget> + Send + Sync>;

/// One candidate URL plus the host whose credentials and TLS mode apply.
pub(crate) struct UrlTarget {
    pub url: Url,
    pub host: HostConfig,
    pub creds: Credentials,
}

pub(crate) struct ReqSpec {
    pub method: Method,
    pub targets: Vec<UrlTarget>,
    pub headers: HeaderMap,
    pub body: Option<BodyFactory>,
    pub content_length: Option<u64>,
    pub expect_digest: Option<String>,
    pub scope: String,
    pub mirror_fn: Option<MirrorFn>,
}

impl ReqSpec {
    pub fn new(method: Method, targets: Vec<UrlTarget>, scope: impl Into<String>) -> ReqSpec {
        ReqSpec {
            method,
            targets,
            headers: HeaderMap::new(),
            body: None,
            content_length: None,
            expect_digest: None,
            scope: scope.into(),
            mirror_fn: None,
        }
    }
}

/// Shared HTTP transports plus the auth negotiator; cheap to clone, the
/// connection pools are shared.
#[derive(Clone)]
pub(crate) struct Transport {
    pub http: reqwest::Client,
    pub http_insecure: reqwest::Client,
    pub auther: Auther,
}

impl Transport {
    fn client_for(&self, host: &HostConfig) -> &reqwest::Client {
        if host.tls == TlsMode::Insecure {
            &self.http_insecure
        } else {
            &self.http
        }
    }

    /// Execute the request, walking mirrors with backoff until one answers
    /// 2xx. The returned reader lazily verifies digest and length and
    /// resumes short bodies via Range.
    pub async fn run(&self, mut spec: ReqSpec) -> Result<BlobReader> {
        if let Some(f) = spec.mirror_fn.take() {
            spec.targets = f(spec.targets);
        }
        let expect = spec.expect_digest.clone();
        let mut state = RetryState {
            transport: self.clone(),
            spec,
            offset: 0,
            backoff: Backoff::default(),
        };
        let resp = state.next_response().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        // a HEAD's content-length describes a body that never arrives
        let declared = if state.spec.method == Method::HEAD {
            None
        } else {
            header_content_length(&headers)
        };
        let digester = expect.as_ref().map(|_| Digester::new());
        Ok(BlobReader {
            state,
            resp: Some(resp),
            status,
            headers,
            declared,
            read: 0,
            discard: 0,
            digester,
            expect,
            done: false,
        })
    }
}

struct RetryState {
    transport: Transport,
    spec: ReqSpec,
    offset: u64,
    backoff: Backoff,
}

impl RetryState {
    // walk the candidate list until a 2xx: transport failures and non-2xx
    // drop the mirror, 408/429 back off in place, 401 gets one same-URL
    // retry after the auth negotiator prepared a credential
    async fn next_response(&mut self) -> Result<reqwest::Response> {
        let mut last_err: Option<Error> = None;
        let mut auth_retried = false;
        loop {
            let Some(target) = self.spec.targets.first() else {
                let last = last_err
                    .take()
                    .unwrap_or_else(|| Error::Unavailable("no candidate urls".into()));
                return Err(Error::AllMirrorsFailed(Box::new(last)));
            };
            let url = target.url.clone();
            let client = self.transport.client_for(&target.host);
            let mut rb = client
                .request(self.spec.method.clone(), url.clone())
                .headers(self.spec.headers.clone());
            if self.offset > 0 {
                rb = rb.header(RANGE, format!("bytes={}-", self.offset));
            }
            if let Some(len) = self.spec.content_length {
                rb = rb.header(CONTENT_LENGTH, len);
            }
            if let Some(factory) = &self.spec.body {
                rb = rb.body(factory().await?);
            }
            rb = self
                .transport
                .auther
                .stamp(rb, &target.host.name, &target.creds, &self.spec.scope)
                .await;

            trace!("{} {}", self.spec.method, url);
            let resp = match rb.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!("transport failure for {}: {}", url, e);
                    last_err = Some(Error::Unavailable(format!("{}: {}", url, e)));
                    self.drop_mirror_and_wait(&mut last_err).await?;
                    auth_retried = false;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            if status == StatusCode::UNAUTHORIZED {
                if auth_retried {
                    return Err(Error::Unauthorized(url.to_string()));
                }
                self.transport
                    .auther
                    .handle_challenge(
                        &target.host.name,
                        &target.creds,
                        &self.spec.scope,
                        resp.headers(),
                    )
                    .await?;
                auth_retried = true;
                continue;
            }
            last_err = Some(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
            if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
                // transient: keep the mirror, wait it out
                self.wait_or_limit(&mut last_err).await?;
                continue;
            }
            debug!("dropping candidate {} after status {}", url, status);
            self.drop_mirror_and_wait(&mut last_err).await?;
            auth_retried = false;
        }
    }

    // remove the current mirror; sleep only when another candidate remains
    async fn drop_mirror_and_wait(&mut self, last_err: &mut Option<Error>) -> Result<()> {
        self.spec.targets.remove(0);
        if self.spec.targets.is_empty() {
            return Ok(());
        }
        self.wait_or_limit(last_err).await
    }

    async fn wait_or_limit(&mut self, last_err: &mut Option<Error>) -> Result<()> {
        if !self.backoff.wait().await {
            let last = last_err
                .take()
                .unwrap_or_else(|| Error::Unavailable("backoff exhausted".into()));
            return Err(Error::BackoffLimit(Box::new(last)));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Backoff {
    count: u32,
}

impl Backoff {
    async fn wait(&mut self) -> bool {
        if self.count >= BACKOFF_LIMIT {
            return false;
        }
        let secs = (BACKOFF_INIT_SECS << self.count).min(BACKOFF_MAX_SECS);
        self.count += 1;
        tokio::time::sleep(Duration::from_secs(secs)).await;
        true
    }
}

fn header_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Response body reader. Counts bytes, tees them into the pinned digest
/// hasher, resumes via Range when the stream ends short of the declared
/// length, and reports a digest mismatch at end-of-stream after all bytes
/// have been delivered.
pub struct BlobReader {
    state: RetryState,
    resp: Option<reqwest::Response>,
    status: StatusCode,
    headers: HeaderMap,
    declared: Option<u64>,
    read: u64,
    // bytes to swallow after a resume the server answered with 200 instead
    // of 206 (they were already delivered and hashed)
    discard: u64,
    digester: Option<Digester>,
    expect: Option<String>,
    done: bool,
}

impl BlobReader {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The URL the successful response came from.
    pub fn url(&self) -> Option<&Url> {
        self.state.spec.targets.first().map(|t| &t.url)
    }

    /// Declared Content-Length of the (first) response, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.declared
    }

    /// Pull the next chunk of the body. `Ok(None)` is a verified
    /// end-of-stream; a digest or length mismatch surfaces as an error on
    /// the read after the final chunk, once every byte has been delivered.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(resp) = self.resp.as_mut() else {
                self.reopen().await?;
                continue;
            };
            match resp.chunk().await {
                Ok(Some(mut b)) => {
                    if self.discard > 0 {
                        let skip = (self.discard).min(b.len() as u64);
                        let _ = b.split_to(skip as usize);
                        self.discard -= skip;
                        if b.is_empty() {
                            continue;
                        }
                    }
                    self.read += b.len() as u64;
                    if let Some(d) = self.digester.as_mut() {
                        d.update(&b);
                    }
                    if let Some(declared) = self.declared
                        && self.read > declared
                    {
                        return Err(Error::SizeMismatch {
                            expected: declared,
                            actual: self.read,
                        });
                    }
                    return Ok(Some(b));
                }
                Ok(None) => {
                    if let Some(declared) = self.declared
                        && self.read < declared
                    {
                        warn!(
                            "short body: {} of {} bytes, resuming via range",
                            self.read, declared
                        );
                        self.resume().await?;
                        continue;
                    }
                    self.done = true;
                    if let (Some(digester), Some(expect)) =
                        (self.digester.take(), self.expect.as_ref())
                    {
                        let computed = digester.finalize();
                        if computed != *expect {
                            return Err(Error::DigestMismatch {
                                expected: expect.clone(),
                                computed,
                            });
                        }
                    }
                    return Ok(None);
                }
                Err(e) => {
                    if self.declared.is_some() && self.read > 0 {
                        warn!("body read failed after {} bytes, resuming: {}", self.read, e);
                        self.resume().await?;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn resume(&mut self) -> Result<()> {
        self.resp = None;
        self.state.offset = self.read;
        // resumes draw on the same backoff budget as the request itself
        let mut last = Some(Error::Unavailable("body ended early".into()));
        self.state.wait_or_limit(&mut last).await?;
        self.reopen().await
    }

    /// Restart the stream at `pos`. The reopen happens lazily on the next
    /// `chunk`. Seeking anywhere but the origin disables digest
    /// verification, since only a full body can be hashed.
    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        self.resp = None;
        self.done = false;
        self.state.offset = pos;
        self.read = pos;
        self.discard = 0;
        self.digester = if pos == 0 {
            self.expect.as_ref().map(|_| Digester::new())
        } else {
            None
        };
        Ok(())
    }

    async fn reopen(&mut self) -> Result<()> {
        let resp = self.state.next_response().await?;
        // a 200 to a ranged request means the server restarted from zero
        if self.state.offset > 0 && resp.status() == StatusCode::OK {
            self.discard = self.state.offset;
        }
        self.resp = Some(resp);
        Ok(())
    }

    /// Drain the remaining body into memory, verifying on the way out.
    pub async fn read_to_bytes(&mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.declared.unwrap_or(0) as usize);
        while let Some(b) = self.chunk().await? {
            buf.extend_from_slice(&b);
        }
        Ok(buf.into())
    }

    /// Stream the remaining body into an async writer, returning the byte
    /// count.
    pub async fn write_to<W>(&mut self, w: &mut W) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;
        let mut n = 0;
        while let Some(b) = self.chunk().await? {
            n += b.len() as u64;
            w.write_all(&b).await?;
        }
        w.flush().await?;
        Ok(n)
    }
}
