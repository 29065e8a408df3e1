use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION};
use reqwest::{Method, Url};

use crate::client::Client;
use crate::digest::Digester;
use crate::dispatch::{ApiEndpoint, ApiRequest};
use crate::errors::{Error, Result};
use crate::hosts::HostConfig;
use crate::manifest::MT_OCTET_STREAM;
use crate::reference::Reference;
use crate::retry::BlobReader;

/// Byte stream feeding a blob upload.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Reopens the upload source from the start, so failed upload attempts can
/// rewind.
pub type BlobSource = Arc<dyn Fn() -> BoxFuture<'static, Result<BlobStream>> + Send + Sync>;

/// Source over an in-memory byte string.
pub fn source_from_bytes(data: impl Into<Bytes>) -> BlobSource {
    let data: Bytes = data.into();
    Arc::new(move || {
        let data = data.clone();
        Box::pin(async move {
            let stream: BlobStream = Box::pin(futures::stream::once(async move { Ok(data) }));
            Ok(stream)
        })
    })
}

/// Source reading a file fresh on every attempt.
pub fn source_from_path(path: impl Into<PathBuf>) -> BlobSource {
    let path: PathBuf = path.into();
    Arc::new(move || {
        let path = path.clone();
        Box::pin(async move {
            let file = tokio::fs::File::open(&path).await?;
            let stream: BlobStream = Box::pin(futures::stream::unfold(file, |mut file| async {
                use tokio::io::AsyncReadExt;
                let mut buf = BytesMut::with_capacity(64 * 1024);
                match file.read_buf(&mut buf).await {
                    Ok(0) => None,
                    Ok(_) => Some((Ok(buf.freeze()), file)),
                    Err(e) => Some((Err(e.into()), file)),
                }
            }));
            Ok(stream)
        })
    })
}

/// Metadata from a blob HEAD.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub digest: String,
    pub size: Option<u64>,
    pub media_type: String,
    pub headers: HeaderMap,
}

/// Streaming, seekable blob download. Reads verify digest and length at
/// end-of-stream; `seek` confirms the server advertises range support
/// before restarting anywhere but the origin.
pub struct Blob {
    reader: BlobReader,
    client: Client,
    rfr: Reference,
    digest: String,
    ranges_ok: Option<bool>,
}

impl Blob {
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn headers(&self) -> &HeaderMap {
        self.reader.headers()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.reader.content_length()
    }

    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.reader.chunk().await
    }

    pub async fn read_to_bytes(&mut self) -> Result<Bytes> {
        self.reader.read_to_bytes().await
    }

    pub async fn write_to<W>(&mut self, w: &mut W) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        self.reader.write_to(w).await
    }

    /// Restart the stream at `pos`. The first non-origin seek HEADs the
    /// blob to confirm the server accepts ranges.
    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        if pos != 0 {
            let ok = match self.ranges_ok {
                Some(ok) => ok,
                None => {
                    let info = self.client.blob_head(&self.rfr, &self.digest).await?;
                    let ok = info
                        .headers
                        .get("accept-ranges")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
                    self.ranges_ok = Some(ok);
                    ok
                }
            };
            if !ok {
                return Err(Error::UnsupportedApi(format!(
                    "blob seek {} {}: server does not accept ranges",
                    self.rfr.common_name(),
                    self.digest
                )));
            }
        }
        self.reader.seek(pos).await
    }

    /// Unwrap into the underlying reader, e.g. to feed a request body.
    pub fn into_reader(self) -> BlobReader {
        self.reader
    }
}

fn resolve_location(base: &Url, headers: &HeaderMap, ctx: &str) -> Result<Url> {
    let loc = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::MissingLocation(ctx.to_string()))?;
    // relative, schemeless, and absolute forms all resolve against the
    // request url
    base.join(loc)
        .map_err(|e| Error::ParsingFailed(format!("{}: bad location {:?}: {}", ctx, loc, e)))
}

fn octet_stream() -> HeaderValue {
    HeaderValue::from_static(MT_OCTET_STREAM)
}

fn body_from_bytes(data: Bytes) -> crate::retry::BodyFactory {
    Box::new(move || {
        let data = data.clone();
        Box::pin(async move { Ok(reqwest::Body::from(data)) })
    })
}

impl Client {
    /// Blob metadata lookup.
    pub async fn blob_head(&self, rfr: &Reference, digest: &str) -> Result<BlobInfo> {
        let ctx = format!("blob head {} {}", rfr.common_name(), digest);
        let ep = ApiEndpoint::new(Method::HEAD, rfr.repository(), format!("blobs/{}", digest));
        let reader = self
            .run_api(ApiRequest::single(rfr.registry(), ep))
            .await
            .map_err(|e| e.map_terminal(&ctx))?;
        let headers = reader.headers().clone();
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MT_OCTET_STREAM)
            .to_string();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(BlobInfo {
            digest: digest.to_string(),
            size,
            media_type,
            headers,
        })
    }

    /// Open a blob for reading. The returned reader verifies the digest on
    /// end-of-stream and resumes interrupted bodies via range requests.
    pub async fn blob_get(&self, rfr: &Reference, digest: &str) -> Result<Blob> {
        let ctx = format!("blob get {} {}", rfr.common_name(), digest);
        let mut ep = ApiEndpoint::new(Method::GET, rfr.repository(), format!("blobs/{}", digest));
        ep.expect_digest = Some(digest.to_string());
        let reader = self
            .run_api(ApiRequest::single(rfr.registry(), ep))
            .await
            .map_err(|e| e.map_terminal(&ctx))?;
        Ok(Blob {
            reader,
            client: self.clone(),
            rfr: rfr.clone(),
            digest: digest.to_string(),
            ranges_ok: None,
        })
    }

    /// Delete a blob by digest; the registry answers 202.
    pub async fn blob_delete(&self, rfr: &Reference, digest: &str) -> Result<()> {
        let ctx = format!("blob delete {} {}", rfr.common_name(), digest);
        let mut ep = ApiEndpoint::new(Method::DELETE, rfr.repository(), format!("blobs/{}", digest));
        ep.actions = "pull,push";
        let mut req = ApiRequest::single(rfr.registry(), ep);
        req.no_mirrors = true;
        let reader = self.run_api(req).await.map_err(|e| e.map_terminal(&ctx))?;
        if reader.status().as_u16() != 202 {
            return Err(Error::HttpStatus {
                status: reader.status().as_u16(),
                url: ctx,
            });
        }
        Ok(())
    }

    /// Cross-repository mount within one registry. On decline the registry
    /// opens an upload session instead; that session is canceled and the
    /// sentinel surfaced so callers fall back to a copy.
    pub async fn blob_mount(&self, rfr: &Reference, digest: &str, from: &str) -> Result<()> {
        match self.blob_mount_inner(rfr, digest, from).await {
            Err(Error::MountReturnedLocation(loc)) => {
                if let Ok(url) = Url::parse(&loc) {
                    let host = self.hosts.get(rfr.registry());
                    self.blob_session_cancel(&host, &url).await;
                }
                Err(Error::MountReturnedLocation(loc))
            }
            other => other,
        }
    }

    // only a 202 with a parseable location yields the sentinel; a 202
    // without one is an error
    async fn blob_mount_inner(&self, rfr: &Reference, digest: &str, from: &str) -> Result<()> {
        let ctx = format!("blob mount {} {}", rfr.common_name(), digest);
        let mut ep = ApiEndpoint::new(Method::POST, rfr.repository(), "blobs/uploads/");
        ep.actions = "pull,push";
        ep.query.push(("mount".into(), digest.to_string()));
        ep.query.push(("from".into(), from.to_string()));
        if !from.is_empty() {
            ep.extra_scopes.push(format!("repository:{}:pull", from));
        }
        let mut req = ApiRequest::single(rfr.registry(), ep);
        req.no_mirrors = true;
        let reader = self.run_api(req).await.map_err(|e| e.map_terminal(&ctx))?;
        match reader.status().as_u16() {
            201 => Ok(()),
            202 => {
                let base = reader
                    .url()
                    .cloned()
                    .ok_or_else(|| Error::MissingLocation(ctx.clone()))?;
                let loc = resolve_location(&base, reader.headers(), &ctx)?;
                Err(Error::MountReturnedLocation(loc.to_string()))
            }
            status => Err(Error::HttpStatus { status, url: ctx }),
        }
    }

    /// Upload a blob. Tries a registry-side mount when digest and length
    /// are known, then a monolithic put when the size fits under the
    /// host's cap, and falls back to a chunked patch+put session. Returns
    /// the digest and size actually uploaded.
    pub async fn blob_put(
        &self,
        rfr: &Reference,
        digest: Option<&str>,
        length: i64,
        source: BlobSource,
    ) -> Result<(String, u64)> {
        let ctx = format!(
            "blob put {} {}",
            rfr.common_name(),
            digest.unwrap_or("(unknown digest)")
        );
        // zero length means unknown: no mount, no monolithic attempt
        let length = if length == 0 { -1 } else { length };
        let host = self.hosts.get(rfr.registry());

        let mut session: Option<Url> = None;
        if let Some(d) = digest
            && length > 0
        {
            match self.blob_mount_inner(rfr, d, "").await {
                Ok(()) => {
                    debug!("{}: anonymous mount satisfied the upload", ctx);
                    return Ok((d.to_string(), length as u64));
                }
                Err(Error::MountReturnedLocation(loc)) => {
                    session = Some(Url::parse(&loc).map_err(|e| {
                        Error::ParsingFailed(format!("{}: bad mount location: {}", ctx, e))
                    })?);
                }
                Err(e) => debug!("{}: mount not taken: {}", ctx, e),
            }
        }

        let mut session = match session {
            Some(url) => url,
            None => self.blob_upload_init(rfr).await?,
        };

        let blob_max = host.effective_blob_max();
        if let Some(d) = digest
            && length > 0
            && blob_max > 0
            && length <= blob_max
        {
            match self
                .blob_put_monolithic(&host, &session, d, length as u64, &source, &ctx)
                .await
            {
                Ok(()) => return Ok((d.to_string(), length as u64)),
                Err(e) => {
                    // the session took a partial body; abandon it and
                    // rewind the source into a fresh chunked session
                    warn!("{}: monolithic put failed, retrying chunked: {}", ctx, e);
                    self.blob_session_cancel(&host, &session).await;
                    session = self.blob_upload_init(rfr).await?;
                }
            }
        }

        match self
            .blob_put_chunked(&host, &mut session, digest, length, &source, &ctx)
            .await
        {
            Ok(done) => Ok(done),
            Err(e) => {
                self.blob_session_cancel(&host, &session).await;
                Err(e)
            }
        }
    }

    // POST the upload-init endpoint and resolve the session url out of the
    // 202's location
    async fn blob_upload_init(&self, rfr: &Reference) -> Result<Url> {
        let ctx = format!("blob upload init {}", rfr.common_name());
        let mut ep = ApiEndpoint::new(Method::POST, rfr.repository(), "blobs/uploads/");
        ep.actions = "pull,push";
        let mut req = ApiRequest::single(rfr.registry(), ep);
        req.no_mirrors = true;
        let reader = self.run_api(req).await.map_err(|e| e.map_terminal(&ctx))?;
        if reader.status().as_u16() != 202 {
            return Err(Error::HttpStatus {
                status: reader.status().as_u16(),
                url: ctx,
            });
        }
        if let Some(uuid) = reader
            .headers()
            .get("docker-upload-uuid")
            .and_then(|v| v.to_str().ok())
        {
            debug!("{}: upload session {}", ctx, uuid);
        }
        let base = reader
            .url()
            .cloned()
            .ok_or_else(|| Error::MissingLocation(ctx.clone()))?;
        resolve_location(&base, reader.headers(), &ctx)
    }

    async fn blob_put_monolithic(
        &self,
        host: &HostConfig,
        session: &Url,
        digest: &str,
        length: u64,
        source: &BlobSource,
        ctx: &str,
    ) -> Result<()> {
        let mut url = session.clone();
        url.query_pairs_mut().append_pair("digest", digest);
        let mut ep = ApiEndpoint::new(Method::PUT, "", "");
        ep.actions = "pull,push";
        ep.headers.insert(CONTENT_TYPE, octet_stream());
        ep.content_length = Some(length);
        let source = source.clone();
        ep.body = Some(Box::new(move || {
            let source = source.clone();
            Box::pin(async move {
                let stream = source().await?;
                Ok(reqwest::Body::wrap_stream(stream))
            })
        }));
        let reader = self.run_url(host, ep, url).await?;
        match reader.status().as_u16() {
            201 | 204 => Ok(()),
            status => Err(Error::HttpStatus {
                status,
                url: ctx.to_string(),
            }),
        }
    }

    async fn blob_put_chunked(
        &self,
        host: &HostConfig,
        session: &mut Url,
        expect_digest: Option<&str>,
        length: i64,
        source: &BlobSource,
        ctx: &str,
    ) -> Result<(String, u64)> {
        let chunk_size = host.effective_blob_chunk() as usize;
        let mut stream = source().await?;
        let mut carry: Option<Bytes> = None;
        let mut digester = Digester::new();
        let mut start: u64 = 0;

        loop {
            let chunk = read_chunk(&mut stream, chunk_size, &mut carry).await?;
            if chunk.is_empty() {
                break;
            }
            digester.update(&chunk);
            let end = start + chunk.len() as u64;

            let mut ep = ApiEndpoint::new(Method::PATCH, "", "");
            ep.actions = "pull,push";
            ep.headers.insert(CONTENT_TYPE, octet_stream());
            ep.headers.insert(
                "content-range",
                HeaderValue::from_str(&format!("{}-{}", start, end))
                    .map_err(|_| Error::ParsingFailed(format!("{}: bad content range", ctx)))?,
            );
            ep.content_length = Some(chunk.len() as u64);
            ep.body = Some(body_from_bytes(chunk.clone()));
            let reader = self.run_url(host, ep, session.clone()).await?;
            match reader.status().as_u16() {
                202 => {}
                201 => info!("{}: server accepted the upload before the final put", ctx),
                status => {
                    return Err(Error::HttpStatus {
                        status,
                        url: ctx.to_string(),
                    });
                }
            }
            if reader.headers().contains_key(LOCATION) {
                *session = resolve_location(session, reader.headers(), ctx)?;
            }

            start = end;
            if chunk.len() < chunk_size {
                break;
            }
        }

        let computed = digester.finalize();
        if let Some(expected) = expect_digest
            && expected != computed
        {
            return Err(Error::DigestMismatch {
                expected: expected.to_string(),
                computed,
            });
        }
        if length >= 0 && start != length as u64 {
            return Err(Error::SizeMismatch {
                expected: length as u64,
                actual: start,
            });
        }

        // zero-length finalize carrying the computed digest
        let mut url = session.clone();
        url.query_pairs_mut().append_pair("digest", &computed);
        let mut ep = ApiEndpoint::new(Method::PUT, "", "");
        ep.actions = "pull,push";
        ep.headers.insert(CONTENT_TYPE, octet_stream());
        ep.content_length = Some(0);
        let reader = self.run_url(host, ep, url).await?;
        match reader.status().as_u16() {
            201 | 204 => Ok((computed, start)),
            status => Err(Error::HttpStatus {
                status,
                url: ctx.to_string(),
            }),
        }
    }

    // best-effort delete of a server-assigned upload session
    async fn blob_session_cancel(&self, host: &HostConfig, session: &Url) {
        let mut ep = ApiEndpoint::new(Method::DELETE, "", "");
        ep.actions = "pull,push";
        if let Err(e) = self.run_url(host, ep, session.clone()).await {
            debug!("upload session cancel failed for {}: {}", session, e);
        }
    }
}

// assemble exactly `size` bytes from the stream, less only at end-of-input
async fn read_chunk(
    stream: &mut BlobStream,
    size: usize,
    carry: &mut Option<Bytes>,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(size);
    if let Some(mut c) = carry.take() {
        if c.len() >= size {
            let rest = c.split_off(size);
            if !rest.is_empty() {
                *carry = Some(rest);
            }
            return Ok(c);
        }
        buf.extend_from_slice(&c);
    }
    while buf.len() < size {
        match stream.next().await {
            Some(Ok(b)) => {
                let need = size - buf.len();
                if b.len() > need {
                    buf.extend_from_slice(&b[..need]);
                    *carry = Some(b.slice(need..));
                    break;
                }
                buf.extend_from_slice(&b);
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(buf.freeze())
}
