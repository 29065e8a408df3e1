use bytes::Bytes;
use log::warn;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, Platform};
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::digest::sha256_digest;
use crate::dispatch::{ApiEndpoint, ApiRequest};
use crate::errors::{Error, Result};
use crate::ratelimit::RateLimit;
use crate::reference::Reference;

pub const MT_DOCKER1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MT_DOCKER1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MT_DOCKER2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MT_DOCKER2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MT_OCI1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MT_OCI1_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MT_DOCKER2_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MT_OCI1_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MT_DOCKER2_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MT_OCI1_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MT_OCI1_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MT_OCI1_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MT_OCTET_STREAM: &str = "application/octet-stream";

pub const HEADER_DOCKER_DIGEST: &str = "docker-content-digest";
pub const HEADER_OCI_DIGEST: &str = "oci-content-digest";

// every manifest flavor we can parse, sent on manifest requests
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v1+prettyjws, \
     application/vnd.docker.distribution.manifest.v1+json";

/// Media types can carry parameters (`; charset=utf-8`); dispatch happens
/// on the base type alone.
pub fn base_media_type(ct: &str) -> &str {
    ct.split(';').next().unwrap_or("").trim()
}

pub fn is_manifest_media_type(ct: &str) -> bool {
    matches!(
        base_media_type(ct),
        MT_DOCKER1 | MT_DOCKER1_SIGNED | MT_DOCKER2 | MT_DOCKER2_LIST | MT_OCI1 | MT_OCI1_INDEX
    )
}

/// Docker schema 1 image manifest, the legacy fsLayers-only format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1Manifest {
    pub schema_version: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub fs_layers: Vec<Schema1FsLayer>,
    #[serde(default)]
    pub history: Vec<Schema1History>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1FsLayer {
    pub blob_sum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1History {
    #[serde(default)]
    pub v1_compatibility: String,
}

/// The parsed variant behind a manifest's raw bytes.
#[derive(Debug, Clone)]
pub enum ManifestBody {
    Docker1(Box<Schema1Manifest>),
    Docker1Signed(Box<Schema1Manifest>),
    Docker2(Box<ImageManifest>),
    Docker2List(Box<ImageIndex>),
    Oci1(Box<ImageManifest>),
    Oci1Index(Box<ImageIndex>),
    Unknown,
}

/// A manifest as pulled from (or destined for) a registry. The raw bytes
/// are canonical: `marshal` returns them verbatim so the digest survives a
/// copy.
#[derive(Debug, Clone)]
pub struct Manifest {
    rfr: Reference,
    media_type: String,
    digest: String,
    raw: Option<Bytes>,
    body: ManifestBody,
    headers: HeaderMap,
    ratelimit: RateLimit,
}

impl Manifest {
    /// Parse raw manifest bytes under a declared media type. The digest is
    /// always recomputed from the bytes.
    pub fn from_bytes(rfr: &Reference, media_type: &str, raw: Bytes) -> Result<Manifest> {
        let base = base_media_type(media_type).to_string();
        let body = parse_body(&base, &raw)?;
        Ok(Manifest {
            rfr: rfr.clone(),
            digest: sha256_digest(&raw),
            media_type: base,
            raw: Some(raw),
            body,
            headers: HeaderMap::new(),
            ratelimit: RateLimit::default(),
        })
    }

    /// Headers-only manifest as returned by a HEAD request.
    pub(crate) fn from_head(
        rfr: &Reference,
        media_type: &str,
        digest: String,
        headers: HeaderMap,
    ) -> Manifest {
        let ratelimit = RateLimit::from_headers(&headers);
        Manifest {
            rfr: rfr.clone(),
            media_type: base_media_type(media_type).to_string(),
            digest,
            raw: None,
            body: ManifestBody::Unknown,
            headers,
            ratelimit,
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.rfr
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn ratelimit(&self) -> &RateLimit {
        &self.ratelimit
    }

    pub fn body(&self) -> &ManifestBody {
        &self.body
    }

    /// The exact bytes as delivered on the wire (or as synthesized).
    pub fn marshal(&self) -> Result<Bytes> {
        self.raw
            .clone()
            .ok_or_else(|| Error::ManifestNotSet(self.rfr.common_name()))
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self.body,
            ManifestBody::Docker2List(_) | ManifestBody::Oci1Index(_)
        )
    }

    /// Layer descriptors of a single-image manifest.
    pub fn layers(&self) -> Result<Vec<Descriptor>> {
        match &self.body {
            ManifestBody::Docker2(m) | ManifestBody::Oci1(m) => Ok(m.layers().clone()),
            ManifestBody::Docker1(m) | ManifestBody::Docker1Signed(m) => m
                .fs_layers
                .iter()
                .map(|l| {
                    let digest = l.blob_sum.parse::<oci_spec::image::Digest>().map_err(|_| {
                        Error::ParsingFailed(format!("bad blobSum {:?}", l.blob_sum))
                    })?;
                    Ok(Descriptor::new(MT_DOCKER2_LAYER_GZIP.into(), 0, digest))
                })
                .collect(),
            _ => Err(self.unsupported("layers")),
        }
    }

    /// Config descriptor; None for formats without one (docker schema 1).
    pub fn config_descriptor(&self) -> Result<Option<Descriptor>> {
        match &self.body {
            ManifestBody::Docker2(m) | ManifestBody::Oci1(m) => Ok(Some(m.config().clone())),
            ManifestBody::Docker1(_) | ManifestBody::Docker1Signed(_) => Ok(None),
            _ => Err(self.unsupported("config descriptor")),
        }
    }

    /// Child descriptors of a manifest list / index.
    pub fn descriptor_list(&self) -> Result<Vec<Descriptor>> {
        match &self.body {
            ManifestBody::Docker2List(i) | ManifestBody::Oci1Index(i) => {
                Ok(i.manifests().clone())
            }
            _ => Err(self.unsupported("descriptor list")),
        }
    }

    /// Child of a list/index matching the given platform.
    pub fn platform_descriptor(&self, platform: &Platform) -> Result<Option<Descriptor>> {
        let list = self.descriptor_list()?;
        Ok(list
            .into_iter()
            .find(|d| d.platform().as_ref().is_some_and(|p| platform_eq(p, platform))))
    }

    fn unsupported(&self, op: &str) -> Error {
        Error::UnsupportedMediaType(format!(
            "{} on {} ({})",
            op,
            self.media_type,
            self.rfr.common_name()
        ))
    }
}

fn platform_eq(a: &Platform, b: &Platform) -> bool {
    a.architecture() == b.architecture()
        && a.os() == b.os()
        && (b.variant().is_none() || a.variant() == b.variant())
}

fn parse_body(base: &str, raw: &Bytes) -> Result<ManifestBody> {
    let parsed = match base {
        MT_DOCKER1 => ManifestBody::Docker1(parse_schema1(raw)?),
        MT_DOCKER1_SIGNED => ManifestBody::Docker1Signed(parse_schema1(raw)?),
        MT_DOCKER2 => ManifestBody::Docker2(Box::new(serde_json::from_slice(raw)?)),
        MT_OCI1 => ManifestBody::Oci1(Box::new(serde_json::from_slice(raw)?)),
        MT_DOCKER2_LIST => ManifestBody::Docker2List(Box::new(serde_json::from_slice(raw)?)),
        MT_OCI1_INDEX => ManifestBody::Oci1Index(Box::new(serde_json::from_slice(raw)?)),
        _ => ManifestBody::Unknown,
    };
    Ok(parsed)
}

fn parse_schema1(raw: &Bytes) -> Result<Box<Schema1Manifest>> {
    let m: Schema1Manifest = serde_json::from_slice(raw)?;
    if m.schema_version != 1 {
        return Err(Error::UnsupportedConfigVersion(format!(
            "schema1 manifest with schemaVersion {}",
            m.schema_version
        )));
    }
    Ok(Box::new(m))
}

/// `/v2/<repo>/tags/list` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagList {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `/v2/_catalog` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoList {
    #[serde(default)]
    pub repositories: Vec<String>,
}

fn tag_or_digest(rfr: &Reference) -> Result<&str> {
    if !rfr.digest().is_empty() {
        Ok(rfr.digest())
    } else if !rfr.tag().is_empty() {
        Ok(rfr.tag())
    } else {
        Err(Error::MissingTagOrDigest(rfr.common_name()))
    }
}

fn digest_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_DOCKER_DIGEST)
        .or_else(|| headers.get(HEADER_OCI_DIGEST))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl Client {
    /// Fetch and parse a manifest. The digest is recomputed from the body;
    /// disagreement with the response header or the reference is logged but
    /// does not fail the request.
    pub async fn manifest_get(&self, rfr: &Reference) -> Result<Manifest> {
        let ctx = format!("manifest get {}", rfr.common_name());
        let tod = tag_or_digest(rfr)?;
        let mut ep = ApiEndpoint::new(Method::GET, rfr.repository(), format!("manifests/{}", tod));
        ep.headers
            .insert(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));
        let mut reader = self
            .run_api(ApiRequest::single(rfr.registry(), ep))
            .await
            .map_err(|e| e.map_terminal(&ctx))?;
        let headers = reader.headers().clone();
        let declared_len = reader.content_length();
        let raw = reader.read_to_bytes().await.map_err(|e| e.map_terminal(&ctx))?;

        if let Some(len) = declared_len
            && len != raw.len() as u64
        {
            warn!("{}: body length {} != content-length {}", ctx, raw.len(), len);
        }
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mut m = Manifest::from_bytes(rfr, &media_type, raw)?;
        if let Some(header_digest) = digest_header(&headers)
            && header_digest != m.digest
        {
            warn!(
                "{}: registry digest {} != computed {}, using computed",
                ctx, header_digest, m.digest
            );
        }
        if !rfr.digest().is_empty() && rfr.digest() != m.digest {
            warn!(
                "{}: requested digest differs from computed {}",
                ctx, m.digest
            );
        }
        m.ratelimit = RateLimit::from_headers(&headers);
        m.headers = headers;
        Ok(m)
    }

    /// Metadata-only manifest lookup.
    pub async fn manifest_head(&self, rfr: &Reference) -> Result<Manifest> {
        let ctx = format!("manifest head {}", rfr.common_name());
        let tod = tag_or_digest(rfr)?;
        let mut ep = ApiEndpoint::new(Method::HEAD, rfr.repository(), format!("manifests/{}", tod));
        ep.headers
            .insert(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));
        let reader = self
            .run_api(ApiRequest::single(rfr.registry(), ep))
            .await
            .map_err(|e| e.map_terminal(&ctx))?;
        let headers = reader.headers().clone();
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let digest = digest_header(&headers)
            .unwrap_or_else(|| rfr.digest().to_string());
        Ok(Manifest::from_head(rfr, &media_type, digest, headers))
    }

    /// Push a manifest. The body is the manifest's canonical bytes and the
    /// Content-Type its declared media type.
    pub async fn manifest_put(&self, rfr: &Reference, manifest: &Manifest) -> Result<()> {
        let ctx = format!("manifest put {}", rfr.common_name());
        let tod = tag_or_digest(rfr)?;
        let raw = manifest.marshal()?;
        let mut ep = ApiEndpoint::new(Method::PUT, rfr.repository(), format!("manifests/{}", tod));
        ep.actions = "pull,push";
        ep.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(manifest.media_type()).map_err(|_| {
                Error::ParsingFailed(format!("bad media type {:?}", manifest.media_type()))
            })?,
        );
        ep.content_length = Some(raw.len() as u64);
        let body = raw.clone();
        ep.body = Some(Box::new(move || {
            let body = body.clone();
            Box::pin(async move { Ok(reqwest::Body::from(body)) })
        }));
        let mut req = ApiRequest::single(rfr.registry(), ep);
        req.no_mirrors = true;
        self.run_api(req).await.map_err(|e| e.map_terminal(&ctx))?;
        Ok(())
    }

    /// Delete a manifest by digest; the registry answers 202.
    pub async fn manifest_delete(&self, rfr: &Reference) -> Result<()> {
        let ctx = format!("manifest delete {}", rfr.common_name());
        if rfr.digest().is_empty() {
            return Err(Error::MissingDigest(rfr.common_name()));
        }
        let mut ep = ApiEndpoint::new(
            Method::DELETE,
            rfr.repository(),
            format!("manifests/{}", rfr.digest()),
        );
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

    /// List tags of a repository, with the registry's paging controls.
    pub async fn tag_list(
        &self,
        rfr: &Reference,
        limit: Option<u32>,
        last: Option<&str>,
    ) -> Result<TagList> {
        let ctx = format!("tag list {}", rfr.common_name());
        let mut ep = ApiEndpoint::new(Method::GET, rfr.repository(), "tags/list");
        if let Some(n) = limit {
            ep.query.push(("n".into(), n.to_string()));
        }
        if let Some(last) = last {
            ep.query.push(("last".into(), last.to_string()));
        }
        let mut reader = self
            .run_api(ApiRequest::single(rfr.registry(), ep))
            .await
            .map_err(|e| e.map_terminal(&ctx))?;
        let raw = reader.read_to_bytes().await.map_err(|e| e.map_terminal(&ctx))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// List repositories of a registry via `/v2/_catalog`.
    pub async fn repo_list(
        &self,
        registry: &str,
        limit: Option<u32>,
        last: Option<&str>,
    ) -> Result<RepoList> {
        let ctx = format!("repo list {}", registry);
        let mut ep = ApiEndpoint::new(Method::GET, "", "_catalog");
        if let Some(n) = limit {
            ep.query.push(("n".into(), n.to_string()));
        }
        if let Some(last) = last {
            ep.query.push(("last".into(), last.to_string()));
        }
        let mut reader = self
            .run_api(ApiRequest::single(registry, ep))
            .await
            .map_err(|e| e.map_terminal(&ctx))?;
        let raw = reader.read_to_bytes().await.map_err(|e| e.map_terminal(&ctx))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Version probe: GET `/v2/`, returning the response headers.
    pub async fn ping(&self, registry: &str) -> Result<HeaderMap> {
        let ctx = format!("ping {}", registry);
        let ep = ApiEndpoint::new(Method::GET, "", "");
        let reader = self
            .run_api(ApiRequest::single(registry, ep))
            .await
            .map_err(|e| e.map_terminal(&ctx))?;
        Ok(reader.headers().clone())
    }
}
