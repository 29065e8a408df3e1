//! Integration tests against an in-process mock registry.
//!
//! The mock speaks just enough of the distribution protocol for the client:
//! manifests and blobs with HEAD/GET/PUT/DELETE, chunked and monolithic
//! uploads, cross-repo mounts, bearer auth, and per-prefix failure
//! injection for mirror failover. A separate raw-TCP fixture serves
//! truncated bodies to exercise range resumption.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use ocireg::digest::sha256_digest;
use ocireg::manifest::{MT_DOCKER2, MT_DOCKER2_CONFIG, MT_DOCKER2_LAYER_GZIP, MT_DOCKER2_LIST};
use ocireg::{Client, Compression, Error, HostConfig, HostMap, Reference, TlsMode};

// ---------------------------------------------------------------------------
// mock registry

#[derive(Default)]
struct Registry {
    /// "METHOD /path?query" per request, in arrival order.
    log: Mutex<Vec<String>>,
    /// (repo, digest) -> blob bytes.
    blobs: Mutex<HashMap<(String, String), Bytes>>,
    /// (repo, tag-or-digest) -> (media type, bytes).
    manifests: Mutex<HashMap<(String, String), (String, Bytes)>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    upload_seq: AtomicU64,
    /// path prefixes that answer 500 to everything.
    fail_prefixes: HashSet<String>,
    /// known path prefixes (mirror simulation); "" for none.
    prefixes: HashSet<String>,
    /// bearer auth: Some(realm-url) demands a token.
    auth_realm: Mutex<Option<String>>,
    token_hits: AtomicU64,
}

impl Registry {
    fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    fn logged(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn put_blob(&self, repo: &str, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let digest = sha256_digest(&data);
        self.blobs
            .lock()
            .unwrap()
            .insert((repo.to_string(), digest.clone()), data);
        digest
    }

    fn put_manifest(&self, repo: &str, tag: &str, media_type: &str, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let digest = sha256_digest(&data);
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(
            (repo.to_string(), tag.to_string()),
            (media_type.to_string(), data.clone()),
        );
        manifests.insert(
            (repo.to_string(), digest.clone()),
            (media_type.to_string(), data),
        );
        digest
    }

    fn has_blob(&self, repo: &str, digest: &str) -> bool {
        self.blobs
            .lock()
            .unwrap()
            .contains_key(&(repo.to_string(), digest.to_string()))
    }
}

fn resp(status: u16) -> axum::http::response::Builder {
    Response::builder().status(status)
}

fn empty(status: u16) -> Response {
    resp(status).body(Body::empty()).unwrap()
}

async fn handle(State(reg): State<Arc<Registry>>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();
    let authz = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = axum::body::to_bytes(req.into_body(), 64 << 20).await.unwrap();

    reg.log.lock().unwrap().push(if query.is_empty() {
        format!("{} {}", method, path)
    } else {
        format!("{} {}?{}", method, path, query)
    });

    if path == "/token" {
        reg.token_hits.fetch_add(1, Ordering::SeqCst);
        return resp(200)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"token": "mock-token", "expires_in": 300}"#))
            .unwrap();
    }

    // bearer gate
    if let Some(realm) = reg.auth_realm.lock().unwrap().clone()
        && authz != "Bearer mock-token"
    {
        return resp(401)
            .header(
                "www-authenticate",
                format!(r#"Bearer realm="{}",service="mock""#, realm),
            )
            .body(Body::empty())
            .unwrap();
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return empty(404);
    };
    // optional mirror prefix ahead of the repository
    let rest = match rest.split_once('/') {
        Some((first, tail)) if reg.prefixes.contains(first) => {
            if reg.fail_prefixes.contains(first) {
                return empty(500);
            }
            tail
        }
        _ => rest,
    };
    if rest.is_empty() {
        return empty(200);
    }

    let segments: Vec<&str> = rest.split('/').collect();
    // <repo...>/manifests/<ref> | <repo...>/blobs/<digest> |
    // <repo...>/blobs/uploads/[id]
    if let Some(i) = segments.iter().position(|s| *s == "manifests") {
        let repo = segments[..i].join("/");
        let target = segments[i + 1..].join("/");
        return handle_manifest(&reg, &method, &repo, &target, &content_type, &body);
    }
    if let Some(i) = segments.iter().position(|s| *s == "blobs") {
        let repo = segments[..i].join("/");
        let after: Vec<&str> = segments[i + 1..].to_vec();
        if after.first() == Some(&"uploads") {
            let id = after.get(1).copied().unwrap_or("");
            return handle_upload(&reg, &method, &repo, id, &query, &body);
        }
        let digest = after.first().copied().unwrap_or("");
        return handle_blob(&reg, &method, &repo, digest);
    }
    empty(404)
}

fn handle_manifest(
    reg: &Registry,
    method: &axum::http::Method,
    repo: &str,
    target: &str,
    content_type: &str,
    body: &Bytes,
) -> Response {
    let key = (repo.to_string(), target.to_string());
    match *method {
        axum::http::Method::GET | axum::http::Method::HEAD => {
            let manifests = reg.manifests.lock().unwrap();
            let Some((mt, data)) = manifests.get(&key) else {
                return empty(404);
            };
            let digest = sha256_digest(data);
            let builder = resp(200)
                .header("content-type", mt.clone())
                .header("docker-content-digest", digest)
                .header("content-length", data.len())
                .header("ratelimit-limit", "100;w=21600")
                .header("ratelimit-remaining", "93;w=21600");
            if *method == axum::http::Method::HEAD {
                builder.body(Body::empty()).unwrap()
            } else {
                builder.body(Body::from(data.clone())).unwrap()
            }
        }
        axum::http::Method::PUT => {
            reg.put_manifest(repo, target, content_type, body.clone());
            empty(201)
        }
        axum::http::Method::DELETE => {
            // deleting by digest also unbinds any tag pointing at the
            // same content, like a real registry
            let mut manifests = reg.manifests.lock().unwrap();
            if manifests.remove(&key).is_none() {
                return empty(404);
            }
            manifests.retain(|(r, _), (_, data)| !(r == repo && sha256_digest(data) == target));
            empty(202)
        }
        _ => empty(405),
    }
}

fn handle_blob(reg: &Registry, method: &axum::http::Method, repo: &str, digest: &str) -> Response {
    let key = (repo.to_string(), digest.to_string());
    match *method {
        axum::http::Method::GET | axum::http::Method::HEAD => {
            let blobs = reg.blobs.lock().unwrap();
            let Some(data) = blobs.get(&key) else {
                return empty(404);
            };
            let builder = resp(200)
                .header("content-type", "application/octet-stream")
                .header("content-length", data.len())
                .header("accept-ranges", "bytes");
            if *method == axum::http::Method::HEAD {
                builder.body(Body::empty()).unwrap()
            } else {
                builder.body(Body::from(data.clone())).unwrap()
            }
        }
        axum::http::Method::DELETE => {
            let mut blobs = reg.blobs.lock().unwrap();
            if blobs.remove(&key).is_some() {
                empty(202)
            } else {
                empty(404)
            }
        }
        _ => empty(405),
    }
}

fn handle_upload(
    reg: &Registry,
    method: &axum::http::Method,
    repo: &str,
    id: &str,
    query: &str,
    body: &Bytes,
) -> Response {
    let params: HashMap<String, String> = url_params(query);
    match *method {
        axum::http::Method::POST => {
            // mount with a source repo succeeds when the blob exists there
            if let Some(mount) = params.get("mount") {
                let from = params.get("from").cloned().unwrap_or_default();
                if !from.is_empty() && reg.has_blob(&from, mount) {
                    let data = reg
                        .blobs
                        .lock()
                        .unwrap()
                        .get(&(from.clone(), mount.clone()))
                        .cloned()
                        .unwrap();
                    reg.blobs
                        .lock()
                        .unwrap()
                        .insert((repo.to_string(), mount.clone()), data);
                    return empty(201);
                }
            }
            let id = reg.upload_seq.fetch_add(1, Ordering::SeqCst);
            let session = format!("session-{}", id);
            reg.uploads.lock().unwrap().insert(session.clone(), Vec::new());
            resp(202)
                .header(
                    "location",
                    format!("/v2/{}/blobs/uploads/{}", repo, session),
                )
                .body(Body::empty())
                .unwrap()
        }
        axum::http::Method::PATCH => {
            let mut uploads = reg.uploads.lock().unwrap();
            let Some(buf) = uploads.get_mut(id) else {
                return empty(404);
            };
            buf.extend_from_slice(body);
            resp(202)
                .header("location", format!("/v2/{}/blobs/uploads/{}", repo, id))
                .body(Body::empty())
                .unwrap()
        }
        axum::http::Method::PUT => {
            let Some(digest) = params.get("digest") else {
                return empty(400);
            };
            let mut uploads = reg.uploads.lock().unwrap();
            let Some(mut buf) = uploads.remove(id) else {
                return empty(404);
            };
            buf.extend_from_slice(body);
            if sha256_digest(&buf) != *digest {
                return empty(400);
            }
            reg.blobs
                .lock()
                .unwrap()
                .insert((repo.to_string(), digest.clone()), buf.into());
            empty(201)
        }
        axum::http::Method::DELETE => {
            reg.uploads.lock().unwrap().remove(id);
            empty(204)
        }
        _ => empty(405),
    }
}

fn url_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), percent_decode(v)))
        .collect()
}

// enough of a percent-decoder for digests and repo paths in query values
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

async fn serve(reg: Arc<Registry>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = axum::Router::new().fallback(handle).with_state(reg);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn client_for(host: &str, addr: &str) -> Client {
    init_logs();
    let hosts = HostMap::new();
    hosts
        .set(HostConfig {
            name: host.to_string(),
            hostname: addr.to_string(),
            tls: TlsMode::Disabled,
            ..Default::default()
        })
        .unwrap();
    Client::with_hosts(hosts).unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    ocireg::compress::compress(Cursor::new(data.to_vec()), Compression::Gzip)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    out
}

/// Seed a single docker2 image (config + one gzip layer + manifest) and
/// return (manifest digest, config digest, layer digest).
fn seed_image(reg: &Registry, repo: &str, tag: &str) -> (String, String, String) {
    let config = br#"{"created": "2023-05-01T12:00:00Z", "architecture": "amd64", "os": "linux", "rootfs": {"type": "layers", "diff_ids": []}}"#;
    let layer = gzip(b"pretend this is a tar layer");
    let config_digest = reg.put_blob(repo, config.to_vec());
    let layer_digest = reg.put_blob(repo, layer.clone());
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MT_DOCKER2,
        "config": {"mediaType": MT_DOCKER2_CONFIG, "digest": config_digest, "size": config.len()},
        "layers": [
            {"mediaType": MT_DOCKER2_LAYER_GZIP, "digest": layer_digest, "size": layer.len()},
        ],
    });
    let manifest_digest = reg.put_manifest(
        repo,
        tag,
        MT_DOCKER2,
        serde_json::to_vec(&manifest).unwrap(),
    );
    (manifest_digest, config_digest, layer_digest)
}

// ---------------------------------------------------------------------------
// scenarios

#[tokio::test]
async fn test_manifest_get_with_bearer_auth() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    *reg.auth_realm.lock().unwrap() = Some(format!("http://{}/token", addr));

    let list = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MT_DOCKER2_LIST,
        "manifests": [
            {"mediaType": MT_DOCKER2, "digest": "sha256:9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0", "size": 3, "platform": {"architecture": "amd64", "os": "linux"}},
        ],
    });
    reg.put_manifest(
        "library/alpine",
        "3.10",
        MT_DOCKER2_LIST,
        serde_json::to_vec(&list).unwrap(),
    );

    let client = client_for("auth.test", &addr);
    let rfr: Reference = "auth.test/library/alpine:3.10".parse().unwrap();
    let m = client.manifest_get(&rfr).await.unwrap();
    assert_eq!(m.media_type(), MT_DOCKER2_LIST);
    assert!(m.is_list());
    assert!(!m.descriptor_list().unwrap().is_empty());
    // rate limit headers surfaced
    assert!(m.ratelimit().set);
    assert_eq!(m.ratelimit().remaining, Some(93));
    assert_eq!(reg.token_hits.load(Ordering::SeqCst), 1);

    // second request reuses the cached token
    client.manifest_get(&rfr).await.unwrap();
    assert_eq!(reg.token_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mirror_failover_order() {
    init_logs();
    let mut reg = Registry::default();
    reg.prefixes = ["ma", "mb", "up"].map(String::from).into();
    reg.fail_prefixes = ["ma", "up"].map(String::from).into();
    let reg = Arc::new(reg);
    let addr = serve(reg.clone()).await;

    let data = b"0123456789".to_vec();
    let digest = sha256_digest(&data);
    reg.blobs
        .lock()
        .unwrap()
        .insert(("foo".to_string(), digest.clone()), data.clone().into());

    let hosts = HostMap::new();
    for (name, prefix, priority) in [
        ("mirror-a.test", "ma", 10u32),
        ("mirror-b.test", "mb", 5),
        ("upstream.test", "up", 10),
    ] {
        hosts
            .set(HostConfig {
                name: name.to_string(),
                hostname: addr.clone(),
                tls: TlsMode::Disabled,
                path_prefix: prefix.to_string(),
                priority,
                mirrors: if name == "upstream.test" {
                    vec!["mirror-a.test".into(), "mirror-b.test".into()]
                } else {
                    Vec::new()
                },
                ..Default::default()
            })
            .unwrap();
    }
    let client = Client::with_hosts(hosts).unwrap();

    let rfr: Reference = "upstream.test/foo".parse().unwrap();
    let mut blob = client.blob_get(&rfr, &digest).await.unwrap();
    let got = blob.read_to_bytes().await.unwrap();
    assert_eq!(got, Bytes::from(data));

    // contact order: mirror-a (p10), upstream (p10, appended last), mirror-b
    let log: Vec<String> = reg
        .logged()
        .iter()
        .filter(|l| l.contains("/blobs/"))
        .cloned()
        .collect();
    assert_eq!(log.len(), 3);
    assert!(log[0].contains("/v2/ma/"), "{:?}", log);
    assert!(log[1].contains("/v2/up/"), "{:?}", log);
    assert!(log[2].contains("/v2/mb/"), "{:?}", log);
}

#[tokio::test]
async fn test_digest_mismatch_surfaces_after_bytes() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;

    let data = b"actual content".to_vec();
    let lying_digest = sha256_digest(b"something else");
    reg.blobs
        .lock()
        .unwrap()
        .insert(("foo".to_string(), lying_digest.clone()), data.clone().into());

    let client = client_for("d.test", &addr);
    let rfr: Reference = "d.test/foo".parse().unwrap();
    let mut blob = client.blob_get(&rfr, &lying_digest).await.unwrap();

    // all bytes arrive, then the terminal read reports the mismatch
    let mut got = Vec::new();
    let err = loop {
        match blob.chunk().await {
            Ok(Some(b)) => got.extend_from_slice(&b),
            Ok(None) => panic!("expected a digest mismatch"),
            Err(e) => break e,
        }
    };
    assert_eq!(got, data);
    assert!(matches!(err, Error::DigestMismatch { .. }), "{}", err);
}

#[tokio::test]
async fn test_monolithic_upload() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("up.test", &addr);
    let rfr: Reference = "up.test/foo/bar".parse().unwrap();

    let data = b"small blob body".to_vec();
    let digest = sha256_digest(&data);
    let (got_digest, size) = client
        .blob_put(
            &rfr,
            Some(&digest),
            data.len() as i64,
            ocireg::source_from_bytes(data.clone()),
        )
        .await
        .unwrap();
    assert_eq!(got_digest, digest);
    assert_eq!(size, data.len() as u64);
    assert!(reg.has_blob("foo/bar", &digest));

    // one POST (mount attempt -> session) and one PUT with the digest
    // query; no PATCH
    let log = reg.logged();
    let posts: Vec<_> = log.iter().filter(|l| l.starts_with("POST")).collect();
    let patches: Vec<_> = log.iter().filter(|l| l.starts_with("PATCH")).collect();
    let puts: Vec<_> = log.iter().filter(|l| l.starts_with("PUT")).collect();
    assert_eq!(posts.len(), 1, "{:?}", log);
    assert!(patches.is_empty(), "{:?}", log);
    assert_eq!(puts.len(), 1, "{:?}", log);
    assert!(puts[0].contains(&format!("digest={}", digest.replace(':', "%3A"))), "{:?}", puts);
}

#[tokio::test]
async fn test_chunked_upload() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;

    let hosts = HostMap::new();
    hosts
        .set(HostConfig {
            name: "up.test".into(),
            hostname: addr.clone(),
            tls: TlsMode::Disabled,
            blob_chunk: 512,
            blob_max: -1, // never monolithic
            ..Default::default()
        })
        .unwrap();
    let client = Client::with_hosts(hosts).unwrap();
    let rfr: Reference = "up.test/foo/bar".parse().unwrap();

    let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let digest = sha256_digest(&data);
    let (got_digest, size) = client
        .blob_put(
            &rfr,
            Some(&digest),
            data.len() as i64,
            ocireg::source_from_bytes(data.clone()),
        )
        .await
        .unwrap();
    assert_eq!(got_digest, digest);
    assert_eq!(size, 1024);
    assert!(reg.has_blob("foo/bar", &digest));

    let log = reg.logged();
    let patches: Vec<_> = log.iter().filter(|l| l.starts_with("PATCH")).collect();
    let puts: Vec<_> = log.iter().filter(|l| l.starts_with("PUT")).collect();
    assert_eq!(patches.len(), 2, "{:?}", log);
    assert_eq!(puts.len(), 1, "{:?}", log);
    assert!(puts[0].contains("digest="), "{:?}", puts);
}

#[tokio::test]
async fn test_blob_copy_skips_and_mounts() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("c.test", &addr);

    let digest = reg.put_blob("src/app", b"shared layer".to_vec());
    let src: Reference = "c.test/src/app".parse().unwrap();
    let tgt: Reference = "c.test/dst/app".parse().unwrap();

    // same registry: a mount avoids the byte transfer
    client.blob_copy(&src, &tgt, &digest).await.unwrap();
    assert!(reg.has_blob("dst/app", &digest));
    let log = reg.logged();
    assert!(
        log.iter().any(|l| l.starts_with("POST") && l.contains("mount=")),
        "{:?}",
        log
    );
    assert!(!log.iter().any(|l| l.starts_with("GET")), "{:?}", log);

    // target already has the digest: nothing but the HEAD happens
    reg.log.lock().unwrap().clear();
    client.blob_copy(&src, &tgt, &digest).await.unwrap();
    let log = reg.logged();
    assert_eq!(log.len(), 1, "{:?}", log);
    assert!(log[0].starts_with("HEAD"), "{:?}", log);

    // same repository: complete no-op
    reg.log.lock().unwrap().clear();
    client.blob_copy(&src, &src, &digest).await.unwrap();
    assert!(reg.logged().is_empty());
}

#[tokio::test]
async fn test_image_copy() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("ic.test", &addr);

    let (manifest_digest, config_digest, layer_digest) = seed_image(&reg, "src/app", "v1");
    let src: Reference = "ic.test/src/app:v1".parse().unwrap();
    let tgt: Reference = "ic.test/dst/app:v1".parse().unwrap();
    client.image_copy(&src, &tgt).await.unwrap();

    assert!(reg.has_blob("dst/app", &config_digest));
    assert!(reg.has_blob("dst/app", &layer_digest));
    let manifests = reg.manifests.lock().unwrap();
    let (_, data) = manifests
        .get(&("dst/app".to_string(), "v1".to_string()))
        .expect("manifest bound to tag");
    // byte-exact copy preserves the digest
    assert_eq!(sha256_digest(data), manifest_digest);
}

#[tokio::test]
async fn test_tag_delete_synthesizes_and_deletes() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("td.test", &addr);

    seed_image(&reg, "repo", "test");
    let rfr: Reference = "td.test/repo:test".parse().unwrap();
    client.tag_delete(&rfr).await.unwrap();

    // the tag no longer resolves
    assert!(client.manifest_head(&rfr).await.is_err());

    let log = reg.logged();
    let put = log
        .iter()
        .find(|l| l.starts_with("PUT") && l.contains("/manifests/test"))
        .expect("synthetic manifest put");
    let delete = log
        .iter()
        .find(|l| l.starts_with("DELETE") && l.contains("/manifests/sha256"))
        .expect("delete by digest");
    assert!(log.iter().position(|l| l == put) < log.iter().position(|l| l == delete));

    // the synthetic config carried the delete-tag label
    let blobs = reg.blobs.lock().unwrap();
    let config = blobs
        .iter()
        .find_map(|((repo, _), data)| {
            (repo == "repo" && data.windows(12).any(|w| w == b"\"delete-tag\"")).then_some(data)
        })
        .expect("synthesized config uploaded");
    let parsed: serde_json::Value = serde_json::from_slice(config).unwrap();
    assert_eq!(parsed["config"]["Labels"]["delete-tag"], "test");
}

#[tokio::test]
async fn test_tag_list() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("tl.test", &addr);
    // the mock has no tags/list route; only check the request shape goes
    // out and a 404 maps to not-found
    let rfr: Reference = "tl.test/foo".parse().unwrap();
    let err = client.tag_list(&rfr, Some(10), Some("v1")).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{}", err);
    let log = reg.logged();
    assert!(
        log.iter().any(|l| l.contains("/tags/list?n=10&last=v1")),
        "{:?}",
        log
    );
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("x.test", &addr);

    let (manifest_digest, config_digest, layer_digest) = seed_image(&reg, "src/app", "v1");
    let src: Reference = "x.test/src/app:v1".parse().unwrap();

    let mut tarball = Vec::new();
    client.image_export(&src, &mut tarball).await.unwrap();

    // the tar carries both layouts
    let mut names = Vec::new();
    let mut archive = tar::Archive::new(Cursor::new(tarball.clone()));
    for entry in archive.entries().unwrap() {
        names.push(entry.unwrap().path().unwrap().to_string_lossy().to_string());
    }
    assert!(names.contains(&"oci-layout".to_string()), "{:?}", names);
    assert!(names.contains(&"index.json".to_string()), "{:?}", names);
    assert!(names.contains(&"manifest.json".to_string()), "{:?}", names);
    for digest in [&manifest_digest, &config_digest, &layer_digest] {
        let path = format!("blobs/{}", digest.replacen(':', "/", 1));
        assert!(names.contains(&path), "{} missing in {:?}", path, names);
    }

    // imports into another repository with the same digests
    let tgt: Reference = "x.test/dst/app:v1".parse().unwrap();
    client
        .image_import(&tgt, Cursor::new(tarball))
        .await
        .unwrap();
    assert!(reg.has_blob("dst/app", &config_digest));
    assert!(reg.has_blob("dst/app", &layer_digest));
    let manifests = reg.manifests.lock().unwrap();
    let (_, data) = manifests
        .get(&("dst/app".to_string(), "v1".to_string()))
        .expect("imported manifest bound to tag");
    assert_eq!(sha256_digest(data), manifest_digest);
}

#[tokio::test]
async fn test_docker_save_import_fallback() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("dk.test", &addr);

    // a docker-save style tar: manifest.json + config + uncompressed layer
    let config = br#"{"created": "2023-05-01T12:00:00Z", "architecture": "amd64", "os": "linux"}"#;
    let layer = b"uncompressed layer tar bytes".repeat(10);
    let manifest_json = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": ["app:1"],
        "Layers": ["aaaa/layer.tar"],
    }]);

    let mut tarball = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tarball);
        let mut add = |path: &str, data: &[u8]| {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, data).unwrap();
        };
        add(
            "manifest.json",
            &serde_json::to_vec(&manifest_json).unwrap(),
        );
        add("config.json", config);
        add("aaaa/layer.tar", &layer);
        builder.finish().unwrap();
    }

    let rfr: Reference = "dk.test/imported/app:one".parse().unwrap();
    client
        .image_import(&rfr, Cursor::new(tarball))
        .await
        .unwrap();

    let manifests = reg.manifests.lock().unwrap();
    let (_, data) = manifests
        .get(&("imported/app".to_string(), "one".to_string()))
        .expect("reconstructed manifest");
    let parsed: serde_json::Value = serde_json::from_slice(data).unwrap();
    assert_eq!(parsed["mediaType"], MT_DOCKER2);
    assert_eq!(parsed["layers"][0]["mediaType"], MT_DOCKER2_LAYER_GZIP);
    // the uploaded layer was gzip-normalized
    let layer_digest = parsed["layers"][0]["digest"].as_str().unwrap();
    assert_eq!(layer_digest, sha256_digest(gzip(&layer)));
    assert!(reg.has_blob("imported/app", layer_digest));
}

#[tokio::test]
async fn test_blob_seek() {
    let reg = Registry::new();
    let addr = serve(reg.clone()).await;
    let client = client_for("sk.test", &addr);

    let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
    let digest = reg.put_blob("foo", data.clone());
    let rfr: Reference = "sk.test/foo".parse().unwrap();

    let mut blob = client.blob_get(&rfr, &digest).await.unwrap();
    // the accept-ranges probe happens lazily on the first non-origin seek
    blob.seek(100).await.unwrap();
    let got = blob.read_to_bytes().await.unwrap();
    assert_eq!(&got[..], &data[100..]);
    let log = reg.logged();
    assert!(
        log.iter().any(|l| l.starts_with("HEAD") && l.contains("/blobs/")),
        "{:?}",
        log
    );

    // back to the origin the digest verification applies again
    blob.seek(0).await.unwrap();
    let got = blob.read_to_bytes().await.unwrap();
    assert_eq!(&got[..], &data[..]);
}

// ---------------------------------------------------------------------------
// range resumption against a deliberately flaky raw server

#[tokio::test]
async fn test_resumable_blob_read() {
    let full: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let digest = sha256_digest(&full);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = full.clone();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(x) => x,
                Err(_) => return,
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];
                // read until end of request headers
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf).to_string();
                let range_offset = head.lines().find_map(|l| {
                    l.to_ascii_lowercase()
                        .strip_prefix("range: bytes=")
                        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
                });
                match range_offset {
                    None => {
                        // declare the full length but cut the body short
                        let resp = format!(
                            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: application/octet-stream\r\nconnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = sock.write_all(resp.as_bytes()).await;
                        let _ = sock.write_all(&body[..512]).await;
                        let _ = sock.shutdown().await;
                    }
                    Some(offset) => {
                        let rest = &body[offset..];
                        let resp = format!(
                            "HTTP/1.1 206 Partial Content\r\ncontent-length: {}\r\ncontent-range: bytes {}-{}/{}\r\nconnection: close\r\n\r\n",
                            rest.len(),
                            offset,
                            body.len() - 1,
                            body.len()
                        );
                        let _ = sock.write_all(resp.as_bytes()).await;
                        let _ = sock.write_all(rest).await;
                        let _ = sock.shutdown().await;
                    }
                }
            });
        }
    });

    let client = client_for("flaky.test", &format!("127.0.0.1:{}", addr.port()));
    let rfr: Reference = "flaky.test/foo".parse().unwrap();
    let mut blob = client.blob_get(&rfr, &digest).await.unwrap();
    let got = blob.read_to_bytes().await.unwrap();
    // resumed transparently and verified against the pinned digest
    assert_eq!(got.len(), 1024);
    assert_eq!(got, Bytes::from(full));
}

// live network check, run explicitly with --ignored
#[tokio::test]
#[ignore]
async fn test_public_pull_docker_hub() {
    let client = Client::new().unwrap();
    let rfr: Reference = "docker.io/library/alpine:3.10".parse().unwrap();
    let m = client.manifest_get(&rfr).await.unwrap();
    assert_eq!(
        m.media_type(),
        "application/vnd.docker.distribution.manifest.list.v2+json"
    );
    assert!(!m.descriptor_list().unwrap().is_empty());
}
