use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};

use bytes::Bytes;
use futures::future::BoxFuture;
use log::{debug, info};
use oci_spec::image::Descriptor;
use serde::Deserialize;

use crate::client::Client;
use crate::compress::{self, Compression};
use crate::digest::{Digester, layout_path, sha256_digest};
use crate::errors::{Error, Result};
use crate::manifest::{
    MT_DOCKER2, MT_DOCKER2_CONFIG, MT_DOCKER2_LAYER_GZIP, MT_OCI1_INDEX, Manifest,
    is_manifest_media_type,
};
use crate::reference::Reference;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_INDEX_FILE: &str = "index.json";
const DOCKER_MANIFEST_FILE: &str = "manifest.json";
const OCI_LAYOUT_VERSION: &str = "1.0.0";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
const ANNOTATION_CONTAINERD_NAME: &str = "io.containerd.image.name";

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

// ---------------------------------------------------------------------------
// export

struct TarWriter<W: Write> {
    builder: tar::Builder<W>,
    seen: HashSet<String>,
    dirs: HashSet<String>,
}

impl<W: Write> TarWriter<W> {
    fn new(w: W) -> TarWriter<W> {
        TarWriter {
            builder: tar::Builder::new(w),
            seen: HashSet::new(),
            dirs: HashSet::new(),
        }
    }

    // each content path is written exactly once
    fn mark(&mut self, path: &str) -> bool {
        self.seen.insert(path.to_string())
    }

    // parent directory entries are emitted lazily before the first file
    // that needs them
    fn ensure_dirs(&mut self, path: &str, mtime: u64) -> Result<()> {
        let mut at = 0;
        while let Some(i) = path[at..].find('/') {
            let dir = &path[..at + i + 1];
            at += i + 1;
            if self.dirs.insert(dir.to_string()) {
                let mut header = tar::Header::new_ustar();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(DIR_MODE);
                header.set_mtime(mtime);
                header.set_size(0);
                self.builder.append_data(&mut header, dir, std::io::empty())?;
            }
        }
        Ok(())
    }

    fn write_file(&mut self, path: &str, data: &[u8], mtime: u64) -> Result<()> {
        self.ensure_dirs(path, mtime)?;
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(FILE_MODE);
        header.set_mtime(mtime);
        header.set_size(data.len() as u64);
        self.builder.append_data(&mut header, path, data)?;
        Ok(())
    }

    fn write_stream(
        &mut self,
        path: &str,
        data: &mut std::fs::File,
        size: u64,
        mtime: u64,
    ) -> Result<()> {
        self.ensure_dirs(path, mtime)?;
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(FILE_MODE);
        header.set_mtime(mtime);
        header.set_size(size);
        self.builder.append_data(&mut header, path, data)?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.builder.finish()?;
        Ok(())
    }
}

// docker-save manifest.json entry; LayerSources preserves the original
// compressed descriptors so a re-export reconstructs them exactly
#[derive(Debug, Clone, Default, serde::Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerSaveEntry {
    config: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    layers: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    layer_sources: HashMap<String, Descriptor>,
}

fn docker_repo_tag(rfr: &Reference) -> String {
    let tag = if rfr.tag().is_empty() {
        crate::reference::DEFAULT_TAG
    } else {
        rfr.tag()
    };
    if rfr.registry() == crate::reference::DOCKER_REGISTRY {
        let repo = rfr
            .repository()
            .strip_prefix("library/")
            .unwrap_or(rfr.repository());
        format!("{}:{}", repo, tag)
    } else {
        format!("{}/{}:{}", rfr.registry(), rfr.repository(), tag)
    }
}

fn created_mtime(config: &[u8]) -> u64 {
    #[derive(Deserialize)]
    struct CreatedOnly {
        #[serde(default)]
        created: String,
    }
    serde_json::from_slice::<CreatedOnly>(config)
        .ok()
        .and_then(|c| chrono::DateTime::parse_from_rfc3339(&c.created).ok())
        .map(|t| t.timestamp().max(0) as u64)
        .unwrap_or(0)
}

impl Client {
    /// Export an image into a tar that is both an OCI image layout and a
    /// `docker load` archive. Every referenced manifest, config, and layer
    /// lands content-addressed under `blobs/`; `manifest.json` is written
    /// for single-image roots.
    pub async fn image_export<W: Write + Send>(&self, rfr: &Reference, w: W) -> Result<()> {
        let ctx = format!("image export {}", rfr.common_name());
        let manifest = self.manifest_get(rfr).await?;
        let raw = manifest.marshal()?;
        let mut tw = TarWriter::new(w);

        tw.write_file(OCI_LAYOUT_FILE, OCI_LAYOUT_CONTENT.as_bytes(), 0)?;

        let tag = if rfr.tag().is_empty() {
            crate::reference::DEFAULT_TAG.to_string()
        } else {
            rfr.tag().to_string()
        };
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MT_OCI1_INDEX,
            "manifests": [{
                "mediaType": manifest.media_type(),
                "digest": manifest.digest(),
                "size": raw.len(),
                "annotations": {
                    ANNOTATION_REF_NAME: tag,
                    ANNOTATION_CONTAINERD_NAME: rfr.common_name(),
                },
            }],
        });
        tw.write_file(OCI_INDEX_FILE, &serde_json::to_vec(&index)?, 0)?;

        // single-image roots also get the docker-save shape
        let mut config_bytes = None;
        if !manifest.is_list() {
            if let Some(config_desc) = manifest.config_descriptor()? {
                let mut blob = self
                    .blob_get(rfr, &config_desc.digest().to_string())
                    .await?;
                config_bytes = Some(blob.read_to_bytes().await?);
            }
            let mut entry = DockerSaveEntry {
                config: String::new(),
                repo_tags: vec![docker_repo_tag(rfr)],
                layers: Vec::new(),
                layer_sources: HashMap::new(),
            };
            if let Some(config_desc) = manifest.config_descriptor()? {
                entry.config = layout_path(&config_desc.digest().to_string());
            }
            for layer in manifest.layers()? {
                let digest = layer.digest().to_string();
                entry.layers.push(layout_path(&digest));
                entry.layer_sources.insert(digest, layer.clone());
            }
            // zeroed timestamp on the top-level docker manifest
            tw.write_file(
                DOCKER_MANIFEST_FILE,
                &serde_json::to_vec(&vec![entry])?,
                0,
            )?;
        }

        self.export_manifest(&mut tw, rfr, &manifest, config_bytes)
            .await?;
        let entries = tw.seen.len();
        tw.finish()?;
        info!("{}: wrote {} content entries", ctx, entries);
        Ok(())
    }

    // walk a manifest and write it plus everything it references; nested
    // lists recurse
    fn export_manifest<'a, W: Write + Send>(
        &'a self,
        tw: &'a mut TarWriter<W>,
        rfr: &'a Reference,
        manifest: &'a Manifest,
        prefetched_config: Option<Bytes>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = layout_path(manifest.digest());
            if !tw.mark(&path) {
                return Ok(());
            }
            if manifest.is_list() {
                tw.write_file(&path, &manifest.marshal()?, 0)?;
                for child in manifest.descriptor_list()? {
                    let digest = child.digest().to_string();
                    let child_rfr = rfr.with_digest(&digest);
                    if is_manifest_media_type(&child.media_type().to_string()) {
                        let child_manifest = self.manifest_get(&child_rfr).await?;
                        self.export_manifest(tw, rfr, &child_manifest, None).await?;
                    } else {
                        self.export_blob(tw, rfr, &digest, 0).await?;
                    }
                }
                return Ok(());
            }

            let config_desc = manifest.config_descriptor()?;
            let config_bytes = match (prefetched_config, &config_desc) {
                (Some(b), _) => Some(b),
                (None, Some(d)) => {
                    let mut blob = self.blob_get(rfr, &d.digest().to_string()).await?;
                    Some(blob.read_to_bytes().await?)
                }
                (None, None) => None,
            };
            let mtime = config_bytes.as_ref().map(|b| created_mtime(b)).unwrap_or(0);

            tw.write_file(&path, &manifest.marshal()?, mtime)?;
            if let (Some(desc), Some(bytes)) = (&config_desc, &config_bytes) {
                let config_path = layout_path(&desc.digest().to_string());
                if tw.mark(&config_path) {
                    tw.write_file(&config_path, bytes, mtime)?;
                }
            }
            for layer in manifest.layers()? {
                if layer.urls().as_ref().is_some_and(|u| !u.is_empty()) {
                    debug!("skipping foreign layer {} on export", layer.digest());
                    continue;
                }
                self.export_blob(tw, rfr, &layer.digest().to_string(), mtime)
                    .await?;
            }
            Ok(())
        })
    }

    // spool a blob through a tempfile so the tar header can carry its size
    async fn export_blob<W: Write + Send>(
        &self,
        tw: &mut TarWriter<W>,
        rfr: &Reference,
        digest: &str,
        mtime: u64,
    ) -> Result<()> {
        let path = layout_path(digest);
        if !tw.mark(&path) {
            return Ok(());
        }
        let mut blob = self.blob_get(rfr, digest).await?;
        let tmp = tempfile::tempfile()?;
        let mut spool = tokio::fs::File::from_std(tmp);
        let size = blob.write_to(&mut spool).await?;
        let mut file = spool.into_std().await;
        file.seek(SeekFrom::Start(0))?;
        tw.write_stream(&path, &mut file, size, mtime)
    }
}

// ---------------------------------------------------------------------------
// import

#[derive(Debug, Clone)]
enum Handler {
    OciLayout,
    IndexJson,
    DockerManifest,
    // a manifest blob; the root one is re-tagged at finish time
    Manifest { media_type: String, root: bool },
    // a raw blob named by its content address
    Blob { digest: String },
    // docker-save fallback pieces
    DockerConfig,
    DockerLayer { index: usize },
}

struct HandlerEntry {
    handler: Handler,
    optional: bool,
    processed: bool,
}

enum Payload {
    Bytes(Bytes),
    File(tempfile::NamedTempFile),
}

struct Finish {
    rfr: Reference,
    media_type: String,
    raw: Bytes,
}

struct TarImport {
    client: Client,
    rfr: Reference,
    handlers: HashMap<String, HandlerEntry>,
    finish: Vec<Finish>,
    docker_manifest: Option<Bytes>,
    docker_config: Option<Descriptor>,
    docker_layers: Vec<Option<Descriptor>>,
    docker_sources: HashMap<String, Descriptor>,
}

impl TarImport {
    fn new(client: &Client, rfr: &Reference) -> TarImport {
        TarImport {
            client: client.clone(),
            rfr: rfr.clone(),
            handlers: HashMap::new(),
            finish: Vec::new(),
            docker_manifest: None,
            docker_config: None,
            docker_layers: Vec::new(),
            docker_sources: HashMap::new(),
        }
    }

    fn add_handler(&mut self, name: &str, handler: Handler, optional: bool) {
        self.handlers.entry(name.to_string()).or_insert(HandlerEntry {
            handler,
            optional,
            processed: false,
        });
    }

    fn pending(&self) -> Vec<&str> {
        self.handlers
            .iter()
            .filter(|(_, e)| !e.processed && !e.optional)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    // repeated passes over the tar: each pass extracts the entries current
    // handlers ask for, then processing may register new handlers for the
    // next pass; a pass without progress with work remaining is a failure
    async fn run<R: Read + Seek>(&mut self, reader: &mut R) -> Result<()> {
        loop {
            let extracted = self.extract_pass(reader)?;
            let mut progress = false;
            for (name, payload) in extracted {
                progress |= self.process(&name, payload).await?;
            }
            let pending = self.pending();
            if pending.is_empty() {
                return Ok(());
            }
            if !progress {
                let mut names: Vec<&str> = pending;
                names.sort_unstable();
                return Err(Error::NotFound(format!(
                    "tar import {}: unmatched entries: {}",
                    self.rfr.common_name(),
                    names.join(", ")
                )));
            }
        }
    }

    fn extract_pass<R: Read + Seek>(&self, reader: &mut R) -> Result<Vec<(String, Payload)>> {
        reader.seek(SeekFrom::Start(0))?;
        let mut archive = tar::Archive::new(reader);
        let mut extracted = Vec::new();
        let mut grabbed: HashSet<String> = HashSet::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry
                .path()?
                .to_string_lossy()
                .trim_start_matches("./")
                .to_string();
            let Some(h) = self.handlers.get(&name) else {
                continue;
            };
            if h.processed || !grabbed.insert(name.clone()) {
                continue;
            }
            let payload = match h.handler {
                // large content spools to disk, metadata stays in memory
                Handler::Blob { .. } | Handler::DockerLayer { .. } => {
                    let mut tmp = tempfile::NamedTempFile::new()?;
                    std::io::copy(&mut entry, tmp.as_file_mut())?;
                    Payload::File(tmp)
                }
                _ => {
                    let mut buf = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut buf)?;
                    Payload::Bytes(buf.into())
                }
            };
            extracted.push((name, payload));
        }
        Ok(extracted)
    }

    async fn process(&mut self, name: &str, payload: Payload) -> Result<bool> {
        let entry = self.handlers.get_mut(name).expect("extracted without handler");
        if entry.processed {
            return Ok(false);
        }
        entry.processed = true;
        let handler = entry.handler.clone();
        debug!("tar import: processing {} as {:?}", name, handler);
        match handler {
            Handler::OciLayout => self.process_oci_layout(payload),
            Handler::IndexJson => self.process_index(payload),
            Handler::DockerManifest => {
                if let Payload::Bytes(b) = payload {
                    self.docker_manifest = Some(b);
                }
                Ok(true)
            }
            Handler::Manifest { media_type, root } => {
                self.process_manifest(name, &media_type, root, payload).await
            }
            Handler::Blob { digest } => self.process_blob(&digest, payload).await,
            Handler::DockerConfig => self.process_docker_config(payload).await,
            Handler::DockerLayer { index } => self.process_docker_layer(index, payload).await,
        }
    }

    fn process_oci_layout(&mut self, payload: Payload) -> Result<bool> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Layout {
            image_layout_version: String,
        }
        let Payload::Bytes(b) = payload else {
            return Ok(false);
        };
        let layout: Layout = serde_json::from_slice(&b)?;
        if layout.image_layout_version != OCI_LAYOUT_VERSION {
            return Err(Error::UnsupportedConfigVersion(format!(
                "oci-layout version {:?}",
                layout.image_layout_version
            )));
        }
        Ok(true)
    }

    // pick the root manifest out of index.json: the single entry, or the
    // one whose ref.name annotation matches the import tag
    fn process_index(&mut self, payload: Payload) -> Result<bool> {
        let Payload::Bytes(b) = payload else {
            return Ok(false);
        };
        let index: oci_spec::image::ImageIndex = serde_json::from_slice(&b)?;
        let manifests = index.manifests();
        let chosen = if manifests.len() == 1 {
            manifests.first()
        } else {
            manifests.iter().find(|d| {
                d.annotations().as_ref().is_some_and(|a| {
                    a.get(ANNOTATION_REF_NAME).is_some_and(|name| {
                        name == self.rfr.tag() || *name == self.rfr.common_name()
                    })
                })
            })
        };
        let Some(chosen) = chosen else {
            return Err(Error::NotFound(format!(
                "tar import {}: no matching manifest in index.json",
                self.rfr.common_name()
            )));
        };
        let path = layout_path(&chosen.digest().to_string());
        self.add_handler(
            &path,
            Handler::Manifest {
                media_type: chosen.media_type().to_string(),
                root: true,
            },
            false,
        );
        Ok(true)
    }

    async fn process_manifest(
        &mut self,
        name: &str,
        media_type: &str,
        root: bool,
        payload: Payload,
    ) -> Result<bool> {
        let Payload::Bytes(raw) = payload else {
            return Ok(false);
        };
        let computed = sha256_digest(&raw);
        let expected = name
            .strip_prefix("blobs/")
            .map(|p| p.replacen('/', ":", 1))
            .unwrap_or_default();
        if !expected.is_empty() && expected != computed {
            return Err(Error::DigestMismatch {
                expected,
                computed,
            });
        }
        let manifest = Manifest::from_bytes(
            &self.rfr.with_digest(&computed),
            media_type,
            raw.clone(),
        )?;
        if manifest.is_list() {
            for child in manifest.descriptor_list()? {
                let path = layout_path(&child.digest().to_string());
                let mt = child.media_type().to_string();
                if is_manifest_media_type(&mt) {
                    self.add_handler(&path, Handler::Manifest { media_type: mt, root: false }, false);
                } else {
                    self.add_handler(
                        &path,
                        Handler::Blob { digest: child.digest().to_string() },
                        false,
                    );
                }
            }
        } else {
            if let Some(config) = manifest.config_descriptor()? {
                self.add_handler(
                    &layout_path(&config.digest().to_string()),
                    Handler::Blob { digest: config.digest().to_string() },
                    false,
                );
            }
            for layer in manifest.layers()? {
                if layer.urls().as_ref().is_some_and(|u| !u.is_empty()) {
                    continue;
                }
                self.add_handler(
                    &layout_path(&layer.digest().to_string()),
                    Handler::Blob { digest: layer.digest().to_string() },
                    false,
                );
            }
        }
        // containers are enqueued before the children they reference, and
        // the queue runs in reverse, so children land first
        let rfr = if root {
            self.rfr.clone()
        } else {
            self.rfr.with_digest(&computed)
        };
        self.finish.push(Finish {
            rfr,
            media_type: media_type.to_string(),
            raw,
        });
        Ok(true)
    }

    async fn process_blob(&mut self, digest: &str, payload: Payload) -> Result<bool> {
        let Payload::File(tmp) = payload else {
            return Ok(false);
        };
        let size = tmp.as_file().metadata()?.len() as i64;
        self.client
            .blob_put(
                &self.rfr,
                Some(digest),
                size,
                crate::blob::source_from_path(tmp.path()),
            )
            .await?;
        Ok(true)
    }

    async fn process_docker_config(&mut self, payload: Payload) -> Result<bool> {
        let Payload::Bytes(b) = payload else {
            return Ok(false);
        };
        let digest = sha256_digest(&b);
        let size = b.len() as u64;
        self.client
            .blob_put(
                &self.rfr,
                Some(&digest),
                size as i64,
                crate::blob::source_from_bytes(b),
            )
            .await?;
        self.docker_config = Some(Descriptor::new(
            MT_DOCKER2_CONFIG.into(),
            size,
            digest
                .parse::<oci_spec::image::Digest>()
                .map_err(|_| Error::ParsingFailed(digest.clone()))?,
        ));
        Ok(true)
    }

    // docker save writes uncompressed tar layers; the registry push wants
    // gzip, so layers are normalized through the codec before upload
    async fn process_docker_layer(&mut self, index: usize, payload: Payload) -> Result<bool> {
        let Payload::File(tmp) = payload else {
            return Ok(false);
        };
        let file = tmp.reopen()?;
        let (gz, digest, size) = spool_gzip(file)?;
        self.client
            .blob_put(
                &self.rfr,
                Some(&digest),
                size as i64,
                crate::blob::source_from_path(gz.path()),
            )
            .await?;
        // keep the original descriptor when the bytes came out identical
        let descriptor = match self.docker_sources.get(&digest) {
            Some(d) => {
                debug!("layer {} matches its LayerSources descriptor", digest);
                d.clone()
            }
            None => Descriptor::new(
                MT_DOCKER2_LAYER_GZIP.into(),
                size,
                digest
                    .parse::<oci_spec::image::Digest>()
                    .map_err(|_| Error::ParsingFailed(digest.clone()))?,
            ),
        };
        if index >= self.docker_layers.len() {
            self.docker_layers.resize(index + 1, None);
        }
        self.docker_layers[index] = Some(descriptor);
        Ok(true)
    }

    async fn run_finish(&mut self) -> Result<()> {
        for f in std::mem::take(&mut self.finish).into_iter().rev() {
            let manifest = Manifest::from_bytes(&f.rfr, &f.media_type, f.raw.clone())?;
            self.client.manifest_put(&f.rfr, &manifest).await?;
        }
        Ok(())
    }
}

// recompress (or pass through) a layer as gzip, hashing and sizing the
// result on the way into a fresh tempfile
fn spool_gzip(file: std::fs::File) -> Result<(tempfile::NamedTempFile, String, u64)> {
    let mut reader = compress::compress(file, Compression::Gzip)?;
    let mut tmp = tempfile::NamedTempFile::new()?;
    let mut digester = Digester::new();
    let mut size: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        tmp.as_file_mut().write_all(&buf[..n])?;
        size += n as u64;
    }
    tmp.as_file_mut().flush()?;
    Ok((tmp, digester.finalize(), size))
}

impl Client {
    /// Import an image tar. The OCI layout form is probed first; when the
    /// tar only carries a docker-save `manifest.json`, a schema 2 manifest
    /// is reconstructed from it.
    pub async fn image_import<R: Read + Seek>(&self, rfr: &Reference, mut reader: R) -> Result<()> {
        let ctx = format!("image import {}", rfr.common_name());
        let mut oci = TarImport::new(self, rfr);
        oci.add_handler(OCI_LAYOUT_FILE, Handler::OciLayout, false);
        oci.add_handler(OCI_INDEX_FILE, Handler::IndexJson, false);
        // captured for the fallback; an OCI tar need not carry it
        oci.add_handler(DOCKER_MANIFEST_FILE, Handler::DockerManifest, true);
        match oci.run(&mut reader).await {
            Ok(()) => {
                oci.run_finish().await?;
                info!("{}: imported via oci layout", ctx);
                return Ok(());
            }
            Err(Error::NotFound(e)) if oci.docker_manifest.is_some() => {
                debug!("{}: not an oci layout ({}), trying docker save", ctx, e);
            }
            Err(e) => return Err(e),
        }
        let docker_manifest = oci.docker_manifest.take().unwrap();
        self.import_docker(rfr, &mut reader, &docker_manifest).await
    }

    async fn import_docker<R: Read + Seek>(
        &self,
        rfr: &Reference,
        reader: &mut R,
        manifest_json: &Bytes,
    ) -> Result<()> {
        let entries: Vec<DockerSaveEntry> = serde_json::from_slice(manifest_json)?;
        let Some(entry) = entries.first() else {
            return Err(Error::ParsingFailed(format!(
                "image import {}: empty manifest.json",
                rfr.common_name()
            )));
        };
        let mut import = TarImport::new(self, rfr);
        import.docker_sources = entry.layer_sources.clone();
        import.add_handler(&entry.config, Handler::DockerConfig, false);
        for (i, layer) in entry.layers.iter().enumerate() {
            import.add_handler(layer, Handler::DockerLayer { index: i }, false);
        }
        import.run(reader).await?;

        let config = import.docker_config.take().ok_or_else(|| {
            Error::NotFound(format!("image import {}: config blob", rfr.common_name()))
        })?;
        let mut layers = Vec::with_capacity(import.docker_layers.len());
        for (i, l) in import.docker_layers.drain(..).enumerate() {
            layers.push(l.ok_or_else(|| {
                Error::NotFound(format!(
                    "image import {}: layer {} missing",
                    rfr.common_name(),
                    i
                ))
            })?);
        }
        let manifest_doc = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MT_DOCKER2,
            "config": config,
            "layers": layers,
        });
        let manifest = Manifest::from_bytes(
            rfr,
            MT_DOCKER2,
            Bytes::from(serde_json::to_vec(&manifest_doc)?),
        )?;
        self.manifest_put(rfr, &manifest).await
    }
}
