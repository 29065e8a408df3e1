use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use log::{debug, info};
use oci_spec::image::Platform;

use crate::blob::{BlobSource, BlobStream};
use crate::client::Client;
use crate::digest::sha256_digest;
use crate::errors::{Error, Result};
use crate::manifest::{
    MT_DOCKER2, MT_DOCKER2_CONFIG, MT_OCI1, MT_OCI1_CONFIG, MT_OCI1_INDEX, Manifest,
    is_manifest_media_type,
};
use crate::reference::Reference;

impl Client {
    /// Copy an image between registries: recurses through manifest lists,
    /// copies config and layers before the manifest, and skips content the
    /// target already has.
    pub async fn image_copy(&self, src: &Reference, tgt: &Reference) -> Result<()> {
        self.image_copy_inner(src, tgt).await
    }

    // manifest lists can nest, so the recursion boxes itself
    fn image_copy_inner<'a>(
        &'a self,
        src: &'a Reference,
        tgt: &'a Reference,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // short-circuit when the target already resolves to the same
            // content
            let src_digest = if !src.digest().is_empty() {
                src.digest().to_string()
            } else {
                match self.manifest_head(src).await {
                    Ok(m) => m.digest().to_string(),
                    Err(_) => String::new(),
                }
            };
            if !src_digest.is_empty()
                && let Ok(t) = self.manifest_head(tgt).await
                && t.digest() == src_digest
            {
                info!(
                    "image copy {} -> {}: target already current",
                    src.common_name(),
                    tgt.common_name()
                );
                return Ok(());
            }

            let m = self.manifest_get(src).await?;
            if m.is_list() {
                for child in m.descriptor_list()? {
                    let digest = child.digest().to_string();
                    let child_src = src.with_digest(&digest);
                    let child_tgt = tgt.with_digest(&digest);
                    if is_manifest_media_type(&child.media_type().to_string()) {
                        self.image_copy_inner(&child_src, &child_tgt).await?;
                        continue;
                    }
                    // unknown child type: image copy first, blob copy as
                    // the fallback
                    match self.image_copy_inner(&child_src, &child_tgt).await {
                        Ok(()) => {}
                        Err(Error::UnsupportedMediaType(_)) | Err(Error::NotFound(_)) => {
                            debug!(
                                "child {} is not a manifest, copying as blob",
                                digest
                            );
                            self.blob_copy(src, tgt, &digest).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
            } else {
                if let Some(config) = m.config_descriptor()? {
                    self.blob_copy(src, tgt, &config.digest().to_string())
                        .await?;
                }
                for layer in m.layers()? {
                    if layer.urls().as_ref().is_some_and(|u| !u.is_empty()) {
                        debug!(
                            "skipping foreign layer {} with external urls",
                            layer.digest()
                        );
                        continue;
                    }
                    self.blob_copy(src, tgt, &layer.digest().to_string()).await?;
                }
            }
            // referenced content exists by now; bind the manifest last
            self.manifest_put(tgt, &m).await
        })
    }

    /// Copy one blob between repositories. No-op when source and target
    /// are the same repository or the target already has the digest; a
    /// same-registry copy tries a server-side mount before transferring
    /// bytes.
    pub async fn blob_copy(&self, src: &Reference, tgt: &Reference, digest: &str) -> Result<()> {
        if src.same_repository(tgt) {
            return Ok(());
        }
        if self.blob_head(tgt, digest).await.is_ok() {
            debug!("blob {} already on {}", digest, tgt.common_name());
            return Ok(());
        }
        if src.registry() == tgt.registry() {
            match self.blob_mount(tgt, digest, src.repository()).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("mount of {} declined, copying: {}", digest, e),
            }
        }
        let info = self.blob_head(src, digest).await?;
        let length = info.size.map(|s| s as i64).unwrap_or(-1);

        let client = self.clone();
        let src = src.clone();
        let digest_owned = digest.to_string();
        let source: BlobSource = Arc::new(move || {
            let client = client.clone();
            let rfr = src.clone();
            let digest = digest_owned.clone();
            Box::pin(async move {
                let blob = client.blob_get(&rfr, &digest).await?;
                let reader = blob.into_reader();
                let stream: BlobStream =
                    Box::pin(futures::stream::unfold(reader, |mut r| async move {
                        r.chunk().await.transpose().map(|item| (item, r))
                    }));
                Ok(stream)
            })
        });
        self.blob_put(tgt, Some(digest), length, source).await?;
        Ok(())
    }

    /// Unbind a tag. The protocol has no delete-tag, so a minimal manifest
    /// is synthesized, put over the tag, and deleted by its own digest;
    /// the originally referenced content is untouched.
    pub async fn tag_delete(&self, rfr: &Reference) -> Result<()> {
        if rfr.tag().is_empty() {
            return Err(Error::MissingTag(rfr.common_name()));
        }
        // match the manifest family the tag currently resolves to
        let current = self.manifest_head(rfr).await?;
        let (manifest_mt, config_mt) = match current.media_type() {
            MT_OCI1 | MT_OCI1_INDEX => (MT_OCI1, MT_OCI1_CONFIG),
            _ => (MT_DOCKER2, MT_DOCKER2_CONFIG),
        };

        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let config = serde_json::json!({
            "created": now,
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Labels": {
                    "delete-tag": rfr.tag(),
                    "delete-date": now,
                },
            },
            "rootfs": {"type": "layers", "diff_ids": []},
        });
        let config_raw = Bytes::from(serde_json::to_vec(&config)?);
        let config_digest = sha256_digest(&config_raw);
        let config_len = config_raw.len() as i64;
        self.blob_put(
            rfr,
            Some(&config_digest),
            config_len,
            crate::blob::source_from_bytes(config_raw),
        )
        .await?;

        let manifest_doc = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": manifest_mt,
            "config": {
                "mediaType": config_mt,
                "digest": config_digest,
                "size": config_len,
            },
            "layers": [],
        });
        let manifest = Manifest::from_bytes(
            rfr,
            manifest_mt,
            Bytes::from(serde_json::to_vec(&manifest_doc)?),
        )?;
        self.manifest_put(rfr, &manifest).await?;
        info!(
            "tag delete {}: synthesized {}, deleting it",
            rfr.common_name(),
            manifest.digest()
        );
        self.manifest_delete(&rfr.with_digest(manifest.digest()))
            .await
    }

    /// Resolve a list/index down to the child manifest for a platform.
    pub async fn image_manifest_for_platform(
        &self,
        rfr: &Reference,
        manifest: &Manifest,
        platform: &Platform,
    ) -> Result<Manifest> {
        let desc = manifest.platform_descriptor(platform)?.ok_or_else(|| {
            Error::NotFound(format!(
                "{}: no manifest for platform {}/{}",
                rfr.common_name(),
                platform.os(),
                platform.architecture()
            ))
        })?;
        self.manifest_get(&rfr.with_digest(&desc.digest().to_string()))
            .await
    }
}
