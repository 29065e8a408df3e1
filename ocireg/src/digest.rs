use sha2::{Digest as _, Sha256};

use crate::errors::{Error, Result};

pub const SHA256: &str = "sha256";

/// Compute the canonical `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: impl AsRef<[u8]>) -> String {
    format!("{}:{}", SHA256, hex::encode(Sha256::digest(data)))
}

/// Incremental digest for streamed bodies.
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> String {
        format!("{}:{}", SHA256, hex::encode(self.hasher.finalize()))
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate the `<algo>:<hex>` shape without allocating a parsed form.
pub fn validate(digest: &str) -> Result<()> {
    let err = || Error::ParsingFailed(format!("invalid digest {:?}", digest));
    let (algo, hexpart) = digest.split_once(':').ok_or_else(err)?;
    if algo.is_empty()
        || !algo
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
    {
        return Err(err());
    }
    if hexpart.len() < 32 || !hexpart.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(err());
    }
    Ok(())
}

// sha256:foo -> sha256/foo, the content address inside an image layout
pub fn layout_path(digest: &str) -> String {
    format!("blobs/{}", digest.replacen(':', "/", 1))
}
