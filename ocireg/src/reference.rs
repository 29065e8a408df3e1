use std::fmt;
use std::str::FromStr;

use crate::digest;
use crate::errors::{Error, Result};

pub const DOCKER_REGISTRY: &str = "docker.io";
pub const DOCKER_LIBRARY: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image coordinate: registry host, repository path, and a tag
/// and/or digest. Parsing fills in `docker.io`, the `library/` namespace,
/// and the `latest` tag the way docker does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: String,
    digest: String,
}

impl Reference {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// host/repo[:tag][@digest]
    pub fn common_name(&self) -> String {
        self.to_string()
    }

    /// Same coordinate addressed by digest only, used for index children.
    pub fn with_digest(&self, digest: &str) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: String::new(),
            digest: digest.to_string(),
        }
    }

    pub fn with_tag(&self, tag: &str) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: tag.to_string(),
            digest: String::new(),
        }
    }

    /// True when src and tgt point into the same repository of the same
    /// registry, which makes a copy between them a no-op.
    pub fn same_repository(&self, other: &Reference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::MissingName("empty reference".into()));
        }

        let (remainder, digest) = match s.split_once('@') {
            Some((pre, digest)) => {
                digest::validate(digest)
                    .map_err(|_| Error::ParsingFailed(format!("invalid digest in {:?}", s)))?;
                (pre, digest.to_string())
            }
            None => (s, String::new()),
        };

        let (registry, path) = split_registry(remainder);
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repo, tag)) => (repo, tag.to_string()),
            None => (path, String::new()),
        };
        if repository.is_empty() {
            return Err(Error::MissingName(format!("no repository in {:?}", s)));
        }

        // single-segment names on docker hub live under library/
        let repository = if registry == DOCKER_REGISTRY && !repository.contains('/') {
            format!("{}/{}", DOCKER_LIBRARY, repository)
        } else {
            repository.to_string()
        };

        let tag = if tag.is_empty() && digest.is_empty() {
            DEFAULT_TAG.to_string()
        } else {
            tag
        };

        validate_registry(&registry)?;
        validate_repository(&repository)?;
        if !tag.is_empty() {
            validate_tag(&tag)?;
        }

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if !self.digest.is_empty() {
            write!(f, "@{}", self.digest)?;
        }
        Ok(())
    }
}

// the first segment is a registry iff it looks like a host
fn split_registry(s: &str) -> (String, &str) {
    match s.split_once('/') {
        Some((head, rest))
            if head.contains('.') || head.contains(':') || head == "localhost" =>
        {
            (head.to_string(), rest)
        }
        _ => (DOCKER_REGISTRY.to_string(), s),
    }
}

fn validate_registry(registry: &str) -> Result<()> {
    let (host, port) = match registry.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (registry, None),
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    let port_ok = port.is_none_or(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if host_ok && port_ok {
        Ok(())
    } else {
        Err(Error::ParsingFailed(format!(
            "invalid registry {:?}",
            registry
        )))
    }
}

fn validate_repository(repository: &str) -> Result<()> {
    // lowercase path components separated by /, with ._- allowed between
    // alphanumeric runs
    let component_ok = |c: &str| {
        !c.is_empty()
            && c.starts_with(|ch: char| ch.is_ascii_lowercase() || ch.is_ascii_digit())
            && c.ends_with(|ch: char| ch.is_ascii_lowercase() || ch.is_ascii_digit())
            && c.chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "._-".contains(ch))
    };
    if repository.split('/').all(component_ok) {
        Ok(())
    } else {
        Err(Error::ParsingFailed(format!(
            "invalid repository {:?}",
            repository
        )))
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    let ok = tag.len() <= 128
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));
    if ok {
        Ok(())
    } else {
        Err(Error::ParsingFailed(format!("invalid tag {:?}", tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_name() {
        let r: Reference = "alpine".parse().unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.tag(), "latest");
        assert_eq!(r.digest(), "");
        assert_eq!(r.common_name(), "docker.io/library/alpine:latest");

        let r: Reference = "x".parse().unwrap();
        assert_eq!(r.repository(), "library/x");
    }

    #[test]
    fn test_parse_full() {
        let d = "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        let r: Reference = format!("quay.io/foo/bar:v1@{}", d).parse().unwrap();
        assert_eq!(r.registry(), "quay.io");
        assert_eq!(r.repository(), "foo/bar");
        assert_eq!(r.tag(), "v1");
        assert_eq!(r.digest(), d);
        assert_eq!(r.common_name(), format!("quay.io/foo/bar:v1@{}", d));
    }

    #[test]
    fn test_parse_digest_only() {
        let d = "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        let r: Reference = format!("example.com/app@{}", d).parse().unwrap();
        assert_eq!(r.tag(), "");
        assert_eq!(r.digest(), d);
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r: Reference = "localhost:5000/foo:1".parse().unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "foo");
        assert_eq!(r.tag(), "1");

        // a plain localhost segment is a registry too
        let r: Reference = "localhost/foo".parse().unwrap();
        assert_eq!(r.registry(), "localhost");
    }

    #[test]
    fn test_parse_nested_repo_keeps_namespace() {
        let r: Reference = "ghcr.io/a/b/c:tag".parse().unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "a/b/c");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Reference>().is_err());
        assert!("alpine:UPPER:case".parse::<Reference>().is_err());
        assert!("example.com/Re po".parse::<Reference>().is_err());
        assert!("example.com/foo@sha256:nothex".parse::<Reference>().is_err());
    }

    #[test]
    fn test_with_digest_drops_tag() {
        let d = "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        let r: Reference = "example.com/foo:v2".parse().unwrap();
        let rd = r.with_digest(d);
        assert_eq!(rd.tag(), "");
        assert_eq!(rd.digest(), d);
        assert!(r.same_repository(&rd));
    }
}
