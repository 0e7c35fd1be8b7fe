//! Docker-style image reference parsing and normalization.
//!
//! Short names are expanded the same way the engine's image store names them:
//! `ubuntu` becomes `docker.io/library/ubuntu:latest`, so an exact-name lookup
//! against the image index finds images pulled under either spelling.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";
const NAME_TOTAL_LENGTH_MAX: usize = 255;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?$",
    )
    .expect("static domain pattern")
});

static PATH_COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("static path pattern")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("static tag pattern"));

static DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
        .expect("static digest pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image reference must not be empty")]
    Empty,
    #[error("repository name must be lowercase: '{0}'")]
    UppercaseRepository(String),
    #[error("invalid registry domain: '{0}'")]
    InvalidDomain(String),
    #[error("invalid repository path component '{component}' in '{reference}'")]
    InvalidPath { reference: String, component: String },
    #[error("invalid tag: '{0}'")]
    InvalidTag(String),
    #[error("invalid digest: '{0}'")]
    InvalidDigest(String),
    #[error("repository name must not be more than {NAME_TOTAL_LENGTH_MAX} characters")]
    NameTooLong,
}

/// Fully-qualified image reference: `domain/path[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize a reference. When a digest is present the tag is
    /// dropped; when neither is present the tag defaults to `latest`.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (remainder, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(ReferenceError::InvalidDigest(digest.to_owned()));
                }
                (name, Some(digest.to_owned()))
            }
            None => (input, None),
        };

        // A tag separator is a ':' after the last '/', otherwise it is a port.
        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(&remainder[split + 1..]))
            }
            None => (remainder, None),
        };

        if let Some(tag) = tag {
            if !TAG_RE.is_match(tag) {
                return Err(ReferenceError::InvalidTag(tag.to_owned()));
            }
        }

        let (domain, path) = split_domain(name);
        if path.to_lowercase() != path {
            return Err(ReferenceError::UppercaseRepository(path));
        }
        if !DOMAIN_RE.is_match(&domain) {
            return Err(ReferenceError::InvalidDomain(domain));
        }
        for component in path.split('/') {
            if !PATH_COMPONENT_RE.is_match(component) {
                return Err(ReferenceError::InvalidPath {
                    reference: input.to_owned(),
                    component: component.to_owned(),
                });
            }
        }
        if domain.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ReferenceError::NameTooLong);
        }

        let tag = match (&digest, tag) {
            (Some(_), _) => None,
            (None, Some(tag)) => Some(tag.to_owned()),
            (None, None) => Some(DEFAULT_TAG.to_owned()),
        };

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `domain/path` without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (mut domain, mut path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_owned(), rest.to_owned())
        }
        Some(_) | None => (DEFAULT_DOMAIN.to_owned(), name.to_owned()),
    };
    if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.clone_into(&mut domain);
    }
    if domain == DEFAULT_DOMAIN && !path.contains('/') {
        path = format!("{OFFICIAL_REPO_PREFIX}{path}");
    }
    (domain, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn short_name_is_normalized() {
        let r = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/ubuntu:latest");
        assert_eq!(r.name(), "docker.io/library/ubuntu");
    }

    #[test]
    fn user_repository_keeps_namespace() {
        let r = ImageReference::parse("kindest/node:v1.29.0").unwrap();
        assert_eq!(r.to_string(), "docker.io/kindest/node:v1.29.0");
        assert_eq!(r.tag(), Some("v1.29.0"));
    }

    #[test]
    fn registry_with_port_is_domain() {
        let r = ImageReference::parse("localhost:5000/capi/node").unwrap();
        assert_eq!(r.domain(), "localhost:5000");
        assert_eq!(r.path(), "capi/node");
        assert_eq!(r.to_string(), "localhost:5000/capi/node:latest");
    }

    #[test]
    fn legacy_domain_is_rewritten() {
        let r = ImageReference::parse("index.docker.io/busybox:1.36").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/busybox:1.36");
    }

    #[test]
    fn digest_drops_tag() {
        let r = ImageReference::parse(&format!("gcr.io/distroless/static:nonroot@{DIGEST}"))
            .unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.to_string(), format!("gcr.io/distroless/static@{DIGEST}"));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(ImageReference::parse("  "), Err(ReferenceError::Empty));
    }

    #[test]
    fn rejects_uppercase_repository() {
        assert!(matches!(
            ImageReference::parse("Ubuntu"),
            Err(ReferenceError::UppercaseRepository(_))
        ));
    }

    #[test]
    fn rejects_bad_tag_and_digest() {
        assert!(matches!(
            ImageReference::parse("busybox:-bad"),
            Err(ReferenceError::InvalidTag(_))
        ));
        assert!(matches!(
            ImageReference::parse("busybox@sha256:xyz"),
            Err(ReferenceError::InvalidDigest(_))
        ));
    }

    #[test]
    fn rejects_bad_path_component() {
        assert!(matches!(
            ImageReference::parse("foo//bar"),
            Err(ReferenceError::InvalidPath { .. })
        ));
    }
}
