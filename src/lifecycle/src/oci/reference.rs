//! Image reference parsing.
//!
//! Turns the repository name given to `analyze` / `export` (for example
//! `ghcr.io/acme/app:v1` or just `app`) into registry, repository, tag and
//! digest parts.

use oci_distribution::Reference;
use packs_core::error::{LifecycleError, Result};

/// Registry used when the reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference carries neither tag nor digest.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/app", "acme/app")
    pub repository: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest ("algorithm:hex"), if any
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference.
    ///
    /// - `app` -> docker.io/library/app:latest
    /// - `acme/app:v1` -> docker.io/acme/app:v1
    /// - `localhost:5000/app` -> localhost:5000/app:latest
    /// - `ghcr.io/acme/app@sha256:...` -> pinned by digest, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(LifecycleError::InvalidArgs(
                "Empty image reference".to_string(),
            ));
        }

        let (name_and_tag, digest) = split_digest(reference)?;
        let (name, tag) = split_tag(name_and_tag);
        if name.is_empty() {
            return Err(LifecycleError::InvalidArgs(format!(
                "Missing repository in reference '{}'",
                reference
            )));
        }
        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical reference string, used as the local store key.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Reference in the form the registry client expects. A digest wins
    /// over a tag.
    pub fn to_oci_reference(&self) -> Reference {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => Reference::with_digest(
                self.registry.clone(),
                self.repository.clone(),
                digest.clone(),
            ),
            (None, tag) => Reference::with_tag(
                self.registry.clone(),
                self.repository.clone(),
                tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string()),
            ),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn split_digest(reference: &str) -> Result<(&str, Option<String>)> {
    match reference.rsplit_once('@') {
        Some((name, digest)) => {
            let valid = digest
                .split_once(':')
                .map(|(algorithm, hex)| !algorithm.is_empty() && !hex.is_empty())
                .unwrap_or(false);
            if !valid {
                return Err(LifecycleError::InvalidArgs(format!(
                    "Invalid digest in reference '{}': expected algorithm:hex",
                    reference
                )));
            }
            Ok((name, Some(digest.to_string())))
        }
        None => Ok((reference, None)),
    }
}

/// A tag is the text after the last ':' of the last path component. A bare
/// `host:port` with no slash is treated as a name, not a tag.
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_slash = name.rfind('/');
    let last_component = &name[last_slash.map(|i| i + 1).unwrap_or(0)..];
    match last_component.rfind(':') {
        Some(pos) => {
            let tag = &last_component[pos + 1..];
            if last_slash.is_none() && !tag.is_empty() && tag.chars().all(|c| c.is_ascii_digit()) {
                return (name, None);
            }
            let split = name.len() - last_component.len() + pos;
            (&name[..split], Some(tag).filter(|t| !t.is_empty()))
        }
        None => (name, None),
    }
}

/// The first component is a registry host if it looks like one (has a dot
/// or port, or is `localhost`).
fn split_registry(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(LifecycleError::InvalidArgs(format!(
                    "Empty repository in reference '{}'",
                    reference
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let r = ImageReference::parse("app").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = ImageReference::parse("acme/app:v1.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "acme/app");
        assert_eq!(r.tag.as_deref(), Some("v1.0"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/stack/run:bionic").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "stack/run");
        assert_eq!(r.tag.as_deref(), Some("bionic"));
    }

    #[test]
    fn test_parse_registry_port_without_tag() {
        let r = ImageReference::parse("registry.local:5000/app").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse("ghcr.io/acme/app@sha256:abcdef").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "acme/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcdef"));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/acme/app:v1@sha256:abcdef").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abcdef"));
        assert_eq!(r.full_reference(), "ghcr.io/acme/app:v1@sha256:abcdef");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
        assert!(ImageReference::parse("app@nodigest").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let r = ImageReference::parse("  app  ").unwrap();
        assert_eq!(r.repository, "library/app");
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("app:1.25").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/app:1.25");
    }

    #[test]
    fn test_to_oci_reference_with_tag() {
        let r = ImageReference::parse("ghcr.io/acme/app:v1").unwrap();
        assert_eq!(r.to_oci_reference().to_string(), "ghcr.io/acme/app:v1");
    }

    #[test]
    fn test_to_oci_reference_prefers_digest() {
        let r = ImageReference::parse("ghcr.io/acme/app:v1@sha256:abcdef").unwrap();
        let oci_ref = r.to_oci_reference();
        assert_eq!(oci_ref.digest(), Some("sha256:abcdef"));
    }
}
