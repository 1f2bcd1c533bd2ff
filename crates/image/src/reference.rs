//! Image reference parsing and registry-family detection.

use crate::ImageError;

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host (and optional port).
    pub registry: String,
    /// Repository path within the registry, e.g. `library/nginx`.
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// What goes in the manifest URL: a digest pin wins over a tag.
    pub fn manifest_reference(&self) -> String {
        self.digest
            .clone()
            .or_else(|| self.tag.clone())
            .unwrap_or_else(|| "latest".to_string())
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(d) = &self.digest {
            write!(f, "@{}", d)
        } else if let Some(t) = &self.tag {
            write!(f, ":{}", t)
        } else {
            Ok(())
        }
    }
}

/// Parse a docker-style reference. Bare names resolve against Docker Hub
/// with the implicit `library/` prefix.
pub fn parse(input: &str) -> Result<ImageRef, ImageError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ImageError::Registry("empty image reference".to_string()));
    }

    let (rest, digest) = match input.split_once('@') {
        Some((rest, digest)) => {
            if !digest.starts_with("sha256:") {
                return Err(ImageError::Registry(format!(
                    "unsupported digest algorithm in {:?}",
                    input
                )));
            }
            (rest, Some(digest.to_string()))
        }
        None => (input, None),
    };

    // The first path segment is a registry host only when it looks like one.
    let (registry, remainder) = match rest.split_once('/') {
        Some((head, tail))
            if head.contains('.') || head.contains(':') || head == "localhost" =>
        {
            (head.to_string(), tail.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), rest.to_string()),
    };

    // A tag colon sits after the last slash; a port colon does not.
    let (repository, tag) = match remainder.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), Some(tag.to_string())),
        _ => (remainder.clone(), None),
    };
    if repository.is_empty() {
        return Err(ImageError::Registry(format!(
            "no repository in {:?}",
            input
        )));
    }

    let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("library/{}", repository)
    } else {
        repository
    };

    let mut normalized_registry = registry;
    if normalized_registry == "docker.io" || normalized_registry == "index.docker.io" {
        normalized_registry = DEFAULT_REGISTRY.to_string();
    }

    Ok(ImageRef {
        registry: normalized_registry,
        repository,
        tag: if digest.is_some() { None } else { tag.or_else(|| Some("latest".to_string())) },
        digest,
    })
}

/// Registry families with their own credential conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFamily {
    DockerHub,
    Google,
    Aws,
    Azure,
    GitHub,
    Quay,
    GitLab,
    Generic,
}

impl RegistryFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryFamily::DockerHub => "docker",
            RegistryFamily::Google => "google",
            RegistryFamily::Aws => "aws",
            RegistryFamily::Azure => "azure",
            RegistryFamily::GitHub => "github",
            RegistryFamily::Quay => "quay",
            RegistryFamily::GitLab => "gitlab",
            RegistryFamily::Generic => "generic",
        }
    }
}

pub fn detect_family(registry: &str) -> RegistryFamily {
    let host = registry.to_ascii_lowercase();
    if host.contains("gcr.io") || host.contains("pkg.dev") {
        RegistryFamily::Google
    } else if host.contains(".dkr.ecr.") && host.contains(".amazonaws.com") {
        RegistryFamily::Aws
    } else if host.ends_with(".azurecr.io") {
        RegistryFamily::Azure
    } else if host.contains("ghcr.io") {
        RegistryFamily::GitHub
    } else if host.contains("quay.io") {
        RegistryFamily::Quay
    } else if host.contains("registry.gitlab.com") {
        RegistryFamily::GitLab
    } else if host == DEFAULT_REGISTRY || host.contains("docker.io") {
        RegistryFamily::DockerHub
    } else {
        RegistryFamily::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_docker_hub_library() {
        let r = parse("nginx").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert!(r.digest.is_none());
    }

    #[test]
    fn org_repo_with_tag() {
        let r = parse("grafana/grafana:10.2.1").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "grafana/grafana");
        assert_eq!(r.tag.as_deref(), Some("10.2.1"));
    }

    #[test]
    fn custom_registry_with_port() {
        let r = parse("registry.local:5000/team/app:v1").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn digest_pin_overrides_tag() {
        let r = parse("ghcr.io/org/app@sha256:0123456789abcdef").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert!(r.tag.is_none());
        assert_eq!(r.manifest_reference(), "sha256:0123456789abcdef");
    }

    #[test]
    fn docker_io_prefix_normalises() {
        let r = parse("docker.io/library/redis:7").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "library/redis");
    }

    #[test]
    fn rejects_empty_and_bad_digest() {
        assert!(parse("").is_err());
        assert!(parse("app@md5:abc").is_err());
    }

    #[test]
    fn family_detection() {
        assert_eq!(detect_family("gcr.io"), RegistryFamily::Google);
        assert_eq!(
            detect_family("europe-west1-docker.pkg.dev"),
            RegistryFamily::Google
        );
        assert_eq!(
            detect_family("123456789.dkr.ecr.us-east-1.amazonaws.com"),
            RegistryFamily::Aws
        );
        assert_eq!(detect_family("myteam.azurecr.io"), RegistryFamily::Azure);
        assert_eq!(detect_family("ghcr.io"), RegistryFamily::GitHub);
        assert_eq!(detect_family("quay.io"), RegistryFamily::Quay);
        assert_eq!(detect_family(DEFAULT_REGISTRY), RegistryFamily::DockerHub);
        assert_eq!(detect_family("harbor.corp.example"), RegistryFamily::Generic);
    }
}
