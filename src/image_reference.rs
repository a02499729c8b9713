use std::fmt;

pub const DEFAULT_TAG: &str = "latest";
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Host that actually serves the Docker Hub v2 API.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Parsed form of a container image string.
///
/// `repository` is kept exactly as written in the pod template (including any registry host),
/// so that a pinned reference can be rebuilt without changing where the image is pulled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    /// Parsing never fails: anything that does not look like `repo[:tag][@digest]` is split on a
    /// best-effort basis. The tag falls back to `latest` when absent or empty.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) if !digest.is_empty() => (name, Some(digest.to_string())),
            Some((name, _)) => (name, None),
            None => (s, None),
        };

        // A colon only starts a tag when it comes after the last slash, otherwise it's a port
        let last_slash = name.rfind('/');
        let (repository, tag) = match name.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&name[..pos], &name[pos + 1..])
            }
            _ => (name, ""),
        };

        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };

        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        }
    }

    /// Same repository and tag, pinned to `digest`.
    pub fn pinned(&self, digest: &str) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest.to_string()),
        }
    }

    /// `repository:tag` without any digest.
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// Registry host the image is pulled from. Images without an explicit host live on Docker Hub.
    pub fn registry_host(&self) -> &str {
        match self.repository.split_once('/') {
            Some((first, _)) if is_registry_host(first) => first,
            _ => DEFAULT_REGISTRY,
        }
    }

    /// Repository path below the registry host, as used in `/v2/<path>/manifests/<tag>`.
    pub fn repository_path(&self) -> String {
        match self.repository.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => {
                if is_docker_hub(first) && !rest.contains('/') {
                    format!("library/{}", rest)
                } else {
                    rest.to_string()
                }
            }
            Some(_) => self.repository.clone(),
            None => format!("library/{}", self.repository),
        }
    }

    /// Host to talk to for the distribution API.
    pub fn api_host(&self) -> &str {
        match self.registry_host() {
            host if is_docker_hub(host) => DOCKER_HUB_API_HOST,
            host => host,
        }
    }
}

fn is_docker_hub(host: &str) -> bool {
    host == DEFAULT_REGISTRY || host == "docker.io"
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Extracts the digest from a container status `imageID`, e.g.
/// `docker-pullable://nginx@sha256:abc` or `docker.io/library/nginx@sha256:abc`.
pub fn digest_from_image_id(image_id: &str) -> Option<String> {
    image_id
        .split_once('@')
        .map(|(_, digest)| digest.to_string())
        .filter(|digest| !digest.is_empty())
}
