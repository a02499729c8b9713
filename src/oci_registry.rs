use crate::config::Config;
use crate::credentials::RegistryCredential;
use crate::image_reference::ImageReference;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::fs;
use tracing::{debug, info};

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Looks up the digest a registry currently publishes for a tag.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn get_digest(
        &self,
        image: &ImageReference,
        credential: Option<&RegistryCredential>,
    ) -> Result<String>;
}

pub fn create_client(config: &Config) -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

enum Authorization {
    Bearer(String),
    Basic { username: String, password: String },
}

impl Authorization {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Authorization::Bearer(token) => request.bearer_auth(token),
            Authorization::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

fn parse_challenge(header: &str) -> Result<Challenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Ok(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        bail!("Unsupported authentication scheme {}", scheme);
    }

    let re = Regex::new(r#"(\w+)="([^"]*)""#).context("Invalid regex pattern for challenges")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for caps in re.captures_iter(params) {
        let value = caps[2].to_string();
        match &caps[1] {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Ok(Challenge::Bearer {
        realm: realm.context("Bearer challenge without realm")?,
        service,
        scope,
    })
}

/// Distribution API client that resolves tags with `HEAD` manifest requests.
pub struct OciRegistry {
    client: Client,
    scheme: &'static str,
}

impl OciRegistry {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            scheme: "https",
        }
    }

    fn manifest_url(&self, image: &ImageReference) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme,
            image.api_host(),
            image.repository_path(),
            image.tag
        )
    }

    async fn fetch_docker_manifest(
        &self,
        url: &str,
        authorization: Option<&Authorization>,
    ) -> Result<Response> {
        debug!("Fetching docker manifest from URL {}", url);
        let mut request = self.client.head(url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        if let Some(authorization) = authorization {
            request = authorization.apply(request);
        }
        request
            .send()
            .await
            .context("Failed to send request to fetch manifest")
    }

    async fn authorize(
        &self,
        challenge: Challenge,
        image: &ImageReference,
        credential: Option<&RegistryCredential>,
    ) -> Result<Authorization> {
        let credential = credential.filter(|c| !c.username.is_empty());
        match challenge {
            Challenge::Basic => {
                let credential = credential.with_context(|| {
                    format!(
                        "Registry {} requires basic authentication but no credentials were found",
                        image.registry_host()
                    )
                })?;
                Ok(Authorization::Basic {
                    username: credential.username.clone(),
                    password: credential.password.expose_secret().to_string(),
                })
            }
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope =
                    scope.unwrap_or_else(|| format!("repository:{}:pull", image.repository_path()));
                let mut query = vec![("scope", scope)];
                if let Some(service) = service {
                    query.push(("service", service));
                }

                let mut request = self.client.get(&realm).query(&query);
                if let Some(credential) = credential {
                    debug!("Using credentials for registry {}", credential.registry);
                    request = request
                        .basic_auth(&credential.username, Some(credential.password.expose_secret()));
                }

                let response = request
                    .send()
                    .await
                    .with_context(|| format!("Failed to request token from {}", realm))?;
                if !response.status().is_success() {
                    bail!(
                        "Token endpoint {} returned error status {}",
                        realm,
                        response.status()
                    );
                }
                let token: TokenResponse = response
                    .json()
                    .await
                    .context("Failed to parse token response")?;
                token
                    .token
                    .or(token.access_token)
                    .map(Authorization::Bearer)
                    .context("Token response did not contain a token")
            }
        }
    }
}

#[async_trait]
impl DigestResolver for OciRegistry {
    async fn get_digest(
        &self,
        image: &ImageReference,
        credential: Option<&RegistryCredential>,
    ) -> Result<String> {
        let url = self.manifest_url(image);

        let mut response = self.fetch_docker_manifest(&url, None).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let header = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .context("Registry answered 401 without a WWW-Authenticate header")?
                .to_str()
                .context("Received invalid UTF-8 content in WWW-Authenticate header")?;
            let challenge = parse_challenge(header)?;
            let authorization = self.authorize(challenge, image, credential).await?;
            response = self
                .fetch_docker_manifest(&url, Some(&authorization))
                .await?;
        }

        if !response.status().is_success() {
            bail!(
                "Registry {} returned error status {} while fetching manifest of {}",
                image.registry_host(),
                response.status(),
                image.tagged()
            );
        }

        get_digest_from_response(&response)
    }
}

fn get_digest_from_response(response: &Response) -> Result<String> {
    Ok(response
        .headers()
        .get("Docker-Content-Digest")
        .context("Response does not contain HTTP header Docker-Content-Digest")?
        .to_str()
        .context("Received invalid UTF-8 content in Docker-Content-Digest header")?
        .to_owned())
}
