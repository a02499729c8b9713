use crate::cluster::{ClusterApi, SecretPayload};
use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKERCFG_TYPE: &str = "kubernetes.io/dockercfg";
const DOCKERCFG_KEY: &str = ".dockercfg";

/// Hosts that all refer to Docker Hub.
const DEFAULT_REGISTRY_ALIASES: [&str; 4] = [
    "index.docker.io",
    "docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// Username/password pair for one registry. Resolved per check and never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthConfig {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
}

/// Strips the scheme and trailing slash and lowercases a registry host.
pub fn normalize_registry(registry: &str) -> String {
    let registry = registry.trim();
    let registry = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    registry.trim_end_matches('/').to_lowercase()
}

pub fn matches_registry(image_registry: &str, secret_registry: &str) -> bool {
    let image_registry = normalize_registry(image_registry);
    let secret_registry = normalize_registry(secret_registry);

    if image_registry == secret_registry {
        return true;
    }

    is_default_registry(&image_registry) && is_default_registry(&secret_registry)
}

/// Docker Hub keys often carry an API path, e.g. `https://index.docker.io/v1/`.
fn is_default_registry(normalized: &str) -> bool {
    let host = normalized.split('/').next().unwrap_or(normalized);
    DEFAULT_REGISTRY_ALIASES.contains(&host)
}

/// Decodes the registry entries of a pull secret, in registry-key order.
pub fn parse_pull_secret(payload: &SecretPayload) -> Result<Vec<RegistryCredential>> {
    let auths: BTreeMap<String, DockerAuthConfig> = match payload.type_.as_deref() {
        Some(DOCKER_CONFIG_JSON_TYPE) => {
            let data = payload
                .data
                .get(DOCKER_CONFIG_JSON_KEY)
                .with_context(|| format!("secret does not contain {}", DOCKER_CONFIG_JSON_KEY))?;
            serde_json::from_slice::<DockerConfigJson>(data)
                .context("failed to parse docker config")?
                .auths
        }
        Some(DOCKERCFG_TYPE) => {
            let data = payload
                .data
                .get(DOCKERCFG_KEY)
                .with_context(|| format!("secret does not contain {}", DOCKERCFG_KEY))?;
            serde_json::from_slice(data).context("failed to parse legacy docker config")?
        }
        other => bail!(
            "secret is not a docker config secret (type: {})",
            other.unwrap_or("<none>")
        ),
    };

    let mut credentials = Vec::with_capacity(auths.len());
    for (registry, config) in auths {
        let mut username = config.username;
        let mut password = config.password;

        if !config.auth.is_empty() && (username.is_empty() || password.is_empty()) {
            match decode_auth(&config.auth) {
                Ok((user, pass)) => {
                    username = user;
                    password = pass;
                }
                Err(e) => {
                    warn!("Failed to decode auth for registry {}: {:#}", registry, e);
                    continue;
                }
            }
        }

        credentials.push(RegistryCredential {
            registry: normalize_registry(&registry),
            username,
            password: SecretString::new(password),
        });
    }
    Ok(credentials)
}

fn decode_auth(auth: &str) -> Result<(String, String)> {
    let decoded = STANDARD.decode(auth.trim()).context("invalid base64")?;
    let decoded = String::from_utf8(decoded).context("invalid UTF-8")?;
    let (username, password) = decoded
        .split_once(':')
        .context("expected username:password")?;
    Ok((username.to_string(), password.to_string()))
}

/// Finds credentials for an image among a workload's pull secrets.
pub struct CredentialResolver<'a> {
    cluster: &'a dyn ClusterApi,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self { cluster }
    }

    /// First matching registry entry across `secret_names` in declaration order. `None` means the
    /// lookup should be anonymous; unreadable secrets are skipped.
    pub async fn resolve(
        &self,
        namespace: &str,
        secret_names: &[String],
        image: &ImageReference,
        cancel: &CancellationToken,
    ) -> Option<RegistryCredential> {
        let image_registry = image.registry_host();

        for secret_name in secret_names {
            let secret = cancel
                .run_until_cancelled(self.cluster.get_secret(namespace, secret_name))
                .await?;
            let payload = match secret {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    debug!("Pull secret {}/{} not found", namespace, secret_name);
                    continue;
                }
                Err(e) => {
                    debug!("Failed to get secret {}/{}: {:#}", namespace, secret_name, e);
                    continue;
                }
            };

            let credentials = match parse_pull_secret(&payload) {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(
                        "Ignoring pull secret {}/{}: {:#}",
                        namespace, secret_name, e
                    );
                    continue;
                }
            };

            if let Some(credential) = credentials
                .into_iter()
                .find(|c| matches_registry(image_registry, &c.registry))
            {
                debug!("Found matching credentials for registry {}", credential.registry);
                return Some(credential);
            }
        }

        debug!("No matching credentials found for registry {}", image_registry);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCluster;
    use proptest::prelude::*;

    fn docker_config_secret(json: &str) -> SecretPayload {
        SecretPayload {
            type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
            data: BTreeMap::from([(DOCKER_CONFIG_JSON_KEY.to_string(), json.as_bytes().to_vec())]),
        }
    }

    #[test]
    fn test_normalize_registry() {
        assert_eq!(normalize_registry("https://GHCR.io/"), "ghcr.io");
        assert_eq!(normalize_registry("http://registry.local:5000"), "registry.local:5000");
        assert_eq!(normalize_registry("quay.io"), "quay.io");
    }

    #[test]
    fn test_matches_registry_after_normalization() {
        assert!(matches_registry("ghcr.io", "https://ghcr.io/"));
        assert!(matches_registry("Registry.Example.com", "registry.example.com"));
        assert!(!matches_registry("ghcr.io", "quay.io"));
    }

    #[test]
    fn test_matches_default_registry_aliases() {
        for image_registry in DEFAULT_REGISTRY_ALIASES {
            for secret_registry in DEFAULT_REGISTRY_ALIASES {
                assert!(matches_registry(image_registry, secret_registry));
            }
        }
        assert!(matches_registry("index.docker.io", "https://index.docker.io/v1/"));
        assert!(!matches_registry("index.docker.io", "ghcr.io"));
        assert!(!matches_registry("ghcr.io", "ghcr.io.evil.example"));
    }

    #[test]
    fn test_parse_pull_secret_prefers_discrete_fields() {
        let auth = STANDARD.encode("encoded-user:encoded-pass");
        let secret = docker_config_secret(&format!(
            r#"{{"auths": {{
                "https://GHCR.io/": {{"username": "user", "password": "pass", "auth": "{auth}"}},
                "quay.io": {{"auth": "{auth}"}}
            }}}}"#
        ));

        let credentials = parse_pull_secret(&secret).expect("Should parse secret");
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].registry, "ghcr.io");
        assert_eq!(credentials[0].username, "user");
        assert_eq!(credentials[0].password.expose_secret(), "pass");
        assert_eq!(credentials[1].username, "encoded-user");
        assert_eq!(credentials[1].password.expose_secret(), "encoded-pass");
    }

    #[test]
    fn test_parse_pull_secret_skips_undecodable_auth() {
        let secret = docker_config_secret(r#"{"auths": {"ghcr.io": {"auth": "%%%"}}}"#);
        let credentials = parse_pull_secret(&secret).expect("Should parse secret");
        assert!(credentials.is_empty());
    }

    #[test]
    fn test_parse_legacy_dockercfg() {
        let secret = SecretPayload {
            type_: Some(DOCKERCFG_TYPE.to_string()),
            data: BTreeMap::from([(
                DOCKERCFG_KEY.to_string(),
                br#"{"quay.io": {"username": "robot", "password": "token"}}"#.to_vec(),
            )]),
        };
        let credentials = parse_pull_secret(&secret).expect("Should parse secret");
        assert_eq!(credentials[0].registry, "quay.io");
        assert_eq!(credentials[0].username, "robot");
    }

    #[test]
    fn test_parse_rejects_opaque_secret() {
        let secret = SecretPayload {
            type_: Some("Opaque".to_string()),
            data: BTreeMap::new(),
        };
        assert!(parse_pull_secret(&secret).is_err());
    }

    #[tokio::test]
    async fn test_resolve_first_match_in_declaration_order() {
        let cluster = FakeCluster::default();
        cluster.add_secret(
            "default",
            "first",
            docker_config_secret(r#"{"auths": {"quay.io": {"username": "a", "password": "1"}}}"#),
        );
        cluster.add_secret(
            "default",
            "second",
            docker_config_secret(
                r#"{"auths": {"ghcr.io": {"username": "b", "password": "2"}, "https://index.docker.io/v1/": {"username": "c", "password": "3"}}}"#,
            ),
        );
        cluster.add_secret(
            "default",
            "third",
            docker_config_secret(r#"{"auths": {"docker.io": {"username": "d", "password": "4"}}}"#),
        );

        let resolver = CredentialResolver::new(&cluster);
        let secrets = vec![
            "missing".to_string(),
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ];
        let image = ImageReference::parse("nginx:latest");

        let credential = resolver
            .resolve("default", &secrets, &image, &CancellationToken::new())
            .await
            .expect("Should resolve credentials");
        assert_eq!(credential.username, "c");
        assert_eq!(credential.registry, "index.docker.io/v1");
    }

    #[tokio::test]
    async fn test_resolve_without_match_is_anonymous() {
        let cluster = FakeCluster::default();
        cluster.add_secret(
            "default",
            "regcred",
            docker_config_secret(r#"{"auths": {"quay.io": {"username": "a", "password": "1"}}}"#),
        );

        let resolver = CredentialResolver::new(&cluster);
        let image = ImageReference::parse("ghcr.io/org/app:1.0");
        let credential = resolver
            .resolve(
                "default",
                &["regcred".to_string()],
                &image,
                &CancellationToken::new(),
            )
            .await;
        assert!(credential.is_none());
    }

    fn host_variant(host: String) -> impl Strategy<Value = String> {
        (
            prop::sample::select(vec!["", "http://", "https://"]),
            any::<bool>(),
            0usize..3,
        )
            .prop_map(move |(scheme, upper, slashes)| {
                let host = if upper { host.to_uppercase() } else { host.clone() };
                format!("{}{}{}", scheme, host, "/".repeat(slashes))
            })
    }

    fn host_and_variant() -> impl Strategy<Value = (String, String)> {
        "[a-z][a-z0-9-]{0,12}(\\.[a-z]{2,6}){1,2}(:[0-9]{2,5})?"
            .prop_flat_map(|host| (Just(host.clone()), host_variant(host)))
    }

    fn alias_pair() -> impl Strategy<Value = (String, String)> {
        (
            prop::sample::select(DEFAULT_REGISTRY_ALIASES.to_vec()),
            prop::sample::select(DEFAULT_REGISTRY_ALIASES.to_vec()),
        )
            .prop_flat_map(|(image, secret)| {
                (Just(image.to_string()), host_variant(secret.to_string()))
            })
    }

    proptest! {
        #[test]
        fn prop_host_variants_always_match((host, variant) in host_and_variant()) {
            prop_assert!(matches_registry(&host, &variant));
            prop_assert!(matches_registry(&variant, &host));
            prop_assert_eq!(normalize_registry(&variant), host);
        }

        #[test]
        fn prop_default_registry_aliases_match((image, secret) in alias_pair()) {
            prop_assert!(matches_registry(&image, &secret));
        }
    }
}
