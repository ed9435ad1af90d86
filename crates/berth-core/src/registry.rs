//! OCI distribution registry client.
//!
//! Resolves tags with `HEAD /v2/<repository>/manifests/<tag>` and reads the
//! `Docker-Content-Digest` header. Handles the bearer token challenge most
//! registries (Docker Hub included) answer anonymous requests with.

use std::time::Duration;

use async_trait::async_trait;
use berth_state::{ArtifactRegistry, ImageDigest, ImageReference, RegistryError, RegistryResult};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

const DIGEST_HEADER: &str = "Docker-Content-Digest";

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Credentials and transport options for [`OciRegistryClient`].
#[derive(Debug, Clone, Default)]
pub struct OciRegistryConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Hosts reached over plain HTTP (`localhost` always is)
    pub insecure_hosts: Vec<String>,
    pub timeout_secs: u64,
}

impl OciRegistryConfig {
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_insecure_host(mut self, host: &str) -> Self {
        self.insecure_hosts.push(host.to_string());
        self
    }
}

/// [`ArtifactRegistry`] backed by a remote OCI registry.
pub struct OciRegistryClient {
    config: OciRegistryConfig,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Bearer ")?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for part in split_params(rest) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Split challenge parameters on commas outside quotes.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

impl OciRegistryClient {
    pub fn new(config: OciRegistryConfig) -> RegistryResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")));
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        let http_client = builder.build().map_err(|e| RegistryError::Unavailable {
            reference: String::new(),
            reason: format!("failed to create HTTP client: {e}"),
        })?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// Manifest URL for a parsed reference.
    pub fn manifest_url(&self, image: &ImageReference) -> String {
        let host = api_host(&image.registry);
        let scheme = if self.is_insecure(&image.registry) {
            "http"
        } else {
            "https"
        };
        format!(
            "{scheme}://{host}/v2/{}/manifests/{}",
            image.repository, image.tag
        )
    }

    fn is_insecure(&self, registry: &str) -> bool {
        let host = registry.split(':').next().unwrap_or(registry);
        host == "localhost"
            || host == "127.0.0.1"
            || self.config.insecure_hosts.iter().any(|h| h == registry || h == host)
    }

    fn head(&self, url: &str, bearer: Option<&str>) -> reqwest::RequestBuilder {
        let request = self.http_client.head(url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        match (bearer, &self.config.username) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(user)) => request.basic_auth(user, self.config.password.as_deref()),
            (None, None) => request,
        }
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        reference: &str,
    ) -> RegistryResult<String> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        let mut request = self.http_client.get(&challenge.realm).query(&query);
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| unavailable(reference, e))?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(RegistryError::Unauthorized {
                    reference: reference.to_string(),
                    reason: format!("token endpoint returned {}", response.status()),
                })
            }
            s => {
                return Err(RegistryError::Unavailable {
                    reference: reference.to_string(),
                    reason: format!("token endpoint returned {s}"),
                })
            }
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| unavailable(reference, e))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Unavailable {
                reference: reference.to_string(),
                reason: "token endpoint returned no token".to_string(),
            })
    }
}

/// Docker Hub serves its API from a different host than its image names.
fn api_host(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" => "registry-1.docker.io",
        other => other,
    }
}

fn unavailable(reference: &str, err: reqwest::Error) -> RegistryError {
    RegistryError::Unavailable {
        reference: reference.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl ArtifactRegistry for OciRegistryClient {
    async fn resolve_digest(&self, reference: &str) -> RegistryResult<ImageDigest> {
        let image = ImageReference::parse(reference)?;
        let url = self.manifest_url(&image);
        debug!(reference, url = %url, "resolving image digest");

        let mut response = self
            .head(&url, None)
            .send()
            .await
            .map_err(|e| unavailable(reference, e))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(BearerChallenge::parse);
            if let Some(challenge) = challenge {
                let token = self.fetch_token(&challenge, reference).await?;
                response = self
                    .head(&url, Some(&token))
                    .send()
                    .await
                    .map_err(|e| unavailable(reference, e))?;
            }
        }

        match response.status() {
            s if s.is_success() => {
                let header = response
                    .headers()
                    .get(DIGEST_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RegistryError::Unavailable {
                        reference: reference.to_string(),
                        reason: format!("response has no {DIGEST_HEADER} header"),
                    })?;
                header.parse::<ImageDigest>()
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound {
                reference: reference.to_string(),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Unauthorized {
                reference: reference.to_string(),
                reason: format!("registry returned {}", response.status()),
            }),
            s => Err(RegistryError::Unavailable {
                reference: reference.to_string(),
                reason: format!("registry returned {s}"),
            }),
        }
    }

    /// The builder pushed the image; confirm the registry serves that digest.
    async fn register(&self, image: &ImageReference, _build_args: &[String]) -> RegistryResult<()> {
        let expected = image
            .digest
            .as_ref()
            .ok_or_else(|| RegistryError::InvalidReference {
                reference: image.tagged(),
                reason: "cannot register an unresolved image".to_string(),
            })?;
        let reference = image.tagged();
        let actual = self.resolve_digest(&reference).await?;
        if &actual != expected {
            warn!(reference = %reference, %expected, %actual, "registry digest differs from build");
            return Err(RegistryError::Unavailable {
                reference,
                reason: format!("registry serves {actual}, build produced {expected}"),
            });
        }
        Ok(())
    }
}
