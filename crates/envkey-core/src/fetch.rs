//! HTTP fetch client: failover endpoints, retries with exponential backoff,
//! disk-cache write-through and fallback, and the best-effort trusted-root
//! rotation acknowledgement.

use std::path::PathBuf;
use std::time::Duration;

use envkey_crypto::{sign_json_detached, Privkey, SignedData};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::defaults;
use crate::envkey::Envkey;
use crate::error::{Error, Result};
use crate::models::{EnvMap, FailoverResponse, FetchResponse};
use crate::parser::ParsedEnv;

/// Action type posted back after applying root pubkey replacements.
pub const UPDATE_TRUSTED_ROOT_ACTION_TYPE: &str =
    "envkey/api/ENVKEY_FETCH_UPDATE_TRUSTED_ROOT_PUBKEY";

/// Loggable type tag on the acknowledgement action.
pub const UPDATE_TRUSTED_ROOT_LOGGABLE_TYPE: &str = "authAction";

/// Caller-tunable fetch behavior.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub should_cache: bool,
    pub cache_dir: Option<PathBuf>,
    pub client_name: String,
    pub client_version: String,
    pub verbose: bool,
    pub timeout_seconds: f64,
    pub retries: u8,
    pub retry_backoff: f64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            should_cache: false,
            cache_dir: None,
            client_name: String::new(),
            client_version: String::new(),
            verbose: false,
            timeout_seconds: defaults::DEFAULT_TIMEOUT_SECONDS,
            retries: defaults::DEFAULT_RETRIES,
            retry_backoff: defaults::DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl FetchOptions {
    fn client_name(&self) -> &str {
        if self.client_name.is_empty() {
            defaults::DEFAULT_CLIENT_NAME
        } else {
            &self.client_name
        }
    }

    fn client_version(&self) -> &str {
        if self.client_version.is_empty() {
            env!("CARGO_PKG_VERSION")
        } else {
            &self.client_version
        }
    }
}

/// Fetch and decrypt the environment for an ENVKEY, returned as JSON.
pub async fn fetch(envkey: &str, options: FetchOptions) -> Result<String> {
    let env = fetch_map(envkey, options).await?;
    Ok(serde_json::to_string(&env)?)
}

/// Fetch and decrypt the environment for an ENVKEY.
pub async fn fetch_map(envkey: &str, options: FetchOptions) -> Result<EnvMap> {
    let parsed: Envkey = envkey.parse()?;
    let client = FetchClient::new(options)?;
    client.fetch_parsed(&parsed).await.map(|output| output.env)
}

/// The fetch client. Holds the HTTP connection pool and options; one value
/// serves any number of fetches.
pub struct FetchClient {
    client: Client,
    options: FetchOptions,
}

enum Body {
    Network(Vec<u8>),
    Cached(Vec<u8>),
}

impl FetchClient {
    pub fn new(options: FetchOptions) -> Result<Self> {
        let client = build_client(options.timeout_seconds, false)?;
        Ok(FetchClient { client, options })
    }

    /// Run the full pipeline for an already-split ENVKEY.
    pub async fn fetch_parsed(&self, envkey: &Envkey) -> Result<ParsedEnv> {
        let cache = if self.options.should_cache {
            match Cache::new(self.options.cache_dir.as_deref()) {
                Ok(cache) => Some(cache),
                Err(err) => {
                    // A broken cache dir shouldn't block a fetch.
                    warn!(error = %err, "cache unavailable");
                    None
                }
            }
        } else {
            None
        };

        let response = self.fetch_env(envkey, cache.as_ref()).await?;

        let parsed = match response.parse(&envkey.password).await {
            Ok(parsed) => parsed,
            Err(err) => {
                // The blob can't be trusted, so neither can the cache copy.
                if let Some(cache) = &cache {
                    cache.flush().await;
                    let _ = cache.delete(&envkey.id_part).await;
                }
                return Err(err);
            }
        };

        // Root was rotated: acknowledge, best-effort.
        if parsed.new_signed_trusted_root.is_some() && !parsed.replacement_ids.is_empty() {
            info!(
                replacements = parsed.replacement_ids.len(),
                "root pubkey replaced; posting new signed trusted root"
            );
            if let Err(err) = self
                .post_update_trusted_root(envkey, &response.org_id, &parsed)
                .await
            {
                debug!(error = %err, "trusted root acknowledgement failed; ignoring");
            }
        }

        if let Some(cache) = &cache {
            cache.flush().await;
        }

        Ok(parsed)
    }

    /// Fetch the response body, retrying whole failover passes with
    /// exponential backoff. `ENVKEY invalid` is never retried.
    async fn fetch_env(&self, envkey: &Envkey, cache: Option<&Cache>) -> Result<FetchResponse> {
        let mut attempt: u8 = 0;
        loop {
            match self.get_json(envkey, cache).await {
                Ok(response) => return Ok(response),
                Err(err @ Error::EnvkeyInvalid) => return Err(err),
                Err(err) => {
                    if attempt >= self.options.retries {
                        return Err(err);
                    }
                    if self.options.retry_backoff > 0.0 {
                        let backoff = self.options.retry_backoff
                            * 2f64.powf(f64::from(attempt) - 1.0);
                        if backoff > 0.0 {
                            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                        }
                    }
                    debug!(attempt = attempt + 1, "retrying fetch");
                    attempt += 1;
                }
            }
        }
    }

    /// One pass over the base endpoint and its failovers, with cache
    /// fallback when everything is unreachable.
    async fn get_json(&self, envkey: &Envkey, cache: Option<&Cache>) -> Result<FetchResponse> {
        let host = envkey.host_or_default();

        let mut last_err: Option<Error> = None;
        let mut success: Option<(u32, Vec<u8>)> = None;

        for endpoint in 0..=defaults::NUM_FAILOVERS {
            let url = fetch_url(host, endpoint);
            if self.options.verbose {
                info!(%url, "attempting to load encrypted config");
            }

            match self.get_body(&url, envkey, endpoint == 1).await {
                Ok((status, body)) => match status.as_u16() {
                    200 => {
                        success = Some((endpoint, body));
                        break;
                    }
                    401 | 404 => {
                        // Permission may have been revoked; the cached copy
                        // is no longer trustworthy either.
                        if let Some(cache) = cache {
                            let _ = cache.delete(&envkey.id_part).await;
                        }
                        return Err(Error::EnvkeyInvalid);
                    }
                    426 => return Err(Error::UpgradeRequired),
                    429 => return Err(Error::Throttled),
                    code => {
                        debug!(%url, code, "fetch endpoint failed");
                        last_err = Some(Error::Network(format!("response status: {code}")));
                    }
                },
                Err(err) => {
                    debug!(%url, error = %err, "fetch endpoint unreachable");
                    last_err = Some(err);
                }
            }
        }

        // A failover endpoint hands back a pre-signed url that holds the
        // actual payload.
        let body = match success {
            Some((0, body)) => Some(Body::Network(body)),
            Some((_, body)) => match self.follow_signed_url(&body).await {
                Ok(body) => Some(Body::Network(body)),
                Err(err) => {
                    last_err = Some(err);
                    None
                }
            },
            None => None,
        };

        let body = match body {
            Some(body) => body,
            None => {
                let network_err =
                    last_err.unwrap_or_else(|| Error::Network("no response".to_string()));
                match cache {
                    Some(cache) => {
                        let cached = cache.read(&envkey.id_part).await.map_err(|cache_err| {
                            Error::Network(format!("{network_err}\n{cache_err}"))
                        })?;
                        info!("loaded encrypted config from cache");
                        Body::Cached(cached)
                    }
                    None => return Err(network_err),
                }
            }
        };

        let (bytes, from_cache) = match &body {
            Body::Network(bytes) => (bytes, false),
            Body::Cached(bytes) => (bytes, true),
        };

        let response: FetchResponse = serde_json::from_slice(bytes)?;

        if !from_cache {
            if let Some(cache) = cache {
                // Write through in the background while decryption runs.
                cache.schedule_write(&envkey.id_part, bytes.clone());
            }
        }

        Ok(response)
    }

    fn build_get(
        &self,
        client: &Client,
        url: &str,
        envkey: &Envkey,
        in_region_failover: bool,
    ) -> reqwest::RequestBuilder {
        let mut request = client.get(url).query(&[
            (
                "fetchServiceVersion",
                defaults::FETCH_SERVICE_VERSION.to_string(),
            ),
            ("envkeyIdPart", envkey.id_part.clone()),
            ("clientName", self.options.client_name().to_string()),
            ("clientVersion", self.options.client_version().to_string()),
            ("clientOs", std::env::consts::OS.to_string()),
            ("clientArch", std::env::consts::ARCH.to_string()),
        ]);
        if in_region_failover {
            request = request.header("Failover", "in-region");
        }
        request
    }

    async fn get_body(
        &self,
        url: &str,
        envkey: &Envkey,
        in_region_failover: bool,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let request = self.build_get(&self.client, url, envkey, in_region_failover);

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if is_root_store_error(&err) => {
                // The system root store is unusable; fall back to the
                // embedded Mozilla bundle and try once more.
                debug!("system roots unavailable; retrying with embedded bundle");
                let fallback = build_client(self.options.timeout_seconds, true)?;
                self.build_get(&fallback, url, envkey, in_region_failover)
                    .send()
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body.to_vec()))
    }

    async fn follow_signed_url(&self, failover_body: &[u8]) -> Result<Vec<u8>> {
        let failover: FailoverResponse = serde_json::from_slice(failover_body)
            .map_err(|e| Error::Network(format!("error parsing failover response: {e}")))?;

        if self.options.verbose {
            info!(url = %failover.signed_url, "following pre-signed failover url");
        }

        let response = self.client.get(&failover.signed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!(
                "error fetching pre-signed failover url: response status: {status}"
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn post_update_trusted_root(
        &self,
        envkey: &Envkey,
        org_id: &str,
        parsed: &ParsedEnv,
    ) -> Result<()> {
        let signed_root = match &parsed.new_signed_trusted_root {
            Some(signed) => signed,
            None => return Ok(()),
        };

        let action = update_trusted_root_action(
            &envkey.id_part,
            org_id,
            &parsed.privkey,
            signed_root,
            &parsed.replacement_ids,
            self.options.client_name(),
            self.options.client_version(),
        )?;

        let url = format!("{}/action", base_url(envkey.host_or_default()));
        let response = self.client.post(&url).json(&action).send().await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "action response status: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTrustedRootAction {
    #[serde(rename = "type")]
    action_type: String,
    meta: ActionMeta,
    payload: UpdateTrustedRootPayload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionMeta {
    loggable_type: String,
    client: ActionMetaClient,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionMetaClient {
    client_name: String,
    client_version: String,
    client_os: String,
    client_arch: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTrustedRootPayload {
    signed_trusted_root: SignedData,
    replacement_ids: Vec<String>,
    envkey_id_part: String,
    org_id: String,
    signature: String,
}

fn update_trusted_root_action(
    envkey_id_part: &str,
    org_id: &str,
    privkey: &Privkey,
    signed_root: &SignedData,
    replacement_ids: &[String],
    client_name: &str,
    client_version: &str,
) -> Result<UpdateTrustedRootAction> {
    let to_sign = (
        envkey_id_part,
        org_id,
        replacement_ids,
        signed_root,
    );
    let signature =
        sign_json_detached(&to_sign, privkey).map_err(|e| Error::Serialization(e.to_string()))?;

    Ok(UpdateTrustedRootAction {
        action_type: UPDATE_TRUSTED_ROOT_ACTION_TYPE.to_string(),
        meta: ActionMeta {
            loggable_type: UPDATE_TRUSTED_ROOT_LOGGABLE_TYPE.to_string(),
            client: ActionMetaClient {
                client_name: client_name.to_string(),
                client_version: client_version.to_string(),
                client_os: std::env::consts::OS.to_string(),
                client_arch: std::env::consts::ARCH.to_string(),
            },
        },
        payload: UpdateTrustedRootPayload {
            signed_trusted_root: signed_root.clone(),
            replacement_ids: replacement_ids.to_vec(),
            envkey_id_part: envkey_id_part.to_string(),
            org_id: org_id.to_string(),
            signature,
        },
    })
}

fn build_client(timeout_seconds: f64, embedded_roots: bool) -> Result<Client> {
    let timeout = Duration::from_secs_f64(timeout_seconds);
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .use_rustls_tls()
        .tls_built_in_root_certs(embedded_roots)
        .build()
        .map_err(Error::from)
}

fn is_root_store_error(err: &reqwest::Error) -> bool {
    let message = err.to_string();
    message.contains("invalid peer certificate") || message.contains("UnknownIssuer")
}

/// Prefix the host with `https://` unless a scheme is already present
/// (host overrides may point at plain-http local servers).
fn base_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// The fetch URL for the nth endpoint: failovers insert `-2`, `-3` before
/// the host's first dot.
fn fetch_url(host: &str, endpoint: u32) -> String {
    let host = if endpoint > 0 {
        match host.find('.') {
            Some(dot) => format!("{}-{}{}", &host[..dot], endpoint + 1, &host[dot..]),
            None => host.to_string(),
        }
    } else {
        host.to_string()
    };
    format!("{}/fetch", base_url(&host))
}
