//! Minimal OCI distribution client: manifest and blob pull with digest
//! verification, monolithic blob push, manifest put, tag listing, and
//! bearer-token auth with a per-repository token cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use log::{error, trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::{
    OciSpecError,
    image::{Descriptor, Digest, DigestAlgorithm, ImageIndex, ImageManifest},
};
use reqwest::{Method, Response, StatusCode, header, header::HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::credentials::{
    Credentials, KEY_ACCESS_TOKEN, KEY_PASSWORD, KEY_REFRESH_TOKEN, KEY_USERNAME,
};

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
pub const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
const DOCKER_IMAGE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_IMAGE_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

pub const ACCEPTED_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";
pub const ACCEPTED_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    OciSpecError(#[from] OciSpecError),
    DigestMismatch,
    SizeMismatch,
    BadDigest,
    BadDockerContentDigest,
    Write,
    InvalidAuth,
    NoUploadLocation,
    TokenRetrieval,
    BadContentType(String),
    DigestAlgorithmNotHandled(DigestAlgorithm),
    StatusNotOk(StatusCode),
    BadRegistryUrl(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where a registry lives: scheme plus authority, no path. Derived from the
/// `baseUrl` of a repository specification; any path component of the base
/// URL belongs to the repository name, not the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    pub scheme: String,
    pub authority: String,
}

impl Registry {
    /// Split `scheme://host[:port][/path]` into the registry and the leading
    /// repository path (without slashes around it).
    pub fn parse_base_url(base_url: &str) -> Result<(Registry, String), Error> {
        let (scheme, rest) = base_url
            .split_once("://")
            .unwrap_or(("https", base_url));
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p.trim_matches('/')),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(Error::BadRegistryUrl(base_url.to_string()));
        }
        Ok((
            Registry {
                scheme: scheme.to_string(),
                authority: authority.to_string(),
            },
            path.to_string(),
        ))
    }

    fn url(&self, tail: &str) -> String {
        format!("{}://{}/v2/{}", self.scheme, self.authority, tail)
    }
}

#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenCacheKey(String);

impl TokenCacheKey {
    fn new(registry: &Registry, repo: &str) -> TokenCacheKey {
        TokenCacheKey(format!("{}/{}", registry.authority, repo))
    }
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenCacheKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenCacheKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

#[derive(Debug, Clone)]
pub enum Auth {
    None,
    UserPass(String, String),
    RefreshToken(String),
    AccessToken(String),
}

impl Auth {
    pub fn from_credentials(credentials: &Credentials) -> Auth {
        if let Some(token) = credentials.get(KEY_ACCESS_TOKEN) {
            return Auth::AccessToken(token.clone());
        }
        if let Some(token) = credentials.get(KEY_REFRESH_TOKEN) {
            return Auth::RefreshToken(token.clone());
        }
        match (credentials.get(KEY_USERNAME), credentials.get(KEY_PASSWORD)) {
            (Some(u), Some(p)) => Auth::UserPass(u.clone(), p.clone()),
            _ => Auth::None,
        }
    }
}

pub type AuthMap = BTreeMap<String, Auth>;

// the whole thing is Clone with interior mutability so that it can be shared
// across repositories hanging off one provider
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    token_cache: Cache<TokenCacheKey, Token>,
    auth_store: Arc<ArcSwap<AuthMap>>,
}

impl Client {
    pub fn new() -> Result<Client, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .https_only(true)
            .build()?;

        let token_cache = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenCacheKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();

        Ok(Client {
            client,
            token_cache,
            auth_store: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
        })
    }

    /// Replace the whole auth table (keyed by registry authority).
    pub fn set_auth(&self, auth: AuthMap) {
        self.auth_store.store(auth.into());
    }

    /// Add or overwrite the auth entry for one registry.
    pub fn add_auth(&self, authority: &str, auth: Auth) {
        let mut map: AuthMap = (**self.auth_store.load()).clone();
        map.insert(authority.to_string(), auth);
        self.auth_store.store(map.into());
    }

    /// GET a manifest by tag or digest. `Ok(None)` is a clean 404. The
    /// returned digest comes from the reference itself or the
    /// docker-content-digest header, computed from the body as a last resort.
    pub async fn get_manifest(
        &self,
        registry: &Registry,
        repo: &str,
        reference: &str,
        accept: &str,
    ) -> Result<Option<(String, Digest, Bytes)>, Error> {
        let url = registry.url(&format!("{repo}/manifests/{reference}"));
        trace!("GET {url}");
        let request = self
            .client
            .request(Method::GET, &url)
            .header(header::ACCEPT, accept);
        let response = self.auth_and_retry(registry, repo, Scope::Pull, request).await?;

        match response.status() {
            StatusCode::OK => {
                let digest = if reference.contains(':') {
                    Some(reference.parse().map_err(|_| Error::BadDigest)?)
                } else {
                    get_docker_content_digest(&response)?
                };
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .map(|x| x.to_str().unwrap_or("").to_string())
                    .unwrap_or_default();
                let data = response.bytes().await?;
                check_data_matches_digest(digest.as_ref(), &data)?;
                let digest = digest.unwrap_or_else(|| digest_from_data(&data));
                Ok(Some((content_type, digest, data)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    pub async fn get_index(
        &self,
        registry: &Registry,
        repo: &str,
        reference: &str,
    ) -> Result<Option<(Digest, ImageIndex)>, Error> {
        match self
            .get_manifest(registry, repo, reference, ACCEPTED_IMAGE_INDEX)
            .await?
        {
            Some((content_type, digest, data)) => {
                if content_type != OCI_IMAGE_INDEX_V1
                    && content_type != DOCKER_IMAGE_MANIFEST_LIST_V2
                {
                    return Err(Error::BadContentType(content_type));
                }
                let index = ImageIndex::from_reader(std::io::Cursor::new(&data))?;
                Ok(Some((digest, index)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_image_manifest(
        &self,
        registry: &Registry,
        repo: &str,
        reference: &str,
    ) -> Result<Option<(Digest, ImageManifest)>, Error> {
        match self
            .get_manifest(registry, repo, reference, ACCEPTED_IMAGE_MANIFEST)
            .await?
        {
            Some((content_type, digest, data)) => {
                if content_type != OCI_IMAGE_MANIFEST_V1 && content_type != DOCKER_IMAGE_MANIFEST_V2
                {
                    return Err(Error::BadContentType(content_type));
                }
                let manifest = ImageManifest::from_reader(std::io::Cursor::new(&data))?;
                Ok(Some((digest, manifest)))
            }
            None => Ok(None),
        }
    }

    /// Stream a blob into `writer`, verifying size and digest incrementally.
    pub async fn get_blob(
        &self,
        registry: &Registry,
        repo: &str,
        descriptor: &Descriptor,
        writer: &mut (impl AsyncWrite + std::marker::Unpin),
    ) -> Result<Option<usize>, Error> {
        let mut response = match self.request_blob(registry, repo, descriptor.digest()).await? {
            Some(r) => r,
            None => return Ok(None),
        };

        let mut len = 0;
        match descriptor.digest().algorithm() {
            DigestAlgorithm::Sha256 => {
                use sha2::Digest;
                let mut hasher = Sha256::new();
                while let Some(chunk) = response.chunk().await? {
                    len += chunk.len();
                    hasher.update(&chunk);
                    writer.write_all(&chunk).await.map_err(|_| Error::Write)?;
                }
                writer.flush().await.map_err(|_| Error::Write)?;
                if descriptor.size() != len as u64 {
                    return Err(Error::SizeMismatch);
                }
                if hex::encode(hasher.finalize()) != descriptor.digest().digest() {
                    return Err(Error::DigestMismatch);
                }
            }
            algo => {
                error!("blob algo not handled {}", algo);
                return Err(Error::DigestAlgorithmNotHandled(algo.clone()));
            }
        }
        Ok(Some(len))
    }

    pub async fn get_blob_bytes(
        &self,
        registry: &Registry,
        repo: &str,
        descriptor: &Descriptor,
    ) -> Result<Option<Bytes>, Error> {
        let response = match self.request_blob(registry, repo, descriptor.digest()).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let data = response.bytes().await?;
        check_data_matches_descriptor(descriptor, &data)?;
        Ok(Some(data))
    }

    /// `Some(size)` when the blob exists (size from content-length, 0 when
    /// the registry doesn't send one), `None` on a clean 404.
    pub async fn head_blob(
        &self,
        registry: &Registry,
        repo: &str,
        digest: &Digest,
    ) -> Result<Option<u64>, Error> {
        let url = registry.url(&format!("{repo}/blobs/{digest}"));
        trace!("HEAD {url}");
        let request = self.client.request(Method::HEAD, &url);
        let response = self.auth_and_retry(registry, repo, Scope::Pull, request).await?;
        match response.status() {
            StatusCode::OK => {
                let size = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Ok(Some(size))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    /// Monolithic upload: POST an upload session, PUT the bytes with the
    /// digest query parameter. Skips the upload when the blob already exists.
    pub async fn push_blob(
        &self,
        registry: &Registry,
        repo: &str,
        digest: &Digest,
        data: Bytes,
    ) -> Result<(), Error> {
        if self.head_blob(registry, repo, digest).await?.is_some() {
            trace!("blob {digest} already present in {repo}");
            return Ok(());
        }

        let url = registry.url(&format!("{repo}/blobs/uploads/"));
        trace!("POST {url}");
        let request = self.client.request(Method::POST, &url);
        let response = self.auth_and_retry(registry, repo, Scope::Push, request).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(status_not_ok(response).await);
        }
        let location = upload_location(registry, &response)?;

        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{sep}digest={digest}");
        trace!("PUT {put_url}");
        let request = self
            .client
            .request(Method::PUT, &put_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, data.len())
            .body(data);
        let response = self.auth_and_retry(registry, repo, Scope::Push, request).await?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            _ => Err(status_not_ok(response).await),
        }
    }

    /// PUT a manifest under a tag or digest, returning the digest the
    /// registry acknowledged (or the computed one when the header is absent).
    pub async fn put_manifest(
        &self,
        registry: &Registry,
        repo: &str,
        reference: &str,
        media_type: &str,
        data: Bytes,
    ) -> Result<Digest, Error> {
        let url = registry.url(&format!("{repo}/manifests/{reference}"));
        trace!("PUT {url}");
        let computed = digest_from_data(&data);
        let request = self
            .client
            .request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, media_type)
            .body(data);
        let response = self.auth_and_retry(registry, repo, Scope::Push, request).await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                Ok(get_docker_content_digest(&response)?.unwrap_or(computed))
            }
            _ => Err(status_not_ok(response).await),
        }
    }

    /// All tags of a repository, paginated. A 404 means the repository does
    /// not exist yet, which callers treat as no versions.
    pub async fn list_tags(&self, registry: &Registry, repo: &str) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        const PAGE: usize = 100;
        let mut all = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let mut url = registry.url(&format!("{repo}/tags/list?n={PAGE}"));
            if let Some(last) = &last {
                url.push_str(&format!("&last={last}"));
            }
            trace!("GET {url}");
            let request = self.client.request(Method::GET, &url);
            let response = self.auth_and_retry(registry, repo, Scope::Pull, request).await?;
            match response.status() {
                StatusCode::OK => {
                    let page: TagList = response.json().await?;
                    let tags = page.tags.unwrap_or_default();
                    let n = tags.len();
                    all.extend(tags);
                    if n < PAGE {
                        return Ok(all);
                    }
                    last = all.last().cloned();
                }
                StatusCode::NOT_FOUND => return Ok(all),
                _ => return Err(status_not_ok(response).await),
            }
        }
    }

    async fn request_blob(
        &self,
        registry: &Registry,
        repo: &str,
        digest: &Digest,
    ) -> Result<Option<Response>, Error> {
        let url = registry.url(&format!("{repo}/blobs/{digest}"));
        trace!("GET {url}");
        let request = self.client.request(Method::GET, &url);
        let response = self.auth_and_retry(registry, repo, Scope::Pull, request).await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    // send the request with whatever token is cached; on 401, parse
    // www-authenticate, fetch a token for the realm+service and retry once
    async fn auth_and_retry(
        &self,
        registry: &Registry,
        repo: &str,
        scope: Scope,
        mut req: reqwest::RequestBuilder,
    ) -> Result<Response, Error> {
        // requests are retried at most once, so cloning up front is fine;
        // bodies here are Bytes which clone cheaply
        let req_copy = req.try_clone().ok_or(Error::Write)?;

        if let Some(token) = self.token_cache.get(&TokenCacheKey::new(registry, repo)).await {
            req = req.bearer_auth(token.token);
        } else if let Auth::AccessToken(token) =
            auth_for(&self.auth_store.load(), &registry.authority)
        {
            req = req.bearer_auth(token);
        }

        let res = req.send().await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let www_auth = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_www_authenticate_bearer_header)
            .ok_or_else(|| {
                error!(
                    "got 401 but no usable www-authenticate header {:?}",
                    res.headers().get(header::WWW_AUTHENTICATE)
                );
                Error::StatusNotOk(StatusCode::UNAUTHORIZED)
            })?;

        let token = self
            .get_token_for(registry, repo, scope, &www_auth)
            .await?
            .ok_or(Error::StatusNotOk(StatusCode::UNAUTHORIZED))?;

        Ok(req_copy.bearer_auth(token.token).send().await?)
    }

    async fn get_token_for(
        &self,
        registry: &Registry,
        repo: &str,
        scope: Scope,
        www_auth: &WwwAuthenticateBearer<'_>,
    ) -> Result<Option<Token>, Error> {
        let auth = auth_for(&self.auth_store.load(), &registry.authority);
        let entry = self
            .token_cache
            .entry(TokenCacheKey::new(registry, repo))
            .or_try_insert_with(retrieve_token(
                self.client.clone(),
                repo,
                scope,
                www_auth,
                auth,
            ))
            .await
            .map_err(|e| {
                error!("error retrieving token {:?}", e);
                Error::TokenRetrieval
            })?;
        if entry.is_fresh() {
            trace!("got new token for {}", entry.key().0);
        }
        Ok(Some(entry.into_value()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scope {
    Pull,
    Push,
}

impl Scope {
    fn actions(self) -> &'static str {
        match self {
            Scope::Pull => "pull",
            Scope::Push => "pull,push",
        }
    }
}

fn auth_for(map: &AuthMap, authority: &str) -> Auth {
    map.get(authority).cloned().unwrap_or(Auth::None)
}

async fn retrieve_token(
    client: reqwest::Client,
    repo: &str,
    scope: Scope,
    www_auth: &WwwAuthenticateBearer<'_>,
    auth: Auth,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct JsonToken {
        token: Option<String>,
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    let scope = format!("repository:{}:{}", repo, scope.actions());
    let mut request = client
        .request(Method::GET, www_auth.realm)
        .query(&[("scope", scope.as_str()), ("service", www_auth.service)]);

    request = match &auth {
        Auth::None => request, // anonymous tokens work for public repos
        Auth::UserPass(user, pass) => request.basic_auth(user, Some(pass)),
        Auth::RefreshToken(token) => request.query(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", token.as_str()),
        ]),
        Auth::AccessToken(_) => return Err(Error::InvalidAuth),
    };

    let token: JsonToken = request.send().await?.json().await?;
    // the distribution token docs give 60 seconds as the default lifetime
    let expires_in = Duration::from_secs(token.expires_in.unwrap_or(60));
    let token = token
        .token
        .or(token.access_token)
        .ok_or(Error::TokenRetrieval)?;
    Ok(Token { token, expires_in })
}

async fn status_not_ok(res: Response) -> Error {
    let status = res.status();
    if log::log_enabled!(log::Level::Trace) {
        match res.text().await {
            Ok(body) => trace!("status={}, body={}", status, body),
            Err(e) => trace!("unhandled error getting body, status={status}, error={e:?}"),
        }
    }
    Error::StatusNotOk(status)
}

fn upload_location(registry: &Registry, response: &Response) -> Result<String, Error> {
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::NoUploadLocation)?;
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(location.to_string())
    } else {
        // relative location, same origin
        Ok(format!(
            "{}://{}{}",
            registry.scheme, registry.authority, location
        ))
    }
}

pub fn digest_from_data(x: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest;
    use std::str::FromStr;
    oci_spec::image::Sha256Digest::from_str(&hex::encode(Sha256::digest(x)))
        .unwrap()
        .into()
}

fn get_docker_content_digest(response: &Response) -> Result<Option<Digest>, Error> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|header_value| -> Result<Digest, Error> {
            header_value
                .to_str()
                .map_err(|_| Error::BadDockerContentDigest)?
                .parse()
                .map_err(|_| Error::BadDockerContentDigest)
        })
        .transpose()
}

pub fn check_data_matches_descriptor(expected: &Descriptor, data: &[u8]) -> Result<(), Error> {
    if expected.size() != data.len() as u64 {
        Err(Error::SizeMismatch)
    } else if !data_matches_digest(expected.digest(), data)? {
        Err(Error::DigestMismatch)
    } else {
        Ok(())
    }
}

fn check_data_matches_digest(expected: Option<&Digest>, data: &[u8]) -> Result<(), Error> {
    match expected {
        Some(expected) if !data_matches_digest(expected, data)? => Err(Error::DigestMismatch),
        _ => Ok(()),
    }
}

fn data_matches_digest(expected: &Digest, data: &[u8]) -> Result<bool, Error> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            use sha2::Digest;
            Ok(hex::encode(Sha256::digest(data)) == expected.digest())
        }
        algo => {
            warn!("digest algo not handled {}", algo);
            Err(Error::DigestAlgorithmNotHandled(algo.clone()))
        }
    }
}

#[derive(Default)]
struct WwwAuthenticateBearerBuilder<'a> {
    realm: Option<&'a str>,
    service: Option<&'a str>,
}

struct WwwAuthenticateBearer<'a> {
    realm: &'a str,
    service: &'a str,
}

fn parse_www_authenticate_bearer_header(
    input: &HeaderValue,
) -> Option<WwwAuthenticateBearer<'_>> {
    parse_www_authenticate_bearer_str(input.to_str().ok()?)
}

fn parse_www_authenticate_bearer_str(input: &str) -> Option<WwwAuthenticateBearer<'_>> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, matches) = parser(input).ok()?;
    let mut ret = WwwAuthenticateBearerBuilder::default();
    for (k, v) in matches.into_iter() {
        match k {
            "realm" => ret.realm = Some(v),
            "service" => ret.service = Some(v),
            _ => {}
        }
    }
    Some(WwwAuthenticateBearer {
        realm: ret.realm?,
        service: ret.service?,
    })
}
