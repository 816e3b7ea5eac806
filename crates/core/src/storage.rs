//! Read-only view of the blob storage the decision engine writes into.
//!
//! Only listing is needed: the observer looks at container and blob
//! modification times and never downloads content.

use std::future::Future;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::AUTHORIZATION;
use sha2::Sha256;
use url::Url;

use crate::error::{MartError, Result};

const API_VERSION: &str = "2021-08-06";
const DEV_STORAGE_ACCOUNT: &str = "devstoreaccount1";
const DEV_STORAGE_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_STORAGE_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Block,
    Page,
    Append,
    Other,
}

impl BlobKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "BlockBlob" => BlobKind::Block,
            "PageBlob" => BlobKind::Page,
            "AppendBlob" => BlobKind::Append,
            _ => BlobKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub kind: BlobKind,
}

pub trait BlobStore: Send + Sync {
    /// Lists containers whose name starts with `prefix`.
    fn list_containers(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<ContainerInfo>>> + Send;

    /// Lists the blobs directly inside `container`.
    fn list_blobs(&self, container: &str) -> impl Future<Output = Result<Vec<BlobInfo>>> + Send;
}

/// Picks the most recently modified container. Later entries win ties.
pub fn latest_container(containers: &[ContainerInfo]) -> Option<&ContainerInfo> {
    containers.iter().fold(None, |best, candidate| match best {
        Some(current) if candidate.last_modified < current.last_modified => Some(current),
        _ => Some(candidate),
    })
}

/// Newest modification time among block blobs; other blob kinds are ignored.
pub fn latest_block_blob_time(blobs: &[BlobInfo]) -> Option<DateTime<Utc>> {
    blobs
        .iter()
        .filter(|b| b.kind == BlobKind::Block)
        .map(|b| b.last_modified)
        .max()
}

#[derive(Clone, PartialEq, Eq)]
pub enum StorageAuth {
    SharedKey { account: String, key: Vec<u8> },
    Sas(String),
}

impl std::fmt::Debug for StorageAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageAuth::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .finish_non_exhaustive(),
            StorageAuth::Sas(_) => f.write_str("Sas(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCredentials {
    pub blob_endpoint: Url,
    pub auth: StorageAuth,
}

/// Parses a `Key=Value;...` storage connection string.
///
/// Supports account keys, shared access signatures, explicit blob endpoints
/// and `UseDevelopmentStorage=true`.
pub fn parse_connection_string(raw: &str) -> Result<StorageCredentials> {
    let mut protocol = "https".to_string();
    let mut account = None;
    let mut account_key = None;
    let mut suffix = "core.windows.net".to_string();
    let mut blob_endpoint = None;
    let mut sas = None;
    let mut dev_storage = false;

    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            MartError::ConnectionString(format!("segment without '=': {part}"))
        })?;
        match key.trim() {
            "DefaultEndpointsProtocol" => protocol = value.to_string(),
            "AccountName" => account = Some(value.to_string()),
            "AccountKey" => account_key = Some(value.to_string()),
            "EndpointSuffix" => suffix = value.to_string(),
            "BlobEndpoint" => blob_endpoint = Some(value.to_string()),
            "SharedAccessSignature" => sas = Some(value.trim_start_matches('?').to_string()),
            "UseDevelopmentStorage" => dev_storage = value.eq_ignore_ascii_case("true"),
            other => tracing::debug!(key = other, "ignoring connection string key"),
        }
    }

    if dev_storage {
        let endpoint = Url::parse(DEV_STORAGE_ENDPOINT)
            .map_err(|e| MartError::ConnectionString(e.to_string()))?;
        let key = BASE64
            .decode(DEV_STORAGE_KEY)
            .map_err(|e| MartError::ConnectionString(e.to_string()))?;
        return Ok(StorageCredentials {
            blob_endpoint: endpoint,
            auth: StorageAuth::SharedKey {
                account: DEV_STORAGE_ACCOUNT.to_string(),
                key,
            },
        });
    }

    let endpoint = match (blob_endpoint, account.as_deref()) {
        (Some(endpoint), _) => endpoint,
        (None, Some(account)) => format!("{protocol}://{account}.blob.{suffix}"),
        (None, None) => {
            return Err(MartError::ConnectionString(
                "neither BlobEndpoint nor AccountName given".into(),
            ))
        }
    };
    let blob_endpoint =
        Url::parse(&endpoint).map_err(|e| MartError::ConnectionString(format!("{endpoint}: {e}")))?;

    let auth = match (account, account_key, sas) {
        (Some(account), Some(key), _) => {
            let key = BASE64
                .decode(key.trim())
                .map_err(|e| MartError::ConnectionString(format!("AccountKey: {e}")))?;
            StorageAuth::SharedKey { account, key }
        }
        (_, _, Some(sas)) => StorageAuth::Sas(sas),
        _ => {
            return Err(MartError::ConnectionString(
                "no AccountKey or SharedAccessSignature".into(),
            ))
        }
    };

    Ok(StorageCredentials {
        blob_endpoint,
        auth,
    })
}

/// Blob store client speaking the storage REST listing API.
#[derive(Clone)]
pub struct AzureBlobStore {
    http: reqwest::Client,
    creds: StorageCredentials,
}

impl AzureBlobStore {
    pub fn new(http: reqwest::Client, creds: StorageCredentials) -> Self {
        Self { http, creds }
    }

    pub fn from_connection_string(http: reqwest::Client, raw: &str) -> Result<Self> {
        Ok(Self::new(http, parse_connection_string(raw)?))
    }

    pub fn endpoint(&self) -> &Url {
        &self.creds.blob_endpoint
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.creds.blob_endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{path}"));
        match &self.creds.auth {
            StorageAuth::Sas(sas) => url.set_query(Some(sas)),
            StorageAuth::SharedKey { .. } => url.set_query(None),
        }
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        url
    }

    async fn get_listing(&self, url: Url) -> Result<String> {
        let mut req = self.http.get(url.clone()).header("x-ms-version", API_VERSION);
        if let StorageAuth::SharedKey { account, key } = &self.creds.auth {
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            let to_sign = string_to_sign(
                "GET",
                &[("x-ms-date", date.as_str()), ("x-ms-version", API_VERSION)],
                account,
                &url,
            );
            let signature = sign(key, &to_sign)?;
            req = req
                .header("x-ms-date", date)
                .header(AUTHORIZATION, format!("SharedKey {account}:{signature}"));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MartError::Storage(format!(
                "listing {} returned {status}: {}",
                url.path(),
                element_text(&body, "Message").unwrap_or(body)
            )));
        }
        Ok(resp.text().await?)
    }

    /// Follows `NextMarker` until the listing is exhausted.
    async fn list_all(&self, path: &str, base_params: &[(&str, &str)], item_tag: &str) -> Result<Vec<String>> {
        let mut items = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut params = base_params.to_vec();
            if let Some(m) = marker.as_deref() {
                params.push(("marker", m));
            }
            let body = self.get_listing(self.url(path, &params)).await?;
            items.extend(elements(&body, item_tag).into_iter().map(str::to_string));
            marker = element_text(&body, "NextMarker").filter(|m| !m.is_empty());
            if marker.is_none() {
                return Ok(items);
            }
        }
    }
}

impl BlobStore for AzureBlobStore {
    async fn list_containers(&self, prefix: &str) -> Result<Vec<ContainerInfo>> {
        let raw = self
            .list_all("", &[("comp", "list"), ("prefix", prefix)], "Container")
            .await?;
        raw.iter().map(String::as_str).map(parse_container).collect()
    }

    async fn list_blobs(&self, container: &str) -> Result<Vec<BlobInfo>> {
        let raw = self
            .list_all(container, &[("restype", "container"), ("comp", "list")], "Blob")
            .await?;
        raw.iter().map(String::as_str).map(parse_blob).collect()
    }
}

fn string_to_sign(method: &str, ms_headers: &[(&str, &str)], account: &str, url: &Url) -> String {
    let mut out = String::from(method);
    out.push('\n');
    // Content-Encoding through Range, all empty for a bodiless GET.
    out.push_str(&"\n".repeat(11));

    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .collect();
    headers.sort();
    for (k, v) in headers {
        out.push_str(&format!("{k}:{v}\n"));
    }

    out.push('/');
    out.push_str(account);
    out.push_str(url.path());

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect();
    params.sort();
    let mut merged: Vec<(String, Vec<String>)> = Vec::new();
    for (k, v) in params {
        match merged.last_mut() {
            Some((last, values)) if *last == k => values.push(v),
            _ => merged.push((k, vec![v])),
        }
    }
    for (k, values) in merged {
        out.push_str(&format!("\n{k}:{}", values.join(",")));
    }
    out
}

fn sign(key: &[u8], to_sign: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| MartError::Storage(format!("invalid account key: {e}")))?;
    mac.update(to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn parse_container(xml: &str) -> Result<ContainerInfo> {
    Ok(ContainerInfo {
        name: required(xml, "Name")?,
        last_modified: parse_http_date(&required(xml, "Last-Modified")?)?,
    })
}

fn parse_blob(xml: &str) -> Result<BlobInfo> {
    Ok(BlobInfo {
        name: required(xml, "Name")?,
        last_modified: parse_http_date(&required(xml, "Last-Modified")?)?,
        kind: element_text(xml, "BlobType")
            .map(|t| BlobKind::parse(&t))
            .unwrap_or(BlobKind::Other),
    })
}

fn required(xml: &str, tag: &str) -> Result<String> {
    element_text(xml, tag).ok_or_else(|| MartError::Storage(format!("listing entry without <{tag}>")))
}

fn parse_http_date(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| MartError::Storage(format!("bad Last-Modified '{raw}': {e}")))
}

/// Inner text of every `<tag>...</tag>` element, in document order.
///
/// The listing responses are flat enough that a tag scan suffices; nested
/// elements with the same name are not supported.
fn elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                out.push(&after[..end]);
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

fn element_text(xml: &str, tag: &str) -> Option<String> {
    elements(xml, tag).first().map(|raw| unescape(raw.trim()))
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
