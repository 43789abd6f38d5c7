//! Azure Blob Storage backend.
//!
//! Talks to one Azure container through the Blob REST API using `reqwest`.
//! Uploads map directly onto block blob primitives:
//!   `stage_block()`       -> Put Block on the final blob (no temp objects)
//!   `commit_block_list()` -> Put Block List
//!   `read()`              -> Get Blob with `x-ms-range`, streamed
//!
//! Uncommitted blocks are garbage-collected by Azure after 7 days, so an
//! abandoned upload needs no cleanup here.
//!
//! Credentials are resolved from, in order:
//!   - `storage.azure.sas_token` in the config file
//!   - `AZURE_STORAGE_KEY` environment variable (Shared Key auth)
//!   - `AZURE_STORAGE_CONNECTION_STRING` environment variable
//!   - `AZURE_STORAGE_SAS_TOKEN` environment variable (SAS token auth)

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use super::backend::{ByteStream, StorageBackend};
use crate::config::AzureStorageConfig;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Encode everything except unreserved characters and '/' (Azure expects
/// '/' unencoded in blob paths).
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Query values (block ids are base64 and may contain `+`, `/`, `=`).
const AZURE_QUERY_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Backend that stores objects as block blobs in one Azure container.
pub struct AzureBlobBackend {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    /// The remote Azure container name.
    container: String,
    /// Azure storage account name.
    account: String,
    /// Key prefix for all blobs in the container.
    prefix: String,
    /// The base URL for the Azure Blob service endpoint.
    base_url: String,
    /// Authentication method.
    auth: AzureAuth,
}

/// Azure authentication method.
enum AzureAuth {
    /// Shared Key authentication using the storage account key.
    SharedKey { key_bytes: Vec<u8> },
    /// SAS token authentication (appended as query parameter).
    SasToken { token: String },
}

/// Body of a write request.
struct Payload {
    data: Bytes,
    content_type: &'static str,
    content_md5: Option<String>,
}

impl AzureBlobBackend {
    /// Create a new Azure backend for the configured container.
    pub fn new(config: &AzureStorageConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let base_url = if config.endpoint.is_empty() {
            format!("https://{}.blob.core.windows.net", config.account)
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };

        let auth = if config.sas_token.is_empty() {
            Self::resolve_auth()?
        } else {
            AzureAuth::SasToken {
                token: config.sas_token.trim_start_matches('?').to_string(),
            }
        };

        info!(
            "Azure blob backend initialized: container={} account={} prefix='{}'",
            config.container, config.account, config.prefix
        );

        Ok(Self {
            client,
            container: config.container.clone(),
            account: config.account.clone(),
            prefix: config.prefix.clone(),
            base_url,
            auth,
        })
    }

    /// Resolve Azure authentication from environment variables.
    fn resolve_auth() -> anyhow::Result<AzureAuth> {
        if let Ok(key) = std::env::var("AZURE_STORAGE_KEY") {
            let key_bytes = BASE64_STANDARD.decode(&key).map_err(|e| {
                anyhow::anyhow!("Invalid AZURE_STORAGE_KEY (not valid base64): {}", e)
            })?;
            return Ok(AzureAuth::SharedKey { key_bytes });
        }

        if let Ok(conn_str) = std::env::var("AZURE_STORAGE_CONNECTION_STRING") {
            for part in conn_str.split(';') {
                if let Some(key_val) = part.strip_prefix("AccountKey=") {
                    let key_bytes = BASE64_STANDARD.decode(key_val).map_err(|e| {
                        anyhow::anyhow!("Invalid AccountKey in connection string: {}", e)
                    })?;
                    return Ok(AzureAuth::SharedKey { key_bytes });
                }
            }
        }

        if let Ok(sas) = std::env::var("AZURE_STORAGE_SAS_TOKEN") {
            return Ok(AzureAuth::SasToken {
                token: sas.trim_start_matches('?').to_string(),
            });
        }

        Err(anyhow::anyhow!(
            "No Azure credentials found. Set storage.azure.sas_token, AZURE_STORAGE_KEY, \
             AZURE_STORAGE_CONNECTION_STRING, or AZURE_STORAGE_SAS_TOKEN."
        ))
    }

    /// Map a storage key to the blob name inside the container.
    fn blob_name(&self, storage_key: &str) -> String {
        format!("{}{}", self.prefix, storage_key)
    }

    /// Base64 MD5 digest, as sent in `Content-MD5`.
    fn content_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        BASE64_STANDARD.encode(hasher.finalize())
    }

    /// Build the full URL for a blob operation, including the query.
    fn blob_url(&self, blob_name: &str, query: &[(&str, &str)]) -> String {
        let encoded_blob =
            percent_encoding::utf8_percent_encode(blob_name, &AZURE_BLOB_ENCODE_SET).to_string();
        let mut url = format!("{}/{}/{}", self.base_url, self.container, encoded_blob);

        let mut pairs: Vec<String> = query
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    k,
                    percent_encoding::utf8_percent_encode(v, &AZURE_QUERY_ENCODE_SET)
                )
            })
            .collect();
        if let AzureAuth::SasToken { token } = &self.auth {
            pairs.push(token.clone());
        }
        if !pairs.is_empty() {
            url.push('?');
            url.push_str(&pairs.join("&"));
        }
        url
    }

    /// Sign a request using Azure Shared Key authentication and return
    /// the Authorization header value.
    ///
    /// The string-to-sign format:
    /// ```text
    /// VERB\n
    /// Content-Encoding\n
    /// Content-Language\n
    /// Content-Length\n
    /// Content-MD5\n
    /// Content-Type\n
    /// Date\n
    /// If-Modified-Since\n
    /// If-Match\n
    /// If-None-Match\n
    /// If-Unmodified-Since\n
    /// Range\n
    /// CanonicalizedHeaders\n
    /// CanonicalizedResource
    /// ```
    #[allow(clippy::too_many_arguments)]
    fn sign_request(
        &self,
        method: &str,
        blob_name: &str,
        content_length: Option<usize>,
        content_md5: &str,
        content_type: &str,
        date: &str,
        extra_headers: &[(String, String)],
        query_params: &[(&str, &str)],
    ) -> anyhow::Result<String> {
        let key_bytes = match &self.auth {
            AzureAuth::SharedKey { key_bytes } => key_bytes,
            AzureAuth::SasToken { .. } => {
                return Err(anyhow::anyhow!("Cannot sign with SAS token auth"));
            }
        };

        // Content-Length: empty for 0 or if not provided (GET/DELETE/HEAD).
        let content_length_str = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        for (k, v) in extra_headers {
            let lk = k.to_lowercase();
            if lk.starts_with("x-ms-") && lk != "x-ms-date" && lk != "x-ms-version" {
                ms_headers.push((lk, v.clone()));
            }
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonicalized_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        // The canonicalized resource uses the un-encoded blob name and
        // un-encoded query values.
        let mut canonicalized_resource =
            format!("/{}/{}/{}", self.account, self.container, blob_name);
        let mut sorted_params = query_params.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in &sorted_params {
            canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
        }

        let string_to_sign = format!(
            "{}\n\n\n{}\n{}\n{}\n\n\n\n\n\n\n{}\n{}",
            method,
            content_length_str,
            content_md5,
            content_type,
            canonicalized_headers,
            canonicalized_resource
        );

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(key_bytes)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(std::time::SystemTime::now())
    }

    /// Map an Azure HTTP error to an anyhow error with context.
    fn map_azure_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow::anyhow!("Azure {}: HTTP {} - {}", context, status, body)
    }

    /// Send one signed request and return the raw response.
    async fn send(
        &self,
        method: Method,
        blob_name: &str,
        query: &[(&str, &str)],
        extra_headers: Vec<(String, String)>,
        payload: Option<Payload>,
    ) -> anyhow::Result<reqwest::Response> {
        let url = self.blob_url(blob_name, query);
        let date = Self::rfc1123_date();

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION);
        for (k, v) in &extra_headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let (content_length, content_md5, content_type) = match &payload {
            Some(p) => (
                Some(p.data.len()),
                p.content_md5.clone().unwrap_or_default(),
                p.content_type,
            ),
            None => (None, String::new(), ""),
        };

        if let AzureAuth::SharedKey { .. } = &self.auth {
            let auth_header = self.sign_request(
                method.as_str(),
                blob_name,
                content_length,
                &content_md5,
                content_type,
                &date,
                &extra_headers,
                query,
            )?;
            req = req.header("Authorization", auth_header);
        }

        if let Some(p) = payload {
            req = req.header("Content-Type", p.content_type);
            if let Some(md5) = p.content_md5 {
                req = req.header("Content-MD5", md5);
            }
            req = req.body(p.data);
        }

        req.send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure {} request failed: {}", method, e))
    }

    /// Fail with the response body as context unless the status is 2xx.
    async fn expect_success(context: &str, resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Self::map_azure_error(context, status, &body))
    }
}

/// Build the XML body for Put Block List.
fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<BlockList>\n");
    for id in block_ids {
        xml.push_str(&format!("  <Latest>{}</Latest>\n", id));
    }
    xml.push_str("</BlockList>");
    xml
}

impl StorageBackend for AzureBlobBackend {
    fn stage_block(
        &self,
        storage_key: &str,
        block_id: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        let block_id = block_id.to_string();
        Box::pin(async move {
            let blob_name = self.blob_name(&storage_key);
            let payload = Payload {
                content_md5: Some(Self::content_md5(&data)),
                data,
                content_type: "application/octet-stream",
            };
            let resp = self
                .send(
                    Method::PUT,
                    &blob_name,
                    &[("comp", "block"), ("blockid", block_id.as_str())],
                    Vec::new(),
                    Some(payload),
                )
                .await?;
            Self::expect_success("put_block", resp).await?;
            debug!("Azure staged block {} on {}", block_id, blob_name);
            Ok(())
        })
    }

    fn commit_block_list(
        &self,
        storage_key: &str,
        block_ids: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        let xml = block_list_xml(block_ids);
        let count = block_ids.len();
        Box::pin(async move {
            let blob_name = self.blob_name(&storage_key);
            let payload = Payload {
                data: Bytes::from(xml),
                content_type: "application/xml",
                content_md5: None,
            };
            let resp = self
                .send(
                    Method::PUT,
                    &blob_name,
                    &[("comp", "blocklist")],
                    Vec::new(),
                    Some(payload),
                )
                .await?;
            Self::expect_success("put_block_list", resp).await?;
            debug!("Azure committed {} blocks to {}", count, blob_name);
            Ok(())
        })
    }

    fn read(
        &self,
        storage_key: &str,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ByteStream>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            let blob_name = self.blob_name(&storage_key);
            let last = offset + length.saturating_sub(1);
            let headers = vec![("x-ms-range".to_string(), format!("bytes={offset}-{last}"))];
            let resp = self
                .send(Method::GET, &blob_name, &[], headers, None)
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                anyhow::bail!("Object not found at storage key: {}", blob_name);
            }
            let resp = Self::expect_success("get_blob", resp).await?;
            let stream = resp
                .bytes_stream()
                .map_err(|e| anyhow::anyhow!("Azure read interrupted: {}", e))
                .boxed();
            Ok(stream)
        })
    }

    fn delete(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            let blob_name = self.blob_name(&storage_key);
            let resp = self
                .send(Method::DELETE, &blob_name, &[], Vec::new(), None)
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            Self::expect_success("delete", resp).await?;
            Ok(())
        })
    }

    fn size(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            let blob_name = self.blob_name(&storage_key);
            let resp = self
                .send(Method::HEAD, &blob_name, &[], Vec::new(), None)
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let resp = Self::expect_success("get_blob_properties", resp).await?;
            let len = resp
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| anyhow::anyhow!("Azure HEAD {} returned no Content-Length", blob_name))?;
            Ok(Some(len))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend(auth: AzureAuth) -> AzureBlobBackend {
        AzureBlobBackend {
            client: reqwest::Client::new(),
            container: "uploads".to_string(),
            account: "acct".to_string(),
            prefix: "cs/".to_string(),
            base_url: "https://acct.blob.core.windows.net".to_string(),
            auth,
        }
    }

    fn shared_key() -> AzureAuth {
        AzureAuth::SharedKey {
            key_bytes: b"0123456789abcdef".to_vec(),
        }
    }

    #[test]
    fn test_blob_name_mapping() {
        let backend = test_backend(shared_key());
        assert_eq!(backend.blob_name("alice/report.pdf"), "cs/alice/report.pdf");
    }

    #[test]
    fn test_blob_url_encodes_name_but_not_slashes() {
        let backend = test_backend(shared_key());
        assert_eq!(
            backend.blob_url("cs/alice/my file#1.txt", &[]),
            "https://acct.blob.core.windows.net/uploads/cs/alice/my%20file%231.txt"
        );
    }

    #[test]
    fn test_blob_url_encodes_block_id() {
        let backend = test_backend(shared_key());
        let url = backend.blob_url("cs/a", &[("comp", "block"), ("blockid", "ab+/c==")]);
        assert!(url.ends_with("?comp=block&blockid=ab%2B%2Fc%3D%3D"), "{url}");
    }

    #[test]
    fn test_sas_token_appended() {
        let backend = test_backend(AzureAuth::SasToken {
            token: "sv=2023&sig=xyz".to_string(),
        });
        assert_eq!(
            backend.blob_url("cs/a", &[]),
            "https://acct.blob.core.windows.net/uploads/cs/a?sv=2023&sig=xyz"
        );
        assert!(backend
            .sign_request("GET", "cs/a", None, "", "", "date", &[], &[])
            .is_err());
    }

    #[test]
    fn test_sign_request_is_deterministic() {
        let backend = test_backend(shared_key());
        let date = "Mon, 01 Jan 2024 00:00:00 GMT";
        let a = backend
            .sign_request(
                "PUT",
                "cs/a",
                Some(5),
                "XUFAKrxLKna5cZ2REBfFkg==",
                "application/octet-stream",
                date,
                &[],
                &[("comp", "block"), ("blockid", "AA==")],
            )
            .unwrap();
        let b = backend
            .sign_request(
                "PUT",
                "cs/a",
                Some(5),
                "XUFAKrxLKna5cZ2REBfFkg==",
                "application/octet-stream",
                date,
                &[],
                &[("blockid", "AA=="), ("comp", "block")],
            )
            .unwrap();
        assert!(a.starts_with("SharedKey acct:"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_covers_md5_and_range() {
        let backend = test_backend(shared_key());
        let date = "Mon, 01 Jan 2024 00:00:00 GMT";
        let base = backend
            .sign_request("PUT", "cs/a", Some(5), "md5-a", "t", date, &[], &[])
            .unwrap();
        let other_md5 = backend
            .sign_request("PUT", "cs/a", Some(5), "md5-b", "t", date, &[], &[])
            .unwrap();
        assert_ne!(base, other_md5);

        let range = |r: &str| {
            backend
                .sign_request(
                    "GET",
                    "cs/a",
                    None,
                    "",
                    "",
                    date,
                    &[("x-ms-range".to_string(), r.to_string())],
                    &[],
                )
                .unwrap()
        };
        assert_ne!(range("bytes=0-9"), range("bytes=10-19"));
    }

    #[test]
    fn test_content_md5_of_hello() {
        assert_eq!(
            AzureBlobBackend::content_md5(b"hello"),
            "XUFAKrxLKna5cZ2REBfFkg=="
        );
    }

    #[test]
    fn test_block_list_xml_preserves_order() {
        let xml = block_list_xml(&["Yg==".to_string(), "YQ==".to_string()]);
        let b = xml.find("Yg==").unwrap();
        let a = xml.find("YQ==").unwrap();
        assert!(b < a);
        assert!(xml.starts_with("<?xml"));
        assert!(xml.ends_with("</BlockList>"));
    }

    #[test]
    fn test_empty_block_list_xml() {
        assert_eq!(
            block_list_xml(&[]),
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<BlockList>\n</BlockList>"
        );
    }
}
