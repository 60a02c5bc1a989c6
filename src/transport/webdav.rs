//! WebDAV client over reqwest: GET/PUT/MKCOL plus PROPFIND listings.

use async_trait::async_trait;
use futures::StreamExt;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, RequestBuilder, StatusCode};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{
    remote_index_path, remote_schema_path, RemoteEntry, RemoteStore, TransportConfig,
    TransportError,
};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getcontentlength/>
  </D:prop>
</D:propfind>"#;

/// Per-operation wall-clock timings, recorded when `profile` is on.
#[derive(Debug, Default)]
struct TimingRecorder {
    samples: Mutex<Vec<(String, Duration)>>,
}

impl TimingRecorder {
    fn record(&self, op: &str, elapsed: Duration) {
        debug!(op, ?elapsed, "transport timing");
        self.samples.lock().unwrap().push((op.to_string(), elapsed));
    }
}

pub struct WebDavClient {
    http: reqwest::Client,
    base: String,
    auth: Option<(String, String)>,
    timings: Option<Arc<TimingRecorder>>,
}

impl WebDavClient {
    /// Build a client for `url`. Accepted schemes are `http://`, `https://`,
    /// and `webdav://` (an alias for `http://`).
    pub fn new(url: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        let base = normalize_url(url)?;
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.parallel_connections.max(1));
        if config.use_http2 {
            builder = builder.http2_prior_knowledge();
        }
        let http = builder.build()?;
        Ok(WebDavClient {
            http,
            base,
            auth: config.basic_auth.clone(),
            timings: config.profile.then(|| Arc::new(TimingRecorder::default())),
        })
    }

    /// Recorded `(operation, elapsed)` samples; empty unless profiling is on.
    pub fn timings(&self) -> Vec<(String, Duration)> {
        self.timings
            .as_ref()
            .map(|recorder| recorder.samples.lock().unwrap().clone())
            .unwrap_or_default()
    }

    fn url_for(&self, remote_rel: &str) -> String {
        let encoded: Vec<String> = remote_rel
            .trim_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base, encoded.join("/"))
    }

    fn request(&self, method: Method, remote_rel: &str) -> RequestBuilder {
        let mut request = self.http.request(method, self.url_for(remote_rel));
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }
        request
    }

    fn record(&self, op: &str, started: Instant) {
        if let Some(recorder) = &self.timings {
            recorder.record(op, started.elapsed());
        }
    }

    async fn get_bytes(&self, remote_rel: &str) -> Result<Vec<u8>, TransportError> {
        let started = Instant::now();
        let response = self.request(Method::GET, remote_rel).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(remote_rel.to_string()));
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                path: remote_rel.to_string(),
            });
        }
        let bytes = response.bytes().await?.to_vec();
        self.record("get", started);
        Ok(bytes)
    }

    /// MKCOL every missing parent collection of `remote_rel`, in order.
    /// Servers answer 405 for collections that already exist.
    async fn ensure_parents(&self, remote_rel: &str) -> Result<(), TransportError> {
        let segments: Vec<&str> = remote_rel.trim_matches('/').split('/').collect();
        if segments.len() < 2 {
            return Ok(());
        }
        let mkcol = Method::from_bytes(b"MKCOL").expect("static method");
        for depth in 1..segments.len() {
            let dir = segments[..depth].join("/");
            let status = self
                .request(mkcol.clone(), &dir)
                .send()
                .await?
                .status();
            if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    path: dir,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for WebDavClient {
    async fn fetch_schema(&self) -> Result<Vec<u8>, TransportError> {
        self.get_bytes(&remote_schema_path()).await
    }

    async fn fetch_index(&self) -> Result<Vec<u8>, TransportError> {
        self.get_bytes(&remote_index_path()).await
    }

    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let started = Instant::now();
        let propfind = Method::from_bytes(b"PROPFIND").expect("static method");
        let response = self
            .request(propfind, remote_dir)
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(remote_dir.to_string()));
        }
        // PROPFIND answers 207 Multi-Status
        if !status.is_success() && status.as_u16() != 207 {
            return Err(TransportError::Status {
                status: status.as_u16(),
                path: remote_dir.to_string(),
            });
        }
        let body = response.bytes().await?;
        let entries = parse_multistatus(&body, remote_dir)?;
        self.record("propfind", started);
        Ok(entries)
    }

    async fn download(&self, remote_rel: &str, local_abs: &Path) -> Result<u64, TransportError> {
        let started = Instant::now();
        let response = self.request(Method::GET, remote_rel).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(remote_rel.to_string()));
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                path: remote_rel.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(local_abs).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        self.record("download", started);
        Ok(written)
    }

    async fn upload(&self, local_abs: &Path, remote_rel: &str) -> Result<(), TransportError> {
        let started = Instant::now();
        self.ensure_parents(remote_rel).await?;

        let file = tokio::fs::File::open(local_abs).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let status = self
            .request(Method::PUT, remote_rel)
            .body(body)
            .send()
            .await?
            .status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                path: remote_rel.to_string(),
            });
        }
        self.record("upload", started);
        Ok(())
    }

    async fn check(&self) -> Result<(), TransportError> {
        let started = Instant::now();
        let propfind = Method::from_bytes(b"PROPFIND").expect("static method");
        let status = self
            .request(propfind, "")
            .header("Depth", "0")
            .send()
            .await?
            .status();
        self.record("check", started);
        // 404 on the probe is still a reachable server
        if status.is_success() || status == StatusCode::NOT_FOUND || status.as_u16() == 207 {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                path: "/".to_string(),
            })
        }
    }
}

fn normalize_url(url: &str) -> Result<String, TransportError> {
    let normalized = if let Some(rest) = url.strip_prefix("webdav://") {
        format!("http://{}", rest)
    } else if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        return Err(TransportError::BadUrl(url.to_string()));
    };
    Ok(normalized.trim_end_matches('/').to_string())
}

/// Pull `(href, size, is_dir)` triples out of a PROPFIND multistatus body.
/// Namespace prefixes vary between servers, so elements are matched by local
/// name only.
fn parse_multistatus(body: &[u8], remote_dir: &str) -> Result<Vec<RemoteEntry>, TransportError> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut current: Option<(String, u64, bool)> = None;
    let mut in_href = false;
    let mut in_length = false;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| TransportError::Propfind(e.to_string()))?
        {
            Event::Start(start) => match local_name(start.name().as_ref()) {
                b"response" => current = Some((String::new(), 0, false)),
                b"href" => in_href = true,
                b"getcontentlength" => in_length = true,
                b"collection" => {
                    if let Some((_, _, is_dir)) = current.as_mut() {
                        *is_dir = true;
                    }
                }
                _ => {}
            },
            Event::Empty(empty) => {
                if local_name(empty.name().as_ref()) == b"collection" {
                    if let Some((_, _, is_dir)) = current.as_mut() {
                        *is_dir = true;
                    }
                }
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| TransportError::Propfind(e.to_string()))?;
                if let Some((href, size, _)) = current.as_mut() {
                    if in_href {
                        href.push_str(&text);
                    } else if in_length {
                        *size = text.trim().parse().unwrap_or(0);
                    }
                }
            }
            Event::End(end) => match local_name(end.name().as_ref()) {
                b"href" => in_href = false,
                b"getcontentlength" => in_length = false,
                b"response" => {
                    if let Some((href, size, is_dir)) = current.take() {
                        if let Some(path) = href_to_rel(&href) {
                            // The listed directory reports itself first
                            if path != remote_dir.trim_matches('/') {
                                entries.push(RemoteEntry { path, size, is_dir });
                            }
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(entries)
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// Strip scheme, host, and percent-encoding from a PROPFIND href.
fn href_to_rel(href: &str) -> Option<String> {
    let path = if let Some(scheme_end) = href.find("://") {
        let after = &href[scheme_end + 3..];
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else {
        href
    };
    let decoded = urlencoding::decode(path).ok()?;
    let trimmed = decoded.trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_schemes() {
        assert_eq!(
            normalize_url("webdav://host:8080/data/").unwrap(),
            "http://host:8080/data"
        );
        assert_eq!(
            normalize_url("https://host/data").unwrap(),
            "https://host/data"
        );
        assert!(matches!(
            normalize_url("ftp://host/data"),
            Err(TransportError::BadUrl(_))
        ));
    }

    #[test]
    fn test_url_for_encodes_segments() {
        let client = WebDavClient::new("http://host/data", &TransportConfig::default()).unwrap();
        assert_eq!(
            client.url_for("Artist Name/Album/01 Track_instrumental.mp3"),
            "http://host/data/Artist%20Name/Album/01%20Track_instrumental.mp3"
        );
    }

    #[test]
    fn test_parse_multistatus() {
        let body = br#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/data/Artist/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/data/Artist/One_instrumental.mp3</D:href>
    <D:propstat><D:prop>
      <D:resourcetype/>
      <D:getcontentlength>4</D:getcontentlength>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/data/Artist/My%20Album/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;

        let entries = parse_multistatus(body, "data/Artist").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            RemoteEntry {
                path: "data/Artist/One_instrumental.mp3".to_string(),
                size: 4,
                is_dir: false,
            }
        );
        assert_eq!(
            entries[1],
            RemoteEntry {
                path: "data/Artist/My Album".to_string(),
                size: 0,
                is_dir: true,
            }
        );
    }
}
