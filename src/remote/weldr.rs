//! HTTP transport for a weldr-style compose API.

use std::io::Write;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{BuildRequest, ComposeService};
use crate::error::{ComposeError, Result};

/// Applies to every call except the result download, which may take as
/// long as the archive needs.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Placeholder job id for errors raised before a compose exists.
const NO_JOB: &str = "(not submitted)";

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    build_id: String,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    queue_status: String,
}

pub struct WeldrClient {
    client: Client,
    base_url: String,
}

impl WeldrClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .map_err(|source| ComposeError::Http {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send and turn non-2xx answers into a job failure carrying the body.
    fn send(&self, request: RequestBuilder, url: &str, job_id: &str) -> Result<Response> {
        debug!(url, "compose API request");
        let response = request.send().map_err(|source| ComposeError::Http {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(ComposeError::RemoteJob {
            job_id: job_id.to_string(),
            status: format!("HTTP {status} from {url}: {}", body.trim()),
        })
    }

    fn json<T: DeserializeOwned>(&self, response: Response, url: &str) -> Result<T> {
        let body = response.text().map_err(|source| ComposeError::Http {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_str(&body).map_err(|source| ComposeError::Json {
            context: url.to_string(),
            source,
        })
    }
}

impl ComposeService for WeldrClient {
    fn push_blueprint(&self, toml: &str) -> Result<()> {
        let url = self.url("blueprints/new");
        let request = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .header(CONTENT_TYPE, "text/x-toml")
            .body(toml.to_string());
        self.send(request, &url, NO_JOB)?;
        Ok(())
    }

    fn submit(&self, request: &BuildRequest) -> Result<String> {
        let url = self.url("compose");
        let body = serde_json::to_string(request).map_err(|source| ComposeError::Json {
            context: "compose request".to_string(),
            source,
        })?;
        let http = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let response = self.send(http, &url, NO_JOB)?;
        let submitted: SubmitResponse = self.json(response, &url)?;
        Ok(submitted.build_id)
    }

    fn queue_status(&self, job_id: &str) -> Result<String> {
        let url = self.url(&format!("compose/info/{job_id}"));
        let request = self.client.get(&url).timeout(REQUEST_TIMEOUT);
        let response = self.send(request, &url, job_id)?;
        let info: InfoResponse = self.json(response, &url)?;
        Ok(info.queue_status)
    }

    fn download_results(&self, job_id: &str, out: &mut dyn Write) -> Result<u64> {
        let url = self.url(&format!("compose/results/{job_id}"));
        let mut response = self.send(self.client.get(&url), &url, job_id)?;
        response.copy_to(out).map_err(|source| ComposeError::Http {
            url: url.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned HTTP response and return the request line it saw.
    fn serve_once(status: &str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api/v1/", listener.local_addr().unwrap());
        let status = status.to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();
            format!(
                "{} {}",
                request_line.trim(),
                String::from_utf8_lossy(&request_body)
            )
            .trim()
            .to_string()
        });
        (base, handle)
    }

    fn client(base: &str) -> WeldrClient {
        let http = Client::builder().no_proxy().build().unwrap();
        WeldrClient::with_client(http, base)
    }

    #[test]
    fn queue_status_reads_info() {
        let (base, server) = serve_once("200 OK", r#"{"id":"abc","queue_status":"RUNNING"}"#);
        let client = client(&base);
        assert_eq!(client.queue_status("abc").unwrap(), "RUNNING");
        assert_eq!(server.join().unwrap(), "GET /api/v1/compose/info/abc HTTP/1.1");
    }

    #[test]
    fn submit_posts_request_json() {
        let (base, server) = serve_once("200 OK", r#"{"build_id":"abc","status":true}"#);
        let client = client(&base);
        let id = client
            .submit(&BuildRequest {
                blueprint_name: "verity-root".into(),
                compose_type: "raw".into(),
                branch: "master".into(),
            })
            .unwrap();
        assert_eq!(id, "abc");
        assert_eq!(
            server.join().unwrap(),
            r#"POST /api/v1/compose HTTP/1.1 {"blueprint_name":"verity-root","compose_type":"raw","branch":"master"}"#
        );
    }

    #[test]
    fn error_status_carries_body() {
        let (base, server) = serve_once("400 Bad Request", r#"{"status":false,"errors":["UnknownUUID"]}"#);
        let client = client(&base);
        match client.queue_status("nope").unwrap_err() {
            ComposeError::RemoteJob { job_id, status } => {
                assert_eq!(job_id, "nope");
                assert!(status.contains("400"), "{status}");
                assert!(status.contains("UnknownUUID"), "{status}");
            }
            other => panic!("unexpected error: {other}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn malformed_json_is_json_error() {
        let (base, server) = serve_once("200 OK", "not json");
        let client = client(&base);
        assert!(matches!(
            client.queue_status("abc").unwrap_err(),
            ComposeError::Json { .. }
        ));
        server.join().unwrap();
    }

    #[test]
    fn url_joining() {
        let client = WeldrClient::new("http://localhost/api/v1/").unwrap();
        assert_eq!(client.url("/compose"), "http://localhost/api/v1/compose");
        assert_eq!(client.url("compose/info/x"), "http://localhost/api/v1/compose/info/x");
    }
}
