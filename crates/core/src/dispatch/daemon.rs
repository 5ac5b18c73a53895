use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::error::{DispatchFailure, WorkerError, WorkerResult};
use crate::job::OutputFormat;
use crate::readiness::ReadyBackend;

const UPSCALE_PATH: &str = "/upscale";
const UPLOAD_FIELD: &str = "image";
const UPLOAD_FILE_NAME: &str = "input.jpg";
const UPLOAD_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonOutput {
    pub bytes: Vec<u8>,
    /// What the daemon says it produced, which wins over what was asked for.
    pub format: OutputFormat,
}

pub trait DaemonDispatch: Send + Sync {
    fn upscale(&self, image: &[u8], format: OutputFormat) -> Result<DaemonOutput, DispatchFailure>;
}

/// Client for the daemon's upscale endpoint. Built from a [`ReadyBackend`],
/// which it keeps alive for the rest of the worker's life.
pub struct HttpDaemonClient {
    client: reqwest::blocking::Client,
    upscale_url: String,
    _backend: ReadyBackend,
}

impl HttpDaemonClient {
    /// `timeout` of `None` lets a dispatch run to completion.
    pub fn connect(backend: ReadyBackend, timeout: Option<Duration>) -> WorkerResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                WorkerError::unexpected(format!("failed to build daemon HTTP client: {err}"))
            })?;
        let upscale_url = format!("{}{UPSCALE_PATH}", backend.base_url().trim_end_matches('/'));

        Ok(Self {
            client,
            upscale_url,
            _backend: backend,
        })
    }
}

impl DaemonDispatch for HttpDaemonClient {
    fn upscale(&self, image: &[u8], format: OutputFormat) -> Result<DaemonOutput, DispatchFailure> {
        let part = Part::bytes(image.to_vec())
            .file_name(UPLOAD_FILE_NAME)
            .mime_str(UPLOAD_MIME)
            .map_err(|err| DispatchFailure::DaemonTransport(err.to_string()))?;
        let form = Form::new().part(UPLOAD_FIELD, part);
        let ext = format!(".{}", format.extension());

        debug!(url = %self.upscale_url, %ext, bytes = image.len(), "dispatching to daemon");
        let response = self
            .client
            .post(&self.upscale_url)
            .query(&[("ext", ext.as_str())])
            .multipart(form)
            .send()
            .map_err(|err| DispatchFailure::DaemonTransport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            warn!(status = status.as_u16(), %body, "daemon rejected upscale request");
            return Err(DispatchFailure::DaemonStatus {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| DispatchFailure::DaemonTransport(format!("failed to read response: {err}")))?;

        Ok(DaemonOutput {
            bytes: bytes.to_vec(),
            format: reconcile_format(format, content_type.as_deref()),
        })
    }
}

/// The daemon's declared content type decides the format when it names one
/// we know; otherwise the requested format stands.
pub fn reconcile_format(requested: OutputFormat, content_type: Option<&str>) -> OutputFormat {
    content_type
        .and_then(OutputFormat::from_content_type)
        .unwrap_or(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::{LivenessProbe, ReadinessGate};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    struct AlwaysUp;

    impl LivenessProbe for AlwaysUp {
        fn probe(&self) -> bool {
            true
        }
    }

    fn ready_backend(base_url: String) -> ReadyBackend {
        ReadinessGate::new(AlwaysUp, 1, Duration::ZERO)
            .open(base_url, None)
            .unwrap()
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let read = stream.read(&mut chunk).unwrap();
            if read == 0 {
                return String::from_utf8_lossy(&raw).into_owned();
            }
            raw.extend_from_slice(&chunk[..read]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&raw[..header_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok());
        let chunked = head.contains("transfer-encoding: chunked");

        loop {
            let body = &raw[header_end..];
            let complete = match content_length {
                Some(len) => body.len() >= len,
                None if chunked => body.ends_with(b"0\r\n\r\n"),
                None => true,
            };
            if complete {
                break;
            }
            let read = stream.read(&mut chunk).unwrap();
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..read]);
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn spawn_daemon(
        status_line: &'static str,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> (String, mpsc::Receiver<String>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            tx.send(request).unwrap();
            let head = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(&body).unwrap();
            let _ = stream.flush();
        });
        (format!("http://{addr}"), rx, handle)
    }

    #[test]
    fn upload_uses_image_field_and_dotted_ext_query() {
        let (base_url, requests, handle) = spawn_daemon("200 OK", "image/png", b"PNGDATA".to_vec());
        let client = HttpDaemonClient::connect(ready_backend(base_url), None).unwrap();

        let output = client.upscale(b"raw-input", OutputFormat::Png).unwrap();
        handle.join().unwrap();
        let request = requests.recv().unwrap();

        assert!(request.starts_with("POST /upscale?ext=.png "), "{request}");
        assert!(request.contains("name=\"image\""), "{request}");
        assert!(request.contains("filename=\"input.jpg\""), "{request}");
        assert!(request.contains("application/octet-stream"), "{request}");
        assert!(request.contains("raw-input"), "{request}");
        assert_eq!(output.bytes, b"PNGDATA");
        assert_eq!(output.format, OutputFormat::Png);
    }

    #[test]
    fn declared_content_type_overrides_requested_format() {
        let (base_url, _requests, handle) = spawn_daemon("200 OK", "image/jpeg", b"JPEG".to_vec());
        let client = HttpDaemonClient::connect(ready_backend(base_url), None).unwrap();

        let output = client.upscale(b"raw", OutputFormat::Png).unwrap();
        handle.join().unwrap();

        assert_eq!(output.format, OutputFormat::Jpg);
    }

    #[test]
    fn non_success_status_carries_status_and_body() {
        let (base_url, _requests, handle) =
            spawn_daemon("500 Internal Server Error", "text/plain", b"engine exploded".to_vec());
        let client = HttpDaemonClient::connect(ready_backend(base_url), None).unwrap();

        let failure = client.upscale(b"raw", OutputFormat::Jpg).expect_err("500 must fail");
        handle.join().unwrap();

        match failure {
            DispatchFailure::DaemonStatus { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "engine exploded");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn unreachable_daemon_is_a_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            HttpDaemonClient::connect(ready_backend(format!("http://{addr}")), None).unwrap();
        let failure = client.upscale(b"raw", OutputFormat::Jpg).expect_err("nothing listening");

        assert!(matches!(failure, DispatchFailure::DaemonTransport(_)));
    }

    #[test]
    fn reconcile_keeps_requested_format_for_unknown_types() {
        assert_eq!(
            reconcile_format(OutputFormat::Jpg, Some("application/octet-stream")),
            OutputFormat::Jpg
        );
        assert_eq!(reconcile_format(OutputFormat::Jpg, None), OutputFormat::Jpg);
        assert_eq!(
            reconcile_format(OutputFormat::Jpg, Some("image/png")),
            OutputFormat::Png
        );
    }
}
