//! In-process HTTP/1.1 server that mimics the speed-test endpoints.

#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

pub const TOKEN: &str = "measurement-token";
pub const UPLOAD_REPLY: &str = "upload-accepted";
pub const METADATA_JSON: &str = r#"{"hostname":"speed.test","clientIp":"127.0.0.1","httpProtocol":"HTTP/1.1","asn":64500,"colo":"LAB","country":"NL"}"#;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Value of the server-timing header; omitted when `None`
    pub server_timing: Option<String>,
    /// Append `___<token>` to download bodies
    pub download_token: bool,
    /// Zero-based probe index from which server-timing is no longer sent
    pub drop_timing_from_probe: Option<usize>,
    /// Zero-based probe index from which downloads advertise this length
    pub declared_length: Option<(usize, u64)>,
    /// Bytes sent on top of the requested download size
    pub download_padding: usize,
    /// Frame download bodies with chunked transfer-encoding
    pub chunked_downloads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_timing: Some("cfRequestDuration;dur=3.2".to_string()),
            download_token: true,
            drop_timing_from_probe: None,
            declared_length: None,
            download_padding: 0,
            chunked_downloads: false,
        }
    }
}

struct ServerState {
    config: ServerConfig,
    probes: AtomicUsize,
    connections: AtomicUsize,
}

pub struct MockSpeedServer {
    pub base_url: String,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl MockSpeedServer {
    pub async fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            config,
            probes: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
        });

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    let state = state.clone();
                    tokio::spawn(async move {
                        let _ = serve_connection(stream, state).await;
                    });
                }
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            task,
        }
    }

    /// Number of `__down` / `__up` requests served
    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockSpeedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;

        let reply = respond(&state, &method, &target);
        let mut head = format!(
            "HTTP/1.1 {}\r\nconnection: keep-alive\r\ncontent-type: text/plain\r\n",
            reply.status
        );
        if reply.chunked {
            head.push_str("transfer-encoding: chunked\r\n");
        } else {
            let length = reply.declared_length.unwrap_or(reply.payload.len() as u64);
            head.push_str(&format!("content-length: {length}\r\n"));
        }
        if let Some(timing) = &reply.timing {
            head.push_str(&format!("server-timing: {timing}\r\n"));
        }
        head.push_str("\r\n");

        let stream = reader.get_mut();
        stream.write_all(head.as_bytes()).await?;
        if reply.chunked {
            stream
                .write_all(format!("{:x}\r\n", reply.payload.len()).as_bytes())
                .await?;
            stream.write_all(&reply.payload).await?;
            stream.write_all(b"\r\n0\r\n\r\n").await?;
        } else {
            stream.write_all(&reply.payload).await?;
        }
        stream.flush().await?;

        if reply.declared_length.is_some() {
            // The advertised body never fully arrives; drop the connection
            return Ok(());
        }
    }
}

struct Reply {
    status: &'static str,
    timing: Option<String>,
    payload: Vec<u8>,
    declared_length: Option<u64>,
    chunked: bool,
}

impl Reply {
    fn plain(status: &'static str, timing: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            status,
            timing,
            payload,
            declared_length: None,
            chunked: false,
        }
    }
}

fn respond(state: &ServerState, method: &str, target: &str) -> Reply {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    match (method, path) {
        ("GET", "/meta") => Reply::plain("200 OK", None, METADATA_JSON.as_bytes().to_vec()),
        ("GET", "/__down") => {
            let probe = state.probes.load(Ordering::SeqCst);
            let timing = probe_timing(state);
            let bytes = query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "bytes")
                .and_then(|(_, value)| value.parse::<usize>().ok())
                .unwrap_or(0);
            let mut payload = vec![b'0'; bytes + state.config.download_padding];
            if state.config.download_token {
                payload.extend_from_slice(format!("___{TOKEN}").as_bytes());
            }
            let declared_length = match state.config.declared_length {
                Some((from, length)) if probe >= from => Some(length),
                _ => None,
            };
            Reply {
                status: "200 OK",
                timing,
                payload,
                declared_length,
                chunked: state.config.chunked_downloads && declared_length.is_none(),
            }
        }
        ("POST", "/__up") => {
            let timing = probe_timing(state);
            Reply::plain("200 OK", timing, UPLOAD_REPLY.as_bytes().to_vec())
        }
        _ => Reply::plain("404 Not Found", None, b"not found".to_vec()),
    }
}

fn probe_timing(state: &ServerState) -> Option<String> {
    let probe = state.probes.fetch_add(1, Ordering::SeqCst);
    match state.config.drop_timing_from_probe {
        Some(from) if probe >= from => None,
        _ => state.config.server_timing.clone(),
    }
}
