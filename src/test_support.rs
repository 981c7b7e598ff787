//! One-shot HTTP servers and log capture for tests.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use log::{Level, LevelFilter, Log, Metadata, Record};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Serve one canned HTTP response and return the base url.
pub async fn serve_once(response: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
    });
    format!("http://{addr}/")
}

/// Start a chunked response, send `body` as one chunk, then go quiet without closing.
pub async fn serve_then_stall(body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let head = "HTTP/1.1 200 OK\r\n\
                    Content-Type: application/x-ndjson\r\n\
                    Transfer-Encoding: chunked\r\n\r\n";
        let chunk = format!("{:x}\r\n{body}\r\n", body.len());
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(chunk.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    format!("http://{addr}/")
}

pub fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/x-ndjson\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}

/// A streamed chat chunk as the server writes it, newline included.
pub fn chat_chunk(content: &str, done: bool) -> String {
    let line = serde_json::json!({
        "model": "qwen3",
        "message": { "role": "assistant", "content": content },
        "done": done,
    });
    format!("{line}\n")
}

async fn read_request(socket: &mut TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        request.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&request);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if request.len() >= header_end + 4 + content_length {
                return;
            }
        }
    }
}

thread_local! {
    static CAPTURED: RefCell<Option<(Level, Vec<String>)>> = const { RefCell::new(None) };
}

/// Records log lines per thread, so parallel tests do not see each other's output.
struct ThreadCapture;

impl Log for ThreadCapture {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        CAPTURED.with(|captured| {
            if let Some((threshold, lines)) = captured.borrow_mut().as_mut() {
                if record.level() <= *threshold {
                    lines.push(format!("{} {}", record.level(), record.args()));
                }
            }
        });
    }

    fn flush(&self) {}
}

static LOGGER: ThreadCapture = ThreadCapture;
static INSTALL: Once = Once::new();

/// Run `fut` and return the log lines it emitted at `threshold` or more severe.
///
/// Only sees records logged on the calling thread, which holds for `#[tokio::test]`.
pub async fn capture_logs<F: Future>(threshold: Level, fut: F) -> (F::Output, Vec<String>) {
    INSTALL.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Trace);
    });
    CAPTURED.with(|captured| *captured.borrow_mut() = Some((threshold, Vec::new())));
    let output = fut.await;
    let lines = CAPTURED.with(|captured| captured.borrow_mut().take());
    (output, lines.map(|(_, lines)| lines).unwrap_or_default())
}
