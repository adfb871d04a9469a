use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;

use url::Url;

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    /// Request target including the query string, percent-encoded as sent.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn url(&self) -> Option<Url> {
        Url::parse("http://mock.local").ok()?.join(&self.path).ok()
    }

    /// Path without the query string.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// Decoded query parameters, in request order.
    pub fn query(&self) -> Vec<(String, String)> {
        self.url()
            .map(|url| url.query_pairs().into_owned().collect())
            .unwrap_or_default()
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        self.query()
            .into_iter()
            .find_map(|(k, v)| if k == key { Some(v) } else { None })
    }
}

/// A canned HTTP response served by [`spawn_scripted_server`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status_line: String,
    pub body: String,
}

impl MockResponse {
    pub fn ok_json(body: &str) -> Self {
        Self {
            status_line: "200 OK".to_string(),
            body: body.to_string(),
        }
    }

    pub fn status(status_line: &str, body: &str) -> Self {
        Self {
            status_line: status_line.to_string(),
            body: body.to_string(),
        }
    }
}

/// Spawn a one-shot HTTP mock server that accepts a single request, captures it,
/// and responds with the given status line and body. Returns the base URL and a
/// receiver that yields the captured request.
pub fn spawn_one_shot_server(
    status_line: &str,
    response_body: &str,
) -> (String, mpsc::Receiver<CapturedRequest>) {
    spawn_scripted_server(vec![MockResponse::status(status_line, response_body)])
}

/// Spawn a mock server that answers one request per scripted response, in order,
/// then stops accepting. Each request is captured on the returned receiver.
pub fn spawn_scripted_server(
    responses: Vec<MockResponse>,
) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("read mock server addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let req = read_http_request(&mut stream);
            if tx.send(req).is_err() {
                return;
            }
            let raw = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                response.status_line,
                response.body.len(),
                response.body
            );
            let _ = stream.write_all(raw.as_bytes());
        }
    });

    (format!("http://{addr}"), rx)
}

fn read_http_request(stream: &mut TcpStream) -> CapturedRequest {
    let mut buf = Vec::new();
    let mut header_end = None;
    let mut content_length = 0usize;

    loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).expect("read request bytes");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if header_end.is_none() {
            header_end = buf
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .map(|idx| idx + 4);
            if let Some(end) = header_end {
                let headers = String::from_utf8_lossy(&buf[..end]);
                for line in headers.lines() {
                    if let Some((key, value)) = line.split_once(':') {
                        if key.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse::<usize>().unwrap_or(0);
                        }
                    }
                }
            }
        }
        if let Some(end) = header_end {
            if buf.len() >= end + content_length {
                break;
            }
        }
    }

    let end = header_end.expect("request headers must be present");
    let headers_raw = String::from_utf8_lossy(&buf[..end]);
    let mut lines = headers_raw.lines();
    let request_line = lines.next().expect("request line");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().expect("method").to_string();
    let path = parts.next().expect("path").to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let body = buf[end..end + content_length].to_vec();

    CapturedRequest {
        method,
        path,
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_server_captures_get() {
        let (url, rx) = spawn_one_shot_server("200 OK", r#"{"ok":true}"#);
        let addr = url.trim_start_matches("http://");
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /rest/v1/messages?order=created_at.asc&or=%28a%2Cb%29 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).unwrap();
        assert!(resp.contains("200 OK"));
        let req = rx.recv().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.route(), "/rest/v1/messages");
        assert_eq!(req.query_param("order").as_deref(), Some("created_at.asc"));
        assert_eq!(req.query_param("or").as_deref(), Some("(a,b)"));
    }

    #[test]
    fn query_values_keep_encoded_separators() {
        let req = CapturedRequest {
            method: "GET".into(),
            path: "/realtime/v1/websocket?apikey=a%26b%3Dc&vsn=1.0.0".into(),
            headers: HashMap::new(),
            body: vec![],
        };
        assert_eq!(req.route(), "/realtime/v1/websocket");
        assert_eq!(req.query_param("apikey").as_deref(), Some("a&b=c"));
        assert_eq!(req.query_param("vsn").as_deref(), Some("1.0.0"));
        assert!(req.query_param("b").is_none());
    }

    #[test]
    fn scripted_server_answers_in_order() {
        let (url, rx) = spawn_scripted_server(vec![
            MockResponse::ok_json("[]"),
            MockResponse::status("500 Internal Server Error", r#"{"message":"boom"}"#),
        ]);
        let addr = url.trim_start_matches("http://").to_string();
        for expected in ["200 OK", "500 Internal Server Error"] {
            let mut stream = TcpStream::connect(&addr).unwrap();
            stream
                .write_all(b"POST /x HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\n\r\n{}")
                .unwrap();
            let mut resp = String::new();
            stream.read_to_string(&mut resp).unwrap();
            assert!(resp.contains(expected));
        }
        let first = rx.recv().unwrap();
        assert_eq!(first.body_text(), "{}");
        assert_eq!(first.header("Content-Length"), Some("2"));
    }
}
