//! Mock backend for integration testing
//!
//! Usage: `mock-server -S <host:port> -t <root>`, the same shape as the
//! PHP built-in server.
//!
//! Environment variables:
//! - STARTUP_DELAY_MS: Delay before binding the listener (default: 0)
//! - MOCK_FAIL: If set, print its value to stderr and exit with status 1

use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct Args {
    addr: String,
    root: PathBuf,
}

fn parse_args() -> Result<Args, String> {
    let mut addr = None;
    let mut root = PathBuf::from(".");
    let mut args = env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-S" => addr = args.next(),
            "-t" => root = args.next().map(PathBuf::from).ok_or("-t needs a value")?,
            other => return Err(format!("unknown argument: {}", other)),
        }
    }

    Ok(Args {
        addr: addr.ok_or("-S <host:port> is required")?,
        root,
    })
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Mock server: {}", e);
            std::process::exit(2);
        }
    };

    if let Ok(message) = env::var("MOCK_FAIL") {
        eprintln!("{}", message);
        std::process::exit(1);
    }

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if startup_delay > 0 {
        eprintln!("Mock server: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = match TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Mock server: failed to bind {}: {}", args.addr, e);
            std::process::exit(1);
        }
    };

    println!("Mock server: listening on http://{}", args.addr);
    println!("Mock server: document root is {}", args.root.display());

    let root = args.root;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let root = root.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &root).await;
                });
            }
            Err(e) => {
                eprintln!("Mock server: accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, root: &Path) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 4096];

    // Read HTTP request headers
    let header_end = loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&temp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 16384 {
            return;
        }
    };

    let head = match std::str::from_utf8(&buf[..header_end]) {
        Ok(s) => s.to_string(),
        Err(_) => return,
    };

    let mut lines = head.lines();
    let request_line = match lines.next() {
        Some(l) => l,
        None => return,
    };

    let parts: Vec<&str> = request_line.split(' ').collect();
    let (method, target) = if parts.len() >= 2 {
        (parts[0], parts[1])
    } else {
        ("GET", "/")
    };

    let headers: Vec<(String, String)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|h| h.split_once(':'))
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    // Read the body by Content-Length
    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        body.extend_from_slice(&temp[..n]);
    }
    body.truncate(content_length);

    println!("Mock server: {} {}", method, target);

    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let (status, content_type, body): (&str, &str, Vec<u8>) = match path {
        "/echo" => (
            "200 OK",
            "text/plain",
            format!(
                "method={}\npath={}\nquery={}\nbody={}",
                method,
                path,
                query,
                String::from_utf8_lossy(&body)
            )
            .into_bytes(),
        ),
        "/headers" => {
            let mut text = String::new();
            for (name, value) in &headers {
                text.push_str(&format!("{}: {}\n", name, value));
            }
            ("200 OK", "text/plain", text.into_bytes())
        }
        "/status" => {
            let code = query
                .split('&')
                .find_map(|pair| pair.strip_prefix("code="))
                .unwrap_or("200");
            let line = match code {
                "201" => "201 Created",
                "302" => "302 Found",
                "404" => "404 Not Found",
                "500" => "500 Internal Server Error",
                _ => "200 OK",
            };
            (line, "text/plain", line.as_bytes().to_vec())
        }
        _ => match serve_file(root, path).await {
            Some(contents) => ("200 OK", content_type_for(path), contents),
            None => ("404 Not Found", "text/plain", b"Not Found".to_vec()),
        },
    };

    let mut response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Mock-Server: true\r\n\
         Set-Cookie: first=1; Path=/\r\n\
         Set-Cookie: second=2; Path=/\r\n\
         \r\n",
        status,
        content_type,
        body.len(),
    )
    .into_bytes();
    if method != "HEAD" {
        response.extend_from_slice(&body);
    }

    let _ = stream.write_all(&response).await;
}

/// Read a file under the document root; `/` maps to `index.html`
async fn serve_file(root: &Path, path: &str) -> Option<Vec<u8>> {
    let relative = path.trim_start_matches('/');
    let relative = if relative.is_empty() { "index.html" } else { relative };

    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }

    tokio::fs::read(root.join(relative)).await.ok()
}

fn content_type_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html") | None => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
