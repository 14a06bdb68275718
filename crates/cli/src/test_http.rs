//! One-connection-per-response HTTP stub for client tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct Captured {
	/// `METHOD /path HTTP/1.1`
	pub request_line: String,
	pub body: String,
}

/// Serves `responses` in order, one per connection, and hands back what each
/// request looked like.
pub async fn serve(responses: Vec<(u16, String)>) -> (u16, JoinHandle<Vec<Captured>>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let task = tokio::spawn(async move {
		let mut captured = Vec::new();
		for (status, body) in responses {
			let (mut stream, _) = listener.accept().await.unwrap();
			captured.push(read_request(&mut stream).await);
			let reply = format!(
				"HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
				body.len()
			);
			stream.write_all(reply.as_bytes()).await.unwrap();
			let _ = stream.shutdown().await;
		}
		captured
	});
	(port, task)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Captured {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	let header_end = loop {
		let n = stream.read(&mut chunk).await.unwrap();
		assert!(n > 0, "client closed before sending headers");
		buf.extend_from_slice(&chunk[..n]);
		if let Some(pos) = find(&buf, b"\r\n\r\n") {
			break pos + 4;
		}
	};

	let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
	let lower = head.to_lowercase();
	let content_length = lower
		.lines()
		.find_map(|line| line.strip_prefix("content-length:"))
		.and_then(|value| value.trim().parse::<usize>().ok());
	let chunked = lower.contains("transfer-encoding: chunked");

	loop {
		let body = &buf[header_end..];
		let complete = match content_length {
			Some(len) => body.len() >= len,
			None if chunked => body.ends_with(b"0\r\n\r\n"),
			None => true,
		};
		if complete {
			break;
		}
		let n = stream.read(&mut chunk).await.unwrap();
		if n == 0 {
			break;
		}
		buf.extend_from_slice(&chunk[..n]);
	}

	Captured {
		request_line: head.lines().next().unwrap_or_default().to_string(),
		body: String::from_utf8_lossy(&buf[header_end..]).to_string(),
	}
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|window| window == needle)
}
