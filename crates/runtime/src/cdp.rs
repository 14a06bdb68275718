//! Chrome DevTools Protocol connection over a websocket.
//!
//! Request/response correlation works like a JSON-RPC client: every call gets a
//! sequential id and a oneshot channel, a reader task routes responses back by id
//! and logs events. When the socket closes, every pending call fails with
//! [`RuntimeError::ConnectionClosed`] and later calls fail immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::error::{Result, RuntimeError};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

#[derive(Debug, Serialize)]
struct Request<'a> {
	id: u64,
	method: &'a str,
	params: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
	code: i64,
	message: String,
}

/// Responses carry an `id`, events do not.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
	Response {
		id: u64,
		#[serde(default)]
		result: Option<Value>,
		#[serde(default)]
		error: Option<ErrorPayload>,
	},
	Event {
		method: String,
		#[serde(default)]
		params: Value,
	},
}

/// A live DevTools session bound to one websocket endpoint.
pub struct CdpConnection {
	last_id: AtomicU64,
	pending: Pending,
	outgoing: mpsc::UnboundedSender<Message>,
	closed: Arc<AtomicBool>,
	request_timeout: Duration,
	tasks: Vec<JoinHandle<()>>,
}

impl CdpConnection {
	/// Opens the websocket at `url` and spawns the reader and writer tasks.
	pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self> {
		let (stream, _) = tokio::time::timeout(request_timeout, tokio_tungstenite::connect_async(url))
			.await
			.map_err(|_| RuntimeError::Timeout {
				method: "connect".to_string(),
				timeout: request_timeout,
			})?
			.map_err(|e| RuntimeError::WebSocket(e.to_string()))?;
		let (mut sink, mut source) = stream.split();

		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let closed = Arc::new(AtomicBool::new(false));
		let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

		let writer_closed = Arc::clone(&closed);
		let writer = tokio::spawn(async move {
			while let Some(message) = outgoing_rx.recv().await {
				if let Err(err) = sink.send(message).await {
					debug!(target = "slotwatch.cdp", error = %err, "websocket write failed");
					writer_closed.store(true, Ordering::SeqCst);
					break;
				}
			}
			let _ = sink.close().await;
		});

		let reader_pending = Arc::clone(&pending);
		let reader_closed = Arc::clone(&closed);
		let reader = tokio::spawn(async move {
			while let Some(frame) = source.next().await {
				let text = match frame {
					Ok(Message::Text(text)) => text,
					Ok(Message::Close(_)) => break,
					Ok(_) => continue,
					Err(err) => {
						debug!(target = "slotwatch.cdp", error = %err, "websocket read failed");
						break;
					}
				};
				dispatch(&reader_pending, text.as_str());
			}

			reader_closed.store(true, Ordering::SeqCst);
			let drained: Vec<_> = reader_pending.lock().drain().collect();
			for (_, tx) in drained {
				let _ = tx.send(Err(RuntimeError::ConnectionClosed));
			}
			debug!(target = "slotwatch.cdp", "message loop ended");
		});

		Ok(Self {
			last_id: AtomicU64::new(1),
			pending,
			outgoing,
			closed,
			request_timeout,
			tasks: vec![writer, reader],
		})
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Sends `method` and waits for its response, bounded by the request timeout.
	pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
		self.call_with_timeout(method, params, self.request_timeout).await
	}

	pub async fn call_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
		if self.is_closed() {
			return Err(RuntimeError::ConnectionClosed);
		}

		let id = self.last_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);

		let payload = serde_json::to_string(&Request { id, method, params })?;
		trace!(target = "slotwatch.cdp", id, method, "send");
		if self.outgoing.send(Message::Text(payload.into())).is_err() {
			self.pending.lock().remove(&id);
			return Err(RuntimeError::ConnectionClosed);
		}

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(RuntimeError::ConnectionClosed),
			Err(_) => {
				self.pending.lock().remove(&id);
				Err(RuntimeError::Timeout {
					method: method.to_string(),
					timeout,
				})
			}
		}
	}

	/// Stops both background tasks. Pending calls fail with `ConnectionClosed`.
	pub fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		for task in &self.tasks {
			task.abort();
		}
		let drained: Vec<_> = self.pending.lock().drain().collect();
		for (_, tx) in drained {
			let _ = tx.send(Err(RuntimeError::ConnectionClosed));
		}
	}
}

impl Drop for CdpConnection {
	fn drop(&mut self) {
		self.close();
	}
}

fn dispatch(pending: &Pending, text: &str) {
	match serde_json::from_str::<Incoming>(text) {
		Ok(Incoming::Response { id, result, error }) => {
			let Some(tx) = pending.lock().remove(&id) else {
				debug!(target = "slotwatch.cdp", id, "response for unknown request");
				return;
			};
			let outcome = match error {
				Some(err) => Err(RuntimeError::Protocol {
					code: err.code,
					message: err.message,
				}),
				None => Ok(result.unwrap_or(Value::Null)),
			};
			let _ = tx.send(outcome);
		}
		Ok(Incoming::Event { method, params }) => {
			trace!(target = "slotwatch.cdp", %method, %params, "event");
		}
		Err(err) => {
			debug!(target = "slotwatch.cdp", error = %err, "unparseable message");
		}
	}
}
