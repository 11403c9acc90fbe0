// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::creds::{load_credentials, save_credentials, Credentials};
use crate::error::{ControlError, Result};
use crate::token::{acquire_token, HTTP_TIMEOUT};
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use olm_wgtunnel_common::WsMessage;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};
use url::Url;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Handler invoked once per inbound message of a registered type. Handlers
/// run serially on the read task and are awaited to completion before the
/// next frame is dispatched.
pub type MessageHandler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;

pub type ConnectCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type TokenCallback = Arc<dyn Fn(String) + Send + Sync>;

struct OutboundFrame {
	message: Message,
	ack: oneshot::Sender<Result<()>>,
}

/// Authenticated, reconnecting control channel to the Pangolin server.
pub struct ControlClient {
	inner: Arc<ClientInner>,
}

struct ClientInner {
	http: reqwest::Client,
	creds: Mutex<Credentials>,
	creds_path: Option<PathBuf>,
	handlers: RwLock<HashMap<String, MessageHandler>>,
	outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
	connected: AtomicBool,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
	on_connect: RwLock<Option<ConnectCallback>>,
	on_token_update: RwLock<Option<TokenCallback>>,
}

impl ControlClient {
	/// Builds a client. Persisted credentials (if any) contribute a cached
	/// token; the id, secret, and endpoint given here always win.
	#[instrument(skip(secret, creds_path), fields(olm_id = %olm_id, endpoint = %endpoint))]
	pub async fn new(
		olm_id: &str,
		secret: &str,
		endpoint: &str,
		creds_path: Option<PathBuf>,
	) -> Result<Self> {
		let mut creds = Credentials {
			olm_id: olm_id.to_string(),
			secret: secret.to_string(),
			endpoint: endpoint.to_string(),
			token: None,
		};

		if let Some(path) = &creds_path {
			match load_credentials(path).await {
				Ok(Some(saved)) if saved.olm_id == creds.olm_id => {
					creds.token = saved.token;
				}
				Ok(_) => {}
				Err(e) => warn!(error = %e, "failed to load persisted credentials"),
			}
		}

		let http = reqwest::Client::builder()
			.timeout(HTTP_TIMEOUT)
			.build()?;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Ok(Self {
			inner: Arc::new(ClientInner {
				http,
				creds: Mutex::new(creds),
				creds_path,
				handlers: RwLock::new(HashMap::new()),
				outbound: Mutex::new(None),
				connected: AtomicBool::new(false),
				shutdown_tx,
				shutdown_rx,
				on_connect: RwLock::new(None),
				on_token_update: RwLock::new(None),
			}),
		})
	}

	/// Installs the handler for one message type. Registrations happen
	/// during startup, before `connect`.
	pub async fn register_handler(&self, message_type: &str, handler: MessageHandler) {
		self.inner
			.handlers
			.write()
			.await
			.insert(message_type.to_string(), handler);
	}

	pub async fn on_connect(&self, callback: ConnectCallback) {
		*self.inner.on_connect.write().await = Some(callback);
	}

	pub async fn on_token_update(&self, callback: TokenCallback) {
		*self.inner.on_token_update.write().await = Some(callback);
	}

	/// Starts the background connect/reconnect loop. Never fails: transport
	/// and auth errors are retried indefinitely at a fixed interval.
	pub fn connect(&self) {
		let inner = Arc::clone(&self.inner);
		tokio::spawn(async move {
			run_loop(inner).await;
		});
	}

	/// Serializes `{type, data}` and writes one text frame. Fails when the
	/// channel is not currently connected.
	pub async fn send_message(&self, message_type: &str, data: impl Serialize) -> Result<()> {
		let payload = serde_json::to_string(&WsMessage {
			message_type: message_type.to_string(),
			data: serde_json::to_value(data)?,
		})?;

		let sender = {
			let outbound = self.inner.outbound.lock().await;
			outbound.clone().ok_or(ControlError::NotConnected)?
		};

		let (ack_tx, ack_rx) = oneshot::channel();
		sender
			.send(OutboundFrame {
				message: Message::text(payload),
				ack: ack_tx,
			})
			.map_err(|_| ControlError::NotConnected)?;

		ack_rx.await.map_err(|_| ControlError::NotConnected)?
	}

	pub fn is_connected(&self) -> bool {
		self.inner.connected.load(Ordering::SeqCst)
	}

	/// Signals every task to exit and closes the socket. Idempotent.
	pub async fn close(&self) {
		let _ = self.inner.shutdown_tx.send(true);
		self.inner.connected.store(false, Ordering::SeqCst);
		*self.inner.outbound.lock().await = None;
		info!("control client closed");
	}
}

async fn run_loop(inner: Arc<ClientInner>) {
	let mut shutdown_rx = inner.shutdown_rx.clone();

	loop {
		if *shutdown_rx.borrow() {
			break;
		}

		match run_session(&inner).await {
			Ok(()) => {
				// session ended after a successful connect; retry right away
				debug!("control session ended, reconnecting");
			}
			Err(e) => {
				warn!(error = %e, "control connect failed, retrying in {}s", RECONNECT_INTERVAL.as_secs());
				tokio::select! {
					_ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
					_ = shutdown_rx.changed() => {}
				}
			}
		}
	}

	debug!("control reconnect loop exited");
}

/// Dials and runs one WebSocket session to completion. An `Err` means the
/// session never got established.
async fn run_session(inner: &Arc<ClientInner>) -> Result<()> {
	let ws_url = {
		let mut creds = inner.creds.lock().await;
		let token = acquire_token(
			&inner.http,
			&creds.endpoint,
			&creds.olm_id,
			&creds.secret,
			creds.token.as_deref(),
		)
		.await?;

		if creds.token.as_deref() != Some(token.as_str()) {
			creds.token = Some(token.clone());
			if let Some(cb) = inner.on_token_update.read().await.clone() {
				cb(token.clone());
			}
		}

		websocket_url(&creds.endpoint, &token)?
	};

	let (ws, _) = connect_async(ws_url.as_str()).await?;
	info!("control channel connected");

	let (sink, stream) = ws.split();

	let (tx, rx) = mpsc::unbounded_channel();
	*inner.outbound.lock().await = Some(tx.clone());
	inner.connected.store(true, Ordering::SeqCst);

	if let Some(path) = &inner.creds_path {
		let creds = inner.creds.lock().await.clone();
		if let Err(e) = save_credentials(&creds, path).await {
			warn!(error = %e, "failed to persist credentials");
		}
	}

	// either task exiting tears the session down
	let (down_tx, mut down_rx) = watch::channel(false);

	let writer = tokio::spawn({
		let down = down_tx.clone();
		async move {
			writer_loop(sink, rx).await;
			let _ = down.send(true);
		}
	});
	let heartbeat = tokio::spawn({
		let down = down_tx;
		async move {
			heartbeat_loop(tx).await;
			let _ = down.send(true);
		}
	});

	if let Some(cb) = inner.on_connect.read().await.clone() {
		cb().await;
	}

	let mut shutdown_rx = inner.shutdown_rx.clone();
	tokio::select! {
		_ = read_loop(stream, inner) => {}
		_ = down_rx.changed() => {}
		_ = shutdown_rx.changed() => {}
	}

	inner.connected.store(false, Ordering::SeqCst);
	*inner.outbound.lock().await = None;
	writer.abort();
	heartbeat.abort();

	Ok(())
}

async fn writer_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<OutboundFrame>) {
	while let Some(frame) = rx.recv().await {
		let result = match timeout(WRITE_DEADLINE, sink.send(frame.message)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(ControlError::WebSocket(e)),
			Err(_) => Err(ControlError::NotConnected),
		};

		let failed = result.is_err();
		let _ = frame.ack.send(result);

		if failed {
			warn!("write failed, closing control socket");
			break;
		}
	}

	let _ = sink.close().await;
}

async fn heartbeat_loop(tx: mpsc::UnboundedSender<OutboundFrame>) {
	let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	ticker.tick().await; // first tick fires immediately, skip it

	loop {
		ticker.tick().await;

		let (ack_tx, ack_rx) = oneshot::channel();
		let frame = OutboundFrame {
			message: Message::Ping(Vec::new().into()),
			ack: ack_tx,
		};

		if tx.send(frame).is_err() {
			break;
		}

		match timeout(WRITE_DEADLINE, ack_rx).await {
			Ok(Ok(Ok(()))) => {}
			_ => {
				warn!("heartbeat failed, closing control socket");
				break;
			}
		}
	}
}

async fn read_loop(mut stream: WsStream, inner: &Arc<ClientInner>) {
	while let Some(frame) = stream.next().await {
		match frame {
			Ok(Message::Text(text)) => {
				let msg: WsMessage = match serde_json::from_str(text.as_str()) {
					Ok(msg) => msg,
					Err(e) => {
						warn!(error = %e, "dropping malformed control message");
						continue;
					}
				};

				let handler = inner.handlers.read().await.get(&msg.message_type).cloned();
				match handler {
					Some(handler) => handler(msg.data).await,
					None => debug!(message_type = %msg.message_type, "no handler registered"),
				}
			}
			Ok(Message::Ping(data)) => {
				let outbound = inner.outbound.lock().await;
				if let Some(tx) = outbound.as_ref() {
					let (ack_tx, _ack_rx) = oneshot::channel();
					let _ = tx.send(OutboundFrame {
						message: Message::Pong(data),
						ack: ack_tx,
					});
				}
			}
			Ok(Message::Close(_)) => {
				info!("control channel closed by server");
				break;
			}
			Ok(_) => {}
			Err(e) => {
				warn!(error = %e, "control read error");
				break;
			}
		}
	}
}

/// Derives the WebSocket URL from the HTTP endpoint: `wss` for `https`,
/// `ws` otherwise, path `/api/v1/ws`, token in the query string.
fn websocket_url(endpoint: &str, token: &str) -> Result<Url> {
	let base = Url::parse(endpoint)?;

	let scheme = if base.scheme() == "http" { "ws" } else { "wss" };
	let host = base
		.host_str()
		.ok_or_else(|| ControlError::InvalidEndpoint(endpoint.to_string()))?;

	let authority = match base.port() {
		Some(port) => format!("{host}:{port}"),
		None => host.to_string(),
	};

	let mut url = Url::parse(&format!("{scheme}://{authority}/api/v1/ws"))?;
	url.query_pairs_mut().append_pair("token", token);
	Ok(url)
}
