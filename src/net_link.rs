use crate::config::Config;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use url::Url;

const COMMAND_CHANNEL_SIZE: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum NetEvent {
    Connected,
    Disconnected,
    Text(String),
    Binary(Bytes),
    /// Connection attempt or session failure, for display.
    Error(String),
}

#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    SendBinary(Bytes),
    Connect,
    Disconnect,
}

/// Why a session ended without an error.
enum SessionEnd {
    Requested,
    Shutdown,
}

/// Cloneable sender side of the link. Sends while disconnected are dropped.
#[derive(Clone)]
pub struct NetHandle {
    tx: mpsc::Sender<NetCommand>,
    connected: Arc<AtomicBool>,
}

impl NetHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::TransportUnavailable)
        }
    }

    /// Returns false if the message was dropped.
    pub async fn send_text(&self, text: String) -> bool {
        if let Err(e) = self.ensure_connected() {
            log::debug!("Dropping outbound text: {}", e);
            return false;
        }
        self.tx.send(NetCommand::SendText(text)).await.is_ok()
    }

    pub async fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string()).await
    }

    pub async fn send_binary(&self, data: Bytes) -> bool {
        if let Err(e) = self.ensure_connected() {
            log::debug!("Dropping outbound audio: {}", e);
            return false;
        }
        self.tx.send(NetCommand::SendBinary(data)).await.is_ok()
    }

    pub async fn connect(&self) {
        let _ = self.tx.send(NetCommand::Connect).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.tx.send(NetCommand::Disconnect).await;
    }
}

pub struct NetLink {
    url: Url,
    reconnect: bool,
    max_retry_delay: u64,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
    connected: Arc<AtomicBool>,
}

impl NetLink {
    pub fn new(config: &Config, tx: mpsc::Sender<NetEvent>) -> Result<(Self, NetHandle)> {
        let (cmd_tx, rx_cmd) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let connected = Arc::new(AtomicBool::new(false));
        let link = Self {
            url: config.connect_url()?,
            reconnect: config.network.reconnect,
            max_retry_delay: config.network.max_retry_delay_secs.max(1),
            tx,
            rx_cmd,
            connected: connected.clone(),
        };
        let handle = NetHandle {
            tx: cmd_tx,
            connected,
        };
        Ok((link, handle))
    }

    /// Idle until a `Connect` command, then keep the session up until
    /// `Disconnect`. Returns once every [`NetHandle`] is dropped.
    pub async fn run(mut self) {
        let mut want_connected = false;
        // 重试机制，指数退避
        let mut retry_delay = 1;

        loop {
            if !want_connected {
                match self.rx_cmd.recv().await {
                    Some(NetCommand::Connect) => {
                        want_connected = true;
                        retry_delay = 1;
                    }
                    Some(NetCommand::Disconnect) => {}
                    Some(_) => log::debug!("Not connected, dropping outbound message"),
                    None => break,
                }
                continue;
            }

            match self.connect_and_loop(&mut retry_delay).await {
                Ok(SessionEnd::Requested) => want_connected = false,
                Ok(SessionEnd::Shutdown) => break,
                Err(e) => {
                    let _ = self.tx.send(NetEvent::Error(e.to_string())).await;
                    if !self.reconnect {
                        log::warn!("Connection error: {}", e);
                        want_connected = false;
                        continue;
                    }
                    log::warn!("Connection error: {}. Retrying in {}s...", e, retry_delay);
                    match self.backoff(Duration::from_secs(retry_delay)).await {
                        Some(keep) => want_connected = keep,
                        None => break,
                    }
                    retry_delay = std::cmp::min(retry_delay * 2, self.max_retry_delay);
                }
            }
        }
        log::info!("Network link stopped");
    }

    /// Sleep before reconnecting while still honouring commands. Returns
    /// whether to reconnect, or `None` on shutdown.
    async fn backoff(&mut self, delay: Duration) -> Option<bool> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Some(true),
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(NetCommand::Disconnect) => return Some(false),
                    Some(NetCommand::Connect) => return Some(true),
                    Some(_) => log::debug!("Reconnecting, dropping outbound message"),
                    None => return None,
                },
            }
        }
    }

    async fn connect_and_loop(&mut self, retry_delay: &mut u64) -> anyhow::Result<SessionEnd> {
        log::info!("Connecting to {}...", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        log::info!("Connected!");
        *retry_delay = 1;

        self.connected.store(true, Ordering::SeqCst);
        if self.tx.send(NetEvent::Connected).await.is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return Ok(SessionEnd::Shutdown);
        }

        let result = self.pump(ws_stream).await;

        self.connected.store(false, Ordering::SeqCst);
        log::info!("Disconnected");
        let _ = self.tx.send(NetEvent::Disconnected).await;
        result
    }

    async fn pump(&mut self, ws_stream: WsStream) -> anyhow::Result<SessionEnd> {
        let (mut write, mut read) = ws_stream.split();
        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if self.tx.send(NetEvent::Text(text.to_string())).await.is_err() {
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if self.tx.send(NetEvent::Binary(data)).await.is_err() {
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        return Err(anyhow::anyhow!("Connection closed"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(anyhow::anyhow!("Connection closed")),
                },
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(NetCommand::SendText(text)) => {
                        write.send(Message::Text(text.into())).await?;
                    }
                    Some(NetCommand::SendBinary(data)) => {
                        write.send(Message::Binary(data)).await?;
                    }
                    Some(NetCommand::Connect) => {}
                    Some(NetCommand::Disconnect) => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Requested);
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                },
            }
        }
    }
}
