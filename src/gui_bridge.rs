use crate::audio::BufferState;
use crate::chat::ChatMessage;
use crate::config::GuiConfig;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Datagram received from the UI process.
#[derive(Debug)]
pub enum GuiEvent {
    Message(String),
}

/// State pushed to the UI process, one JSON datagram each.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    Chat(ChatMessage),
    Buffer(BufferState),
    Connection {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<GuiEvent>,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &GuiConfig, tx: mpsc::Sender<GuiEvent>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", config.local_port)).await?;
        let target_addr = format!("127.0.0.1:{}", config.remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: config.buffer_size.max(1),
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            match std::str::from_utf8(&buf[..len]) {
                Ok(msg) => {
                    if self.tx.send(GuiEvent::Message(msg.to_string())).await.is_err() {
                        log::info!("GUI event receiver dropped");
                        break;
                    }
                }
                Err(e) => log::debug!("Ignoring non-UTF-8 datagram from UI: {}", e),
            }
        }
        Ok(())
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket.send_to(msg.as_bytes(), &self.target_addr).await?;
        Ok(())
    }

    pub async fn send_event(&self, event: &UiEvent) -> anyhow::Result<()> {
        let json = serde_json::to_string(event)?;
        self.send_message(&json).await
    }
}
