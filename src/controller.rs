use crate::audio::{AudioChunk, BufferState, CaptureSource, PlayerHandle, Recorder};
use crate::chat::{ChatLog, ChatMessage, Role};
use crate::config::{Config, SerializerMode};
use crate::frame::{self, OutboundPacket, WireFrame, WireMode};
use crate::gui_bridge::{GuiBridge, GuiEvent, UiEvent};
use crate::net_link::{NetEvent, NetHandle};
use crate::protocol;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_AGENT: &str = "default";
const ENVELOPE_TEXT: &str = "Hello from Standard Envelope!";
const UNSAFE_TEXT: &str = "I want to talk about war and violence";

/// A line typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    ToggleMic,
    Connect,
    Disconnect,
    GameContext(String),
    Envelope(String),
    UnsafeTrigger,
    Text(String),
    Quit,
}

impl UserCommand {
    /// `None` for blank lines, unknown commands and `/game` without an id.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('/') {
            return Some(UserCommand::Text(line.to_string()));
        }

        let (cmd, arg) = match line.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (line, ""),
        };
        match cmd {
            "/mic" => Some(UserCommand::ToggleMic),
            "/connect" => Some(UserCommand::Connect),
            "/disconnect" => Some(UserCommand::Disconnect),
            "/game" if !arg.is_empty() => Some(UserCommand::GameContext(arg.to_string())),
            "/envelope" if arg.is_empty() => Some(UserCommand::Envelope(ENVELOPE_TEXT.to_string())),
            "/envelope" => Some(UserCommand::Envelope(arg.to_string())),
            "/unsafe" => Some(UserCommand::UnsafeTrigger),
            "/quit" => Some(UserCommand::Quit),
            _ => None,
        }
    }
}

pub struct CoreController {
    serializer: SerializerMode,
    wire_mode: Option<WireMode>,
    capture_rate: u32,
    net: NetHandle,
    player: PlayerHandle,
    chat: ChatLog,
    gui_bridge: Option<Arc<GuiBridge>>,
    recorder: Recorder,
    capture_source: Option<CaptureSource>,
    capture_tx: mpsc::Sender<OutboundPacket>,
}

impl CoreController {
    pub fn new(
        config: &Config,
        net: NetHandle,
        player: PlayerHandle,
        gui_bridge: Option<Arc<GuiBridge>>,
        capture_source: Option<CaptureSource>,
        capture_tx: mpsc::Sender<OutboundPacket>,
    ) -> Self {
        Self {
            serializer: config.network.serializer,
            wire_mode: config.network.serializer.wire_mode(),
            capture_rate: config.audio.capture_sample_rate,
            net,
            player,
            chat: ChatLog::new(),
            gui_bridge,
            recorder: Recorder::new(config.audio.capture_frames),
            capture_source,
            capture_tx,
        }
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub async fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Text(text) => match frame::parse_text(&text) {
                Ok(value) => self.process_control(value).await,
                Err(e) => log::debug!("Dropping text frame: {}", e),
            },
            NetEvent::Binary(data) => self.process_binary(data).await,
            NetEvent::Connected => {
                log::info!("WebSocket Connected");
                let text = format!("Connected to Ziggy AI ({})", self.serializer);
                self.add_system(text).await;
                self.notify(&UiEvent::Connection {
                    connected: true,
                    detail: None,
                })
                .await;
            }
            NetEvent::Disconnected => {
                log::info!("WebSocket Disconnected");
                self.player.reset().await;
                self.add_system("Disconnected").await;
                self.notify(&UiEvent::Connection {
                    connected: false,
                    detail: None,
                })
                .await;
            }
            NetEvent::Error(e) => {
                log::warn!("Connection error: {}", e);
                self.add_system(format!("Connection error: {}", e)).await;
                self.notify(&UiEvent::Connection {
                    connected: false,
                    detail: Some(e),
                })
                .await;
            }
        }
    }

    async fn process_binary(&mut self, data: Bytes) {
        let Some(mode) = self.wire_mode else {
            log::debug!(
                "No decoder for serializer {}, dropping {} byte frame",
                self.serializer,
                data.len()
            );
            return;
        };

        match frame::demux(&data, mode) {
            Ok(Some(WireFrame::Audio {
                sample_rate,
                payload,
            })) => match AudioChunk::from_pcm16(&payload, sample_rate) {
                Ok(chunk) => {
                    self.player.enqueue(chunk).await;
                }
                Err(e) => log::debug!("Dropping audio frame: {}", e),
            },
            Ok(Some(WireFrame::Control(value))) => self.process_control(value).await,
            Ok(None) => {}
            Err(e) => log::debug!("Dropping frame: {}", e),
        }
    }

    async fn process_control(&mut self, value: Value) {
        let Some(msg) = protocol::route(&value) else {
            return;
        };
        if let Some(entry) = self.chat.apply(msg).cloned() {
            print_entry(&entry);
            self.notify(&UiEvent::Chat(entry)).await;
        }
    }

    /// Forward one captured microphone buffer to the server.
    pub async fn handle_capture_packet(&mut self, packet: OutboundPacket) {
        self.net.send_binary(packet.encode()).await;
    }

    pub async fn handle_buffer_state(&mut self, state: BufferState) {
        log::debug!("Buffer {:?} {:.0}%", state.status, state.fill_percent);
        self.notify(&UiEvent::Buffer(state)).await;
    }

    pub async fn handle_gui_event(&mut self, event: GuiEvent) {
        let GuiEvent::Message(msg) = event;
        log::info!("Received Message from GUI: {}", msg);
        self.net.send_text(msg).await;
    }

    /// Apply a stdin command. `Quit` is left to the caller.
    pub async fn handle_user_command(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::ToggleMic => self.toggle_mic().await,
            UserCommand::Connect => self.net.connect().await,
            UserCommand::Disconnect => {
                self.recorder.shutdown().await;
                self.net.disconnect().await;
            }
            UserCommand::GameContext(game_id) => {
                let msg = protocol::game_context(&game_id);
                self.send_control(&msg, format!("Sent Game Context: {}", game_id))
                    .await;
            }
            UserCommand::Envelope(text) => {
                let msg = protocol::text_envelope(&text, DEFAULT_AGENT);
                self.send_control(&msg, "Sent Standard Envelope").await;
            }
            UserCommand::UnsafeTrigger => {
                let msg = protocol::flat_text(UNSAFE_TEXT, DEFAULT_AGENT);
                self.send_control(&msg, "Sent Unsafe Trigger").await;
            }
            UserCommand::Text(text) => {
                let msg = protocol::flat_text(&text, DEFAULT_AGENT);
                if !self.net.send_json(&msg).await {
                    println!("Not connected");
                }
            }
            UserCommand::Quit => {}
        }
    }

    async fn send_control(&mut self, msg: &Value, note: impl Into<String>) {
        if self.net.send_json(msg).await {
            self.add_system(note).await;
        } else {
            println!("Not connected");
        }
    }

    async fn toggle_mic(&mut self) {
        if self.recorder.is_recording() {
            self.recorder.shutdown().await;
            self.add_system("Microphone off").await;
            return;
        }
        let Some(source) = self.capture_source.clone() else {
            println!("No capture source configured");
            return;
        };
        match self
            .recorder
            .start_source(&source, self.capture_rate, self.capture_tx.clone())
        {
            Ok(()) => self.add_system("Microphone on").await,
            Err(e) => {
                log::error!("Failed to start recording: {}", e);
                self.add_system(format!("Microphone unavailable: {}", e)).await;
            }
        }
    }

    async fn add_system(&mut self, text: impl Into<String>) {
        let entry = self.chat.system(text).clone();
        print_entry(&entry);
        self.notify(&UiEvent::Chat(entry)).await;
    }

    async fn notify(&self, event: &UiEvent) {
        if let Some(gui) = &self.gui_bridge {
            if let Err(e) = gui.send_event(event).await {
                log::warn!("Failed to send to GUI: {}", e);
            }
        }
    }
}

fn print_entry(entry: &ChatMessage) {
    match (entry.role, &entry.label) {
        (Role::System, _) => println!("* {}", entry.text),
        (_, Some(label)) => println!("{}: {}", label, entry.text),
        (_, None) => println!("{}", entry.text),
    }
    if let Some(emotion) = &entry.emotion {
        println!("  ({})", emotion);
    }
}
