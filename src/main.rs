use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use ziggy_voice_rs::audio::{
    CaptureSource, ClockSink, CompletionSender, PlaybackSink, Player, PlayerConfig,
};
use ziggy_voice_rs::config::{Config, SerializerMode};
use ziggy_voice_rs::controller::{CoreController, UserCommand};
use ziggy_voice_rs::frame::OutboundPacket;
use ziggy_voice_rs::gui_bridge::{GuiBridge, GuiEvent};
use ziggy_voice_rs::net_link::{NetEvent, NetLink};

const CAPTURE_CHANNEL_SIZE: usize = 32;

/// Voice chat client for the Ziggy AI server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file (default: config.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket endpoint, e.g. ws://localhost:3001/user-audio-input
    #[arg(long)]
    server: Option<String>,

    /// raw | raw_no_header | protobuf | opus
    #[arg(long)]
    serializer: Option<SerializerMode>,

    /// Audio buffered before playback starts
    #[arg(long)]
    buffer_ms: Option<u32>,

    /// Raw PCM16 mono file used as the microphone
    #[arg(long)]
    input: Option<PathBuf>,
}

fn open_sink(
    device: &str,
    sample_rate: u32,
    completions: CompletionSender,
) -> ziggy_voice_rs::Result<Box<dyn PlaybackSink + Send>> {
    #[cfg(feature = "alsa")]
    {
        match ziggy_voice_rs::audio::AlsaSink::open(device, sample_rate, completions.clone()) {
            Ok(sink) => return Ok(Box::new(sink)),
            Err(e) => log::warn!("ALSA playback unavailable ({}), falling back to clock", e),
        }
    }
    #[cfg(not(feature = "alsa"))]
    let _ = (device, sample_rate);

    log::info!("Playing through the device-less clock sink");
    Ok(Box::new(ClockSink::new(completions)))
}

#[cfg(feature = "alsa")]
fn default_capture(config: &Config) -> Option<CaptureSource> {
    Some(CaptureSource::Alsa(config.audio.capture_device.clone()))
}

#[cfg(not(feature = "alsa"))]
fn default_capture(_config: &Config) -> Option<CaptureSource> {
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let args = Args::parse();

    // 加载配置，命令行参数优先
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(server) = &args.server {
        config.network.server_url = server.clone();
    }
    if let Some(serializer) = args.serializer {
        config.network.serializer = serializer;
    }
    if let Some(buffer_ms) = args.buffer_ms {
        config.audio.buffer_ms = buffer_ms;
    }
    config.validate()?;

    // 创建通道，用于组件间通信
    let (tx_net_event, mut rx_net_event) = mpsc::channel::<NetEvent>(100);
    let (tx_gui_event, mut rx_gui_event) = mpsc::channel::<GuiEvent>(100);
    let (tx_capture, mut rx_capture) = mpsc::channel::<OutboundPacket>(CAPTURE_CHANNEL_SIZE);

    // 启动GUI桥，与GUI进程通信
    let gui_bridge = if config.gui.enabled {
        let bridge = Arc::new(GuiBridge::new(&config.gui, tx_gui_event).await?);
        let bridge_clone = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge_clone.run().await {
                log::error!("GuiBridge error: {}", e);
            }
        });
        Some(bridge)
    } else {
        drop(tx_gui_event);
        None
    };

    // 启动网络链接
    let (net_link, net) = NetLink::new(&config, tx_net_event)?;
    tokio::spawn(net_link.run());

    // 启动播放任务
    let device = config.audio.playback_device.clone();
    let output_rate = config.audio.output_sample_rate;
    let (_player_task, player) = Player::spawn(PlayerConfig::from(&config.audio), move |c| {
        open_sink(&device, output_rate, c)
    })?;
    let mut buffer_state = player.subscribe();

    let source = args
        .input
        .clone()
        .map(CaptureSource::File)
        .or_else(|| default_capture(&config));
    let mut controller = CoreController::new(
        &config,
        net.clone(),
        player,
        gui_bridge,
        source,
        tx_capture,
    );

    log::info!(
        "Connecting to {} (serializer {}, buffer {} ms)",
        config.network.server_url,
        config.network.serializer,
        config.audio.buffer_ms
    );
    net.connect().await;
    println!("Commands: /mic /connect /disconnect /game <id> /envelope [text] /unsafe /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(event) = rx_net_event.recv() => controller.handle_net_event(event).await,

            Some(packet) = rx_capture.recv() => controller.handle_capture_packet(packet).await,

            Some(event) = rx_gui_event.recv() => controller.handle_gui_event(event).await,

            Ok(()) = buffer_state.changed() => {
                let state = *buffer_state.borrow_and_update();
                controller.handle_buffer_state(state).await;
            }

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match UserCommand::parse(&line) {
                    Some(UserCommand::Quit) => break,
                    Some(cmd) => controller.handle_user_command(cmd).await,
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command: {}", line.trim()),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("stdin error: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    net.disconnect().await;
    drop(controller);
    Ok(())
}
