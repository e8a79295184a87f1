//! Playback task: the single consumer that owns the jitter buffer.
//!
//! Controller commands, sink completions and grace timer expirations all
//! arrive on channels drained by one task, so the buffer is only ever
//! mutated from one place. Buffer state is published on a watch channel.

use super::jitter_buffer::{BufferState, DrainCheck, JitterBuffer, PlaybackSink, PlaybackTicket};
use super::pcm::AudioChunk;
use crate::config::AudioConfig;
use crate::error::Result;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const COMMAND_CHANNEL_SIZE: usize = 100;

#[derive(Debug)]
pub enum PlayerCommand {
    Enqueue(AudioChunk),
    /// Drop queued audio, close the sink and open a fresh one (used on
    /// disconnect, before the connection is reused).
    Reset,
}

#[derive(Debug)]
enum PlayerEvent {
    Completed(PlaybackTicket),
    GraceElapsed(DrainCheck),
}

/// Given to the sink so it can report finished chunks. Safe to use from
/// any thread.
#[derive(Clone)]
pub struct CompletionSender(mpsc::UnboundedSender<PlayerEvent>);

impl CompletionSender {
    pub fn complete(&self, ticket: PlaybackTicket) {
        // Player gone: nobody is waiting for this.
        let _ = self.0.send(PlayerEvent::Completed(ticket));
    }
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub target_latency: Duration,
    pub grace: Duration,
    pub start_lead: Duration,
}

impl From<&AudioConfig> for PlayerConfig {
    fn from(config: &AudioConfig) -> Self {
        Self {
            target_latency: config.target_latency(),
            grace: config.grace_delay(),
            start_lead: config.start_lead(),
        }
    }
}

#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerCommand>,
    state: watch::Receiver<BufferState>,
}

impl PlayerHandle {
    /// Queue a decoded chunk. Returns false if the player has stopped.
    pub async fn enqueue(&self, chunk: AudioChunk) -> bool {
        self.send(PlayerCommand::Enqueue(chunk)).await
    }

    pub async fn reset(&self) -> bool {
        self.send(PlayerCommand::Reset).await
    }

    async fn send(&self, cmd: PlayerCommand) -> bool {
        if self.tx.send(cmd).await.is_err() {
            log::warn!("Player stopped, dropping command");
            return false;
        }
        true
    }

    pub fn state(&self) -> BufferState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BufferState> {
        self.state.clone()
    }
}

type SinkFactory<S> = Box<dyn FnMut(CompletionSender) -> Result<S> + Send>;

pub struct Player<S> {
    jitter: JitterBuffer<S>,
    make_sink: SinkFactory<S>,
    grace: Duration,
    commands: mpsc::Receiver<PlayerCommand>,
    events_tx: mpsc::UnboundedSender<PlayerEvent>,
    events_rx: mpsc::UnboundedReceiver<PlayerEvent>,
    state_tx: watch::Sender<BufferState>,
    drain_timer: Option<JoinHandle<()>>,
}

impl<S> Player<S>
where
    S: PlaybackSink + Send + 'static,
{
    /// Build a player around the sink returned by `make_sink`, which receives
    /// the channel on which it must report finished chunks. `make_sink` is
    /// called again for every reset.
    pub fn new<F>(config: PlayerConfig, make_sink: F) -> Result<(Self, PlayerHandle)>
    where
        F: FnMut(CompletionSender) -> Result<S> + Send + 'static,
    {
        let mut make_sink: SinkFactory<S> = Box::new(make_sink);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink = make_sink(CompletionSender(events_tx.clone()))?;
        let jitter =
            JitterBuffer::new(sink, config.target_latency).with_start_lead(config.start_lead);

        let (tx, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (state_tx, state) = watch::channel(BufferState::default());

        let player = Self {
            jitter,
            make_sink,
            grace: config.grace,
            commands,
            events_tx,
            events_rx,
            state_tx,
            drain_timer: None,
        };
        Ok((player, PlayerHandle { tx, state }))
    }

    /// Create the player and run it on the current tokio runtime.
    pub fn spawn<F>(config: PlayerConfig, make_sink: F) -> Result<(JoinHandle<()>, PlayerHandle)>
    where
        F: FnMut(CompletionSender) -> Result<S> + Send + 'static,
    {
        let (player, handle) = Self::new(config, make_sink)?;
        Ok((tokio::spawn(player.run()), handle))
    }

    /// Process commands until every [`PlayerHandle`] is dropped.
    pub async fn run(mut self) {
        log::info!("Player started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
            self.publish();
        }
        self.cancel_drain_timer();
        self.jitter.reset();
        log::info!("Player stopped");
    }

    fn handle_command(&mut self, cmd: PlayerCommand) {
        self.cancel_drain_timer();
        match cmd {
            PlayerCommand::Enqueue(chunk) => {
                self.jitter.enqueue(chunk);
            }
            PlayerCommand::Reset => {
                log::info!("Resetting playback (generation {})", self.jitter.generation());
                let completions = CompletionSender(self.events_tx.clone());
                let make_sink = &mut self.make_sink;
                if let Err(e) = self.jitter.rebuild_sink(|| make_sink(completions)) {
                    log::error!("Failed to reopen playback sink: {}", e);
                }
            }
        }
    }

    fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Completed(ticket) => {
                if let Some(check) = self.jitter.on_playback_complete(ticket) {
                    self.arm_drain_timer(check);
                }
            }
            PlayerEvent::GraceElapsed(check) => {
                self.jitter.on_grace_elapsed(check);
            }
        }
    }

    fn arm_drain_timer(&mut self, check: DrainCheck) {
        self.cancel_drain_timer();
        let tx = self.events_tx.clone();
        let grace = self.grace;
        self.drain_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(PlayerEvent::GraceElapsed(check));
        }));
    }

    fn cancel_drain_timer(&mut self) {
        if let Some(timer) = self.drain_timer.take() {
            timer.abort();
        }
    }

    fn publish(&self) {
        let current = self.jitter.state();
        self.state_tx.send_if_modified(|state| {
            if *state != current {
                *state = current;
                true
            } else {
                false
            }
        });
    }
}
