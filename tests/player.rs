use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use ziggy_voice_rs::audio::{
    AudioChunk, BufferState, BufferStatus, ClockSink, PlaybackSink, PlaybackTicket, Player,
    PlayerConfig, PlayerHandle,
};

fn config() -> PlayerConfig {
    PlayerConfig {
        target_latency: Duration::from_millis(300),
        grace: Duration::from_millis(100),
        start_lead: Duration::from_millis(50),
    }
}

fn chunk_100ms() -> AudioChunk {
    AudioChunk::new(vec![0.0; 100], 1000).unwrap()
}

fn spawn_player() -> PlayerHandle {
    let (_task, player) = Player::spawn(config(), |c| Ok(ClockSink::new(c))).unwrap();
    player
}

async fn wait_for(
    rx: &mut watch::Receiver<BufferState>,
    pred: impl FnMut(&BufferState) -> bool,
) -> BufferState {
    *rx.wait_for(pred).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_buffers_plays_and_drains() {
    let start = Instant::now();
    let player = spawn_player();
    let mut state = player.subscribe();

    player.enqueue(chunk_100ms()).await;
    player.enqueue(chunk_100ms()).await;
    let s = wait_for(&mut state, |s| s.fill_percent > 60.0).await;
    assert_eq!(s.status, BufferStatus::Buffering);

    player.enqueue(chunk_100ms()).await;
    let s = wait_for(&mut state, |s| s.status == BufferStatus::Playing).await;
    assert_eq!(s.fill_percent, 100.0);

    wait_for(&mut state, |s| s.status == BufferStatus::Ready).await;
    // 50 ms lead + 300 ms of audio + 100 ms grace
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(450), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
    assert_eq!(player.state().fill_percent, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_arrival_during_grace_keeps_playing() {
    let start = Instant::now();
    let player = spawn_player();
    let mut state = player.subscribe();

    for _ in 0..3 {
        player.enqueue(chunk_100ms()).await;
    }
    wait_for(&mut state, |s| s.status == BufferStatus::Playing).await;

    // The last chunk ends at 350 ms; 400 ms is inside the grace window.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(player.state().status, BufferStatus::Playing);
    player.enqueue(chunk_100ms()).await;

    sleep(Duration::from_millis(60)).await;
    assert_eq!(player.state().status, BufferStatus::Playing);

    wait_for(&mut state, |s| s.status == BufferStatus::Ready).await;
    // New chunk plays 400..500 ms, then the grace period.
    assert!(start.elapsed() >= Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_reset_mid_stream() {
    let player = spawn_player();
    let mut state = player.subscribe();

    for _ in 0..3 {
        player.enqueue(chunk_100ms()).await;
    }
    wait_for(&mut state, |s| s.status == BufferStatus::Playing).await;

    sleep(Duration::from_millis(200)).await;
    player.reset().await;
    let s = wait_for(&mut state, |s| s.status == BufferStatus::Ready).await;
    assert_eq!(s.fill_percent, 0.0);

    // Completions of the old session must not disturb the new one.
    player.enqueue(chunk_100ms()).await;
    wait_for(&mut state, |s| s.status == BufferStatus::Buffering).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(player.state().status, BufferStatus::Buffering);
}

#[tokio::test(start_paused = true)]
async fn test_player_stops_when_handles_dropped() {
    let (task, player) = Player::spawn(config(), |c| Ok(ClockSink::new(c))).unwrap();
    player.enqueue(chunk_100ms()).await;
    drop(player);
    task.await.unwrap();
}

/// Clock sink that counts how many instances are open.
struct TrackedSink {
    inner: ClockSink,
    open: Arc<AtomicUsize>,
    closed: bool,
}

impl PlaybackSink for TrackedSink {
    fn now(&self) -> f64 {
        self.inner.now()
    }

    fn schedule(&mut self, chunk: AudioChunk, at: f64, ticket: PlaybackTicket) {
        self.inner.schedule(chunk, at, ticket)
    }

    fn reset(&mut self) {
        self.inner.reset()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for TrackedSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[tokio::test(start_paused = true)]
async fn test_reset_reopens_sink() {
    let built = Arc::new(AtomicUsize::new(0));
    let open = Arc::new(AtomicUsize::new(0));
    let (_task, player) = {
        let built = built.clone();
        let open = open.clone();
        Player::spawn(config(), move |c| {
            built.fetch_add(1, Ordering::SeqCst);
            // The previous sink must be closed before the next one opens.
            assert_eq!(open.fetch_add(1, Ordering::SeqCst), 0);
            Ok(TrackedSink {
                inner: ClockSink::new(c),
                open: open.clone(),
                closed: false,
            })
        })
        .unwrap()
    };
    let mut state = player.subscribe();
    assert_eq!(built.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        player.enqueue(chunk_100ms()).await;
    }
    wait_for(&mut state, |s| s.status == BufferStatus::Playing).await;

    // Disconnect, then the next session plays on a new sink.
    player.reset().await;
    wait_for(&mut state, |s| s.status == BufferStatus::Ready).await;
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert_eq!(open.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        player.enqueue(chunk_100ms()).await;
    }
    wait_for(&mut state, |s| s.status == BufferStatus::Playing).await;
    wait_for(&mut state, |s| s.status == BufferStatus::Ready).await;
    assert_eq!(built.load(Ordering::SeqCst), 2);
}
