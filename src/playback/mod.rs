//! Sequential playback of synthesized speech
//!
//! The player owns an ordered queue of decoded clips and plays them
//! strictly one at a time through a [`PlaybackSink`]. Cancellation is a
//! single queue-clear operation: the current clip stops, every queued
//! clip reports `Cancelled`, and nothing plays until the next enqueue.
//!
//! # Architecture
//!
//! ```text
//! enqueue/cancel_all ──commands──▶ player task ──▶ PlaybackSink (one clip
//!                                      │               at a time)
//!                                      └──updates──▶ per-item outcome,
//!                                                    queue order
//! ```
//!
//! A clip that fails to play is logged and skipped; a single bad clip
//! must not stall the queue. Hardware aborts resolve as benign
//! completion, never as errors.

pub mod cpal_sink;

pub use cpal_sink::CpalPlaybackSink;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Command channel depth; enqueues beyond this apply backpressure
const COMMAND_CHANNEL_DEPTH: usize = 32;

/// Errors from a single clip. The queue continues past them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Clip bytes were not a decodable container
    BadClip(String),
    /// Output device or stream failure
    SinkFailed(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::BadClip(e) => write!(f, "Undecodable audio clip: {}", e),
            PlaybackError::SinkFailed(e) => write!(f, "Audio output failed: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// How one queued item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to natural completion
    Completed,
    /// Interrupted by `cancel_all` or shutdown; not an error
    Cancelled,
    /// The clip itself failed; the queue moved on
    Failed(PlaybackError),
}

/// A queued clip awaiting playback.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub id: Uuid,
    /// Self-describing container bytes (WAV header + PCM16)
    pub container: Vec<u8>,
}

impl PlaybackItem {
    pub fn new(id: Uuid, container: Vec<u8>) -> Self {
        Self { id, container }
    }
}

/// Per-item completion report, delivered in queue order.
#[derive(Debug, Clone)]
pub struct PlaybackUpdate {
    pub item_id: Uuid,
    pub outcome: PlaybackOutcome,
}

/// One-clip-at-a-time output seam.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Play one clip to completion. Implementations must resolve when
    /// `cancel` fires (stop output, return `Ok`) and must treat hardware
    /// aborts as completion rather than error, or the queue would stall.
    async fn play(&self, container: &[u8], cancel: &CancellationToken)
        -> Result<(), PlaybackError>;
}

enum PlayerCommand {
    Enqueue(PlaybackItem),
    CancelAll,
    Shutdown,
}

/// Strict-FIFO playback queue.
///
/// Outcomes arrive on the updates receiver returned by [`new`], always
/// in enqueue order; no two items ever play concurrently.
///
/// [`new`]: StreamingAudioPlayer::new
pub struct StreamingAudioPlayer {
    commands: mpsc::Sender<PlayerCommand>,
}

impl StreamingAudioPlayer {
    /// Spawn the player task over the given sink.
    pub fn new(sink: Arc<dyn PlaybackSink>) -> (Self, mpsc::Receiver<PlaybackUpdate>) {
        let (commands, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (update_tx, update_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);

        tokio::spawn(run_player(sink, cmd_rx, update_tx));

        (Self { commands }, update_rx)
    }

    /// Append an item to the tail. If the queue is empty and idle,
    /// playback starts immediately.
    pub async fn enqueue(&self, item: PlaybackItem) {
        if self
            .commands
            .send(PlayerCommand::Enqueue(item))
            .await
            .is_err()
        {
            log::warn!("Player task gone, dropping enqueue");
        }
    }

    /// Stop the current item and discard the queue. Every discarded
    /// item reports `Cancelled`, not `Failed`.
    pub async fn cancel_all(&self) {
        if self.commands.send(PlayerCommand::CancelAll).await.is_err() {
            log::debug!("Player task gone, cancel_all is a no-op");
        }
    }

    /// Cancel everything and end the player task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(PlayerCommand::Shutdown).await;
    }
}

async fn run_player(
    sink: Arc<dyn PlaybackSink>,
    mut cmd_rx: mpsc::Receiver<PlayerCommand>,
    updates: mpsc::Sender<PlaybackUpdate>,
) {
    let mut queue: VecDeque<PlaybackItem> = VecDeque::new();
    log::debug!("Player task started");

    'outer: loop {
        // Idle: wait for the head of the queue
        let item = loop {
            if let Some(item) = queue.pop_front() {
                break item;
            }
            match cmd_rx.recv().await {
                Some(PlayerCommand::Enqueue(item)) => queue.push_back(item),
                Some(PlayerCommand::CancelAll) => {} // nothing to cancel
                Some(PlayerCommand::Shutdown) | None => break 'outer,
            }
        };

        let cancel = CancellationToken::new();
        let play_fut = sink.play(&item.container, &cancel);
        tokio::pin!(play_fut);

        let mut shutting_down = false;
        let outcome = loop {
            tokio::select! {
                result = &mut play_fut => {
                    break match result {
                        // A cancelled sink resolves Ok; report the interruption
                        Ok(()) if cancel.is_cancelled() => PlaybackOutcome::Cancelled,
                        Ok(()) => PlaybackOutcome::Completed,
                        Err(e) => PlaybackOutcome::Failed(e),
                    };
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(PlayerCommand::Enqueue(item)) => queue.push_back(item),
                    Some(PlayerCommand::CancelAll) => cancel.cancel(),
                    Some(PlayerCommand::Shutdown) | None => {
                        shutting_down = true;
                        cancel.cancel();
                    }
                },
            }
        };

        if let PlaybackOutcome::Failed(ref e) = outcome {
            log::warn!("Playback of item {} failed: {} (queue continues)", item.id, e);
        }

        let discard_queue = matches!(outcome, PlaybackOutcome::Cancelled);
        let _ = updates
            .send(PlaybackUpdate {
                item_id: item.id,
                outcome,
            })
            .await;

        if discard_queue {
            for queued in queue.drain(..) {
                let _ = updates
                    .send(PlaybackUpdate {
                        item_id: queued.id,
                        outcome: PlaybackOutcome::Cancelled,
                    })
                    .await;
            }
        }

        if shutting_down {
            break;
        }
    }

    log::debug!("Player task ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Sink that records start/end markers and simulates clip duration.
    struct RecordingSink {
        events: Mutex<Vec<String>>,
        playing: AtomicBool,
        clip_duration: Duration,
    }

    impl RecordingSink {
        fn new(clip_duration: Duration) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                playing: AtomicBool::new(false),
                clip_duration,
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlaybackSink for RecordingSink {
        async fn play(
            &self,
            container: &[u8],
            cancel: &CancellationToken,
        ) -> Result<(), PlaybackError> {
            // First byte doubles as the clip label in these tests
            let label = container.first().copied().unwrap_or(0);

            assert!(
                !self.playing.swap(true, Ordering::SeqCst),
                "two clips playing concurrently"
            );
            self.events.lock().unwrap().push(format!("start:{}", label));

            tokio::select! {
                _ = sleep(self.clip_duration) => {}
                _ = cancel.cancelled() => {}
            }

            self.events.lock().unwrap().push(format!("end:{}", label));
            self.playing.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sink that fails every clip.
    struct FailingSink;

    #[async_trait]
    impl PlaybackSink for FailingSink {
        async fn play(
            &self,
            _container: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<(), PlaybackError> {
            Err(PlaybackError::SinkFailed("broken speaker".to_string()))
        }
    }

    fn item(label: u8) -> PlaybackItem {
        PlaybackItem::new(Uuid::new_v4(), vec![label])
    }

    #[tokio::test]
    async fn test_fifo_order_no_overlap() {
        let sink = Arc::new(RecordingSink::new(Duration::from_millis(20)));
        let (player, mut updates) = StreamingAudioPlayer::new(sink.clone());

        let a = item(1);
        let b = item(2);
        let c = item(3);
        let ids = [a.id, b.id, c.id];

        player.enqueue(a).await;
        player.enqueue(b).await;
        player.enqueue(c).await;

        for expected_id in ids {
            let update = updates.recv().await.unwrap();
            assert_eq!(update.item_id, expected_id);
            assert_eq!(update.outcome, PlaybackOutcome::Completed);
        }

        assert_eq!(
            sink.events(),
            vec!["start:1", "end:1", "start:2", "end:2", "start:3", "end:3"]
        );
    }

    #[tokio::test]
    async fn test_cancel_all_reports_cancelled_for_current_and_queued() {
        let sink = Arc::new(RecordingSink::new(Duration::from_secs(30)));
        let (player, mut updates) = StreamingAudioPlayer::new(sink.clone());

        let b = item(2);
        let c = item(3);
        let (b_id, c_id) = (b.id, c.id);

        player.enqueue(b).await;
        player.enqueue(c).await;

        // Let B start before cancelling
        sleep(Duration::from_millis(30)).await;
        player.cancel_all().await;

        let first = updates.recv().await.unwrap();
        assert_eq!(first.item_id, b_id);
        assert_eq!(first.outcome, PlaybackOutcome::Cancelled);

        let second = updates.recv().await.unwrap();
        assert_eq!(second.item_id, c_id);
        assert_eq!(second.outcome, PlaybackOutcome::Cancelled);

        // Nothing further plays until a new enqueue
        sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_err());

        let d = item(4);
        let d_id = d.id;
        player.enqueue(d).await;
        let third = updates.recv().await.unwrap();
        assert_eq!(third.item_id, d_id);
        assert_eq!(third.outcome, PlaybackOutcome::Completed);
    }

    #[tokio::test]
    async fn test_failed_clip_does_not_stall_queue() {
        let sink = Arc::new(FailingSink);
        let (player, mut updates) = StreamingAudioPlayer::new(sink);

        let a = item(1);
        let b = item(2);
        let (a_id, b_id) = (a.id, b.id);

        player.enqueue(a).await;
        player.enqueue(b).await;

        let first = updates.recv().await.unwrap();
        assert_eq!(first.item_id, a_id);
        assert!(matches!(first.outcome, PlaybackOutcome::Failed(_)));

        // The queue continued to the next item instead of stalling
        let second = updates.recv().await.unwrap();
        assert_eq!(second.item_id, b_id);
        assert!(matches!(second.outcome, PlaybackOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_enqueue_during_playback_waits_its_turn() {
        let sink = Arc::new(RecordingSink::new(Duration::from_millis(40)));
        let (player, mut updates) = StreamingAudioPlayer::new(sink.clone());

        player.enqueue(item(1)).await;
        sleep(Duration::from_millis(10)).await;
        // Arrives while clip 1 is mid-playback
        player.enqueue(item(2)).await;

        assert_eq!(
            updates.recv().await.unwrap().outcome,
            PlaybackOutcome::Completed
        );
        assert_eq!(
            updates.recv().await.unwrap().outcome,
            PlaybackOutcome::Completed
        );

        assert_eq!(
            sink.events(),
            vec!["start:1", "end:1", "start:2", "end:2"]
        );
    }

    #[tokio::test]
    async fn test_cancel_all_when_idle_is_a_no_op() {
        let sink = Arc::new(RecordingSink::new(Duration::from_millis(10)));
        let (player, mut updates) = StreamingAudioPlayer::new(sink);

        player.cancel_all().await;

        let a = item(1);
        let a_id = a.id;
        player.enqueue(a).await;

        let update = updates.recv().await.unwrap();
        assert_eq!(update.item_id, a_id);
        assert_eq!(update.outcome, PlaybackOutcome::Completed);
    }
}
