//! Timeline playback of ROS bag v2.0 files.
//!
//! A [`Player`] runs as a background task owning all playback state: the
//! loaded bag's metadata, the chunk cache, compiled schemas and the virtual
//! clock. A cloneable [`PlayerHandle`] drives it through commands and
//! observes it through a state watch channel and message-batch
//! subscriptions. The clock ticks every 33 ms; each tick advances the bag
//! time by elapsed wall time times the speed multiplier, publishes a state
//! snapshot and emits every cached message that falls into the one-tick
//! lookback window.

pub mod cache;
pub mod source;
pub mod state;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bagplay_format::{
    decode_chunk, read_bag_header, read_index, BagMetadata, BagTime, RosbagMessage, SchemaCache,
    HEADER_PADDING,
};
use eyre::{eyre, WrapErr};
use futures_concurrency::stream::Merge;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};
use tokio_stream::StreamExt;

pub use cache::{ChunkCache, ChunkCacheEntry, DEFAULT_CACHE_BYTES};
pub use source::{ChunkSource, FileSource, MemorySource};
pub use state::{OptionsUpdate, PlaybackOptions, PlayerState};

/// Cadence of the playback clock.
const TICK: Duration = Duration::from_millis(33);
const TICK_SECS: f64 = 0.033;

/// Chunk reads in flight at once during prefetch.
const PREFETCH_CONCURRENCY: usize = 2;

/// One batch of decoded messages, emitted per tick or seek preview.
pub type MessageBatch = Arc<Vec<RosbagMessage>>;

enum Command {
    LoadFile {
        source: Arc<dyn ChunkSource>,
        reply: oneshot::Sender<eyre::Result<Arc<BagMetadata>>>,
    },
    Play,
    Pause,
    Seek(BagTime),
    UpdateOptions(OptionsUpdate),
    SubscribeMessages(mpsc::Sender<MessageBatch>),
    Destroy,
}

enum Event {
    Command(Command),
    CommandsClosed,
    Tick,
    ChunkFetched {
        generation: u64,
        idx: usize,
        result: std::io::Result<Vec<u8>>,
    },
}

enum RunStatus {
    Continue,
    Exit,
}

/// Handle to a running player task.
///
/// Cloneable; the task shuts down once every handle is dropped or
/// [`PlayerHandle::destroy`] is called. Commands sent after teardown are
/// silently ignored.
#[derive(Clone)]
pub struct PlayerHandle {
    commands_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<PlayerState>,
}

impl PlayerHandle {
    /// Loads a bag from `source`, replacing any currently loaded file and
    /// resetting all playback state.
    ///
    /// Fails if the magic, header or index region is invalid; no file is
    /// loaded in that case.
    pub async fn load_file(
        &self,
        source: impl ChunkSource + 'static,
    ) -> eyre::Result<Arc<BagMetadata>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands_tx
            .send(Command::LoadFile {
                source: Arc::new(source),
                reply: reply_tx,
            })
            .await
            .map_err(|_| eyre!("player task is no longer running"))?;
        reply_rx
            .await
            .map_err(|_| eyre!("player task dropped the load reply"))?
    }

    /// Starts the clock at the current position. No-op while already
    /// playing or with no file loaded.
    pub async fn play(&self) {
        let _ = self.commands_tx.send(Command::Play).await;
    }

    pub async fn pause(&self) {
        let _ = self.commands_tx.send(Command::Pause).await;
    }

    /// Jumps to `target`, cancelling outstanding prefetches. A seek issued
    /// while an earlier one is still prefetching replaces it; if playback
    /// was running it resumes at `target` once the new window is ready,
    /// otherwise a preview batch around `target` is emitted.
    pub async fn seek(&self, target: BagTime) {
        let _ = self.commands_tx.send(Command::Seek(target)).await;
    }

    /// Merges a partial options change, effective on the next tick.
    pub async fn update_options(&self, update: OptionsUpdate) {
        let _ = self.commands_tx.send(Command::UpdateOptions(update)).await;
    }

    /// Registers a subscriber for decoded message batches: one batch per
    /// clock tick with messages in its window, plus one preview batch per
    /// paused seek.
    pub async fn subscribe_messages(&self) -> mpsc::Receiver<MessageBatch> {
        let (sender, receiver) = mpsc::channel(64);
        let _ = self
            .commands_tx
            .send(Command::SubscribeMessages(sender))
            .await;
        receiver
    }

    /// Watches state snapshots: current time, metadata, options, play flag.
    pub fn state(&self) -> watch::Receiver<PlayerState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> PlayerState {
        self.state_rx.borrow().clone()
    }

    /// Tears the player down: pauses, cancels all prefetches and exits the
    /// task. Further commands on any handle are no-ops.
    pub async fn destroy(&self) {
        let _ = self.commands_tx.send(Command::Destroy).await;
    }
}

struct PlayClock {
    wall_start: Instant,
    bag_anchor: BagTime,
}

struct LoadedBag {
    source: Arc<dyn ChunkSource>,
    metadata: Arc<BagMetadata>,
    cache: ChunkCache,
    schemas: SchemaCache,
}

struct PrefetchState {
    /// Bumped on every cancellation; completions from older generations
    /// are discarded without touching the cache.
    generation: u64,
    /// Dropping this sender aborts every in-flight read of the current
    /// generation.
    cancel_tx: watch::Sender<()>,
    queue: VecDeque<usize>,
    in_flight: HashSet<usize>,
}

struct SeekState {
    target: BagTime,
    resume: bool,
    pending: HashSet<usize>,
}

/// The playback orchestrator task.
pub struct Player {
    events_tx: mpsc::Sender<Event>,
    state_tx: watch::Sender<PlayerState>,
    subscribers: Vec<mpsc::Sender<MessageBatch>>,
    max_cache_bytes: u64,
    options: PlaybackOptions,
    bag: Option<LoadedBag>,
    current_time: Option<BagTime>,
    clock: Option<PlayClock>,
    last_prefetch_secs: Option<f64>,
    prefetch: PrefetchState,
    active_seek: Option<SeekState>,
}

impl Player {
    /// Spawns the player task onto the current tokio runtime and returns a
    /// handle to drive it.
    pub fn spawn() -> PlayerHandle {
        Self::spawn_with_cache_budget(DEFAULT_CACHE_BYTES)
    }

    pub fn spawn_with_cache_budget(max_cache_bytes: u64) -> PlayerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(PlayerState::default());
        let (cancel_tx, _) = watch::channel(());

        let player = Player {
            events_tx,
            state_tx,
            subscribers: Vec::new(),
            max_cache_bytes,
            options: PlaybackOptions::default(),
            bag: None,
            current_time: None,
            clock: None,
            last_prefetch_secs: None,
            prefetch: PrefetchState {
                generation: 0,
                cancel_tx,
                queue: VecDeque::new(),
                in_flight: HashSet::new(),
            },
            active_seek: None,
        };
        tokio::spawn(player.run(commands_rx, events_rx));

        PlayerHandle {
            commands_tx,
            state_rx,
        }
    }

    async fn run(
        mut self,
        commands_rx: mpsc::Receiver<Command>,
        events_rx: mpsc::Receiver<Event>,
    ) {
        let commands = ReceiverStream::new(commands_rx)
            .map(Event::Command)
            .chain(tokio_stream::once(Event::CommandsClosed));
        let fetches = ReceiverStream::new(events_rx);
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let ticks = IntervalStream::new(interval).map(|_| Event::Tick);

        let mut events = (commands, fetches, ticks).merge();
        while let Some(event) = events.next().await {
            let status = match event {
                Event::Command(command) => self.handle_command(command).await,
                Event::CommandsClosed => RunStatus::Exit,
                Event::Tick => {
                    self.handle_tick();
                    RunStatus::Continue
                }
                Event::ChunkFetched {
                    generation,
                    idx,
                    result,
                } => {
                    self.handle_chunk_fetched(generation, idx, result);
                    RunStatus::Continue
                }
            };
            if let RunStatus::Exit = status {
                break;
            }
        }
        tracing::debug!("player task stopped");
    }

    async fn handle_command(&mut self, command: Command) -> RunStatus {
        match command {
            Command::LoadFile { source, reply } => {
                let result = self.load_file(source).await;
                let _ = reply.send(result);
            }
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::Seek(target) => self.seek(target),
            Command::UpdateOptions(update) => {
                self.options.merge(update);
                // re-anchor so the new speed applies only to wall time
                // after the change
                if let (Some(clock), Some(current)) = (&mut self.clock, self.current_time) {
                    clock.wall_start = Instant::now();
                    clock.bag_anchor = current;
                }
                self.publish_state();
            }
            Command::SubscribeMessages(sender) => self.subscribers.push(sender),
            Command::Destroy => {
                self.reset();
                tracing::info!("player destroyed");
                return RunStatus::Exit;
            }
        }
        RunStatus::Continue
    }

    async fn load_file(
        &mut self,
        source: Arc<dyn ChunkSource>,
    ) -> eyre::Result<Arc<BagMetadata>> {
        self.reset();

        let file_length = source.len();
        let header_buf = source
            .read(0, HEADER_PADDING as u64)
            .await
            .wrap_err("failed to read bag header")?;
        let header = read_bag_header(&header_buf)?;
        if header.index_pos > file_length {
            return Err(eyre!(
                "index position {} lies past the end of the {file_length} byte file",
                header.index_pos
            ));
        }
        let index_buf = source
            .read(header.index_pos, file_length - header.index_pos)
            .await
            .wrap_err("failed to read bag index region")?;
        let metadata = Arc::new(read_index(&header, &index_buf, file_length)?);
        tracing::info!(
            connections = metadata.connections.len(),
            chunks = metadata.chunks_info.len(),
            start = %metadata.start_time,
            end = %metadata.end_time,
            "loaded bag"
        );

        self.current_time = Some(metadata.start_time);
        self.bag = Some(LoadedBag {
            source,
            metadata: metadata.clone(),
            cache: ChunkCache::new(self.max_cache_bytes),
            schemas: SchemaCache::new(),
        });
        self.publish_state();
        // warm the cache around the start of the timeline
        self.trigger_prefetch(metadata.start_time);
        Ok(metadata)
    }

    fn play(&mut self) {
        if self.clock.is_some() || self.bag.is_none() {
            return;
        }
        let Some(anchor) = self.current_time else {
            return;
        };
        self.clock = Some(PlayClock {
            wall_start: Instant::now(),
            bag_anchor: anchor,
        });
        self.publish_state();
    }

    fn pause(&mut self) {
        if self.clock.take().is_some() {
            self.publish_state();
        }
    }

    fn seek(&mut self, target: BagTime) {
        if self.bag.is_none() {
            return;
        }
        // a newer seek replaces an unfinished one, inheriting its intent
        // to resume playback
        let resume =
            self.clock.is_some() || self.active_seek.as_ref().is_some_and(|seek| seek.resume);
        self.cancel_prefetch();
        self.clock = None;
        self.current_time = Some(target);
        self.publish_state();

        let pending: HashSet<usize> = self.trigger_prefetch(target).into_iter().collect();
        let seek = SeekState {
            target,
            resume,
            pending,
        };
        if seek.pending.is_empty() {
            self.finish_seek(seek);
        } else {
            self.active_seek = Some(seek);
        }
    }

    fn finish_seek(&mut self, seek: SeekState) {
        if seek.resume {
            self.clock = Some(PlayClock {
                wall_start: Instant::now(),
                bag_anchor: seek.target,
            });
            self.publish_state();
        } else if self.clock.is_none() {
            let batch = self.gather(seek.target.add_secs(-TICK_SECS), seek.target);
            self.emit(Arc::new(batch));
        }
    }

    fn handle_tick(&mut self) {
        // the clock is paused while a seek waits for its window
        if self.active_seek.is_some() {
            return;
        }
        let (Some(clock), Some(bag)) = (&self.clock, &self.bag) else {
            return;
        };
        let metadata = bag.metadata.clone();
        let elapsed = clock.wall_start.elapsed().as_secs_f64();
        let new_time = clock.bag_anchor.add_secs(elapsed * self.options.speed);
        // one-tick lookback window, deliberately not scaled by speed
        let window_start = clock.bag_anchor.add_secs(elapsed - TICK_SECS);

        if new_time >= metadata.end_time {
            if self.options.looping {
                tracing::debug!("reached end of bag, looping to start");
                self.current_time = Some(metadata.start_time);
                self.clock = Some(PlayClock {
                    wall_start: Instant::now(),
                    bag_anchor: metadata.start_time,
                });
                self.publish_state();
                self.trigger_prefetch(metadata.start_time);
            } else {
                tracing::debug!("reached end of bag, pausing");
                self.clock = None;
                self.current_time = Some(metadata.start_time);
                self.publish_state();
            }
            return;
        }

        self.current_time = Some(new_time);
        self.publish_state();

        let batch = self.gather(window_start, new_time);
        if !batch.is_empty() {
            self.emit(Arc::new(batch));
        }

        let new_secs = new_time.as_secs_f64();
        let prefetch_due = match self.last_prefetch_secs {
            Some(last) => new_secs - last > self.options.prefetch_secs / 2.0,
            None => true,
        };
        if prefetch_due {
            self.trigger_prefetch(new_time);
        }
    }

    /// Collects every cached message with time in `[from, to]`, walking
    /// chunks in time-sorted order. Chunks that are not cached yet drop
    /// out of the window silently.
    fn gather(&self, from: BagTime, to: BagTime) -> Vec<RosbagMessage> {
        let Some(bag) = &self.bag else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for info in &bag.metadata.chunks_info {
            if !info.overlaps(from, to) {
                continue;
            }
            let Some(entry) = bag.cache.get(info.idx) else {
                continue;
            };
            out.extend(
                entry
                    .messages
                    .iter()
                    .filter(|message| message.time >= from && message.time <= to)
                    .cloned(),
            );
        }
        out
    }

    fn emit(&mut self, batch: MessageBatch) {
        self.subscribers
            .retain(|sender| match sender.try_send(batch.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("dropping message batch for a slow subscriber");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    /// Queues reads for every uncached chunk whose time range intersects
    /// the prefetch window anchored at `anchor`, and returns their indexes.
    fn trigger_prefetch(&mut self, anchor: BagTime) -> Vec<usize> {
        let Some(bag) = &self.bag else {
            return Vec::new();
        };
        self.last_prefetch_secs = Some(anchor.as_secs_f64());
        let window_end = std::cmp::min(
            anchor.add_secs(self.options.prefetch_secs),
            bag.metadata.end_time,
        );
        let wanted: Vec<usize> = bag
            .metadata
            .chunks_info
            .iter()
            .filter(|info| info.end_time >= anchor && info.start_time <= window_end)
            .map(|info| info.idx)
            .filter(|idx| !bag.cache.contains(*idx))
            .filter(|idx| {
                !self.prefetch.in_flight.contains(idx) && !self.prefetch.queue.contains(idx)
            })
            .collect();
        if !wanted.is_empty() {
            tracing::debug!(anchor = %anchor, chunks = ?wanted, "prefetching");
        }
        self.prefetch.queue.extend(wanted.iter().copied());
        self.pump_prefetch();
        wanted
    }

    fn pump_prefetch(&mut self) {
        let Some(bag) = &self.bag else {
            return;
        };
        let source = bag.source.clone();
        let metadata = bag.metadata.clone();
        while self.prefetch.in_flight.len() < PREFETCH_CONCURRENCY {
            let Some(idx) = self.prefetch.queue.pop_front() else {
                break;
            };
            let info = &metadata.chunks_info[idx];
            let position = info.chunk_position;
            let span = info.span_bytes();
            self.prefetch.in_flight.insert(idx);

            let source = source.clone();
            let events_tx = self.events_tx.clone();
            let generation = self.prefetch.generation;
            let mut cancel_rx = self.prefetch.cancel_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    result = source.read(position, span) => {
                        let _ = events_tx
                            .send(Event::ChunkFetched {
                                generation,
                                idx,
                                result,
                            })
                            .await;
                    }
                    // resolves once the cancel sender is dropped
                    _ = cancel_rx.changed() => {}
                }
            });
        }
    }

    fn handle_chunk_fetched(
        &mut self,
        generation: u64,
        idx: usize,
        result: std::io::Result<Vec<u8>>,
    ) {
        if generation != self.prefetch.generation {
            // late completion of a cancelled fetch
            return;
        }
        self.prefetch.in_flight.remove(&idx);
        if let Some(bag) = &mut self.bag {
            match result {
                Ok(bytes) => {
                    let metadata = bag.metadata.clone();
                    let info = &metadata.chunks_info[idx];
                    match decode_chunk(info, &bytes, &metadata.connections, &mut bag.schemas) {
                        Ok(messages) => {
                            tracing::debug!(
                                chunk = idx,
                                messages = messages.len(),
                                "cached chunk"
                            );
                            bag.cache.insert(
                                idx,
                                ChunkCacheEntry {
                                    messages: Arc::new(messages),
                                    size_bytes: info.span_bytes(),
                                },
                            );
                        }
                        Err(err) => {
                            tracing::warn!(chunk = idx, error = %err, "failed to decode chunk");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(chunk = idx, error = %err, "failed to read chunk");
                }
            }
        }
        self.pump_prefetch();
        self.note_seek_progress(idx);
    }

    fn note_seek_progress(&mut self, idx: usize) {
        let settled = self
            .active_seek
            .as_mut()
            .map(|seek| {
                seek.pending.remove(&idx);
                seek.pending.is_empty()
            })
            .unwrap_or(false);
        if settled {
            if let Some(seek) = self.active_seek.take() {
                self.finish_seek(seek);
            }
        }
    }

    fn cancel_prefetch(&mut self) {
        self.prefetch.generation += 1;
        self.prefetch.queue.clear();
        self.prefetch.in_flight.clear();
        // dropping the previous sender aborts every in-flight read
        let (cancel_tx, _) = watch::channel(());
        self.prefetch.cancel_tx = cancel_tx;
        self.active_seek = None;
    }

    fn reset(&mut self) {
        self.cancel_prefetch();
        self.clock = None;
        self.current_time = None;
        self.bag = None;
        self.last_prefetch_secs = None;
        self.publish_state();
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(PlayerState {
            current_time: self.current_time,
            metadata: self.bag.as_ref().map(|bag| bag.metadata.clone()),
            options: self.options,
            is_playing: self.clock.is_some(),
        });
    }
}
