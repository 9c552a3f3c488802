//! End-to-end playback tests against in-memory bag images.
//!
//! Every test runs on a paused tokio clock, so the 33 ms playback ticks
//! and the simulated slow reads advance deterministically in virtual time.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bagplay_format::{BagTime, FormatError};
use bagplay_player::{
    ChunkSource, MemorySource, OptionsUpdate, Player, PlayerHandle, MessageBatch,
};
use tokio::time::timeout;

const MAGIC: &[u8] = b"#ROSBAG V2.0\n";
const HEADER_PADDING: usize = 4096;

fn field(name: &str, value: &[u8]) -> Vec<u8> {
    let len = name.len() + 1 + value.len();
    let mut out = (len as u32).to_le_bytes().to_vec();
    out.extend_from_slice(name.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
    out
}

fn record(header: &[Vec<u8>], data: &[u8]) -> Vec<u8> {
    let header: Vec<u8> = header.concat();
    let mut out = (header.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(&header);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// One recorded message: connection id, record time, counter payload.
type Message = (u32, BagTime, u32);

/// Builds a complete single-connection bag image. Each inner slice becomes
/// one uncompressed chunk; the connection decodes as `uint32 value`.
fn build_bag(chunks: &[&[Message]]) -> Vec<u8> {
    let mut body = Vec::new();
    let mut chunk_infos = Vec::new();

    for messages in chunks {
        let chunk_position = (HEADER_PADDING + body.len()) as u64;

        let mut payload = Vec::new();
        let mut entries: BTreeMap<u32, Vec<(BagTime, u32)>> = BTreeMap::new();
        let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
        for &(conn, time, value) in *messages {
            let offset = payload.len() as u32;
            payload.extend_from_slice(&record(
                &[
                    field("conn", &conn.to_le_bytes()),
                    field("time", &time.to_le_bytes()),
                ],
                &value.to_le_bytes(),
            ));
            entries.entry(conn).or_default().push((time, offset));
            *counts.entry(conn).or_default() += 1;
        }

        body.extend_from_slice(&record(
            &[
                field("compression", b"none"),
                field("size", &(payload.len() as u32).to_le_bytes()),
            ],
            &payload,
        ));
        for (conn, entries) in &entries {
            let data: Vec<u8> = entries
                .iter()
                .flat_map(|(time, offset)| {
                    let mut entry = time.to_le_bytes().to_vec();
                    entry.extend_from_slice(&offset.to_le_bytes());
                    entry
                })
                .collect();
            body.extend_from_slice(&record(
                &[
                    field("ver", &1u32.to_le_bytes()),
                    field("conn", &conn.to_le_bytes()),
                    field("count", &(entries.len() as u32).to_le_bytes()),
                ],
                &data,
            ));
        }

        let start = messages.iter().map(|(_, time, _)| *time).min().unwrap();
        let end = messages.iter().map(|(_, time, _)| *time).max().unwrap();
        chunk_infos.push((chunk_position, start, end, counts));
    }

    let index_pos = (HEADER_PADDING + body.len()) as u64;
    body.extend_from_slice(&record(
        &[
            field("conn", &0u32.to_le_bytes()),
            field("topic", b"/counter"),
        ],
        &[
            field("type", b"test_msgs/Counter"),
            field("md5sum", b"*"),
            field("message_definition", b"uint32 value"),
        ]
        .concat(),
    ));
    for (chunk_position, start, end, counts) in &chunk_infos {
        let data: Vec<u8> = counts
            .iter()
            .flat_map(|(conn, count)| {
                let mut pair = conn.to_le_bytes().to_vec();
                pair.extend_from_slice(&count.to_le_bytes());
                pair
            })
            .collect();
        body.extend_from_slice(&record(
            &[
                field("ver", &1u32.to_le_bytes()),
                field("chunk_pos", &chunk_position.to_le_bytes()),
                field("start_time", &start.to_le_bytes()),
                field("end_time", &end.to_le_bytes()),
                field("count", &(counts.len() as u32).to_le_bytes()),
            ],
            &data,
        ));
    }

    let header_fields = [
        field("index_pos", &index_pos.to_le_bytes()),
        field("conn_count", &1u32.to_le_bytes()),
        field("chunk_count", &(chunks.len() as u32).to_le_bytes()),
    ]
    .concat();
    let mut out = MAGIC.to_vec();
    out.extend_from_slice(&(header_fields.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_fields);
    let padding = HEADER_PADDING - out.len() - 4;
    out.extend_from_slice(&(padding as u32).to_le_bytes());
    out.resize(HEADER_PADDING, 0);
    out.extend_from_slice(&body);
    out
}

/// A source whose reads complete only after a (virtual) delay.
struct SlowSource {
    inner: MemorySource,
    delay: Duration,
}

impl SlowSource {
    fn new(bytes: Vec<u8>, delay: Duration) -> Self {
        Self {
            inner: MemorySource::new(bytes),
            delay,
        }
    }
}

#[async_trait]
impl ChunkSource for SlowSource {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    async fn read(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        self.inner.read(offset, len).await
    }
}

async fn recv_batch(receiver: &mut tokio::sync::mpsc::Receiver<MessageBatch>) -> MessageBatch {
    timeout(Duration::from_secs(60), receiver.recv())
        .await
        .expect("timed out waiting for a message batch")
        .expect("player closed the message stream")
}

async fn load(handle: &PlayerHandle, bag: Vec<u8>) {
    handle
        .load_file(MemorySource::new(bag))
        .await
        .expect("failed to load bag");
}

#[tokio::test(start_paused = true)]
async fn load_reports_metadata() {
    let bag = build_bag(&[
        &[(0, BagTime::new(10, 0), 1), (0, BagTime::new(14, 0), 2)],
        &[(0, BagTime::new(15, 0), 3), (0, BagTime::new(19, 0), 4)],
    ]);
    let file_length = bag.len() as u64;

    let handle = Player::spawn();
    let metadata = handle.load_file(MemorySource::new(bag)).await.unwrap();

    assert_eq!(metadata.start_time, BagTime::new(10, 0));
    assert_eq!(metadata.end_time, BagTime::new(19, 0));
    assert_eq!(metadata.chunks_info.len(), 2);
    assert_eq!(metadata.chunks_info[0].idx, 0);
    assert_eq!(
        metadata.chunks_info[0].next_chunk_position,
        metadata.chunks_info[1].chunk_position
    );
    assert_eq!(metadata.chunks_info[1].next_chunk_position, file_length);
    assert_eq!(metadata.connections[&0].topic, "/counter");

    let state = handle.current_state();
    assert_eq!(state.current_time, Some(BagTime::new(10, 0)));
    assert!(!state.is_playing);

    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn empty_bag_is_rejected() {
    let bag = build_bag(&[]);
    let handle = Player::spawn();
    let err = handle
        .load_file(MemorySource::new(bag))
        .await
        .expect_err("a bag without chunks must not load");
    assert!(matches!(
        err.downcast_ref::<FormatError>(),
        Some(FormatError::EmptyBag)
    ));
    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn corrupted_magic_is_rejected() {
    let mut bag = build_bag(&[&[(0, BagTime::new(1, 0), 1)]]);
    bag[0] = b'$';
    let handle = Player::spawn();
    assert!(handle.load_file(MemorySource::new(bag)).await.is_err());
    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn playback_streams_messages_in_time_order() {
    // one message every 100 ms across two chunks
    let first: Vec<Message> = (0..50)
        .map(|i| (0, BagTime::new(10 + i / 10, (i % 10) * 100_000_000), i))
        .collect();
    let second: Vec<Message> = (50..100)
        .map(|i| (0, BagTime::new(10 + i / 10, (i % 10) * 100_000_000), i))
        .collect();
    let bag = build_bag(&[&first, &second]);

    let handle = Player::spawn();
    load(&handle, bag).await;
    let mut messages_rx = handle.subscribe_messages().await;
    handle.play().await;

    let mut seen = Vec::new();
    while seen.len() < 30 {
        let batch = recv_batch(&mut messages_rx).await;
        seen.extend(batch.iter().map(|message| message.time));
    }
    assert!(
        seen.windows(2).all(|pair| pair[0] <= pair[1]),
        "messages must arrive in time order: {seen:?}"
    );
    assert!(seen.iter().all(|time| *time >= BagTime::new(10, 0)));

    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn paused_seek_emits_preview_window() {
    let bag = build_bag(&[&[
        (0, BagTime::new(1, 0), 1),
        (0, BagTime::new(5, 20_000_000), 2),
        (0, BagTime::new(5, 50_000_000), 3),
        (0, BagTime::new(9, 0), 4),
    ]]);

    let handle = Player::spawn();
    load(&handle, bag).await;
    let mut messages_rx = handle.subscribe_messages().await;

    let target = BagTime::new(5, 50_000_000);
    handle.seek(target).await;

    let batch = recv_batch(&mut messages_rx).await;
    let times: Vec<BagTime> = batch.iter().map(|message| message.time).collect();
    assert_eq!(
        times,
        vec![BagTime::new(5, 20_000_000), BagTime::new(5, 50_000_000)],
        "preview must cover exactly one tick before the seek target"
    );
    assert_eq!(handle.current_state().current_time, Some(target));
    assert!(!handle.current_state().is_playing);

    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn seek_while_playing_resumes() {
    let messages: Vec<Message> = (0..100)
        .map(|i| (0, BagTime::new(10 + i / 10, (i % 10) * 100_000_000), i))
        .collect();
    let bag = build_bag(&[&messages]);

    let handle = Player::spawn();
    load(&handle, bag).await;
    handle.play().await;
    let mut state_rx = handle.state();
    timeout(Duration::from_secs(60), state_rx.wait_for(|state| state.is_playing))
        .await
        .expect("timed out waiting for playback to start")
        .expect("player task stopped");

    handle.seek(BagTime::new(15, 0)).await;
    let state = timeout(
        Duration::from_secs(60),
        state_rx.wait_for(|state| {
            state.is_playing && state.current_time >= Some(BagTime::new(15, 0))
        }),
    )
    .await
    .expect("timed out waiting for the seek to resume playback")
    .expect("player task stopped")
    .clone();
    assert!(state.is_playing, "playback must resume after the seek");

    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn newer_seek_replaces_unfinished_one() {
    let chunk_a: Vec<Message> = vec![
        (0, BagTime::new(1, 0), 1),
        (0, BagTime::new(1, 20_000_000), 2),
    ];
    let chunk_b: Vec<Message> = vec![
        (0, BagTime::new(100, 0), 3),
        (0, BagTime::new(100, 20_000_000), 4),
    ];
    let bag = build_bag(&[&chunk_a, &chunk_b]);

    let handle = Player::spawn();
    handle
        .load_file(SlowSource::new(bag, Duration::from_secs(1)))
        .await
        .unwrap();
    let mut messages_rx = handle.subscribe_messages().await;

    // the second seek lands before the first one's chunk read finishes
    handle.seek(BagTime::new(1, 20_000_000)).await;
    handle.seek(BagTime::new(100, 20_000_000)).await;

    let batch = recv_batch(&mut messages_rx).await;
    assert!(
        batch.iter().all(|message| message.time >= BagTime::new(100, 0)),
        "only the newest seek's preview may be emitted, got {batch:?}"
    );
    assert!(
        messages_rx.try_recv().is_err(),
        "the cancelled seek must not emit a batch"
    );
    assert_eq!(
        handle.current_state().current_time,
        Some(BagTime::new(100, 20_000_000))
    );

    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn loop_wraps_back_to_start() {
    // a fifth of a second of bag time, looped
    let messages: Vec<Message> = (0..4)
        .map(|i| (0, BagTime::new(10, i * 50_000_000), i))
        .collect();
    let bag = build_bag(&[&messages]);

    let handle = Player::spawn();
    load(&handle, bag).await;
    let mut state_rx = handle.state();
    handle.play().await;

    let mut previous = BagTime::ZERO;
    let mut started = false;
    let mut wrapped = false;
    for _ in 0..100 {
        timeout(Duration::from_secs(60), state_rx.changed())
            .await
            .expect("timed out waiting for a state change")
            .expect("player task stopped");
        let state = state_rx.borrow_and_update().clone();
        if !state.is_playing {
            assert!(!started, "looping playback must never pause");
            continue;
        }
        started = true;
        let Some(current) = state.current_time else {
            continue;
        };
        if current < previous {
            wrapped = true;
            assert_eq!(current, BagTime::new(10, 0), "loop must rewind to the start");
            break;
        }
        previous = current;
    }
    assert!(wrapped, "playback never wrapped around the end of the bag");

    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn reaching_the_end_without_loop_pauses_and_rewinds() {
    let messages: Vec<Message> = (0..4)
        .map(|i| (0, BagTime::new(10, i * 50_000_000), i))
        .collect();
    let bag = build_bag(&[&messages]);

    let handle = Player::spawn();
    load(&handle, bag).await;
    handle
        .update_options(OptionsUpdate {
            looping: Some(false),
            ..Default::default()
        })
        .await;
    let mut state_rx = handle.state();
    handle.play().await;
    timeout(Duration::from_secs(60), state_rx.wait_for(|state| state.is_playing))
        .await
        .expect("timed out waiting for playback to start")
        .expect("player task stopped");

    let state = timeout(
        Duration::from_secs(60),
        state_rx.wait_for(|state| !state.is_playing),
    )
    .await
    .expect("timed out waiting for playback to pause at the end")
    .expect("player task stopped")
    .clone();
    assert_eq!(state.current_time, Some(BagTime::new(10, 0)));

    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn destroyed_player_ignores_commands() {
    let bag = build_bag(&[&[(0, BagTime::new(1, 0), 1)]]);
    let handle = Player::spawn();
    handle.destroy().await;
    // let the task drain the command and exit
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the task is gone; commands become no-ops and loads fail
    handle.play().await;
    assert!(handle.load_file(MemorySource::new(bag)).await.is_err());
}
