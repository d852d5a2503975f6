//! Integration tests driving a worker over its framed TCP channel, playing
//! the czar's role by hand.

use futures::{SinkExt, StreamExt};
use skyshard_common::{ChunkId, CzarId, JobId, QueryId};
use skyshard_config::WorkerConfig;
use skyshard_proto::{
    ChecksumAccumulator, FrameCodec, Message, RowBundle, TaskFragment, TaskMsg, TaskState,
    WireErrorCode, WorkerCommand,
};
use skyshard_worker::runner::MockQueryRunner;
use skyshard_worker::server::WorkerServer;
use skyshard_worker::{ServiceContext, executor};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

async fn start_worker(chunks: &[u32]) -> (String, Arc<MockQueryRunner>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    let config = WorkerConfig {
        scheduler: skyshard_config::SchedulerConfig {
            pool_size: 2,
            ..skyshard_config::SchedulerConfig::default()
        },
        ..WorkerConfig::default()
    };
    let runner = Arc::new(MockQueryRunner::new());
    let ctx = ServiceContext::new(config, Arc::clone(&runner) as _);
    for &chunk in chunks {
        ctx.add_chunk("LSST", ChunkId(chunk));
    }
    let _pool = executor::spawn_pool(&ctx);
    tokio::spawn(async move {
        let _ = WorkerServer::new(ctx).run(listener).await;
    });
    (addr, runner)
}

async fn connect(addr: &str) -> Framed<TcpStream, FrameCodec> {
    let socket = TcpStream::connect(addr).await.expect("connect");
    Framed::new(socket, FrameCodec::new(64 * 1024 * 1024))
}

fn task(query_id: u64, job_id: u32, attempt: u32, chunk: u32, sql: &str) -> Message {
    Message::Task(TaskMsg {
        query_id: QueryId(query_id),
        job_id: JobId(job_id),
        attempt,
        czar_id: CzarId(1),
        db: "LSST".to_string(),
        chunk: ChunkId(chunk),
        scan_interactive: true,
        scan_tables: vec![],
        fragments: vec![TaskFragment {
            queries: vec![sql.to_string()],
            subchunks: vec![],
            result_table: format!("qserv_result_{query_id}"),
        }],
    })
}

async fn next_frame(channel: &mut Framed<TcpStream, FrameCodec>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), channel.next())
        .await
        .expect("frame before timeout")
        .expect("channel open")
        .expect("frame decodes")
}

#[tokio::test]
async fn reply_stream_is_ordered_and_digest_checked() {
    let (addr, runner) = start_worker(&[100]).await;
    let sql = "SELECT id FROM LSST.Object_100";
    let mut bundle = RowBundle::new(vec!["id".to_string()]);
    bundle.rows.push(vec![Some("11".to_string())]);
    runner.stage(sql, bundle);

    let mut channel = connect(&addr).await;
    channel.send(task(1, 0, 1, 100, sql)).await.expect("send task");

    let mut header = None;
    let mut blobs = Vec::new();
    loop {
        match next_frame(&mut channel).await {
            Message::Status(_) => {}
            Message::ReplyHeader(h) => {
                assert!(header.is_none(), "exactly one header");
                header = Some(h);
            }
            Message::ReplyBlob(b) => {
                let done = b.last;
                blobs.push(b);
                if done {
                    break;
                }
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    let header = header.expect("header arrived before blobs");
    assert_eq!(header.row_count, 1);
    let mut checksum = ChecksumAccumulator::new();
    for (i, blob) in blobs.iter().enumerate() {
        assert_eq!(blob.seq, i as u32, "sequence numbers are dense");
        checksum.update(&blob.payload);
    }
    assert_eq!(checksum.finish(), header.md5);
}

#[tokio::test]
async fn foreign_chunk_is_refused() {
    let (addr, _runner) = start_worker(&[100]).await;
    let mut channel = connect(&addr).await;
    channel
        .send(task(2, 0, 1, 999, "SELECT 1"))
        .await
        .expect("send task");

    match next_frame(&mut channel).await {
        Message::Error(err) => assert_eq!(err.code, WireErrorCode::ResourceMismatch),
        other => panic!("expected resource mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_dispatch_of_same_attempt_is_rejected() {
    let (addr, runner) = start_worker(&[100]).await;
    let sql = "SELECT id FROM LSST.Object_100";
    runner.stage_delay(sql, Duration::from_secs(30));

    let mut channel = connect(&addr).await;
    channel.send(task(3, 0, 1, 100, sql)).await.expect("first");
    // First ack.
    match next_frame(&mut channel).await {
        Message::Status(s) => assert_eq!(s.state, TaskState::Queued),
        other => panic!("expected queued ack, got {other:?}"),
    }

    channel.send(task(3, 0, 1, 100, sql)).await.expect("duplicate");
    loop {
        match next_frame(&mut channel).await {
            Message::Error(err) => {
                assert_eq!(err.code, WireErrorCode::DuplicateTask);
                break;
            }
            Message::Status(_) => {}
            other => panic!("expected duplicate rejection, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn admin_commands_manage_the_chunk_inventory() {
    let (addr, _runner) = start_worker(&[]).await;
    let mut channel = connect(&addr).await;

    channel
        .send(Message::WorkerCommand(WorkerCommand::AddChunk {
            db: "LSST".to_string(),
            chunk: ChunkId(7),
        }))
        .await
        .expect("add chunk");
    let _ack = next_frame(&mut channel).await;

    channel
        .send(Message::WorkerCommand(WorkerCommand::ListChunks))
        .await
        .expect("list");
    match next_frame(&mut channel).await {
        Message::Status(status) => {
            let payload: serde_json::Value =
                serde_json::from_str(&status.extended).expect("json");
            assert_eq!(payload["chunks"][0]["chunk"], 7);
        }
        other => panic!("expected listing, got {other:?}"),
    }

    channel
        .send(Message::WorkerCommand(WorkerCommand::Echo {
            payload: "ping".to_string(),
        }))
        .await
        .expect("echo");
    match next_frame(&mut channel).await {
        Message::Status(status) => assert!(status.extended.contains("ping")),
        other => panic!("expected echo, got {other:?}"),
    }
}
