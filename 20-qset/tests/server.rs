use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use qset::{
    QSet, StoreError, Timestamp,
    queue::{self, PendingWrite},
    status::Status,
    store::{
        Feed, FeedEvent, FeedSource, MemoryStore, RemoteStore, SetStore, StoreServer,
        protocol::{Request, Response, read_message, write_message},
    },
};
use tokio::{
    io::BufReader,
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

type Server = (SocketAddr, MemoryStore, oneshot::Sender<()>, JoinHandle<()>);

async fn start_server() -> Result<Server> {
    serve(MemoryStore::new()).await
}

async fn serve(store: MemoryStore) -> Result<Server> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = StoreServer::new(listener, store.clone());
    let addr = server.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });
    Ok((addr, store, shutdown_tx, handle))
}

async fn remote_replica(addr: SocketAddr, key: &str) -> Result<QSet<String>> {
    let set = QSet::new()
        .with_writer(Arc::new(RemoteStore::connect(addr).await?))
        .with_subscriber(Arc::new(RemoteStore::connect(addr).await?))
        .with_set_key(key)
        .with_identity_codec();
    set.init().await?;
    Ok(set)
}

#[tokio::test]
async fn conditional_set_over_tcp() -> Result<()> {
    let (addr, _store, shutdown_tx, server) = start_server().await?;
    let conn = RemoteStore::connect(addr).await?;

    let ts = Timestamp::from_micros(1_463_493_139_936_983);
    assert!(conn.conditional_set("TESTKEY", ts, "data").await?);
    assert!(!conn.conditional_set("TESTKEY", ts, "data").await?);
    assert_eq!(conn.read_all("TESTKEY").await?, vec![("data".to_string(), ts)]);

    drop(conn);
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn subscribed_connection_only_streams() -> Result<()> {
    let (addr, store, shutdown_tx, server) = start_server().await?;
    let conn = RemoteStore::connect(addr).await?;
    let mut feed = conn.subscribe("TESTKEY").await?;

    let ack = timeout(Duration::from_secs(1), feed.recv()).await??;
    assert_eq!(
        ack,
        FeedEvent::Subscribed {
            channel: "TESTKEY".into(),
            count: 1
        }
    );
    assert!(matches!(
        conn.read_all("TESTKEY").await,
        Err(StoreError::SubscriberMode)
    ));

    store.conditional_set("TESTKEY", Timestamp::from_micros(5), "pushed")?;
    let pushed = timeout(Duration::from_secs(1), feed.recv()).await??;
    assert_eq!(
        pushed,
        FeedEvent::Message {
            channel: "TESTKEY".into(),
            payload: "5:pushed".into()
        }
    );

    drop(feed);
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn remote_replicas_converge() -> Result<()> {
    let (addr, store, shutdown_tx, server) = start_server().await?;
    let a = remote_replica(addr, "TESTKEY").await?;
    let b = remote_replica(addr, "TESTKEY").await?;

    let newer = Utc::now();
    let older = newer - chrono::Duration::seconds(1);
    a.set(&"x".to_string(), newer).await;
    a.sync().await;
    b.set(&"x".to_string(), older).await;
    b.sync().await;

    let expected = Timestamp::from(newer).to_datetime();
    timeout(Duration::from_secs(2), async {
        while a.get(&"x".to_string()) != Some(expected) || b.get(&"x".to_string()) != Some(expected) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(store.read_all("TESTKEY"), vec![("x".to_string(), Timestamp::from(newer))]);
    assert!(a.last_state().is_none());
    assert!(b.last_state().is_none());

    a.quit().await;
    b.quit().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn late_replica_bootstraps_from_server() -> Result<()> {
    let (addr, _store, shutdown_tx, server) = start_server().await?;
    let first = remote_replica(addr, "TESTKEY").await?;
    first.set(&"Data".to_string(), Utc::now()).await;
    first.sync().await;

    let second = remote_replica(addr, "TESTKEY").await?;
    assert_eq!(second.list(), vec!["Data".to_string()]);

    first.quit().await;
    second.quit().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

/// A store server that takes `delay` to answer each conditional set.
async fn start_slow_store(delay: Duration) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let mut members = Vec::new();
        while let Ok(Some(request)) = read_message::<_, Request>(&mut reader, &mut line).await {
            let response = match request {
                Request::ConditionalSet { ts, member, .. } => {
                    sleep(delay).await;
                    members.push((member, ts));
                    Response::Applied { applied: true }
                }
                Request::ReadAll { .. } => Response::Members {
                    members: members.clone(),
                },
                other => Response::Error {
                    message: format!("unexpected {other:?}"),
                },
            };
            if write_message(&mut writer, &response).await.is_err() {
                return;
            }
        }
    });
    Ok(addr)
}

#[tokio::test]
async fn quit_during_a_slow_write_leaves_the_connection_usable() -> Result<()> {
    let addr = start_slow_store(Duration::from_millis(300)).await?;
    let remote = Arc::new(RemoteStore::connect(addr).await?);
    let status = Arc::new(Status::new());
    let writer: Arc<dyn SetStore> = remote.clone();
    let (queue, drainer) = queue::spawn(8, "TESTKEY".into(), writer, status.clone());

    let ts = Timestamp::from_micros(42);
    queue
        .enqueue(PendingWrite {
            member: "slow".into(),
            ts,
        })
        .await?;
    sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(2), drainer.quit()).await?;

    // The reply to the write was consumed, so the next call pairs correctly.
    assert_eq!(remote.read_all("TESTKEY").await?, vec![("slow".to_string(), ts)]);
    assert!(status.last().is_none());
    Ok(())
}

#[tokio::test]
async fn journaled_server_keeps_sets_across_restarts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("qset.journal");
    let at = Utc::now();

    let (addr, store, shutdown_tx, server) = serve(MemoryStore::open(&path)?).await?;
    let writer = remote_replica(addr, "TESTKEY").await?;
    writer.set(&"kept".to_string(), at).await;
    writer.sync().await;
    assert!(writer.last_state().is_none());
    writer.quit().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    drop(store);

    let (addr, _store, shutdown_tx, server) = serve(MemoryStore::open(&path)?).await?;
    let reader = remote_replica(addr, "TESTKEY").await?;
    assert_eq!(
        reader.get(&"kept".to_string()),
        Some(Timestamp::from(at).to_datetime())
    );
    reader.quit().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}
