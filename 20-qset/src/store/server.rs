//! TCP front end for a [`MemoryStore`], so replicas in different processes
//! can share one store.

use std::{collections::HashMap, future::Future, net::SocketAddr};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::store::memory::{MemoryStore, Published, SubscriberId};
use crate::store::protocol::{Request, Response, read_message, write_message};

pub struct StoreServer {
    listener: TcpListener,
    store: MemoryStore,
}

impl StoreServer {
    pub fn new(listener: TcpListener, store: MemoryStore) -> Self {
        Self { listener, store }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients until `shutdown` resolves. Open sessions are closed
    /// on the way out, which drops their subscriptions.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = self.store.clone();
                        sessions.spawn(serve_client(stream, peer, store));
                    }
                    Err(err) => warn!(error = ?err, "failed to accept store client"),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "store session task failed");
                    }
                }
            }
        }

        info!(open_sessions = sessions.len(), "store server shutting down");
        sessions.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, store: MemoryStore) {
    debug!(%peer, "store client connected");
    match handle_connection(stream, store).await {
        Ok(()) => debug!(%peer, "store client disconnected"),
        Err(err) => warn!(%peer, error = ?err, "store connection closed with error"),
    }
}

/// Per-connection state. Once a client subscribes it only gets pushes and
/// subscription management.
struct Session {
    store: MemoryStore,
    push_tx: mpsc::UnboundedSender<Published>,
    subscriptions: HashMap<String, SubscriberId>,
}

impl Session {
    fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Subscribe { key } => {
                if !self.subscriptions.contains_key(&key) {
                    let id = self.store.register(&key, self.push_tx.clone());
                    self.subscriptions.insert(key.clone(), id);
                }
                Response::Subscribed {
                    key,
                    count: self.subscriptions.len(),
                }
            }
            Request::Unsubscribe { key } => {
                if let Some(id) = self.subscriptions.remove(&key) {
                    self.store.unregister(&key, id);
                }
                Response::Unsubscribed {
                    key,
                    count: self.subscriptions.len(),
                }
            }
            _ if !self.subscriptions.is_empty() => Response::Error {
                message: "only subscribe and unsubscribe are allowed in subscriber mode".into(),
            },
            Request::ConditionalSet { key, ts, member } => {
                match self.store.conditional_set(&key, ts, &member) {
                    Ok(applied) => Response::Applied { applied },
                    Err(err) => {
                        warn!(%key, %member, error = %err, "conditional set failed");
                        Response::Error {
                            message: err.to_string(),
                        }
                    }
                }
            }
            Request::ReadAll { key } => Response::Members {
                members: self.store.read_all(&key),
            },
        }
    }

    fn close(&mut self) {
        for (key, id) in self.subscriptions.drain() {
            self.store.unregister(&key, id);
        }
    }
}

// Sessions aborted at shutdown never reach the explicit close.
impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handle_connection(stream: TcpStream, store: MemoryStore) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        store,
        push_tx,
        subscriptions: HashMap::new(),
    };

    run_session(&mut session, &mut push_rx, &mut reader, &mut writer).await
}

async fn run_session<R, W>(
    session: &mut Session,
    push_rx: &mut mpsc::UnboundedReceiver<Published>,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        select! {
            request = read_message::<_, Request>(reader, &mut line) => {
                match request? {
                    Some(request) => {
                        let response = session.handle(request);
                        write_message(writer, &response).await?;
                    }
                    None => break,
                }
            }
            // The session holds a sender, so this never yields `None`.
            Some(Published { channel, payload }) = push_rx.recv() => {
                write_message(writer, &Response::Message { key: channel, payload }).await?;
            }
        }
    }

    Ok(())
}
