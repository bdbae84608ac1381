//! Client side of the [`StoreServer`](crate::store::StoreServer) protocol.
//!
//! A `RemoteStore` is one TCP connection. Use one for reads and writes and
//! a second one for the subscription: subscribing hands the connection over
//! to the returned feed.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::protocol::{Request, Response, read_message, write_message};
use crate::store::{Feed, FeedEvent, FeedSource, SetStore};
use crate::timestamp::Timestamp;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    // Partial inbound line, kept across cancelled reads.
    line: Vec<u8>,
}

impl Connection {
    async fn read(&mut self) -> Result<Option<Response>, StoreError> {
        Ok(read_message::<_, Response>(&mut self.reader, &mut self.line).await?)
    }

    async fn call(&mut self, request: &Request) -> Result<Response, StoreError> {
        write_message(&mut self.writer, request).await?;
        match self.read().await? {
            Some(Response::Error { message }) => Err(StoreError::Protocol(message)),
            Some(response) => Ok(response),
            None => Err(StoreError::Closed),
        }
    }
}

pub struct RemoteStore {
    addr: SocketAddr,
    // `None` once the connection has been handed to a feed.
    conn: Mutex<Option<Connection>>,
}

impl RemoteStore {
    pub async fn connect(addr: SocketAddr) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(addr).await?;
        info!(%addr, "connected to store");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            conn: Mutex::new(Some(Connection {
                reader: BufReader::new(reader),
                writer,
                line: Vec::new(),
            })),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn call(&self, request: Request) -> Result<Response, StoreError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::SubscriberMode)?;
        conn.call(&request).await
    }
}

fn unexpected(response: Response) -> StoreError {
    StoreError::Protocol(format!("unexpected response: {response:?}"))
}

#[async_trait]
impl SetStore for RemoteStore {
    async fn conditional_set(
        &self,
        set_key: &str,
        ts: Timestamp,
        member: &str,
    ) -> Result<bool, StoreError> {
        let request = Request::ConditionalSet {
            key: set_key.to_string(),
            ts,
            member: member.to_string(),
        };
        match self.call(request).await? {
            Response::Applied { applied } => Ok(applied),
            other => Err(unexpected(other)),
        }
    }

    async fn read_all(&self, set_key: &str) -> Result<Vec<(String, Timestamp)>, StoreError> {
        let request = Request::ReadAll {
            key: set_key.to_string(),
        };
        match self.call(request).await? {
            Response::Members { members } => Ok(members),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl FeedSource for RemoteStore {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Feed>, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .await
            .take()
            .ok_or(StoreError::SubscriberMode)?;
        write_message(
            &mut conn.writer,
            &Request::Subscribe {
                key: channel.to_string(),
            },
        )
        .await?;
        debug!(addr = %self.addr, channel, "subscribe sent");
        Ok(Box::new(RemoteFeed { conn }))
    }
}

struct RemoteFeed {
    conn: Connection,
}

#[async_trait]
impl Feed for RemoteFeed {
    /// Safe to cancel: a partially received push is resumed on the next call.
    async fn recv(&mut self) -> Result<FeedEvent, StoreError> {
        match self.conn.read().await? {
            Some(Response::Subscribed { key, count }) => Ok(FeedEvent::Subscribed {
                channel: key,
                count,
            }),
            Some(Response::Message { key, payload }) => Ok(FeedEvent::Message {
                channel: key,
                payload,
            }),
            Some(Response::Unsubscribed { key, count }) => Ok(FeedEvent::Unsubscribed {
                channel: key,
                count,
            }),
            Some(Response::Error { message }) => Err(StoreError::Protocol(message)),
            Some(other) => Err(unexpected(other)),
            None => Err(StoreError::Closed),
        }
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        write_message(
            &mut self.conn.writer,
            &Request::Unsubscribe {
                key: channel.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}
