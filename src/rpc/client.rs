//! Calling side of a control channel.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::codec::{self, FrameReader, FrameWriter};
use super::RpcError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] RpcError),

    #[error("{0}")]
    Remote(String),
}

type Outcome = Result<(Value, Vec<OwnedFd>), ClientError>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Outcome>>,
    closed: bool,
}

/// Issues calls and matches responses by id; calls may overlap.
pub struct Client {
    writer: tokio::sync::Mutex<FrameWriter>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl Client {
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = codec::split(stream);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(read_responses(reader, pending.clone()));
        Client {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let (result, _) = self.call_with_fds(method, params, Vec::new()).await?;
        Ok(result)
    }

    /// Call `method`, sending `fds` with the request. Our copies of `fds`
    /// are closed once the request is written.
    pub async fn call_with_fds(
        &self,
        method: &str,
        params: Value,
        fds: Vec<OwnedFd>,
    ) -> Result<(Value, Vec<OwnedFd>), ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(RpcError::Closed.into());
            }
            pending.waiters.insert(id, tx);
        }

        let mut body = json!({"id": id, "method": method, "params": [params]});
        if !fds.is_empty() {
            body["fds"] = json!(fds.len());
        }
        let borrowed: Vec<_> = fds.iter().map(|fd| fd.as_fd()).collect();
        let written = self.writer.lock().await.write_frame(&body, &borrowed).await;
        if let Err(err) = written {
            lock(&self.pending).waiters.remove(&id);
            return Err(err.into());
        }
        drop(borrowed);
        drop(fds);

        rx.await.map_err(|_| ClientError::Transport(RpcError::Closed))?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock(pending: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_responses(mut reader: FrameReader, pending: Arc<Mutex<Pending>>) {
    let failure = loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break RpcError::Closed,
            Err(err) => break err,
        };
        let Some(id) = frame.body.get("id").and_then(Value::as_u64) else {
            break RpcError::Malformed("response without numeric id".into());
        };
        let Some(waiter) = lock(&pending).waiters.remove(&id) else {
            break RpcError::UnknownRequest(id);
        };
        let outcome = match frame.body.get("error") {
            Some(Value::Null) | None => Ok((
                frame.body.get("result").cloned().unwrap_or(Value::Null),
                frame.fds,
            )),
            Some(Value::String(message)) => Err(ClientError::Remote(message.clone())),
            Some(other) => Err(ClientError::Remote(other.to_string())),
        };
        let _ = waiter.send(outcome);
    };

    debug!(reason = %failure, "control client stopped");
    let mut pending = lock(&pending);
    pending.closed = true;
    for (_, waiter) in pending.waiters.drain() {
        let _ = waiter.send(Err(RpcError::Closed.into()));
    }
}
