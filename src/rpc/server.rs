//! Serving a control channel.

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::os::fd::AsFd;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::codec::{self, Frame, FrameWriter};
use super::{unwrap_params, Call, CallError, Handler, Reply, RpcError};

#[derive(Deserialize)]
struct RequestFrame {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

type InFlight = Pin<Box<dyn Future<Output = (u64, Result<Reply, CallError>)> + Send>>;

/// Answer requests on `stream` until the peer hangs up.
///
/// Every request gets exactly one response carrying the caller's own id.
/// Handlers run concurrently; responses are written as they complete.
/// Requests still in flight when the stream closes are dropped.
pub async fn serve(stream: UnixStream, handler: Arc<dyn Handler>) -> Result<(), RpcError> {
    let (mut reader, writer) = codec::split(stream);
    let mut next_seq: u64 = 0;
    let mut pending: HashMap<u64, Value> = HashMap::new();
    let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();

    loop {
        tokio::select! {
            frame = reader.read_frame() => {
                let Some(frame) = frame? else {
                    debug!(dropped = in_flight.len(), "control channel closed");
                    return Ok(());
                };
                next_seq += 1;
                let seq = next_seq;
                let (id, call) = decode_request(frame)?;
                pending.insert(seq, id);
                match call {
                    Ok(call) => {
                        debug!(seq, method = %call.method, fds = call.fds.len(), "control call");
                        let handler = handler.clone();
                        in_flight.push(Box::pin(async move { (seq, handler.call(call).await) }));
                    }
                    Err(err) => in_flight.push(Box::pin(async move { (seq, Err(err)) })),
                }
            }
            Some((seq, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                let id = pending.remove(&seq).ok_or(RpcError::UnknownRequest(seq))?;
                respond(&writer, id, outcome).await?;
            }
        }
    }
}

fn decode_request(frame: Frame) -> Result<(Value, Result<Call, CallError>), RpcError> {
    let request: RequestFrame =
        serde_json::from_value(frame.body).map_err(|e| RpcError::Malformed(e.to_string()))?;
    let call = unwrap_params(request.params).map(|params| Call {
        method: request.method,
        params,
        fds: frame.fds,
    });
    Ok((request.id, call))
}

async fn respond(
    writer: &FrameWriter,
    id: Value,
    outcome: Result<Reply, CallError>,
) -> Result<(), RpcError> {
    match outcome {
        Ok(reply) => {
            let mut body = json!({"id": id, "result": reply.body, "error": null});
            if !reply.fds.is_empty() {
                body["fds"] = json!(reply.fds.len());
            }
            let fds: Vec<_> = reply.fds.iter().map(|fd| fd.as_fd()).collect();
            writer.write_frame(&body, &fds).await
            // `reply.fds` drops here, closing our copies.
        }
        Err(err) => {
            warn!(error = %err, "control call failed");
            let body = json!({"id": id, "result": null, "error": err.0});
            writer.write_frame(&body, &[]).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::ClientError;
    use crate::rpc::{codec, Client};
    use async_trait::async_trait;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(&self, call: Call) -> Result<Reply, CallError> {
            match call.method.as_str() {
                "echo" => {
                    // Later requests finish first to force interleaving.
                    let delay = call.params.get("delay").and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Reply::json(call.params)
                }
                "pipes" => {
                    let mut fds = Vec::new();
                    for _ in 0..2 {
                        let (r, w) = nix::unistd::pipe().map_err(|e| CallError::new(e.to_string()))?;
                        drop(r);
                        fds.push(w);
                    }
                    Ok(Reply::empty().with_fds(fds))
                }
                "count" => Reply::json(call.fds.len()),
                other => Err(CallError::new(format!("no such method {other}"))),
            }
        }
    }

    fn start() -> Client {
        let (host, peer) = codec::pair().unwrap();
        tokio::spawn(serve(host, Arc::new(Echo)));
        Client::new(codec::adopt(peer).unwrap())
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let client = start();
        let result = client.call("echo", json!({"a": 1, "b": 2})).await.unwrap();
        assert_eq!(result, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn interleaved_requests_keep_their_ids() {
        let client = Arc::new(start());
        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let params = json!({"n": i, "delay": (8 - i) * 5});
                let result = client.call("echo", params.clone()).await.unwrap();
                assert_eq!(result, params);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn errors_do_not_close_the_connection() {
        let client = start();
        let err = client.call("nope", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("no such method"));
        assert_eq!(client.call("echo", json!({"x": 1})).await.unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn reply_descriptors_arrive() {
        let client = start();
        let (result, fds): (Value, Vec<OwnedFd>) =
            client.call_with_fds("pipes", json!({}), Vec::new()).await.unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(fds.len(), 2);
    }

    #[tokio::test]
    async fn request_descriptors_arrive() {
        let client = start();
        let (r, w) = nix::unistd::pipe().unwrap();
        let (result, _) = client
            .call_with_fds("count", json!({}), vec![r, w])
            .await
            .unwrap();
        assert_eq!(result, json!(2));
    }

    #[tokio::test]
    async fn positional_array_is_unwrapped_once() {
        let client = start();
        let nested = client.call("echo", json!([{"a": 1}])).await.unwrap();
        assert_eq!(nested, json!([{"a": 1}]));
        let pair = client.call("echo", json!([1, 2])).await.unwrap();
        assert_eq!(pair, json!([1, 2]));
    }

    #[tokio::test]
    async fn peer_hangup_mid_call_ends_both_sides() {
        let (host, peer) = codec::pair().unwrap();
        let server = tokio::spawn(serve(host, Arc::new(Echo)));
        let half = peer.try_clone().unwrap();
        let client = Arc::new(Client::new(codec::adopt(peer).unwrap()));

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call("echo", json!({"delay": 60_000})).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The script side stops sending, as when the sandbox exits.
        unsafe { libc::shutdown(half.as_raw_fd(), libc::SHUT_WR) };

        let served = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        served.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(RpcError::Closed)), "{err}");
    }
}
