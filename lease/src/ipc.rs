use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::agent::LeaseAgent;
use crate::transport::LeaseTtl;
use crate::{Error, Result};

/// Component of the hosting process a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    LeaseAgent,
    ApplicationHost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeader {
    pub actor: Actor,
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseQueryRequest {
    pub header: RoutingHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseQueryReply {
    pub request_id: u64,
    pub ttl: std::result::Result<LeaseTtl, String>,
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(frame)?)
}

/// Source of the lease agent's TTL for an indirect monitor.
#[async_trait]
pub trait LeaseQueryClient: Send + Sync {
    async fn query_lease_ttl(&self) -> Result<LeaseTtl>;
}

/// Answers lease queries on behalf of a local agent.
#[derive(Debug, Clone)]
pub struct LeaseQueryService {
    agent: LeaseAgent,
}

impl LeaseQueryService {
    pub fn new(agent: LeaseAgent) -> Self {
        Self { agent }
    }

    pub fn handle_frame(&self, frame: &[u8]) -> Result<Bytes> {
        let request: LeaseQueryRequest = decode_frame(frame)?;
        let ttl = if request.header.actor == Actor::LeaseAgent {
            self.agent.lease_ttl_for_ipc().map_err(|e| e.to_string())
        } else {
            Err(format!("no handler for actor {:?}", request.header.actor))
        };
        trace!(request = request.header.request_id, ?ttl, "answered lease query");

        encode_frame(&LeaseQueryReply {
            request_id: request.header.request_id,
            ttl,
        })
    }
}

type Exchange = (Bytes, oneshot::Sender<Bytes>);

/// In-process IPC: frames travel over a channel to a server task.
pub struct LoopbackIpc;

impl LoopbackIpc {
    /// Spawns the server task for `service` and returns a connected client.
    pub fn serve(service: LeaseQueryService) -> IpcClient {
        let (tx, mut rx) = mpsc::channel::<Exchange>(64);

        tokio::spawn(async move {
            while let Some((frame, reply_to)) = rx.recv().await {
                match service.handle_frame(&frame) {
                    Ok(reply) => {
                        let _ = reply_to.send(reply);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed lease query"),
                }
            }
            debug!("lease query server stopped");
        });

        IpcClient {
            tx,
            next_request: AtomicU64::new(1),
        }
    }
}

#[derive(Debug)]
pub struct IpcClient {
    tx: mpsc::Sender<Exchange>,
    next_request: AtomicU64,
}

#[async_trait]
impl LeaseQueryClient for IpcClient {
    async fn query_lease_ttl(&self) -> Result<LeaseTtl> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = encode_frame(&LeaseQueryRequest {
            header: RoutingHeader {
                actor: Actor::LeaseAgent,
                request_id,
            },
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((frame, reply_tx))
            .await
            .map_err(|_| Error::Ipc("lease query server is gone".to_string()))?;
        let reply = reply_rx
            .await
            .map_err(|_| Error::Ipc("lease query dropped".to_string()))?;

        let reply: LeaseQueryReply = decode_frame(&reply)?;
        if reply.request_id != request_id {
            return Err(Error::Ipc(format!(
                "reply {} does not match request {}",
                reply.request_id, request_id
            )));
        }
        reply.ttl.map_err(Error::Ipc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reply_frame_carries_error_text() {
        let reply = LeaseQueryReply {
            request_id: 9,
            ttl: Err("lease agent is not open".to_string()),
        };

        let decoded: LeaseQueryReply = decode_frame(&encode_frame(&reply).unwrap()).unwrap();

        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let frame = encode_frame(&LeaseQueryReply {
            request_id: 1,
            ttl: Ok(LeaseTtl::Remaining(Duration::from_secs(3))),
        })
        .unwrap();

        let result: Result<LeaseQueryReply> = decode_frame(&frame[..frame.len() - 1]);

        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
