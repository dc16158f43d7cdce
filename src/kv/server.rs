//! The KV store's client-facing TCP listener: decode a request, submit it through the
//! replicated state machine, and widen the application-level `KvErr` into the wire-level
//! `ClientErr` the `Clerk` knows how to retry on.

use super::{KvErr, KvOp, KvReply, KvStateMachine};
use crate::net;
use crate::rsm::{Rsm, RsmError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRequest {
    pub op: KvOp,
}

/// `KvErr` widened with the one failure mode the state machine itself never produces: this
/// replica not being (or no longer being) the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientErr {
    Ok,
    NoKey,
    Version,
    WrongLeader,
}

impl From<KvErr> for ClientErr {
    fn from(err: KvErr) -> Self {
        match err {
            KvErr::Ok => ClientErr::Ok,
            KvErr::NoKey => ClientErr::NoKey,
            KvErr::Version => ClientErr::Version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvResponse {
    Get { value: String, version: u64, err: ClientErr },
    Put { err: ClientErr },
}

/// Accept connections forever, each serving a sequence of request/response frames until the
/// client disconnects. Returns only if the listener itself errors out.
pub async fn serve(listener: TcpListener, rsm: Arc<Rsm<KvStateMachine>>) -> anyhow::Result<()> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let rsm = rsm.clone();
        tokio::spawn(async move {
            stream.set_nodelay(true).ok();
            loop {
                let request: KvRequest = match net::read_frame(&mut stream).await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let encoded = bincode::serialize(&request.op).expect("kv op must serialize");
                let response = match rsm.submit(encoded).await {
                    Ok(bytes) => {
                        let reply: KvReply = bincode::deserialize(&bytes).expect("kv reply must decode");
                        match reply {
                            KvReply::Get { value, version, err } => {
                                KvResponse::Get { value, version, err: err.into() }
                            }
                            KvReply::Put { err } => KvResponse::Put { err: err.into() },
                        }
                    }
                    Err(RsmError::NotLeader) => match request.op {
                        KvOp::Get { .. } => KvResponse::Get {
                            value: String::new(),
                            version: 0,
                            err: ClientErr::WrongLeader,
                        },
                        KvOp::Put { .. } => KvResponse::Put { err: ClientErr::WrongLeader },
                    },
                };
                if net::write_frame(&mut stream, &response).await.is_err() {
                    return;
                }
            }
        });
    }
}
