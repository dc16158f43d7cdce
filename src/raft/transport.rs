//! TCP transport for the Raft RPC envelope: one `RaftRpc` request in, one reply out, on a
//! fresh connection per call. Grounded on the teacher's `send_raft_message`/listener pair in
//! `raft.rs`, adapted to the shared `net::write_frame`/`read_frame` framing.

use super::rpc::RaftRpc;
use crate::net;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Dial `addr`, send `request`, and wait for the single reply frame, bounded by `timeout`.
pub async fn call(addr: SocketAddr, request: RaftRpc, timeout: Duration) -> anyhow::Result<RaftRpc> {
    tokio::time::timeout(timeout, async move {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        net::write_frame(&mut stream, &request).await?;
        net::read_frame(&mut stream).await
    })
    .await
    .map_err(|_| anyhow::anyhow!("rpc to {} timed out", addr))?
}

/// A peer's inbound Raft RPC handler: given one decoded request, produce the reply to send
/// back. `RaftPeer` supplies this via its three `handle_*` methods dispatched on the variant.
pub trait RpcHandler: Send + Sync {
    fn handle<'a>(&'a self, request: RaftRpc) -> Pin<Box<dyn Future<Output = RaftRpc> + Send + 'a>>;
}

/// Accept connections on `listener` forever, handling one request-reply round trip per
/// connection on its own task. Returns only if the listener itself errors out.
pub async fn serve<H>(listener: TcpListener, handler: Arc<H>) -> anyhow::Result<()>
where
    H: RpcHandler + 'static,
{
    loop {
        let (mut stream, _) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            stream.set_nodelay(true).ok();
            let request: RaftRpc = match net::read_frame(&mut stream).await {
                Ok(r) => r,
                Err(_) => return,
            };
            let reply = handler.handle(request).await;
            let _ = net::write_frame(&mut stream, &reply).await;
        });
    }
}
