//! Length-prefixed bincode framing shared by the Raft transport and the KV wire protocol.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one frame: a u32 length prefix followed by the bincode encoding of `msg`.
pub async fn write_frame<T, S>(stream: &mut S, msg: &T) -> anyhow::Result<()>
where
    T: Serialize,
    S: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(msg)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame written by `write_frame`.
pub async fn read_frame<T, S>(stream: &mut S) -> anyhow::Result<T>
where
    T: DeserializeOwned,
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Blocking counterparts used by the synchronous `Clerk` client.
pub mod sync {
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use std::io::{Read, Write};

    pub fn write_frame<T: Serialize>(stream: &mut impl Write, msg: &T) -> anyhow::Result<()> {
        let bytes = bincode::serialize(msg)?;
        stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
        stream.write_all(&bytes)?;
        stream.flush()?;
        Ok(())
    }

    pub fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> anyhow::Result<T> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        Ok(bincode::deserialize(&buf)?)
    }
}
