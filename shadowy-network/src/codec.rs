use crate::{SyncRequest, SyncResponse};
use async_trait::async_trait;
use futures::prelude::*;
use libp2p::request_response;
use std::io;

/// Frames are capped well above any legal block to bound peer memory.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SyncProtocol;

impl AsRef<str> for SyncProtocol {
    fn as_ref(&self) -> &str {
        "/shadowy/sync/1"
    }
}

/// Length-prefixed bincode frames for the sync protocol.
#[derive(Debug, Clone, Default)]
pub struct SyncCodec;

async fn read_frame<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "sync frame exceeds cap",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<T>(io: &mut T, payload: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "sync frame exceeds cap",
        ));
    }
    io.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    io.write_all(payload).await?;
    io.close().await?;
    Ok(())
}

fn encode<M: serde::Serialize>(message: &M) -> io::Result<Vec<u8>> {
    bincode::serialize(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn decode<M: serde::de::DeserializeOwned>(bytes: &[u8]) -> io::Result<M> {
    bincode::deserialize(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[async_trait]
impl request_response::Codec for SyncCodec {
    type Protocol = SyncProtocol;
    type Request = SyncRequest;
    type Response = SyncResponse;

    async fn read_request<T>(&mut self, _: &SyncProtocol, io: &mut T) -> io::Result<SyncRequest>
    where
        T: AsyncRead + Unpin + Send,
    {
        decode(&read_frame(io).await?)
    }

    async fn read_response<T>(&mut self, _: &SyncProtocol, io: &mut T) -> io::Result<SyncResponse>
    where
        T: AsyncRead + Unpin + Send,
    {
        decode(&read_frame(io).await?)
    }

    async fn write_request<T>(
        &mut self,
        _: &SyncProtocol,
        io: &mut T,
        request: SyncRequest,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &encode(&request)?).await
    }

    async fn write_response<T>(
        &mut self,
        _: &SyncProtocol,
        io: &mut T,
        response: SyncResponse,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &encode(&response)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadowy_core::Hash32;

    #[test]
    fn request_frames_roundtrip() {
        let request = SyncRequest::GetHeaders { start: 4, count: 32 };
        let bytes = encode(&request).unwrap();
        let back: SyncRequest = decode(&bytes).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn response_frames_roundtrip() {
        let response = SyncResponse::Block(None);
        let bytes = encode(&response).unwrap();
        let back: SyncResponse = decode(&bytes).unwrap();
        assert_eq!(back, response);

        let hello = SyncResponse::Hello(crate::HelloInfo {
            node_id: "12D3KooW".into(),
            chain_id: shadowy_core::sha3_digest(b"genesis"),
            software_version: "shadowy/0.1.0".into(),
            tip_height: 9,
            tip_hash: Hash32::ZERO,
        });
        let back: SyncResponse = decode(&encode(&hello).unwrap()).unwrap();
        assert_eq!(back, hello);
    }
}
