//! outbound send path
//!
//! Every connection drains one FIFO queue of outbound items. An item is
//! written completely before the next starts, so bytes reach the peer in
//! submission order and a short write boundary never drops or repeats
//! bytes: the writer keeps retrying the identical buffer until drained.
//! Items longer than one TLS record of plaintext are sliced so a single
//! write never exceeds what the record layer carries at once.

use std::fmt;
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::connection::ConnShared;
use crate::frame::WsFrame;
use crate::http::HttpMessage;

/// plaintext bytes of one TLS record
pub(crate) const SEND_CHUNK: usize = 16 * 1024;

/// one item of a connection's outbound queue
pub enum Outbound {
    Http(HttpMessage),
    Frame(WsFrame),
    Raw(BytesMut),
}

impl Outbound {
    pub fn into_buffer(self) -> BytesMut {
        match self {
            Outbound::Http(msg) => msg.into_buffer(),
            Outbound::Frame(frame) => frame.into_buffer(),
            Outbound::Raw(buf) => buf,
        }
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Http(msg) => write!(f, "Outbound::Http({} bytes)", msg.as_bytes().len()),
            Outbound::Frame(frame) => {
                write!(f, "Outbound::Frame({} bytes)", frame.as_bytes().len())
            }
            Outbound::Raw(buf) => write!(f, "Outbound::Raw({} bytes)", buf.len()),
        }
    }
}

/// write one outbound item completely, updating the connection counters
pub(crate) async fn write_outbound<W>(
    stream: &mut W,
    shared: &ConnShared,
    item: Outbound,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = item.into_buffer();
    let mut offset = 0;
    while offset < buf.len() {
        let end = (offset + SEND_CHUNK).min(buf.len());
        stream.write_all(&buf[offset..end]).await?;
        shared.stamp_out(end - offset);
        offset = end;
    }
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::io::AsyncReadExt;

    fn shared() -> std::sync::Arc<ConnShared> {
        ConnShared::new(1, "127.0.0.1:1".parse().unwrap())
    }

    #[tokio::test]
    async fn writes_every_byte_once_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let shared = shared();

        let mut payload = BytesMut::new();
        for i in 0..(3 * SEND_CHUNK + 17) {
            payload.extend_from_slice(&[(i % 251) as u8]);
        }
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            write_outbound(&mut client, &shared, Outbound::Raw(payload))
                .await
                .unwrap();
            shared.out_bytes.load(Ordering::Relaxed)
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while received.len() < expected.len() {
            let n = server.read(&mut buf).await.unwrap();
            assert_ne!(n, 0);
            received.extend_from_slice(&buf[..n]);
        }

        let sent = writer.await.unwrap();
        assert_eq!(received, expected.to_vec());
        assert_eq!(sent as usize, expected.len());
    }

    #[tokio::test]
    async fn items_keep_submission_order() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let shared = shared();

        let writer = tokio::spawn(async move {
            write_outbound(&mut client, &shared, Outbound::Raw(BytesMut::from(&b"first "[..])))
                .await
                .unwrap();
            write_outbound(&mut client, &shared, Outbound::Raw(BytesMut::from(&b"second"[..])))
                .await
                .unwrap();
        });

        let mut received = vec![0u8; 12];
        server.read_exact(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, b"first second");
    }
}
