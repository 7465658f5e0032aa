use std::io::{self, ErrorKind};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::Frame;
use crate::AppResult;

/// Read side of a socket, turning the byte stream into frames.
#[derive(Debug)]
pub struct Connection<R> {
    reader: R,
    buffer: BytesMut,
    max_package_size: usize,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn new(reader: R, max_package_size: usize) -> Connection<R> {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            max_package_size,
        }
    }

    /// Reads the next frame.
    ///
    /// A malformed or oversized frame is an error and the connection should be closed.
    /// `None` means the other side closed the connection between frames; closing it in the
    /// middle of a frame is reported as a connection reset.
    pub async fn read_frame(&mut self) -> AppResult<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buffer, self.max_package_size)? {
                return Ok(Some(frame));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::buffer::BufferPool;
    use crate::protocol::{FrameBuilder, OpCode};
    use crate::AppError;

    #[tokio::test]
    async fn test_read_frames_then_clean_close() {
        let pool = BufferPool::new(8);
        let mut bytes = BytesMut::new();
        for value in [1u32, 2] {
            let mut builder = FrameBuilder::control(&pool, OpCode::REGISTRATION_COMPLETE);
            builder.writer().write_u32(value);
            bytes.extend_from_slice(&builder.finish().unwrap().to_bytes());
        }

        let (mut client, server) = tokio::io::duplex(7);
        let writer = tokio::spawn(async move {
            client.write_all(&bytes).await.unwrap();
        });
        let mut connection = Connection::new(server, 1024);
        for _ in 0..2 {
            match connection.read_frame().await.unwrap() {
                Some(Frame::Control { opcode, .. }) => {
                    assert_eq!(opcode, OpCode::REGISTRATION_COMPLETE)
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        writer.await.unwrap();
        assert!(connection.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_reset() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&[crate::protocol::CONTROL_LEAD, 0, 0, 0, 9, 1])
            .await
            .unwrap();
        drop(client);
        let mut connection = Connection::new(server, 1024);
        match connection.read_frame().await {
            Err(AppError::IoError(e)) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
