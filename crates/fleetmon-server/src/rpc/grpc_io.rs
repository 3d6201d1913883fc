use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use fleetmon_common::proto;

/// Bridges a gRPC IO-stream pair (inbound `Streaming`, outbound frame
/// sender) into a plain byte stream the broker can relay.
pub struct GrpcIo {
    inbound: Streaming<proto::IoStreamData>,
    outbound: mpsc::UnboundedSender<Result<proto::IoStreamData, Status>>,
    leftover: Vec<u8>,
    offset: usize,
}

impl GrpcIo {
    pub fn new(
        inbound: Streaming<proto::IoStreamData>,
        outbound: mpsc::UnboundedSender<Result<proto::IoStreamData, Status>>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            leftover: Vec::new(),
            offset: 0,
        }
    }
}

impl AsyncRead for GrpcIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.offset < self.leftover.len() {
                let remaining = self.leftover.len() - self.offset;
                let n = remaining.min(buf.remaining());
                let start = self.offset;
                buf.put_slice(&self.leftover[start..start + n]);
                self.offset += n;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inbound).poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if frame.data.is_empty() {
                        // keepalive frame, nothing to deliver
                        continue;
                    }
                    self.leftover = frame.data;
                    self.offset = 0;
                }
                Poll::Ready(Some(Err(status))) => {
                    return Poll::Ready(Err(std::io::Error::other(status)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for GrpcIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let frame = proto::IoStreamData { data: buf.to_vec() };
        match self.outbound.send(Ok(frame)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
