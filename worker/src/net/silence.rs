use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, ReadBuf},
    time::{self, Instant, Sleep},
};

/// A reader that fails with `TimedOut` once no byte arrived for `limit`.
///
/// Every read that makes progress pushes the deadline back, so a large frame
/// trickling in slowly is not mistaken for a silent peer.
pub(crate) struct SilenceGuard<R> {
    inner: R,
    limit: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<R: AsyncRead + Unpin> SilenceGuard<R> {
    /// Wraps `inner`, with no limit the guard only forwards reads.
    pub(crate) fn new(inner: R, limit: Option<Duration>) -> Self {
        Self {
            inner,
            limit,
            deadline: limit.map(|limit| Box::pin(time::sleep(limit))),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SilenceGuard<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let filled = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let (Some(limit), Some(deadline)) = (this.limit, this.deadline.as_mut())
                    && buf.filled().len() > filled
                {
                    deadline.as_mut().reset(Instant::now() + limit);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                let (Some(limit), Some(deadline)) = (this.limit, this.deadline.as_mut()) else {
                    return Poll::Pending;
                };

                ready!(deadline.as_mut().poll(cx));
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data for {}ms", limit.as_millis()),
                )))
            }
        }
    }
}
