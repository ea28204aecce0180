//! Drives a stream of outbound envelopes into a sink.
//!
//! Similar to `futures::stream::Forward`, except the sink's
//! `poll_complete` is also called on wakeups with nothing to send, so
//! buffered writes keep flushing while the send queue is quiet.

use futures::{Async, AsyncSink, Future, Poll, Sink, Stream};

pub struct Driver<S: Stream, K: Sink<SinkItem = S::Item>> {
    stream: S,
    sink: K,
    pending: Option<S::Item>,
}

impl<S, K> Driver<S, K>
    where S: Stream,
          K: Sink<SinkItem = S::Item, SinkError = S::Error>
{
    pub fn new(stream: S, sink: K) -> Driver<S, K> {
        Driver {
            stream: stream,
            sink: sink,
            pending: None,
        }
    }

    /// Tries to push the buffered item, if any. True iff the buffer is
    /// empty afterwards.
    fn flush_pending(&mut self) -> Result<bool, S::Error> {
        match self.pending.take() {
            None => Ok(true),
            Some(item) => {
                match self.sink.start_send(item)? {
                    AsyncSink::Ready => Ok(true),
                    AsyncSink::NotReady(item) => {
                        self.pending = Some(item);
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Completes when the stream is exhausted and fully flushed.
impl<S, K> Future for Driver<S, K>
    where S: Stream,
          K: Sink<SinkItem = S::Item, SinkError = S::Error>
{
    type Item = ();
    type Error = S::Error;

    fn poll(&mut self) -> Poll<(), S::Error> {
        self.sink.poll_complete()?;
        loop {
            if self.flush_pending()? {
                match self.stream.poll()? {
                    Async::Ready(Some(item)) => {
                        self.pending = Some(item);
                    }
                    Async::Ready(None) => {
                        trace!("send queue drained");
                        return self.sink.poll_complete();
                    }
                    Async::NotReady => {
                        self.sink.poll_complete()?;
                        return Ok(Async::NotReady);
                    }
                }
            } else {
                // The buffered item did not fit; drain the sink and try
                // again, or wait for it to make progress.
                match self.sink.poll_complete()? {
                    Async::Ready(()) => {}
                    Async::NotReady => return Ok(Async::NotReady),
                }
            }
        }
    }
}
