/*!
A bounded byte pipe between a synchronous producer and an asynchronous
consumer.

Archive packing runs on a blocking worker thread and writes into the pipe;
the task driving the builder subprocess reads from it and forwards the
bytes to the process's stdin. The writer blocks on a condition variable
when the ring buffer is full; the reader suspends on a notifier when it is
empty. Closing wakes both sides; reads after close drain the remaining
bytes and then return empty. Concurrent reads are forbidden.
*/

use std::io;
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::Notify;

const DEFAULT_CAPACITY: usize = 1 << 16;

struct PipeState {
    buf: Box<[u8]>,
    pos: usize,
    size: usize,
    closed: bool,
    reading: bool,
}

struct Shared {
    state: Mutex<PipeState>,
    write_cv: Condvar,
    read_notify: Notify,
}

#[derive(Clone)]
pub struct SyncToAsyncPipe {
    shared: Arc<Shared>,
}

impl SyncToAsyncPipe {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PipeState {
                    buf: vec![0; capacity.max(1)].into_boxed_slice(),
                    pos: 0,
                    size: 0,
                    closed: false,
                    reading: false,
                }),
                write_cv: Condvar::new(),
                read_notify: Notify::new(),
            }),
        }
    }

    /// Write all of `data`, blocking while the buffer is full. Fails with
    /// a broken pipe error if the pipe has been closed.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut data_pos = 0;
        let mut state = self.shared.state.lock().unwrap();
        while data_pos < data.len() {
            while state.size == state.buf.len() && !state.closed {
                state = self.shared.write_cv.wait(state).unwrap();
            }
            if state.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe closed while writing",
                ));
            }

            let capacity = state.buf.len();
            let write_offset = (state.pos + state.size) % capacity;
            let amount = (data.len() - data_pos)
                .min(capacity - state.size)
                .min(capacity - write_offset);
            state.buf[write_offset..write_offset + amount]
                .copy_from_slice(&data[data_pos..data_pos + amount]);
            state.size += amount;
            data_pos += amount;
            self.shared.read_notify.notify_one();
        }
        Ok(())
    }

    /// Read a chunk. Returns an empty vec once the pipe is closed and
    /// drained. Only one task may read at a time.
    pub async fn read(&self) -> io::Result<Vec<u8>> {
        loop {
            let notified = self.shared.read_notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.size > 0 {
                    let capacity = state.buf.len();
                    let amount = state.size.min(capacity - state.pos);
                    let result = state.buf[state.pos..state.pos + amount].to_vec();
                    state.pos = (state.pos + amount) % capacity;
                    state.size -= amount;
                    self.shared.write_cv.notify_all();
                    return Ok(result);
                }
                if state.closed {
                    return Ok(Vec::new());
                }
                if state.reading {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "cannot read from the same pipe concurrently",
                    ));
                }
                state.reading = true;
            }
            notified.await;
            self.shared.state.lock().unwrap().reading = false;
        }
    }

    /// Close the pipe from either side. Blocked writers fail with a broken
    /// pipe error; the reader drains remaining bytes and then sees EOF.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        self.shared.write_cv.notify_all();
        self.shared.read_notify.notify_one();
    }

    /// An `io::Write` adapter for handing to archive writers.
    pub fn writer(&self) -> PipeWriter {
        PipeWriter { pipe: self.clone() }
    }
}

impl Default for SyncToAsyncPipe {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PipeWriter {
    pipe: SyncToAsyncPipe,
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pipe.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let pipe = SyncToAsyncPipe::new();
        pipe.write(b"hello ").unwrap();
        pipe.write(b"world").unwrap();
        pipe.close();

        let mut collected = Vec::new();
        loop {
            let chunk = pipe.read().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world");

        // Reads after EOF keep returning empty.
        assert!(pipe.read().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn threaded_producer_with_small_buffer() {
        let pipe = SyncToAsyncPipe::with_capacity(16);
        let writer = pipe.clone();
        let producer = std::thread::spawn(move || {
            for chunk in (0u8..100).collect::<Vec<u8>>().chunks(7) {
                writer.write(chunk).unwrap();
            }
            writer.close();
        });

        let mut collected = Vec::new();
        loop {
            let chunk = pipe.read().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        producer.join().unwrap();
        assert_eq!(collected, (0u8..100).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let pipe = SyncToAsyncPipe::new();
        pipe.close();
        let err = pipe.write(b"data").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_writer_fails_on_close() {
        let pipe = SyncToAsyncPipe::with_capacity(4);
        pipe.write(b"full").unwrap();
        let writer = pipe.clone();
        let blocked = std::thread::spawn(move || writer.write(b"more"));
        // Give the writer time to block on the full buffer, then close.
        std::thread::sleep(std::time::Duration::from_millis(50));
        pipe.close();
        let result = blocked.join().unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_reads_rejected() {
        let pipe = SyncToAsyncPipe::new();
        let reader = pipe.clone();
        let pending = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = pipe.read().await.unwrap_err();
        assert!(err.to_string().contains("concurrently"));

        pipe.close();
        assert!(pending.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn writer_adapter() {
        use std::io::Write;
        let pipe = SyncToAsyncPipe::new();
        let mut writer = pipe.writer();
        writer.write_all(b"adapted").unwrap();
        writer.flush().unwrap();
        pipe.close();
        assert_eq!(pipe.read().await.unwrap(), b"adapted");
    }
}
