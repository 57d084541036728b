//! Latest-wins publish/subscribe over named shared memory.
//!
//! A topic is a (semaphore, buffer) pair: the buffer carries the most
//! recent payload, the semaphore counts ready frames, and the publisher
//! posts only-when-zero, so the pending count never exceeds 1. A slow
//! subscriber therefore sees "one ready" with the newest bytes, however
//! many publishes it slept through. This is deliberate lossy
//! latest-value-wins messaging, not a queue.
//!
//! Payloads are opaque bytes; callers supply the codec via
//! [`TopicMessage`]. Buffer size is pinned by the first publish: the
//! multiplexer never resizes, a later mismatch is a fatal resource error.

use std::collections::HashMap;

use crate::error::{OcmError, OcmResult};
use crate::ipc::{NamedSemaphore, SharedBuffer};

/// Caller-supplied payload codec.
pub trait TopicMessage: Sized {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> OcmResult<Self>;
}

/// Keyed maps of topic semaphores and payload buffers, populated lazily on
/// first use. One instance per communicating thread; the kernel objects
/// behind the maps are shared across processes by name.
#[derive(Debug, Default)]
pub struct SharedMemoryTopic {
    semaphores: HashMap<String, NamedSemaphore>,
    buffers: HashMap<String, SharedBuffer>,
}

impl SharedMemoryTopic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `msg` into `buffer` and flag `topic` ready.
    pub fn publish<M: TopicMessage>(&mut self, topic: &str, buffer: &str, msg: &M) -> OcmResult<()> {
        let bytes = msg.encode();
        self.write_buffer(buffer, &bytes)?;
        self.topic_sem(topic)?.post_if_zero()
    }

    /// Write the concatenated encodings of `msgs` into `buffer`, then flag
    /// every topic in `topics` ready. Same latest-wins semantics per topic.
    pub fn publish_list<M: TopicMessage>(
        &mut self,
        topics: &[&str],
        buffer: &str,
        msgs: &[M],
    ) -> OcmResult<()> {
        let mut bytes = Vec::new();
        for msg in msgs {
            bytes.extend(msg.encode());
        }
        self.write_buffer(buffer, &bytes)?;
        for topic in topics {
            self.topic_sem(topic)?.post_if_zero()?;
        }
        Ok(())
    }

    /// Block until `topic` has a ready frame, then decode `buffer` and
    /// invoke `callback`.
    pub fn subscribe<M, F>(&mut self, topic: &str, buffer: &str, callback: F) -> OcmResult<()>
    where
        M: TopicMessage,
        F: FnOnce(M),
    {
        self.topic_sem(topic)?.wait()?;
        self.deliver(buffer, callback)
    }

    /// Deliver if a frame is pending; otherwise a no-op. Returns whether a
    /// payload was delivered.
    pub fn subscribe_no_wait<M, F>(&mut self, topic: &str, buffer: &str, callback: F) -> OcmResult<bool>
    where
        M: TopicMessage,
        F: FnOnce(M),
    {
        if !self.topic_sem(topic)?.try_wait() {
            return Ok(false);
        }
        self.deliver(buffer, callback)?;
        Ok(true)
    }

    /// Like [`subscribe`](Self::subscribe) with an upper wait bound.
    /// Returns whether a payload was delivered; a timeout is not an error.
    pub fn subscribe_timeout<M, F>(
        &mut self,
        topic: &str,
        buffer: &str,
        timeout_ms: u64,
        callback: F,
    ) -> OcmResult<bool>
    where
        M: TopicMessage,
        F: FnOnce(M),
    {
        if !self.topic_sem(topic)?.wait_timeout(timeout_ms)? {
            return Ok(false);
        }
        self.deliver(buffer, callback)?;
        Ok(true)
    }

    fn topic_sem(&mut self, topic: &str) -> OcmResult<&NamedSemaphore> {
        if !self.semaphores.contains_key(topic) {
            self.semaphores
                .insert(topic.to_string(), NamedSemaphore::open(topic, 0)?);
        }
        Ok(&self.semaphores[topic])
    }

    /// Attach to `buffer` adopting its existing size. Only called after a
    /// successful semaphore wait, which implies a publisher already
    /// created the region.
    fn reader_buffer(&mut self, buffer: &str) -> OcmResult<&SharedBuffer> {
        if !self.buffers.contains_key(buffer) {
            self.buffers
                .insert(buffer.to_string(), SharedBuffer::attach(buffer, false, 0)?);
        }
        Ok(&self.buffers[buffer])
    }

    fn deliver<M, F>(&mut self, buffer: &str, callback: F) -> OcmResult<()>
    where
        M: TopicMessage,
        F: FnOnce(M),
    {
        let shm = self.reader_buffer(buffer)?;
        let msg = {
            let guard = shm.lock()?;
            M::decode(&guard)?
        };
        // Callback runs outside the buffer lock.
        callback(msg);
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &str, bytes: &[u8]) -> OcmResult<()> {
        if !self.buffers.contains_key(buffer) {
            // First publish fixes the size: create-with-size, or verify a
            // pre-existing region matches exactly.
            self.buffers.insert(
                buffer.to_string(),
                SharedBuffer::attach(buffer, true, bytes.len())?,
            );
        }
        let shm = &self.buffers[buffer];
        if bytes.len() != shm.size() {
            return Err(OcmError::Resource(format!(
                "topic buffer '{buffer}' holds {} bytes, payload is {}: topics never resize",
                shm.size(),
                bytes.len()
            )));
        }
        let mut guard = shm.lock()?;
        guard.copy_from_slice(bytes);
        Ok(())
    }
}
