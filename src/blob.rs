//! Blobs: the payload bundles transmitted across pipeline edges.

use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{Buffer, TypedBuffer};
use crate::error::{PipelineError, Result};

/// An ordered bundle of shared [`Buffer`]s plus routing metadata.
///
/// Buffers are addressed by position; retrieving one with [`Blob::get`]
/// fails unless the declared (payload, meta) pair matches the slot. The blob
/// itself travels through ports as `Arc<Blob>`, its buffers are dropped when
/// the last owning blob goes away.
#[derive(Debug, Default)]
pub struct Blob {
    buffers: Vec<Arc<Buffer>>,
    pub stream_id: i32,
    pub frame_id: i32,
    /// Submission time, millisecond resolution.
    pub timestamp: Duration,
    pub type_id: i32,
    /// Free-form application context.
    pub ctx: i32,
}

impl Blob {
    pub fn new() -> Blob {
        Blob::default()
    }

    pub fn with_ids(stream_id: i32, frame_id: i32) -> Blob {
        Blob {
            stream_id,
            frame_id,
            ..Blob::default()
        }
    }

    /// Record the current wall-clock time in the timestamp field.
    pub fn stamp_now(&mut self) {
        self.timestamp = Duration::from_millis(coarsetime::Clock::now_since_epoch().as_millis());
    }

    /// Append a pre-built buffer.
    pub fn push(&mut self, buffer: Arc<Buffer>) {
        self.buffers.push(buffer);
    }

    /// Construct a buffer in place and return a shared handle to it.
    pub fn emplace<T, M>(&mut self, payload: T, size: usize, meta: Option<M>) -> Arc<Buffer>
    where
        T: Send + Sync + 'static,
        M: Send + Sync + 'static,
    {
        let buffer = Arc::new(Buffer::with_meta(payload, size, meta));
        self.buffers.push(buffer.clone());
        buffer
    }

    /// Like [`Blob::emplace`], installing a release hook on the new buffer.
    pub fn emplace_with_release<T, M, F>(
        &mut self,
        payload: T,
        size: usize,
        meta: Option<M>,
        hook: F,
    ) -> Arc<Buffer>
    where
        T: Send + Sync + 'static,
        M: Send + Sync + 'static,
        F: FnOnce(T, Option<M>) + Send + Sync + 'static,
    {
        let buffer = Arc::new(Buffer::with_release(payload, size, meta, hook));
        self.buffers.push(buffer.clone());
        buffer
    }

    /// Typed view of the `index`-th buffer.
    ///
    /// Fails with [`PipelineError::TypeMismatch`] when the slot holds a
    /// different (payload, meta) pair; the blob is left intact either way.
    pub fn get<T, M>(&self, index: usize) -> Result<TypedBuffer<T, M>>
    where
        T: Send + Sync + 'static,
        M: Send + Sync + 'static,
    {
        let buffer = self
            .buffers
            .get(index)
            .ok_or(PipelineError::NoSuchBuffer(index))?;
        if !buffer.matches::<T, M>() {
            return Err(PipelineError::TypeMismatch {
                index,
                stored: buffer.key_string().to_owned(),
                requested: type_name::<(T, M)>(),
            });
        }
        Ok(TypedBuffer::new(buffer.clone()))
    }

    pub fn buffers(&self) -> &[Arc<Buffer>] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
