//! Typed payload cells, the smallest unit of data a pipeline moves around.
//!
//! A [`Buffer`] owns one payload of an arbitrary type plus an optional typed
//! metadata value. The concrete types are erased at construction and recorded
//! as a tag pair; retrieval through [`Blob::get`](crate::Blob::get) checks the
//! tag and hands out a typed view. Each (payload, meta) pair has a stable
//! *key string* (overridable through [`Buffer::register_key`]) and a stable
//! per-process *UID*.
//!
//! An optional release hook runs exactly once, when the last owner drops the
//! buffer. Pre-erased ("opaque") payloads must install one, since nothing
//! else knows how to free them.

use std::any::{type_name, Any, TypeId};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{PipelineError, Result};

/// A payload whose concrete type has already been erased by the caller.
pub type ErasedPayload = Box<dyn Any + Send + Sync>;

/// Hook invoked exactly once with the payload and metadata when the last
/// owner drops the buffer.
pub type ReleaseHook = Box<dyn FnOnce(ErasedPayload, Option<ErasedPayload>) + Send + Sync>;

/// Tag used for buffers built from pre-erased payloads.
pub struct Opaque;

type ConvertFn = Arc<dyn Fn(&Buffer) -> Result<Buffer> + Send + Sync>;

struct TypeRegistry {
    uids: DashMap<TypeId, i32>,
    keys: DashMap<TypeId, String>,
    conversions: DashMap<(i32, String), ConvertFn>,
    next_uid: AtomicI32,
}

static REGISTRY: Lazy<TypeRegistry> = Lazy::new(|| TypeRegistry {
    uids: DashMap::new(),
    keys: DashMap::new(),
    conversions: DashMap::new(),
    next_uid: AtomicI32::new(1),
});

fn uid_of(tag: TypeId) -> i32 {
    *REGISTRY
        .uids
        .entry(tag)
        .or_insert_with(|| REGISTRY.next_uid.fetch_add(1, Ordering::Relaxed))
}

fn key_of(tag: TypeId, fallback: &'static str) -> String {
    REGISTRY
        .keys
        .get(&tag)
        .map(|key| key.clone())
        .unwrap_or_else(|| fallback.to_owned())
}

/// A single type-erased payload cell with optional metadata.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Buffer {
    // `Some` until the final drop hands it to the release hook
    #[derivative(Debug = "ignore")]
    payload: Option<ErasedPayload>,
    #[derivative(Debug = "ignore")]
    meta: Mutex<Option<ErasedPayload>>,
    size: AtomicUsize,
    payload_tag: TypeId,
    meta_tag: TypeId,
    pair_tag: TypeId,
    key: String,
    uid: i32,
    #[derivative(Debug = "ignore")]
    release: Mutex<Option<ReleaseHook>>,
}

impl Buffer {
    /// Build a cell around `payload` with no metadata and the default
    /// release (a plain drop).
    ///
    /// `size` is an opaque indicator carried alongside the payload, it is
    /// never used for allocation.
    pub fn new<T: Send + Sync + 'static>(payload: T, size: usize) -> Buffer {
        Self::build::<T, ()>(Box::new(payload), size, None, None)
    }

    /// Build a cell with typed metadata.
    pub fn with_meta<T, M>(payload: T, size: usize, meta: Option<M>) -> Buffer
    where
        T: Send + Sync + 'static,
        M: Send + Sync + 'static,
    {
        Self::build::<T, M>(
            Box::new(payload),
            size,
            meta.map(|m| Box::new(m) as ErasedPayload),
            None,
        )
    }

    /// Build a cell with a release hook. The hook receives the payload and
    /// the metadata (if any) exactly once, on the final owner's drop.
    pub fn with_release<T, M, F>(payload: T, size: usize, meta: Option<M>, hook: F) -> Buffer
    where
        T: Send + Sync + 'static,
        M: Send + Sync + 'static,
        F: FnOnce(T, Option<M>) + Send + Sync + 'static,
    {
        let erased: ReleaseHook = Box::new(move |payload, meta| {
            if let Ok(payload) = payload.downcast::<T>() {
                let meta = meta.and_then(|m| m.downcast::<M>().ok()).map(|m| *m);
                hook(*payload, meta);
            }
        });
        Self::build::<T, M>(
            Box::new(payload),
            size,
            meta.map(|m| Box::new(m) as ErasedPayload),
            Some(erased),
        )
    }

    /// Build a cell from an already erased payload. The release hook is
    /// mandatory: with the type gone, only the caller knows how to free it.
    pub fn opaque(
        payload: ErasedPayload,
        size: usize,
        meta: Option<ErasedPayload>,
        hook: ReleaseHook,
    ) -> Buffer {
        Self::build::<Opaque, Opaque>(payload, size, meta, Some(hook))
    }

    fn build<T: 'static, M: 'static>(
        payload: ErasedPayload,
        size: usize,
        meta: Option<ErasedPayload>,
        hook: Option<ReleaseHook>,
    ) -> Buffer {
        let pair_tag = TypeId::of::<(T, M)>();
        Buffer {
            payload: Some(payload),
            meta: Mutex::new(meta),
            size: AtomicUsize::new(size),
            payload_tag: TypeId::of::<T>(),
            meta_tag: TypeId::of::<M>(),
            pair_tag,
            key: key_of(pair_tag, type_name::<(T, M)>()),
            uid: uid_of(pair_tag),
            release: Mutex::new(hook),
        }
    }

    /// The key string of the stored (payload, meta) pair. Defaults to the
    /// compiler's type name unless overridden with [`Buffer::register_key`].
    pub fn key_string(&self) -> &str {
        &self.key
    }

    /// A stable per-process integer identifying the (payload, meta) pair.
    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Relaxed);
    }

    /// Whether the stored pair is exactly (`T`, `M`).
    pub fn matches<T: 'static, M: 'static>(&self) -> bool {
        self.pair_tag == TypeId::of::<(T, M)>()
    }

    /// Typed view of the payload, `None` when `T` does not match.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        if self.payload_tag != TypeId::of::<T>() {
            return None;
        }
        self.payload.as_ref().and_then(|p| p.downcast_ref())
    }

    /// Run `f` on the metadata, if present and of type `M`.
    pub fn map_meta<M: 'static, R>(&self, f: impl FnOnce(&M) -> R) -> Option<R> {
        let meta = self.meta.lock();
        meta.as_ref().and_then(|m| m.downcast_ref()).map(f)
    }

    /// Replace the metadata. The previous value is dropped; the declared
    /// metadata type cannot change.
    pub fn set_meta<M: Send + Sync + 'static>(&self, meta: M) -> Result<()> {
        if self.meta_tag != TypeId::of::<M>() {
            return Err(PipelineError::TypeMismatch {
                index: 0,
                stored: self.key.clone(),
                requested: type_name::<M>(),
            });
        }
        *self.meta.lock() = Some(Box::new(meta));
        Ok(())
    }

    /// Convert this buffer to the type identified by `target_key`, using a
    /// conversion previously installed with [`Buffer::register_conversion`].
    pub fn convert_to(&self, target_key: &str) -> Result<Buffer> {
        let convert = REGISTRY
            .conversions
            .get(&(self.uid, target_key.to_owned()))
            .map(|f| f.clone());
        match convert {
            Some(f) => f(self),
            None => Err(PipelineError::NoConversion {
                from: self.key.clone(),
                to: target_key.to_owned(),
            }),
        }
    }

    /// Override the key string of the (`T`, `M`) pair. Affects buffers built
    /// after the call; register keys at startup.
    pub fn register_key<T: 'static, M: 'static>(key: impl Into<String>) {
        REGISTRY.keys.insert(TypeId::of::<(T, M)>(), key.into());
    }

    /// Install a conversion from (`T`, `M`) buffers to the type identified
    /// by `target_key`.
    pub fn register_conversion<T: 'static, M: 'static>(
        target_key: impl Into<String>,
        convert: impl Fn(&Buffer) -> Result<Buffer> + Send + Sync + 'static,
    ) {
        let uid = uid_of(TypeId::of::<(T, M)>());
        REGISTRY
            .conversions
            .insert((uid, target_key.into()), Arc::new(convert));
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let payload = self.payload.take();
        let meta = self.meta.get_mut().take();
        if let Some(hook) = self.release.get_mut().take() {
            if let Some(payload) = payload {
                hook(payload, meta);
            }
        }
    }
}

/// Shared handle to a [`Buffer`] whose (payload, meta) pair has been checked.
///
/// Obtained from [`Blob::get`](crate::Blob::get); dereferences to the payload.
pub struct TypedBuffer<T, M = ()> {
    inner: Arc<Buffer>,
    _types: std::marker::PhantomData<fn() -> (T, M)>,
}

impl<T, M> TypedBuffer<T, M>
where
    T: Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    pub(crate) fn new(inner: Arc<Buffer>) -> TypedBuffer<T, M> {
        TypedBuffer {
            inner,
            _types: std::marker::PhantomData,
        }
    }

    pub fn payload(&self) -> &T {
        self.inner.payload::<T>().expect("tag checked on creation")
    }

    pub fn map_meta<R>(&self, f: impl FnOnce(&M) -> R) -> Option<R> {
        self.inner.map_meta(f)
    }

    pub fn set_meta(&self, meta: M) -> Result<()> {
        self.inner.set_meta(meta)
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn set_size(&self, size: usize) {
        self.inner.set_size(size)
    }

    /// The untyped shared buffer behind this view.
    pub fn inner(&self) -> &Arc<Buffer> {
        &self.inner
    }
}

impl<T, M> Clone for TypedBuffer<T, M> {
    fn clone(&self) -> Self {
        TypedBuffer {
            inner: self.inner.clone(),
            _types: std::marker::PhantomData,
        }
    }
}

impl<T, M> std::ops::Deref for TypedBuffer<T, M>
where
    T: Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        self.payload()
    }
}

impl<T, M> std::fmt::Debug for TypedBuffer<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedBuffer")
            .field("key", &self.inner.key_string())
            .field("uid", &self.inner.uid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn release_hook_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let buffer = {
            let count = count.clone();
            Arc::new(Buffer::with_release::<u32, (), _>(7, 1, None, move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let other = buffer.clone();
        drop(buffer);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(other);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_release_drops_payload() {
        let marker = Arc::new(());
        let buffer = Buffer::new(marker.clone(), 1);
        assert_eq!(Arc::strong_count(&marker), 2);
        drop(buffer);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn opaque_hook_receives_payload_and_meta() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = count.clone();
            Box::new(move |payload: ErasedPayload, meta: Option<ErasedPayload>| {
                assert_eq!(payload.downcast_ref::<&str>(), Some(&"frame"));
                assert!(meta.is_some());
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let buffer = Buffer::opaque(Box::new("frame"), 5, Some(Box::new(42u8)), hook);
        drop(buffer);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uid_is_stable_per_pair() {
        struct A;
        struct B;
        let a1 = Buffer::new(3u128, 1);
        let a2 = Buffer::new(4u128, 1);
        assert_eq!(a1.uid(), a2.uid());
        let a = Buffer::with_meta(3u64, 1, Some(A));
        let b = Buffer::with_meta(3u64, 1, Some(B));
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn key_string_can_be_overridden() {
        struct Nv12Frame(#[allow(dead_code)] u8);
        Buffer::register_key::<Nv12Frame, ()>("NV12Frame");
        let buffer = Buffer::new(Nv12Frame(0), 1);
        assert_eq!(buffer.key_string(), "NV12Frame");
    }

    #[test]
    fn set_meta_rejects_a_different_type() {
        struct M1;
        let buffer = Buffer::with_meta(1u32, 1, Some(M1));
        assert!(buffer.set_meta(M1).is_ok());
        assert!(matches!(
            buffer.set_meta("wrong"),
            Err(PipelineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn conversion_goes_through_the_registry() {
        struct Celsius(f64);
        struct Fahrenheit(#[allow(dead_code)] f64);
        Buffer::register_conversion::<Celsius, ()>("fahrenheit", |buffer| {
            let celsius = buffer.payload::<Celsius>().ok_or(PipelineError::Failure)?;
            Ok(Buffer::new(Fahrenheit(celsius.0 * 9.0 / 5.0 + 32.0), 1))
        });
        let buffer = Buffer::new(Celsius(100.0), 1);
        let converted = buffer.convert_to("fahrenheit").unwrap();
        assert!(converted.matches::<Fahrenheit, ()>());
        assert!(matches!(
            buffer.convert_to("kelvin"),
            Err(PipelineError::NoConversion { .. })
        ));
    }
}
