//! State shared by every resource: identity, pool back-reference, version and views.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::{Mutex, RwLock};
use zenith_core::log;
use crate::device::DeviceObject;
use crate::id::ObjectId;
use crate::memory::MemoryStatisticsBuilder;
use crate::resource_pool::DevicePool;
use crate::{RhiError, RhiResult};

/// A resource's registration as input or output of the frame graph.
#[derive(Debug)]
pub struct FrameAttachment {
    id: ObjectId,
    name: String,
}

impl FrameAttachment {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::next(),
            name: name.into(),
        })
    }

    #[inline]
    pub fn id(&self) -> ObjectId { self.id }

    #[inline]
    pub fn name(&self) -> &str { &self.name }
}

/// Notified when a resource's backing changes and cached views must be rebuilt.
pub trait ResourceInvalidateListener: Send + Sync {
    fn on_resource_invalidated(&self);
}

/// Non-owning reference from a resource to the pool it is registered with.
pub struct PoolBinding<P: ?Sized> {
    pub id: ObjectId,
    pub pool: Weak<P>,
}

impl<P: ?Sized> Clone for PoolBinding<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pool: self.pool.clone(),
        }
    }
}

/// Common resource state, generic over the kind of pool it binds to.
pub struct ResourceBase<P: ?Sized> {
    id: ObjectId,
    name: RwLock<String>,
    pool: RwLock<Option<PoolBinding<P>>>,
    version: AtomicU32,
    frame_attachment: RwLock<Weak<FrameAttachment>>,
    listeners: Mutex<Vec<(ObjectId, Weak<dyn ResourceInvalidateListener>)>>,
}

impl<P: ?Sized> ResourceBase<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ObjectId::next(),
            name: RwLock::new(name.into()),
            pool: RwLock::new(None),
            version: AtomicU32::new(0),
            frame_attachment: RwLock::new(Weak::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId { self.id }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn pool(&self) -> Option<Arc<P>> {
        self.pool.read().as_ref()?.pool.upgrade()
    }

    pub fn pool_id(&self) -> Option<ObjectId> {
        self.pool.read().as_ref().map(|b| b.id)
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_first_version(&self) -> bool {
        self.version() == 0
    }

    /// Rebinds the resource. Bumps the version on every call.
    ///
    /// Entering a pool after the first version invalidates the views first. Leaving
    /// the pool is refused while a frame attachment is live.
    pub(crate) fn set_pool(&self, binding: Option<PoolBinding<P>>) -> RhiResult {
        match &binding {
            None if self.is_attachment() => {
                log::error!("resource '{}' cannot leave its pool while it is a frame attachment", self.name());
                return Err(RhiError::InvalidOperation);
            }
            Some(_) if !self.is_first_version() => self.invalidate_views(),
            _ => {}
        }
        *self.pool.write() = binding;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn frame_attachment(&self) -> Option<Arc<FrameAttachment>> {
        self.frame_attachment.read().upgrade()
    }

    pub fn is_attachment(&self) -> bool {
        self.frame_attachment().is_some()
    }

    pub fn set_frame_attachment(&self, attachment: Option<&Arc<FrameAttachment>>) {
        *self.frame_attachment.write() = attachment.map_or_else(Weak::new, Arc::downgrade);
    }

    pub fn add_invalidate_listener(&self, id: ObjectId, listener: Weak<dyn ResourceInvalidateListener>) {
        self.listeners.lock().push((id, listener));
    }

    pub fn remove_invalidate_listener(&self, id: ObjectId) {
        self.listeners.lock().retain(|(existing, _)| *existing != id);
    }

    pub fn invalidate_listener_count(&self) -> usize {
        self.listeners.lock().iter().filter(|(_, l)| l.strong_count() > 0).count()
    }

    /// Notifies every live view exactly once.
    pub fn invalidate_views(&self) {
        let listeners: Vec<_> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|(_, l)| l.strong_count() > 0);
            listeners.iter().filter_map(|(_, l)| l.upgrade()).collect()
        };
        for listener in listeners {
            listener.on_resource_invalidated();
        }
    }
}

/// A resource living on a single device, registered with at most one [`DevicePool`].
pub trait DeviceResource: DeviceObject + Send + Sync + 'static {
    fn resource_base(&self) -> &ResourceBase<dyn DevicePool>;

    /// Adds this resource's entry to the pool currently open in `builder`.
    fn report_memory_usage(&self, _builder: &mut MemoryStatisticsBuilder) {}

    fn as_any(&self) -> &dyn Any;
}

impl dyn DeviceResource {
    /// Hands the resource back to its pool, or just detaches it from its device when it
    /// is not registered.
    pub fn shutdown(&self) -> RhiResult {
        match self.resource_base().pool() {
            Some(pool) => pool.resource_pool().shutdown_resource(pool.as_ref(), self),
            None => {
                self.device_slot().unbind();
                Ok(())
            }
        }
    }

    pub fn downcast_ref<T: DeviceResource>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}
