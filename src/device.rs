//! Device base: the binding between one OS descriptor and an engine.
//!
//! Every transport embeds a [`DeviceCore`] and implements the [`Device`]
//! trait on top of it. The core owns the optional descriptor, the weak
//! back-pointer to the engine the device is registered with, and the last
//! recorded error. The trait carries the six readiness entry points the
//! engine dispatches into; each has a default body that only logs, so a
//! transport overrides exactly the signals it cares about.

use crate::engine::{self, EngineState};
use crate::error::{DeviceError, ErrorCode};
use crate::sys;

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// A shared cell holding the weak engine back-pointer of one device.
///
/// The cell is an `Rc` so collaborators that must observe the device's
/// engine binding as it changes (the UDP server's synthetic peers) can hold
/// a clone instead of re-borrowing the device itself.
#[derive(Clone)]
pub(crate) struct EngineRef(Rc<RefCell<Weak<RefCell<EngineState>>>>);

impl EngineRef {
    fn unattached() -> Self {
        Self(Rc::new(RefCell::new(Weak::new())))
    }

    pub(crate) fn set(&self, engine: Weak<RefCell<EngineState>>) {
        *self.0.borrow_mut() = engine;
    }

    pub(crate) fn clear(&self) {
        *self.0.borrow_mut() = Weak::new();
    }

    /// Upgrades the back-pointer, `None` when the device is unattached or
    /// the engine is gone.
    pub(crate) fn get(&self) -> Option<Rc<RefCell<EngineState>>> {
        self.0.borrow().upgrade()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.0.borrow().strong_count() > 0
    }
}

/// Per-device state shared by every transport.
///
/// Invariants:
/// - the handle is `Some` exactly while the device owns an open descriptor,
/// - while the engine pointer is set, that engine's registry lists this
///   device under its id, and under its descriptor when one is present.
///
/// Dropping a core deregisters the device from its engine and closes the
/// descriptor.
pub struct DeviceCore {
    id: u64,
    handle: Option<RawFd>,
    engine: EngineRef,
    last_error: DeviceError,
}

impl Default for DeviceCore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCore {
    pub fn new() -> Self {
        Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            handle: None,
            engine: EngineRef::unattached(),
            last_error: DeviceError::default(),
        }
    }

    /// The descriptor currently owned by this device, if any.
    pub fn handle(&self) -> Option<RawFd> {
        self.handle
    }

    /// Whether the device is currently registered with a live engine.
    pub fn is_attached(&self) -> bool {
        self.engine.is_attached()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn engine_ref(&self) -> &EngineRef {
        &self.engine
    }

    /// Adopts a freshly opened descriptor.
    ///
    /// If the device is registered, the engine entry for the previous
    /// descriptor (when there was one) is rekeyed to the new descriptor in
    /// place, preserving its position and interest; otherwise a new entry
    /// with readable interest is appended.
    pub fn register_new_handle(&mut self, handle: Option<RawFd>) {
        log::debug!("registering new handle {handle:?} (replacing {:?})", self.handle);

        if let Some(state) = self.engine.get() {
            let _ = state
                .borrow_mut()
                .register_new_handle(self.handle, handle, self.id);
        }

        self.handle = handle;
    }

    /// Asks the engine to wake this device for readable readiness only.
    pub fn request_read(&self) {
        if let Some(state) = self.engine.get() {
            state.borrow_mut().request_read(self.handle);
        }
    }

    /// Asks the engine to wake this device for writable readiness only.
    pub fn request_write(&self) {
        if let Some(state) = self.engine.get() {
            state.borrow_mut().request_write(self.handle);
        }
    }

    /// Closes the descriptor, removes its engine entry and clears it.
    ///
    /// The device itself stays registered (without a descriptor) and may
    /// adopt a new handle later.
    pub fn destroy_handle(&mut self) {
        self.close_handle();

        if let Some(state) = self.engine.get() {
            let _ = state.borrow_mut().deregister_handle(self.handle);
        }

        self.handle = None;
    }

    /// Closes the descriptor without touching registration state.
    pub fn close_handle(&mut self) {
        if let Some(fd) = self.handle {
            sys::sys_close(fd);
        }
    }

    /// Registers another device on the engine this device is attached to.
    ///
    /// Does nothing when unattached.
    pub fn register_child<D: Device + 'static>(&self, child: &Rc<RefCell<D>>) {
        if let Some(state) = self.engine.get() {
            let _ = engine::register_device(&state, child);
        }
    }

    /// Records a failure so `last_error()` can surface it.
    pub fn set_error(&mut self, code: impl Into<ErrorCode>, description: impl Into<String>) {
        let error = DeviceError { code: code.into(), description: description.into() };
        log::debug!("recorded error: {error}");
        self.last_error = error;
    }

    /// The most recently recorded failure.
    pub fn last_error(&self) -> &DeviceError {
        &self.last_error
    }

    /// Logs the recorded failure at error level under the given context.
    pub fn log_last_error(&self, context: &str) {
        log::error!("{context}: {}", self.last_error);
    }
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        if let Some(state) = self.engine.get() {
            let mut state = state.borrow_mut();
            let _ = state.deregister_handle(self.handle);
            state.remove_device(self.id);
        }
        self.engine.clear();

        if let Some(fd) = self.handle.take() {
            sys::sys_close(fd);
        }
    }
}

/// Readiness entry points dispatched by the engine, plus access to the
/// embedded [`DeviceCore`].
///
/// The default bodies log the signal and do nothing else.
pub trait Device {
    fn core(&self) -> &DeviceCore;
    fn core_mut(&mut self) -> &mut DeviceCore;

    /// The descriptor has readable data pending.
    fn ready_read(&mut self) {
        log::debug!("readable readiness ignored: no handler implemented");
    }

    /// The descriptor accepts a write.
    fn ready_write(&mut self) {
        log::debug!("writable readiness ignored: no handler implemented");
    }

    /// The descriptor is in an error state.
    fn ready_error(&mut self) {
        log::error!("error readiness ignored: no handler implemented");
    }

    /// The peer hung up.
    fn ready_hangup(&mut self) {
        log::warn!("hangup readiness ignored: no handler implemented");
    }

    /// The descriptor was invalid at poll time.
    fn ready_invalid(&mut self) {
        log::warn!("invalid-request readiness ignored: no handler implemented");
    }

    /// The peer closed its end of a stream.
    fn ready_peer_disconnect(&mut self) {
        log::warn!("peer-disconnect readiness ignored: no handler implemented");
    }
}
