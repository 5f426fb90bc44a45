//! The readiness engine: registration tables and the dispatch loop.
//!
//! An engine owns three tables that must stay consistent:
//!
//! - an ordered poll-list of `pollfd` entries, one per registered
//!   descriptor,
//! - a map from descriptor to the device that owns it,
//! - a flat list of registered devices, including those that currently have
//!   no descriptor.
//!
//! One [`Engine::run_once`] call performs a single readiness wait and
//! dispatches every reported event. Within a tick, callbacks fire readable
//! first, then writable, error, hangup, invalid and peer-disconnect; within
//! one class, descriptors fire in poll-list order. A callback may mutate the
//! tables (including removing the descriptor currently firing), so dispatch
//! re-resolves every descriptor immediately before invoking it.
//!
//! All engine operations return a [`Status`] rather than failing; `Nok`
//! outcomes record an [`EngineError`] retrievable via
//! [`Engine::last_error`].

use crate::device::Device;
use crate::error::{EngineError, EngineErrorKind, Status};
use crate::sys;

use libc::pollfd;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// How long each iteration of [`Engine::run_forever`] waits at most.
const FOREVER_SLICE_MS: i32 = 100;

/// A registered device: its stable id plus a non-owning handle to it.
#[derive(Clone)]
pub(crate) struct DeviceRef {
    id: u64,
    device: Weak<RefCell<dyn Device>>,
}

/// The engine's registration tables.
///
/// Invariants: the poll-list and the descriptor map always cover the same
/// descriptor set, no descriptor appears twice, and the device list is a
/// superset of the mapped devices (a device may be registered while it has
/// no descriptor).
pub(crate) struct EngineState {
    poll_list: Vec<pollfd>,
    fd_map: HashMap<RawFd, DeviceRef>,
    devices: Vec<DeviceRef>,
    last_error: EngineError,
}

impl EngineState {
    fn new() -> Self {
        Self {
            poll_list: Vec::new(),
            fd_map: HashMap::new(),
            devices: Vec::new(),
            last_error: EngineError::default(),
        }
    }

    fn find_poll_entry(&self, fd: RawFd) -> Option<usize> {
        self.poll_list.iter().position(|entry| entry.fd == fd)
    }

    fn set_error(&mut self, code: EngineErrorKind, description: impl Into<String>) {
        let error = EngineError::new(code, description);
        log::debug!("recorded error: {error}");
        self.last_error = error;
    }

    /// Adds or rekeys the poll entry for a device that adopted a new
    /// descriptor.
    ///
    /// When the device had no tracked descriptor a fresh entry with
    /// readable interest is appended; otherwise the existing entry is
    /// updated in place, preserving its position and interest mask.
    pub(crate) fn register_new_handle(
        &mut self,
        old_handle: Option<RawFd>,
        new_handle: Option<RawFd>,
        device_id: u64,
    ) -> Status {
        log::debug!("registering handle {new_handle:?} for device {device_id}");

        let Some(new_fd) = new_handle else {
            return Status::Passable;
        };

        let Some(device) = self.devices.iter().find(|entry| entry.id == device_id).cloned()
        else {
            return Status::Passable;
        };

        match old_handle.and_then(|fd| self.find_poll_entry(fd)) {
            None => {
                self.poll_list.push(pollfd {
                    fd: new_fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
                self.fd_map.insert(new_fd, device);
            }
            Some(position) => {
                if let Some(old_fd) = old_handle {
                    self.fd_map.remove(&old_fd);
                }
                self.fd_map.insert(new_fd, device);
                self.poll_list[position].fd = new_fd;
            }
        }

        Status::Ok
    }

    /// Removes the poll entry and map key for a descriptor.
    pub(crate) fn deregister_handle(&mut self, handle: Option<RawFd>) -> Status {
        log::debug!("deregistering handle {handle:?}");

        let Some(fd) = handle else {
            return Status::Passable;
        };

        let Some(position) = self.find_poll_entry(fd) else {
            self.set_error(
                EngineErrorKind::DeviceDoesNotExist,
                "the handle being deregistered is not in the registered list",
            );
            return Status::Nok;
        };

        self.poll_list.remove(position);
        self.fd_map.remove(&fd);

        Status::Ok
    }

    /// Narrows a descriptor's interest to readable readiness.
    pub(crate) fn request_read(&mut self, handle: Option<RawFd>) {
        let Some(position) = handle.and_then(|fd| self.find_poll_entry(fd)) else {
            return;
        };

        self.poll_list[position].events = libc::POLLIN;
    }

    /// Narrows a descriptor's interest to writable readiness.
    pub(crate) fn request_write(&mut self, handle: Option<RawFd>) {
        let Some(position) = handle.and_then(|fd| self.find_poll_entry(fd)) else {
            return;
        };

        self.poll_list[position].events = libc::POLLOUT;
    }

    pub(crate) fn remove_device(&mut self, device_id: u64) {
        self.devices.retain(|entry| entry.id != device_id);
    }
}

/// Registers a device with an engine's tables.
///
/// Registering an already registered device records
/// `DeviceAlreadyRegistered` and returns `Passable` without duplicating any
/// entry. A device registered with another engine is deregistered from it
/// first.
pub(crate) fn register_device<D: Device + 'static>(
    state: &Rc<RefCell<EngineState>>,
    device: &Rc<RefCell<D>>,
) -> Status {
    let device: Rc<RefCell<dyn Device>> = device.clone();
    register_dyn(state, &device)
}

fn register_dyn(state: &Rc<RefCell<EngineState>>, device: &Rc<RefCell<dyn Device>>) -> Status {
    log::debug!("registering device");

    let (id, handle, previous_engine) = {
        let device = device.borrow();
        let core = device.core();
        (core.id(), core.handle(), core.engine_ref().get())
    };

    if state.borrow().devices.iter().any(|entry| entry.id == id) {
        state.borrow_mut().set_error(
            EngineErrorKind::DeviceAlreadyRegistered,
            "the device is already registered with this engine",
        );
        return Status::Passable;
    }

    if let Some(previous) = previous_engine {
        if !Rc::ptr_eq(&previous, state) {
            let _ = deregister_dyn(&previous, device);
        }
    }

    device.borrow().core().engine_ref().set(Rc::downgrade(state));

    let mut state = state.borrow_mut();
    state.devices.push(DeviceRef { id, device: Rc::downgrade(device) });
    state.register_new_handle(None, handle, id)
}

/// Removes a device from an engine's tables and clears its back-pointer.
pub(crate) fn deregister_device<D: Device + 'static>(
    state: &Rc<RefCell<EngineState>>,
    device: &Rc<RefCell<D>>,
) -> Status {
    let device: Rc<RefCell<dyn Device>> = device.clone();
    deregister_dyn(state, &device)
}

fn deregister_dyn(state: &Rc<RefCell<EngineState>>, device: &Rc<RefCell<dyn Device>>) -> Status {
    log::debug!("deregistering device");

    let (id, handle) = {
        let device = device.borrow();
        let core = device.core();
        core.engine_ref().clear();
        (core.id(), core.handle())
    };

    let mut state = state.borrow_mut();
    let _ = state.deregister_handle(handle);
    state.remove_device(id);

    Status::Ok
}

/// The single-threaded readiness dispatcher.
///
/// An engine is driven by exactly one thread. Devices register with it,
/// after which one of the `run_*` methods waits for readiness and invokes
/// the matching [`Device`] entry points. Dropping the engine deregisters
/// every remaining device.
pub struct Engine {
    state: Rc<RefCell<EngineState>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self { state: Rc::new(RefCell::new(EngineState::new())) }
    }

    /// Registers a device, adding its descriptor (when present) to the poll
    /// set with readable interest.
    pub fn register<D: Device + 'static>(&self, device: &Rc<RefCell<D>>) -> Status {
        register_device(&self.state, device)
    }

    /// Deregisters a device, removing its descriptor from the poll set and
    /// clearing its engine back-pointer.
    pub fn deregister<D: Device + 'static>(&self, device: &Rc<RefCell<D>>) -> Status {
        deregister_device(&self.state, device)
    }

    /// The most recently recorded failure.
    pub fn last_error(&self) -> EngineError {
        self.state.borrow().last_error.clone()
    }

    /// Performs one readiness wait, bounded by `timeout` (indefinite when
    /// `None`), and dispatches everything it reported.
    ///
    /// Returns whether any event fired.
    pub fn run_once(&self, timeout: Option<Duration>) -> bool {
        let timeout_ms = match timeout {
            None => -1,
            Some(duration) => clamp_to_poll_ms(duration),
        };

        self.tick(timeout_ms)
    }

    /// Ticks until the given wall-clock duration has elapsed.
    ///
    /// The remaining budget is recomputed after every tick, so early
    /// wake-ups do not shorten the overall wait.
    pub fn run_for(&self, duration: Duration) {
        let start = Instant::now();

        while let Some(remaining) = duration.checked_sub(start.elapsed()) {
            if remaining.is_zero() {
                break;
            }

            self.tick(clamp_to_poll_ms(remaining));
        }
    }

    /// Ticks forever with a modest wait per iteration.
    pub fn run_forever(&self) -> ! {
        loop {
            self.tick(FOREVER_SLICE_MS);
        }
    }

    fn device_for(&self, fd: RawFd) -> Option<Rc<RefCell<dyn Device>>> {
        self.state
            .borrow()
            .fd_map
            .get(&fd)
            .and_then(|entry| entry.device.upgrade())
    }

    /// One readiness wait plus one round of dispatch.
    fn tick(&self, timeout_ms: i32) -> bool {
        let mut ready_read: Vec<RawFd> = Vec::new();
        let mut ready_write: Vec<RawFd> = Vec::new();
        let mut errored: Vec<RawFd> = Vec::new();
        let mut hangup: Vec<RawFd> = Vec::new();
        let mut invalid: Vec<RawFd> = Vec::new();
        let mut peer_disconnect: Vec<RawFd> = Vec::new();

        {
            let mut state = self.state.borrow_mut();

            let fired = match sys::sys_poll(&mut state.poll_list, timeout_ms) {
                Ok(0) => return false,
                Ok(count) => count,
                Err(error) => {
                    log::warn!("readiness wait failed: {error}");
                    return false;
                }
            };

            let mut classified = 0;
            for entry in &state.poll_list {
                let revents = entry.revents;

                if revents == libc::POLLIN {
                    ready_read.push(entry.fd);
                    classified += 1;
                } else if revents == libc::POLLOUT {
                    ready_write.push(entry.fd);
                    classified += 1;
                } else if revents & libc::POLLERR != 0 {
                    errored.push(entry.fd);
                    classified += 1;
                } else if revents & libc::POLLHUP != 0 {
                    hangup.push(entry.fd);
                    classified += 1;
                } else if revents & libc::POLLNVAL != 0 {
                    invalid.push(entry.fd);
                    classified += 1;
                } else if revents & libc::POLLRDHUP != 0 {
                    peer_disconnect.push(entry.fd);
                    classified += 1;
                }

                if classified >= fired {
                    break;
                }
            }
        }

        let order: [(&[RawFd], fn(&mut dyn Device)); 6] = [
            (&ready_read, |device: &mut dyn Device| device.ready_read()),
            (&ready_write, |device: &mut dyn Device| device.ready_write()),
            (&errored, |device: &mut dyn Device| device.ready_error()),
            (&hangup, |device: &mut dyn Device| device.ready_hangup()),
            (&invalid, |device: &mut dyn Device| device.ready_invalid()),
            (&peer_disconnect, |device: &mut dyn Device| device.ready_peer_disconnect()),
        ];

        for (descriptors, dispatch) in order {
            for &fd in descriptors {
                // A previous callback may have removed or replaced this
                // descriptor.
                let Some(device) = self.device_for(fd) else {
                    continue;
                };

                match device.try_borrow_mut() {
                    Ok(mut device) => dispatch(&mut *device),
                    Err(_) => log::debug!("fd {fd} is mid-dispatch, skipping"),
                };
            }
        }

        true
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let devices: Vec<DeviceRef> = {
            let mut state = self.state.borrow_mut();
            state.poll_list.clear();
            state.fd_map.clear();
            state.devices.drain(..).collect()
        };

        for entry in devices {
            if let Some(device) = entry.device.upgrade() {
                device.borrow().core().engine_ref().clear();
            }
        }
    }
}

fn clamp_to_poll_ms(duration: Duration) -> i32 {
    let ms = duration.as_millis();

    if ms > i32::MAX as u128 {
        log::warn!("timeout exceeds the platform maximum of {} ms, clamping", i32::MAX);
        return i32::MAX;
    }

    ms as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCore;

    struct Probe {
        core: DeviceCore,
    }

    impl Probe {
        fn new() -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self { core: DeviceCore::new() }))
        }
    }

    impl Device for Probe {
        fn core(&self) -> &DeviceCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut DeviceCore {
            &mut self.core
        }
    }

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "Failed to create pipe");
        (fds[0], fds[1])
    }

    #[test]
    fn register_then_deregister_restores_tables() {
        let engine = Engine::new();
        let probe = Probe::new();
        let (read_end, write_end) = pipe_pair();
        probe.borrow_mut().core_mut().register_new_handle(Some(read_end));

        assert!(engine.register(&probe).is_ok());
        {
            let state = engine.state.borrow();
            assert_eq!(state.poll_list.len(), 1);
            assert_eq!(state.fd_map.len(), 1);
            assert_eq!(state.devices.len(), 1);
        }
        assert!(probe.borrow().core().is_attached());

        assert!(engine.deregister(&probe).is_ok());
        {
            let state = engine.state.borrow();
            assert!(state.poll_list.is_empty());
            assert!(state.fd_map.is_empty());
            assert!(state.devices.is_empty());
        }
        assert!(!probe.borrow().core().is_attached());

        sys::sys_close(write_end);
    }

    #[test]
    fn double_register_is_passable_and_does_not_duplicate() {
        let engine = Engine::new();
        let probe = Probe::new();
        let (read_end, write_end) = pipe_pair();
        probe.borrow_mut().core_mut().register_new_handle(Some(read_end));

        assert!(engine.register(&probe).is_ok());
        assert_eq!(engine.register(&probe), Status::Passable);
        assert_eq!(engine.last_error().code, EngineErrorKind::DeviceAlreadyRegistered);

        let state = engine.state.borrow();
        assert_eq!(state.poll_list.len(), 1);
        assert_eq!(state.devices.len(), 1);

        drop(state);
        sys::sys_close(write_end);
    }

    #[test]
    fn register_without_handle_lists_the_device_only() {
        let engine = Engine::new();
        let probe = Probe::new();

        assert!(engine.register(&probe).is_ok());

        let state = engine.state.borrow();
        assert!(state.poll_list.is_empty());
        assert!(state.fd_map.is_empty());
        assert_eq!(state.devices.len(), 1);
    }

    #[test]
    fn handle_replacement_preserves_position_and_interest() {
        let engine = Engine::new();
        let probe = Probe::new();
        let (first_read, first_write) = pipe_pair();
        let (second_read, second_write) = pipe_pair();
        probe.borrow_mut().core_mut().register_new_handle(Some(first_read));

        assert!(engine.register(&probe).is_ok());
        probe.borrow().core().request_write();
        assert_eq!(engine.state.borrow().poll_list[0].events, libc::POLLOUT);

        probe.borrow_mut().core_mut().register_new_handle(Some(second_read));
        {
            let state = engine.state.borrow();
            assert_eq!(state.poll_list.len(), 1);
            assert_eq!(state.poll_list[0].fd, second_read);
            assert_eq!(state.poll_list[0].events, libc::POLLOUT);
            assert!(state.fd_map.contains_key(&second_read));
            assert!(!state.fd_map.contains_key(&first_read));
        }

        sys::sys_close(first_read);
        sys::sys_close(first_write);
        sys::sys_close(second_write);
    }

    #[test]
    fn fresh_handle_starts_with_readable_interest() {
        let engine = Engine::new();
        let probe = Probe::new();
        let (read_end, write_end) = pipe_pair();

        assert!(engine.register(&probe).is_ok());
        probe.borrow_mut().core_mut().register_new_handle(Some(read_end));

        assert_eq!(engine.state.borrow().poll_list[0].events, libc::POLLIN);

        sys::sys_close(write_end);
    }

    #[test]
    fn read_interest_replaces_write_interest() {
        let engine = Engine::new();
        let probe = Probe::new();
        let (read_end, write_end) = pipe_pair();
        probe.borrow_mut().core_mut().register_new_handle(Some(read_end));

        assert!(engine.register(&probe).is_ok());
        probe.borrow().core().request_write();
        probe.borrow().core().request_read();

        assert_eq!(engine.state.borrow().poll_list[0].events, libc::POLLIN);

        sys::sys_close(write_end);
    }

    #[test]
    fn destroy_handle_clears_engine_entries() {
        let engine = Engine::new();
        let probe = Probe::new();
        let (read_end, write_end) = pipe_pair();
        probe.borrow_mut().core_mut().register_new_handle(Some(read_end));

        assert!(engine.register(&probe).is_ok());
        probe.borrow_mut().core_mut().destroy_handle();

        {
            let state = engine.state.borrow();
            assert!(state.poll_list.is_empty());
            assert!(state.fd_map.is_empty());
            assert_eq!(state.devices.len(), 1);
        }
        assert_eq!(probe.borrow().core().handle(), None);

        sys::sys_close(write_end);
    }

    #[test]
    fn dropping_a_device_deregisters_it() {
        let engine = Engine::new();
        let probe = Probe::new();
        let (read_end, write_end) = pipe_pair();
        probe.borrow_mut().core_mut().register_new_handle(Some(read_end));

        assert!(engine.register(&probe).is_ok());
        drop(probe);

        let state = engine.state.borrow();
        assert!(state.poll_list.is_empty());
        assert!(state.fd_map.is_empty());
        assert!(state.devices.is_empty());

        drop(state);
        sys::sys_close(write_end);
    }

    #[test]
    fn dropping_the_engine_detaches_devices() {
        let probe = Probe::new();
        {
            let engine = Engine::new();
            assert!(engine.register(&probe).is_ok());
            assert!(probe.borrow().core().is_attached());
        }
        assert!(!probe.borrow().core().is_attached());
    }

    #[test]
    fn moving_a_device_between_engines_deregisters_from_the_first() {
        let first = Engine::new();
        let second = Engine::new();
        let probe = Probe::new();
        let (read_end, write_end) = pipe_pair();
        probe.borrow_mut().core_mut().register_new_handle(Some(read_end));

        assert!(first.register(&probe).is_ok());
        assert!(second.register(&probe).is_ok());

        assert!(first.state.borrow().devices.is_empty());
        assert!(first.state.borrow().poll_list.is_empty());
        assert_eq!(second.state.borrow().devices.len(), 1);
        assert_eq!(second.state.borrow().poll_list.len(), 1);

        sys::sys_close(write_end);
    }

    #[test]
    fn deregistering_an_unknown_handle_records_the_failure() {
        let engine = Engine::new();
        let status = engine.state.borrow_mut().deregister_handle(Some(9999));

        assert!(status.is_nok());
        assert_eq!(engine.last_error().code, EngineErrorKind::DeviceDoesNotExist);
    }
}
