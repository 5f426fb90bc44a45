//! Byte-stream I/O on top of readiness: non-blocking reads plus a queued,
//! write-readiness-driven send path.
//!
//! The write state machine is shared by every transport: `async_send`
//! enqueues a payload and requests writable interest; each writable tick
//! drains exactly one queued item (so several devices on one engine make
//! even progress) and re-arms; an empty queue reverts the device to
//! readable interest.

pub mod serial;

use crate::device::Device;
use crate::error::{DeviceError, DeviceErrorKind, Status};
use crate::sys;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Size of the per-thread scratch block used by the stream read drain.
const READ_BLOCK_LEN: usize = 2048;

thread_local! {
    /// Scratch block reused by every stream read on this thread.
    static READ_SCRATCH: RefCell<[u8; READ_BLOCK_LEN]> = const { RefCell::new([0; READ_BLOCK_LEN]) };
}

/// A raw byte payload.
pub type IoData = Vec<u8>;

/// An outgoing payload in one of three ownership modes.
///
/// Callers differ in whether they hand the bytes off, keep a shared copy
/// for other subsystems, or pass a uniquely owned buffer; all three coexist
/// in one outgoing queue.
#[derive(Debug, Clone)]
pub enum IoPayload {
    /// Bytes owned by the queue itself.
    Owned(IoData),
    /// Bytes shared with the caller.
    Shared(Rc<IoData>),
    /// A uniquely owned, boxed buffer handed off by the caller.
    Unique(Box<IoData>),
}

impl IoPayload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            IoPayload::Owned(data) => data,
            IoPayload::Shared(data) => data,
            IoPayload::Unique(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl From<IoData> for IoPayload {
    fn from(data: IoData) -> Self {
        IoPayload::Owned(data)
    }
}

impl From<&[u8]> for IoPayload {
    fn from(data: &[u8]) -> Self {
        IoPayload::Owned(data.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for IoPayload {
    fn from(data: &[u8; N]) -> Self {
        IoPayload::Owned(data.to_vec())
    }
}

impl From<Rc<IoData>> for IoPayload {
    fn from(data: Rc<IoData>) -> Self {
        IoPayload::Shared(data)
    }
}

impl From<Box<IoData>> for IoPayload {
    fn from(data: Box<IoData>) -> Self {
        IoPayload::Unique(data)
    }
}

/// Result of a synchronous receive: the tri-valued status plus the bytes
/// when the receive succeeded.
#[derive(Debug)]
pub struct ReceivedData {
    pub status: Status,
    pub data: Option<IoData>,
}

impl ReceivedData {
    pub(crate) fn failed() -> Self {
        Self { status: Status::Nok, data: None }
    }

    fn received(data: IoData) -> Self {
        Self { status: Status::Ok, data: Some(data) }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

type DataCallback = Box<dyn FnMut(&[u8])>;

/// Queue and callback state embedded in every I/O-capable transport.
#[derive(Default)]
pub struct IoCore {
    outgoing: VecDeque<IoPayload>,
    callback: Option<DataCallback>,
}

impl IoCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads still waiting to be drained.
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }

    pub(crate) fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }

    /// Dequeues the payload at the front of the outgoing queue.
    pub(crate) fn pop_outgoing(&mut self) -> Option<IoPayload> {
        self.outgoing.pop_front()
    }

    pub(crate) fn notify(&mut self, data: &[u8]) {
        if let Some(callback) = self.callback.as_mut() {
            callback(data);
        }
    }
}

/// Non-blocking byte-stream I/O over a [`Device`].
///
/// Transports implement the two accessors; everything else is provided.
pub trait IoDevice: Device {
    fn io(&self) -> &IoCore;
    fn io_mut(&mut self) -> &mut IoCore;

    /// Whether the device can perform data operations right now.
    fn device_is_ready(&self) -> bool {
        self.core().handle().is_some()
    }

    /// Installs the callback invoked with every drained read.
    fn set_data_callback(&mut self, callback: impl FnMut(&[u8]) + 'static) {
        log::debug!("data callback updated");
        self.io_mut().set_callback(Box::new(callback));
    }

    /// Adopts a freshly opened descriptor and switches it to non-blocking
    /// mode. A flag query or update failure is logged but does not undo the
    /// handle assignment.
    fn register_io_handle(&mut self, handle: Option<RawFd>) {
        self.core_mut().register_new_handle(handle);

        let Some(fd) = handle else {
            return;
        };

        if let Err(error) = sys::sys_set_nonblocking(fd) {
            log::error!("unable to set descriptor {fd} non-blocking: {error}");
        }
    }

    /// Queues a payload for the readiness-driven drain.
    ///
    /// The device must be registered with an engine and ready; otherwise the
    /// payload is dropped and `InvalidLogic` recorded.
    fn async_send(&mut self, data: impl Into<IoPayload>) -> Status {
        if !self.core().is_attached() {
            self.core_mut().set_error(
                DeviceErrorKind::InvalidLogic,
                "asynchronous sends require the device to be registered with an engine; \
                 the message will be dropped",
            );
            return Status::Nok;
        }

        if !self.device_is_ready() {
            self.core_mut().set_error(
                DeviceErrorKind::InvalidLogic,
                "the device is not ready; the message will be dropped",
            );
            return Status::Nok;
        }

        self.io_mut().outgoing.push_back(data.into());
        self.core().request_write();

        Status::Ok
    }

    /// Writes a payload immediately, waiting for writable readiness first.
    fn sync_send(&mut self, data: &IoPayload) -> Status {
        if !self.device_is_ready() {
            self.core_mut()
                .set_error(DeviceErrorKind::InvalidLogic, "the device is not ready");
            return Status::Nok;
        }

        self.perform_sync_send(data.as_slice())
    }

    /// The blocking write behind both `sync_send` and the queue drain.
    ///
    /// Polls the descriptor for writable readiness without a timeout; error,
    /// hangup and peer-disconnect conditions reported by the poll are routed
    /// through the matching readiness callback before failing.
    fn perform_sync_send(&mut self, data: &[u8]) -> Status {
        let Some(fd) = self.core().handle() else {
            self.core_mut().set_error(
                DeviceErrorKind::DeviceNotReady,
                "the device has not been configured yet; unable to send",
            );
            return Status::Nok;
        };

        let revents = match sys::sys_poll_one(fd, libc::POLLOUT, -1) {
            Ok(Some(revents)) => revents,
            Ok(None) => {
                self.core_mut().set_error(
                    DeviceErrorKind::PollError,
                    "an indefinite wait for writable readiness reported no descriptor",
                );
                return Status::Nok;
            }
            Err(_) => {
                let error = DeviceError::last_os("the descriptor cannot be polled for writable");
                self.core_mut().set_error(error.code, error.description);
                return Status::Nok;
            }
        };

        if revents & libc::POLLERR != 0 {
            self.ready_error();
            self.core_mut()
                .set_error(DeviceErrorKind::PollError, "poll reported an error condition");
            return Status::Nok;
        }

        if revents & libc::POLLHUP != 0 {
            self.ready_hangup();
            self.core_mut()
                .set_error(DeviceErrorKind::PollError, "the peer hung up");
            return Status::Nok;
        }

        if revents & libc::POLLRDHUP != 0 {
            self.ready_peer_disconnect();
            self.core_mut()
                .set_error(DeviceErrorKind::PollError, "the peer disconnected");
            return Status::Nok;
        }

        let written = sys::sys_write(fd, data);
        if written < 0 {
            let error = DeviceError::last_os("unable to write to the descriptor");
            self.core_mut().set_error(error.code, error.description);
            return Status::Nok;
        }

        if (written as usize) < data.len() {
            self.core_mut().set_error(
                DeviceErrorKind::GeneralError,
                format!("short write: {written} of {} bytes", data.len()),
            );
            return Status::Nok;
        }

        self.core().request_read();

        Status::Ok
    }

    /// Waits for readable readiness and drains whatever is buffered.
    ///
    /// With a timeout the wait is re-entered on early wake-ups until the
    /// budget is spent, then `Timeout` is recorded; without one it blocks
    /// indefinitely.
    fn sync_receive(&mut self, timeout: Option<Duration>) -> ReceivedData {
        let Some(fd) = self.core().handle() else {
            self.core_mut().set_error(
                DeviceErrorKind::DeviceNotReady,
                "the device has not been configured yet; unable to receive",
            );
            return ReceivedData::failed();
        };

        let Some(timeout) = timeout else {
            return match sys::sys_poll_one(fd, libc::POLLIN, -1) {
                Ok(Some(_)) => self.drain_into_received(),
                _ => {
                    self.core_mut().set_error(
                        DeviceErrorKind::PollError,
                        "an indefinite wait for readable readiness failed",
                    );
                    ReceivedData::failed()
                }
            };
        };

        let start = Instant::now();

        while let Some(remaining) = timeout.checked_sub(start.elapsed()) {
            let remaining_ms = remaining.as_millis().min(i32::MAX as u128) as i32;

            match sys::sys_poll_one(fd, libc::POLLIN, remaining_ms) {
                Ok(Some(_)) => return self.drain_into_received(),
                Ok(None) => continue,
                Err(_) => {
                    self.core_mut()
                        .set_error(DeviceErrorKind::PollError, "poll returned an error");
                    return ReceivedData::failed();
                }
            }
        }

        self.core_mut()
            .set_error(DeviceErrorKind::Timeout, "synchronous receive reached its timeout");
        ReceivedData::failed()
    }

    /// Drains the descriptor into `out`, stopping when the read would
    /// block or the stream ends.
    ///
    /// A would-block condition is the natural end of the drain; any other
    /// failure surfaces with its OS code.
    fn read_io_data(&self, out: &mut IoData) -> Result<(), DeviceError> {
        let Some(fd) = self.core().handle() else {
            return Err(DeviceError::internal(
                DeviceErrorKind::DeviceNotReady,
                "the device has not been configured yet; unable to read",
            ));
        };

        READ_SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();

            loop {
                let count = sys::sys_read(fd, &mut scratch[..]);

                if count > 0 {
                    out.extend_from_slice(&scratch[..count as usize]);
                    continue;
                }

                if count == 0 {
                    return Ok(());
                }

                let error = DeviceError::last_os("read error");
                if error.is_would_block() {
                    return Ok(());
                }

                return Err(error);
            }
        })
    }

    /// Default readable behavior: drain the stream and hand the bytes to
    /// the data callback.
    fn io_ready_read(&mut self) {
        let mut data = IoData::new();

        if let Err(error) = self.read_io_data(&mut data) {
            log::error!("error reading descriptor: {error}");
            return;
        }

        self.io_mut().notify(&data);
    }

    /// Default writable behavior: drain one queued payload, then re-arm.
    ///
    /// An empty queue reverts the device to readable interest. The front
    /// item is dequeued whether or not its write succeeds.
    fn drain_outgoing(&mut self) {
        if self.io().outgoing.is_empty() {
            self.core().request_read();
            return;
        }

        if self.core().handle().is_none() {
            log::error!("writable readiness with no configured descriptor");
            return;
        }

        let Some(item) = self.io_mut().outgoing.pop_front() else {
            return;
        };

        if self.perform_sync_send(item.as_slice()).is_nok() {
            log::error!(
                "unable to write queued payload: {}",
                self.core().last_error()
            );
        }

        self.core().request_write();
    }

    #[doc(hidden)]
    fn drain_into_received(&mut self) -> ReceivedData {
        let mut data = IoData::new();

        match self.read_io_data(&mut data) {
            Ok(()) => ReceivedData::received(data),
            Err(error) => {
                self.core_mut().set_error(error.code, error.description);
                ReceivedData::failed()
            }
        }
    }
}
