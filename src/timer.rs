//! Interval timers backed by a monotonic timer descriptor.

use crate::device::{Device, DeviceCore};
use crate::error::{DeviceError, DeviceErrorKind, Status};
use crate::sys;

use std::time::Duration;

type TimerCallback = Box<dyn FnMut()>;

/// A repeating interval timer.
///
/// Starting a timer arms both its initial expiry and its repeat interval to
/// the same duration, so a registered timer fires its callback once per
/// period on every engine tick that observes it.
pub struct Timer {
    core: DeviceCore,
    duration: Option<Duration>,
    running: bool,
    callback: Option<TimerCallback>,
}

impl Timer {
    /// Creates the timer descriptor, disarmed.
    pub fn new() -> Result<Self, DeviceError> {
        let fd = sys::sys_timerfd_create().map_err(|error| {
            DeviceError::os(
                error.raw_os_error().unwrap_or(0),
                "unable to create a timer descriptor",
            )
        })?;

        let mut timer = Self {
            core: DeviceCore::new(),
            duration: None,
            running: false,
            callback: None,
        };

        timer.core.register_new_handle(Some(fd));

        Ok(timer)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Installs the callback invoked on every expiry.
    pub fn set_callback(&mut self, callback: impl FnMut() + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Arms the timer to fire repeatedly every `duration`.
    pub fn start(&mut self, duration: Duration) -> Status {
        if self.running {
            let _ = self.stop();
        }

        let Some(fd) = self.core.handle() else {
            self.core
                .set_error(DeviceErrorKind::DeviceNotReady, "the timer holds no descriptor");
            return Status::Nok;
        };

        if let Err(error) = sys::sys_timerfd_arm(fd, duration, duration) {
            self.core.set_error(
                error.raw_os_error().unwrap_or(0),
                "unable to start the timer",
            );
            return Status::Nok;
        }

        self.duration = Some(duration);
        self.running = true;

        Status::Ok
    }

    /// Disarms the timer. Stopping an already stopped timer is a no-op.
    pub fn stop(&mut self) -> Status {
        if !self.running {
            return Status::Passable;
        }

        self.running = false;

        let Some(fd) = self.core.handle() else {
            self.core
                .set_error(DeviceErrorKind::DeviceNotReady, "the timer holds no descriptor");
            return Status::Nok;
        };

        if let Err(error) = sys::sys_timerfd_arm(fd, Duration::ZERO, Duration::ZERO) {
            self.core.set_error(
                error.raw_os_error().unwrap_or(0),
                "unable to stop the timer",
            );
            return Status::Nok;
        }

        Status::Ok
    }

    /// Re-arms the timer with its previously started duration.
    pub fn resume(&mut self) -> Status {
        let Some(duration) = self.duration else {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the timer cannot be resumed, it has never been started",
            );
            return Status::Nok;
        };

        self.start(duration)
    }

    /// The most recently recorded failure.
    pub fn last_error(&self) -> &DeviceError {
        self.core.last_error()
    }
}

impl Device for Timer {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn ready_read(&mut self) {
        let Some(fd) = self.core.handle() else {
            return;
        };

        // The expiry count must be drained or the descriptor stays
        // readable and the engine spins.
        let mut expiries = [0u8; 8];
        let _ = sys::sys_read(fd, &mut expiries);

        if let Some(callback) = self.callback.as_mut() {
            callback();
        }
    }

    fn ready_error(&mut self) {
        log::error!("the timer descriptor reported an unknown error");
    }
}
