//! Serial ports: a character device configured through termios.

use crate::device::{Device, DeviceCore};
use crate::error::{DeviceError, DeviceErrorKind, Status};
use crate::io::{IoCore, IoDevice};
use crate::sys;

use libc::{
    cfsetispeed, cfsetospeed, speed_t, tcgetattr, tcsetattr, termios, BRKINT, CLOCAL, CREAD,
    CRTSCTS, CS5, CS6, CS7, CS8, CSIZE, CSTOPB, ECHO, ECHOE, ECHONL, HUPCL, ICANON, ICRNL, IGNBRK,
    IGNCR, INLCR, ISIG, ISTRIP, IXANY, IXOFF, IXON, ONLCR, OPOST, O_RDWR, PARENB, PARMRK, PARODD,
    TCSANOW,
};
use std::mem;

/// Data bits per transmitted character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CharSize {
    Bits5,
    Bits6,
    Bits7,
    #[default]
    Bits8,
}

/// The termios-shaped configuration applied when opening a port.
///
/// Defaults describe the common case: 9600 baud, 8N1, no flow control, raw
/// input and output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub baud: u32,

    // Control modes
    pub enable_parity: bool,
    pub parity_even: bool,
    pub two_stop_bits: bool,
    pub hw_flow_control: bool,
    pub hangup_on_close: bool,
    pub enable_receiver: bool,
    pub ignore_modem_lines: bool,
    pub char_size: CharSize,

    // Local modes
    pub canonical: bool,
    pub interpret_signals: bool,
    pub echo: bool,
    pub echo_erasure: bool,
    pub echo_newline: bool,

    // Input modes
    pub sw_flow_control: bool,
    pub special_input_handling: bool,

    // Output modes
    pub map_nl_to_crnl: bool,
    pub post_process_output: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            baud: 9600,
            enable_parity: false,
            parity_even: true,
            two_stop_bits: false,
            hw_flow_control: false,
            hangup_on_close: false,
            enable_receiver: true,
            ignore_modem_lines: true,
            char_size: CharSize::Bits8,
            canonical: false,
            interpret_signals: false,
            echo: false,
            echo_erasure: false,
            echo_newline: false,
            sw_flow_control: false,
            special_input_handling: false,
            map_nl_to_crnl: false,
            post_process_output: false,
        }
    }
}

/// Maps a numeric rate to its discrete `B*` constant, `None` when the rate
/// has no such constant.
fn baud_constant(baud: u32) -> Option<speed_t> {
    let speed = match baud {
        0 => libc::B0,
        50 => libc::B50,
        75 => libc::B75,
        110 => libc::B110,
        134 => libc::B134,
        150 => libc::B150,
        200 => libc::B200,
        300 => libc::B300,
        600 => libc::B600,
        1200 => libc::B1200,
        1800 => libc::B1800,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        500_000 => libc::B500000,
        576_000 => libc::B576000,
        921_600 => libc::B921600,
        1_000_000 => libc::B1000000,
        1_152_000 => libc::B1152000,
        1_500_000 => libc::B1500000,
        2_000_000 => libc::B2000000,
        2_500_000 => libc::B2500000,
        3_000_000 => libc::B3000000,
        3_500_000 => libc::B3500000,
        4_000_000 => libc::B4000000,
        _ => return None,
    };

    Some(speed)
}

fn apply_flag(flags: &mut libc::tcflag_t, flag: libc::tcflag_t, enable: bool) {
    if enable {
        *flags |= flag;
    } else {
        *flags &= !flag;
    }
}

/// A serial port device.
///
/// Opening configures the line from a [`Settings`] record and registers the
/// descriptor; received bytes are delivered through the data callback like
/// any other byte stream.
pub struct SerialPort {
    core: DeviceCore,
    io: IoCore,
    connected: bool,
}

impl Default for SerialPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort {
    pub fn new() -> Self {
        Self {
            core: DeviceCore::new(),
            io: IoCore::new(),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Opens a character device and configures it from `settings`.
    ///
    /// The baud rate must be one of the discrete supported values.
    pub fn open(&mut self, path: &str, settings: &Settings) -> Status {
        self.disconnect();

        let Some(baud) = baud_constant(settings.baud) else {
            self.core
                .set_error(DeviceErrorKind::InvalidArgument, "unsupported baud rate");
            return Status::Nok;
        };

        let fd = match sys::sys_open(path, O_RDWR) {
            Ok(fd) => fd,
            Err(error) => {
                self.core.set_error(
                    error.raw_os_error().unwrap_or(0),
                    format!("unable to open the serial port {path}"),
                );
                return Status::Nok;
            }
        };

        let mut tty: termios = unsafe { mem::zeroed() };

        if unsafe { tcgetattr(fd, &mut tty) } != 0 {
            let error = DeviceError::last_os("unable to read the serial settings");
            self.core.set_error(error.code, error.description);
            sys::sys_close(fd);
            return Status::Nok;
        }

        apply_flag(&mut tty.c_cflag, PARENB, settings.enable_parity);
        if settings.enable_parity {
            apply_flag(&mut tty.c_cflag, PARODD, !settings.parity_even);
        }
        apply_flag(&mut tty.c_cflag, CSTOPB, settings.two_stop_bits);
        apply_flag(&mut tty.c_cflag, CRTSCTS, settings.hw_flow_control);
        apply_flag(&mut tty.c_cflag, HUPCL, settings.hangup_on_close);
        apply_flag(&mut tty.c_cflag, CLOCAL, settings.ignore_modem_lines);
        apply_flag(&mut tty.c_cflag, CREAD, settings.enable_receiver);

        tty.c_cflag &= !CSIZE;
        tty.c_cflag |= match settings.char_size {
            CharSize::Bits5 => CS5,
            CharSize::Bits6 => CS6,
            CharSize::Bits7 => CS7,
            CharSize::Bits8 => CS8,
        };

        apply_flag(&mut tty.c_lflag, ICANON, settings.canonical);
        apply_flag(&mut tty.c_lflag, ISIG, settings.interpret_signals);
        apply_flag(&mut tty.c_lflag, ECHO, settings.echo);
        apply_flag(&mut tty.c_lflag, ECHOE, settings.echo_erasure);
        apply_flag(&mut tty.c_lflag, ECHONL, settings.echo_newline);

        apply_flag(&mut tty.c_iflag, IXON | IXOFF | IXANY, settings.sw_flow_control);
        apply_flag(
            &mut tty.c_iflag,
            IGNBRK | BRKINT | PARMRK | ISTRIP | INLCR | IGNCR | ICRNL,
            settings.special_input_handling,
        );

        apply_flag(&mut tty.c_oflag, OPOST, settings.post_process_output);
        apply_flag(&mut tty.c_oflag, ONLCR, settings.map_nl_to_crnl);

        unsafe {
            cfsetispeed(&mut tty, baud);
            cfsetospeed(&mut tty, baud);
        }

        if unsafe { tcsetattr(fd, TCSANOW, &tty) } != 0 {
            let error = DeviceError::last_os("unable to apply the serial settings");
            self.core.set_error(error.code, error.description);
            sys::sys_close(fd);
            return Status::Nok;
        }

        self.register_io_handle(Some(fd));
        self.connected = true;

        Status::Ok
    }

    /// Closes the port and deregisters the descriptor.
    pub fn disconnect(&mut self) {
        self.core.destroy_handle();
        self.connected = false;
    }
}

impl Device for SerialPort {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn ready_read(&mut self) {
        self.io_ready_read();
    }

    fn ready_write(&mut self) {
        self.drain_outgoing();
    }
}

impl IoDevice for SerialPort {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_baud_rates_map_to_constants() {
        assert_eq!(baud_constant(9600), Some(libc::B9600));
        assert_eq!(baud_constant(115_200), Some(libc::B115200));
        assert_eq!(baud_constant(4_000_000), Some(libc::B4000000));
    }

    #[test]
    fn unsupported_baud_rates_are_rejected() {
        assert_eq!(baud_constant(12345), None);

        let mut port = SerialPort::new();
        let status = port.open("/dev/null", &Settings { baud: 12345, ..Settings::default() });

        assert!(status.is_nok());
        assert_eq!(
            port.core().last_error().code,
            crate::error::ErrorCode::Internal(DeviceErrorKind::InvalidArgument)
        );
    }
}
