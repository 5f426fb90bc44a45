//! Serial port behavior, exercised over a pseudo-terminal pair.

use crossbar::io::serial::{SerialPort, Settings};
use crossbar::{Device, Engine, IoDevice};

use std::cell::RefCell;
use std::ffi::CStr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Opens a pty pair, returning the master descriptor and the slave path.
fn open_pty() -> (RawFd, String) {
    let master = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
    assert!(master >= 0, "Failed to open pty master");

    let rc = unsafe { libc::grantpt(master) };
    assert_eq!(rc, 0, "Failed to grant pty");
    let rc = unsafe { libc::unlockpt(master) };
    assert_eq!(rc, 0, "Failed to unlock pty");

    let name = unsafe { libc::ptsname(master) };
    assert!(!name.is_null(), "Failed to resolve pty slave name");
    let path = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();

    (master, path)
}

fn read_master(master: RawFd, want: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buffer = [0_u8; 256];

    while collected.len() < want {
        let mut entry = libc::pollfd { fd: master, events: libc::POLLIN, revents: 0 };
        let rc = unsafe { libc::poll(&mut entry, 1, 2000) };
        assert!(rc > 0, "Timed out waiting for pty output");

        let count = unsafe { libc::read(master, buffer.as_mut_ptr() as *mut _, buffer.len()) };
        assert!(count > 0, "Failed to read from pty master");
        collected.extend_from_slice(&buffer[..count as usize]);
    }

    collected
}

#[test]
fn bytes_written_to_the_line_reach_the_data_callback() {
    let (master, slave_path) = open_pty();

    let engine = Engine::new();
    let port = Rc::new(RefCell::new(SerialPort::new()));
    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    assert!(
        port.borrow_mut().open(&slave_path, &Settings::default()).is_ok(),
        "Failed to open {slave_path}: {}",
        port.borrow().core().last_error()
    );
    assert!(port.borrow().is_connected());

    {
        let received = received.clone();
        port.borrow_mut().set_data_callback(move |data| {
            received.borrow_mut().extend_from_slice(data);
        });
    }

    assert!(engine.register(&port).is_ok());

    let message = b"ping";
    let written = unsafe { libc::write(master, message.as_ptr() as *const _, message.len()) };
    assert_eq!(written, message.len() as isize, "Failed to write to pty master");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while received.borrow().len() < message.len() && std::time::Instant::now() < deadline {
        engine.run_once(Some(Duration::from_millis(50)));
    }

    assert_eq!(received.borrow().as_slice(), message);

    unsafe { libc::close(master) };
}

#[test]
fn queued_payloads_drain_out_of_the_line() {
    let (master, slave_path) = open_pty();

    let engine = Engine::new();
    let port = Rc::new(RefCell::new(SerialPort::new()));

    assert!(port.borrow_mut().open(&slave_path, &Settings::default()).is_ok());
    assert!(engine.register(&port).is_ok());

    assert!(port.borrow_mut().async_send(b"pong").is_ok());
    assert!(engine.run_once(Some(Duration::from_millis(1000))));

    assert_eq!(read_master(master, 4), b"pong");
    assert_eq!(port.borrow().io().pending(), 0);

    unsafe { libc::close(master) };
}

#[test]
fn disconnect_releases_the_descriptor() {
    let (master, slave_path) = open_pty();

    let mut port = SerialPort::new();
    assert!(port.open(&slave_path, &Settings::default()).is_ok());
    assert!(port.core().handle().is_some());

    port.disconnect();
    assert!(!port.is_connected());
    assert_eq!(port.core().handle(), None);

    unsafe { libc::close(master) };
}
