//! Dispatch-order and registration behavior observable through the public
//! device interface.

use crossbar::{Device, DeviceCore, Engine, Status};

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// A device that appends `<label>:<event>` to a shared log for every
/// readiness signal it receives.
struct Recorder {
    core: DeviceCore,
    label: &'static str,
    log: Rc<RefCell<Vec<String>>>,
    drop_on_read: Option<Rc<RefCell<Option<Rc<RefCell<Recorder>>>>>>,
}

impl Recorder {
    fn new(label: &'static str, log: Rc<RefCell<Vec<String>>>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            core: DeviceCore::new(),
            label,
            log,
            drop_on_read: None,
        }))
    }

    fn record(&self, event: &str) {
        self.log.borrow_mut().push(format!("{}:{event}", self.label));
    }
}

impl Device for Recorder {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn ready_read(&mut self) {
        self.record("read");

        if let Some(victim) = self.drop_on_read.take() {
            victim.borrow_mut().take();
        }
    }

    fn ready_write(&mut self) {
        self.record("write");
    }

    fn ready_error(&mut self) {
        self.record("error");
    }

    fn ready_hangup(&mut self) {
        self.record("hangup");
    }
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "Failed to create pipe");
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let byte = [0x2a_u8];
    let written = unsafe { libc::write(fd, byte.as_ptr() as *const _, 1) };
    assert_eq!(written, 1, "Failed to write to pipe");
}

#[test]
fn readiness_classes_dispatch_in_fixed_order() {
    let engine = Engine::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    // An errored descriptor: the write end of a pipe whose read end is
    // gone.
    let (orphan_read, orphan_write) = pipe_pair();
    unsafe { libc::close(orphan_read) };
    let errored = Recorder::new("err", log.clone());
    errored.borrow_mut().core_mut().register_new_handle(Some(orphan_write));

    // A writable descriptor: an empty pipe's write end, switched to write
    // interest.
    let (idle_read, idle_write) = pipe_pair();
    let writable = Recorder::new("wr", log.clone());
    writable.borrow_mut().core_mut().register_new_handle(Some(idle_write));

    // A readable descriptor: a pipe read end with one byte waiting.
    let (full_read, full_write) = pipe_pair();
    write_byte(full_write);
    let readable = Recorder::new("rd", log.clone());
    readable.borrow_mut().core_mut().register_new_handle(Some(full_read));

    // Registration order is deliberately the reverse of dispatch order.
    assert!(engine.register(&errored).is_ok());
    assert!(engine.register(&writable).is_ok());
    assert!(engine.register(&readable).is_ok());
    writable.borrow().core().request_write();

    assert!(engine.run_once(Some(Duration::from_millis(1000))));

    assert_eq!(
        log.borrow().as_slice(),
        ["rd:read", "wr:write", "err:error"],
        "readable must fire before writable before error"
    );

    unsafe { libc::close(idle_read) };
    unsafe { libc::close(full_write) };
}

#[test]
fn same_class_dispatch_follows_registration_order() {
    let engine = Engine::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (first_read, first_write) = pipe_pair();
    let (second_read, second_write) = pipe_pair();
    write_byte(first_write);
    write_byte(second_write);

    let first = Recorder::new("first", log.clone());
    first.borrow_mut().core_mut().register_new_handle(Some(first_read));
    let second = Recorder::new("second", log.clone());
    second.borrow_mut().core_mut().register_new_handle(Some(second_read));

    assert!(engine.register(&first).is_ok());
    assert!(engine.register(&second).is_ok());

    assert!(engine.run_once(Some(Duration::from_millis(1000))));

    assert_eq!(log.borrow().as_slice(), ["first:read", "second:read"]);

    unsafe { libc::close(first_write) };
    unsafe { libc::close(second_write) };
}

#[test]
fn a_callback_may_remove_a_device_pending_dispatch() {
    let engine = Engine::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (first_read, first_write) = pipe_pair();
    let (second_read, second_write) = pipe_pair();
    write_byte(first_write);
    write_byte(second_write);

    let killer = Recorder::new("killer", log.clone());
    killer.borrow_mut().core_mut().register_new_handle(Some(first_read));
    let victim = Recorder::new("victim", log.clone());
    victim.borrow_mut().core_mut().register_new_handle(Some(second_read));

    assert!(engine.register(&killer).is_ok());
    assert!(engine.register(&victim).is_ok());

    // The killer's read callback drops the victim's only strong handle, so
    // the victim deregisters mid-tick and must not be dispatched.
    let slot = Rc::new(RefCell::new(Some(victim)));
    killer.borrow_mut().drop_on_read = Some(slot);

    assert!(engine.run_once(Some(Duration::from_millis(1000))));

    assert_eq!(log.borrow().as_slice(), ["killer:read"]);

    unsafe { libc::close(first_write) };
    unsafe { libc::close(second_write) };
}

#[test]
fn registration_is_idempotent() {
    let engine = Engine::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let device = Recorder::new("dev", log);

    assert!(engine.register(&device).is_ok());
    assert_eq!(engine.register(&device), Status::Passable);
    assert!(engine.deregister(&device).is_ok());
    assert!(engine.register(&device).is_ok());
}

#[test]
fn an_unregistered_device_receives_no_dispatch() {
    let engine = Engine::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let (read_end, write_end) = pipe_pair();
    write_byte(write_end);
    let device = Recorder::new("dev", log.clone());
    device.borrow_mut().core_mut().register_new_handle(Some(read_end));

    assert!(engine.register(&device).is_ok());
    assert!(engine.deregister(&device).is_ok());

    assert!(!engine.run_once(Some(Duration::from_millis(50))));
    assert!(log.borrow().is_empty());

    unsafe { libc::close(write_end) };
}
