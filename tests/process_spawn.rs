//! Spawns a real child process and waits for the loop to report its exit.

#![cfg(unix)]

use std::cell::RefCell;
use std::rc::Rc;

use reactor_core::process::{ExitStatus, ProcessOptions};
use reactor_core::{Loop, RunMode};

#[test]
fn spawned_child_exit_is_reaped_and_reported() {
    let mut loop_ = Loop::new().unwrap();

    let mut opts = ProcessOptions::new("/bin/sh");
    opts.args = vec!["-c".to_string(), "exit 7".to_string()];

    let exit_status = Rc::new(RefCell::new(None));
    let exit_status_cb = exit_status.clone();
    loop_
        .spawn(&opts, move |status| {
            *exit_status_cb.borrow_mut() = Some(status);
        })
        .unwrap();

    for _ in 0..200 {
        if exit_status.borrow().is_some() {
            break;
        }
        loop_.run(RunMode::NoWait);
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    match exit_status.borrow().as_ref().expect("child never reaped") {
        ExitStatus::Exited(code) => assert_eq!(*code, 7),
        ExitStatus::Signaled(sig) => panic!("unexpected signal {sig}"),
    }
}

#[test]
fn exec_failure_surfaces_as_error_not_panic() {
    let mut loop_ = Loop::new().unwrap();
    let opts = ProcessOptions::new("/no/such/binary-ever-12345");
    let err = loop_.spawn(&opts, |_| {}).unwrap_err();
    assert_eq!(err.code(), reactor_core::Code::Enoent);
}
