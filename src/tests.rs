//! Whole-loop scenarios, as opposed to the unit tests colocated with each
//! module. These exercise the phase ordering in `r#loop.rs` end to end.

use std::cell::RefCell;
use std::rc::Rc;

use crate::timer::TimerOptions;
use crate::{Loop, RunMode, RunResult};

#[test]
fn timer_fires_once() {
    let mut loop_ = Loop::new().unwrap();
    let fired = Rc::new(RefCell::new(0));
    let fired_cb = fired.clone();
    loop_.timer_start(
        TimerOptions {
            timeout: 1,
            repeat: 0,
        },
        move |_id| {
            *fired_cb.borrow_mut() += 1;
        },
    );

    let result = loop_.run(RunMode::Default);
    assert_eq!(result, RunResult::NothingToDo);
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn repeating_timer_can_be_stopped_after_n_fires() {
    let mut loop_ = Loop::new().unwrap();
    let fired = Rc::new(RefCell::new(0));
    let fired_cb = fired.clone();
    let stop_after = 3;
    let id = loop_.timer_start(
        TimerOptions {
            timeout: 1,
            repeat: 1,
        },
        move |_id| {
            *fired_cb.borrow_mut() += 1;
        },
    );

    // Run iterations until the timer has fired `stop_after` times, then
    // stop it; the loop should go idle instead of firing indefinitely.
    loop {
        loop_.run(RunMode::Once);
        if *fired.borrow() >= stop_after {
            loop_.timer_stop(id);
            break;
        }
    }

    let result = loop_.run(RunMode::Default);
    assert_eq!(result, RunResult::NothingToDo);
    assert_eq!(*fired.borrow(), stop_after);
}

#[test]
fn idle_handle_runs_every_iteration_until_stopped() {
    let mut loop_ = Loop::new().unwrap();
    let ticks = Rc::new(RefCell::new(0));
    let ticks_cb = ticks.clone();
    loop_.idle_start(move || {
        *ticks_cb.borrow_mut() += 1;
    });

    // Also arm a timer so the loop has something to eventually go idle on;
    // an idle handle alone would spin the loop forever.
    loop_.timer_start(
        TimerOptions {
            timeout: 5,
            repeat: 0,
        },
        |_| {},
    );

    for _ in 0..5 {
        loop_.run(RunMode::Once);
    }

    assert!(*ticks.borrow() >= 5);
}

#[test]
fn async_wakeup_runs_callback_from_other_thread() {
    let mut loop_ = Loop::new().unwrap();
    let woken = Rc::new(RefCell::new(false));
    let woken_cb = woken.clone();
    let (_id, sender) = loop_.async_start(move || {
        *woken_cb.borrow_mut() = true;
    });

    let handle = std::thread::spawn(move || {
        sender.send();
    });
    handle.join().unwrap();

    loop_.run(RunMode::Once);
    assert!(*woken.borrow());
}

#[test]
fn queued_work_runs_on_worker_and_completes_on_loop_thread() {
    let mut loop_ = Loop::new().unwrap();
    let result = Rc::new(RefCell::new(None));
    let result_cb = result.clone();
    let loop_thread = std::thread::current().id();

    loop_.queue_work(
        || Ok(Box::new(7i32) as Box<dyn std::any::Any + Send>),
        move |res| {
            let value = *res.unwrap().downcast::<i32>().unwrap();
            assert_eq!(std::thread::current().id(), loop_thread);
            *result_cb.borrow_mut() = Some(value);
        },
    );

    for _ in 0..20 {
        if result.borrow().is_some() {
            break;
        }
        loop_.run(RunMode::Once);
    }

    assert_eq!(*result.borrow(), Some(7));
}
