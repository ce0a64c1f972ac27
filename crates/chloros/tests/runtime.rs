// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative scheduling, join/exit, and reclamation.
//!
//! libtest runs each test on its own OS thread, and each OS thread gets its
//! own runtime, so every test starts from a fresh `init`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chloros::{Error, JoinError, Status, ThreadId};

#[test]
fn yield_with_only_bootstrap_returns_false() {
    chloros::init(false).unwrap();
    assert_eq!(chloros::current(), ThreadId::BOOTSTRAP);
    assert!(!chloros::yield_now());
    assert!(!chloros::yield_now());
}

#[test]
fn second_init_is_rejected() {
    chloros::init(false).unwrap();
    assert!(matches!(chloros::init(false), Err(Error::AlreadyInitialized)));
}

#[test]
fn yielding_threads_alternate() {
    const ROUNDS: usize = 6;
    chloros::init(false).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));

    let mut ids = Vec::new();
    for name in ["a", "b"] {
        let log = log.clone();
        ids.push(chloros::spawn(move || {
            for _ in 0..ROUNDS {
                log.borrow_mut().push(name);
                chloros::yield_now();
            }
        }));
    }
    for id in ids {
        chloros::join(id).unwrap();
    }

    let expected: Vec<&str> = ["a", "b"].repeat(ROUNDS);
    assert_eq!(*log.borrow(), expected);
}

#[test]
fn join_returns_computed_value() {
    chloros::init(false).unwrap();
    for (input, output) in [(21, 42), (100, 200)] {
        let id = chloros::spawn(move || input * 2);
        assert_eq!(chloros::join_as::<i32>(id).unwrap(), output);
    }
}

fn sum_from(x: u64) -> u64 {
    if x == 10 {
        return 10;
    }
    let child = chloros::spawn(move || sum_from(x + 1));
    x + chloros::join_as::<u64>(child).unwrap()
}

#[test]
fn recursive_join_sums() {
    chloros::init(false).unwrap();
    let top = chloros::spawn(|| sum_from(1));
    assert_eq!(chloros::join_as::<u64>(top).unwrap(), 55);
}

#[test]
fn join_after_exit_does_not_block() {
    chloros::init(false).unwrap();
    let id = chloros::spawn(|| 5u8);
    chloros::wait();

    assert_eq!(chloros::status(id), Some(Status::Joinable));
    assert_eq!(chloros::stats().joinable, 1);
    assert_eq!(chloros::join_as::<u8>(id).unwrap(), 5);
}

#[test]
fn join_before_exit_blocks_joiner() {
    chloros::init(false).unwrap();
    let finished = Rc::new(Cell::new(false));
    let seen_bootstrap = Rc::new(Cell::new(None));

    let id = {
        let finished = finished.clone();
        let seen_bootstrap = seen_bootstrap.clone();
        chloros::spawn(move || {
            for _ in 0..5 {
                chloros::yield_now();
            }
            seen_bootstrap.set(chloros::status(ThreadId::BOOTSTRAP));
            finished.set(true);
            9u16
        })
    };

    assert!(!finished.get());
    assert_eq!(chloros::status(id), Some(Status::Ready));
    assert_eq!(chloros::join_as::<u16>(id).unwrap(), 9);
    assert!(finished.get());
    assert_eq!(seen_bootstrap.get(), Some(Status::Waiting));
}

#[test]
fn explicit_exit_matches_return() {
    chloros::init(false).unwrap();
    let id = chloros::spawn(|| -> &'static str {
        chloros::exit("early");
    });
    assert_eq!(chloros::join_as::<&str>(id).unwrap(), "early");
}

#[test]
fn second_joiner_is_refused() {
    chloros::init(false).unwrap();
    let target = chloros::spawn(|| {
        for _ in 0..10 {
            chloros::yield_now();
        }
        1u32
    });
    let first = chloros::spawn(move || chloros::join_as::<u32>(target).unwrap());

    assert!(matches!(
        chloros::join(target),
        Err(JoinError::JoinerPresent(id)) if id == target
    ));
    assert_eq!(chloros::join_as::<u32>(first).unwrap(), 1);
}

#[test]
fn unjoinable_targets() {
    chloros::init(false).unwrap();
    assert!(matches!(
        chloros::join(ThreadId::BOOTSTRAP),
        Err(JoinError::NotJoinable(_))
    ));
    assert!(matches!(
        chloros::join(ThreadId::from_u64(999)),
        Err(JoinError::NotFound(_))
    ));

    let id = chloros::spawn(|| {
        matches!(
            chloros::join(chloros::current()),
            Err(JoinError::NotJoinable(_))
        )
    });
    assert!(chloros::join_as::<bool>(id).unwrap());
}

#[test]
fn wait_drains_runnable_threads() {
    chloros::init(false).unwrap();
    let steps = Rc::new(Cell::new(0));
    for n in 0..5 {
        let steps = steps.clone();
        chloros::spawn(move || {
            for _ in 0..n {
                steps.set(steps.get() + 1);
                chloros::yield_now();
            }
        });
    }

    chloros::wait();
    assert_eq!(steps.get(), 1 + 2 + 3 + 4);
    let stats = chloros::stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.joinable, 5);
}

#[test]
fn joined_thread_is_reclaimed_on_next_pass() {
    chloros::init(false).unwrap();
    let id = chloros::spawn(|| vec![1u8; 64]);
    assert_eq!(chloros::join_as::<Vec<u8>>(id).unwrap().len(), 64);

    assert_eq!(chloros::status(id), Some(Status::Zombie));
    assert!(matches!(chloros::join(id), Err(JoinError::AlreadyJoined(_))));

    assert!(!chloros::yield_now());
    assert_eq!(chloros::status(id), None);
    assert_eq!(chloros::stats().joinable, 0);
    assert!(matches!(chloros::join(id), Err(JoinError::NotFound(_))));

    // A pass with nothing to collect changes nothing.
    assert!(!chloros::yield_now());
    assert_eq!(chloros::stats().joinable, 0);
}

#[test]
fn panic_is_reported_to_joiner() {
    chloros::init(false).unwrap();
    let id = chloros::spawn(|| -> u8 { panic!("boom") });
    match chloros::join(id) {
        Err(JoinError::Panicked(msg)) => assert!(msg.contains("boom")),
        other => panic!("expected Panicked, got {other:?}"),
    }
    assert_eq!(chloros::status(id), Some(Status::Zombie));
}

#[test]
fn typed_join_checks_the_type() {
    chloros::init(false).unwrap();
    let id = chloros::spawn(|| 1u8);
    assert!(matches!(
        chloros::join_as::<String>(id),
        Err(JoinError::TypeMismatch(t)) if t == id
    ));
    assert_eq!(chloros::status(id), Some(Status::Zombie));
}

#[test]
fn current_names_the_running_thread() {
    chloros::init(false).unwrap();
    let id = chloros::spawn(chloros::current);
    assert_ne!(id, ThreadId::BOOTSTRAP);
    assert_eq!(chloros::join_as::<ThreadId>(id).unwrap(), id);
    assert_eq!(chloros::current(), ThreadId::BOOTSTRAP);
}

#[test]
fn ids_are_never_reused() {
    chloros::init(false).unwrap();
    let first = chloros::spawn(|| ());
    chloros::join(first).unwrap();
    chloros::yield_now();
    let second = chloros::spawn(|| ());
    assert!(second.as_u64() > first.as_u64());
    chloros::join(second).unwrap();
}
