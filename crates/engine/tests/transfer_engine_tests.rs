//! Transfer Engine Integration Tests
//!
//! Drives `Interface` against the in-memory transfer library.
//!
//! # Test Scenarios
//! - Submission and duplicate submission
//! - Cancellation
//! - Resubmission driven by callbacks
//! - Submission and resubmission failures
//! - Interface teardown
//!
//! Run with: `cargo test -p engine --test transfer_engine_tests`

use common::{ClaimError, CompletionStatus, EndpointKey, Error, IntegrityError, SubmitError};
use engine::Interface;
use engine::test_utils::{MockDevice, MockLibrary};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn open_interface() -> (Rc<MockLibrary>, Rc<MockDevice>, Interface<MockLibrary>) {
    let library = Rc::new(MockLibrary::new());
    let device = Rc::new(MockDevice::new());
    let interface = Interface::open(library.clone(), device.clone(), 0, false)
        .expect("Failed to open interface");
    (library, device, interface)
}

fn in_key(endpoint: u8) -> EndpointKey {
    EndpointKey::input(endpoint).unwrap()
}

fn out_key(endpoint: u8) -> EndpointKey {
    EndpointKey::output(endpoint).unwrap()
}

// ============================================================================
// Submission Tests
// ============================================================================

#[test]
fn test_double_submit_read_rejected() {
    let (library, _device, interface) = open_interface();

    interface.submit_read(1, 8, |_| true).unwrap();
    let err = interface.submit_read(1, 8, |_| true).unwrap_err();

    assert!(matches!(
        err,
        Error::Integrity(IntegrityError::EndpointBusy(key)) if key == in_key(1)
    ));
    assert_eq!(interface.active_transfers(), 1);
    assert_eq!(library.submissions(in_key(1)), 1);
}

#[test]
fn test_read_and_write_on_same_number_are_distinct() {
    let (_library, _device, interface) = open_interface();

    interface.submit_read(1, 8, |_| false).unwrap();
    interface.submit_write(1, &[1, 2], |_| false).unwrap();

    assert!(interface.is_active(in_key(1)));
    assert!(interface.is_active(out_key(1)));
    assert_eq!(interface.active_transfers(), 2);
}

#[test]
fn test_submit_failure_leaves_registry_unchanged() {
    let (library, _device, interface) = open_interface();
    library.fail_next_submit(rusb::Error::NoDevice);

    let err = interface.submit_read(1, 8, |_| true).unwrap_err();
    assert!(matches!(
        err,
        Error::Submit(SubmitError {
            source: rusb::Error::NoDevice,
            ..
        })
    ));
    assert!(!interface.is_active(in_key(1)));
    assert_eq!(library.allocated(), 1);
    assert_eq!(library.freed(), 1);

    // endpoint is usable again
    interface.submit_read(1, 8, |_| true).unwrap();
    assert!(interface.is_active(in_key(1)));
}

#[test]
fn test_write_copies_caller_data() {
    let (library, _device, interface) = open_interface();
    let mut data = vec![0xAA, 0xBB, 0xCC, 0xDD];

    interface.submit_write(2, &data, |_| false).unwrap();
    data.fill(0);

    assert_eq!(
        library.submitted_data(out_key(2)),
        vec![vec![0xAA, 0xBB, 0xCC, 0xDD]]
    );
}

// ============================================================================
// Cancellation Tests
// ============================================================================

#[test]
fn test_cancel_read_frees_transfer() {
    let (library, _device, interface) = open_interface();

    interface.submit_read(1, 8, |_| true).unwrap();
    interface.cancel_read(1).unwrap();

    assert!(!interface.is_active(in_key(1)));
    assert_eq!(interface.active_transfers(), 0);
    assert_eq!(library.cancelled(), 1);
    assert_eq!(library.freed(), 1);
    assert!(!library.is_in_flight(in_key(1)));
}

#[test]
fn test_cancel_unknown_endpoint() {
    let (_library, _device, interface) = open_interface();

    let err = interface.cancel_write(3).unwrap_err();
    assert!(matches!(
        err,
        Error::Integrity(IntegrityError::EndpointNotFound(key)) if key == out_key(3)
    ));

    // wrong direction
    interface.submit_read(3, 8, |_| true).unwrap();
    assert!(interface.cancel_write(3).is_err());
    assert!(interface.is_active(in_key(3)));
}

// ============================================================================
// Completion Tests
// ============================================================================

#[test]
fn test_read_completion_without_resubmit() {
    let (library, _device, interface) = open_interface();
    let received = Rc::new(RefCell::new(Vec::new()));

    let sink = received.clone();
    interface
        .submit_read(1, 8, move |done| {
            sink.borrow_mut().extend_from_slice(done.data());
            false
        })
        .unwrap();

    library
        .complete_read(in_key(1), &[1, 2, 3, 4, 5, 6, 7, 8])
        .unwrap();

    assert_eq!(*received.borrow(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(interface.active_transfers(), 0);
    assert_eq!(library.submissions(in_key(1)), 1);
    assert_eq!(library.freed(), 1);
}

#[test]
fn test_read_resubmits_until_callback_declines() {
    let (library, _device, interface) = open_interface();
    let calls = Rc::new(Cell::new(0));

    let counter = calls.clone();
    interface
        .submit_read(1, 4, move |_| {
            counter.set(counter.get() + 1);
            counter.get() <= 3
        })
        .unwrap();

    for _ in 0..4 {
        library.complete_read(in_key(1), &[0; 4]).unwrap();
    }

    assert_eq!(calls.get(), 4);
    // initial submission plus three resubmissions
    assert_eq!(library.submissions(in_key(1)), 4);
    assert_eq!(library.allocated(), 1);
    assert_eq!(library.freed(), 1);
    assert!(!interface.is_active(in_key(1)));
}

#[test]
fn test_short_read_reports_actual_length() {
    let (library, _device, interface) = open_interface();
    let lengths = Rc::new(RefCell::new(Vec::new()));

    let sink = lengths.clone();
    interface
        .submit_read(1, 64, move |done| {
            sink.borrow_mut().push(done.data().len());
            true
        })
        .unwrap();

    library.complete_read(in_key(1), &[9; 5]).unwrap();
    library.complete_read(in_key(1), &[9; 64]).unwrap();

    assert_eq!(*lengths.borrow(), vec![5, 64]);
}

#[test]
fn test_read_callback_sees_stall_status() {
    let (library, _device, interface) = open_interface();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let sink = seen.clone();
    interface
        .submit_read(1, 8, move |done| {
            assert_eq!(done.endpoint(), in_key(1));
            sink.borrow_mut().push((done.status(), done.data().len()));
            done.status().is_success()
        })
        .unwrap();

    library
        .complete(in_key(1), CompletionStatus::Stall, &[])
        .unwrap();

    assert_eq!(*seen.borrow(), vec![(CompletionStatus::Stall, 0)]);
    assert!(!interface.is_active(in_key(1)));
    assert_eq!(library.submissions(in_key(1)), 1);
}

#[test]
fn test_write_resubmits_once() {
    let (library, _device, interface) = open_interface();
    let calls = Rc::new(Cell::new(0));

    let counter = calls.clone();
    interface
        .submit_write(2, &[1, 2, 3, 4], move |done| {
            assert_eq!(done.status(), CompletionStatus::Completed);
            assert_eq!(done.actual_length(), 4);
            counter.set(counter.get() + 1);
            counter.get() == 1
        })
        .unwrap();

    library.complete_write(out_key(2)).unwrap();
    library.complete_write(out_key(2)).unwrap();

    assert_eq!(calls.get(), 2);
    assert_eq!(library.submissions(out_key(2)), 2);
    assert_eq!(interface.active_transfers(), 0);
}

#[test]
fn test_write_callback_refreshes_buffer() {
    let (library, _device, interface) = open_interface();
    let sequence = Rc::new(Cell::new(0u8));

    let next = sequence.clone();
    interface
        .submit_write(2, &[0, 0], move |done| {
            next.set(next.get() + 1);
            done.buffer_mut().fill(next.get());
            next.get() < 3
        })
        .unwrap();

    for _ in 0..3 {
        library.complete_write(out_key(2)).unwrap();
    }

    assert_eq!(
        library.submitted_data(out_key(2)),
        vec![vec![0, 0], vec![1, 1], vec![2, 2]]
    );
}

#[test]
fn test_resubmit_failure_is_reported() {
    let (library, _device, interface) = open_interface();
    interface.submit_read(1, 8, |_| true).unwrap();

    library.fail_next_submit(rusb::Error::Pipe);
    let err = library.complete_read(in_key(1), &[0; 8]).unwrap_err();

    assert!(matches!(
        err,
        Error::Submit(SubmitError {
            source: rusb::Error::Pipe,
            ..
        })
    ));
    assert!(!interface.is_active(in_key(1)));
    assert_eq!(library.freed(), 1);
}

#[test]
fn test_callback_submits_on_other_endpoint() {
    let library = Rc::new(MockLibrary::new());
    let interface = Rc::new(
        Interface::open(library.clone(), Rc::new(MockDevice::new()), 0, false).unwrap(),
    );

    let weak = Rc::downgrade(&interface);
    interface
        .submit_read(1, 8, move |done| {
            let reply = done.data().to_vec();
            weak.upgrade()
                .unwrap()
                .submit_write(2, &reply, |_| false)
                .unwrap();
            false
        })
        .unwrap();

    library.complete_read(in_key(1), &[7; 8]).unwrap();

    assert!(!interface.is_active(in_key(1)));
    assert!(interface.is_active(out_key(2)));
    assert_eq!(library.submitted_data(out_key(2)), vec![vec![7; 8]]);
}

#[test]
fn test_queued_completions_run_in_handle_events() {
    use engine::EventLibrary;

    let (library, _device, interface) = open_interface();
    let calls = Rc::new(Cell::new(0));

    let counter = calls.clone();
    interface
        .submit_read(1, 8, move |_| {
            counter.set(counter.get() + 1);
            true
        })
        .unwrap();
    library.queue_completion(in_key(1), CompletionStatus::Completed, &[1; 8]);

    library.handle_events().unwrap();
    assert_eq!(calls.get(), 1);
    assert!(interface.is_active(in_key(1)));
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_drop_cancels_everything_then_releases() {
    let (library, device, interface) = open_interface();

    interface.submit_read(1, 8, |_| true).unwrap();
    interface.submit_read(2, 8, |_| true).unwrap();
    interface.submit_write(1, &[0; 8], |_| true).unwrap();
    assert_eq!(device.claimed(), vec![0]);

    drop(interface);

    assert_eq!(library.cancelled(), 3);
    assert_eq!(library.freed(), 3);
    assert_eq!(device.released(), vec![0]);
    assert!(device.claimed().is_empty());
}

#[test]
fn test_release_failure_is_not_fatal() {
    let library = Rc::new(MockLibrary::new());
    let device = Rc::new(MockDevice::new().with_release_error(rusb::Error::NoDevice));
    let interface = Interface::open(library.clone(), device.clone(), 0, false).unwrap();
    interface.submit_read(1, 8, |_| true).unwrap();

    drop(interface);
    assert_eq!(library.freed(), 1);
    assert!(device.released().is_empty());
}

#[test]
fn test_open_busy_interface() {
    let library = Rc::new(MockLibrary::new());

    let device = Rc::new(MockDevice::new().with_busy_interface(0));
    let err = Interface::open(library.clone(), device, 0, false)
        .err()
        .expect("busy interface should not open");
    assert!(matches!(err, Error::Claim(ClaimError::Busy { interface: 0 })));

    let device = Rc::new(MockDevice::new().with_busy_interface(0));
    let interface = Interface::open(library, device.clone(), 0, true).unwrap();
    assert_eq!(interface.number(), 0);
    assert_eq!(device.detach_calls(), 1);
}

#[test]
fn test_interface_dropped_from_callback() {
    let library = Rc::new(MockLibrary::new());
    let device = Rc::new(MockDevice::new());
    let slot: Rc<RefCell<Option<Interface<MockLibrary>>>> = Rc::new(RefCell::new(None));

    let interface = Interface::open(library.clone(), device.clone(), 0, false).unwrap();
    let owner = slot.clone();
    interface
        .submit_read(1, 8, move |_| {
            owner.borrow_mut().take();
            true
        })
        .unwrap();
    *slot.borrow_mut() = Some(interface);

    library.complete_read(in_key(1), &[0; 8]).unwrap();

    assert!(slot.borrow().is_none());
    assert_eq!(library.submissions(in_key(1)), 1);
    assert_eq!(library.freed(), 1);
    assert_eq!(device.released(), vec![0]);
}
