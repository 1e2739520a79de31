//! Loop driver tests
//!
//! The session slot is set exactly while a driving call is active, in the
//! foreground and on the engine's background thread.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use mosquitto_lua::{BridgeError, DriveMode, EngineEvent, EventKind, HostArg, StatusCode};
use pretty_assertions::assert_eq;

const WAIT: Duration = Duration::from_secs(5);

// ===== Foreground =====

#[test]
fn test_session_set_only_inside_handler() {
    let h = Harness::connected();
    let weak = Arc::downgrade(&h.ctx);
    let (tx, rx) = mpsc::channel();
    h.ctx
        .set_handler(
            EventKind::Publish,
            TestHandler::hook("puback", move |_| {
                if let Some(ctx) = weak.upgrade() {
                    let _ = tx.send(ctx.drive_mode());
                }
            }),
        )
        .unwrap();

    h.ctx.publish("a", None, 0, false).unwrap();
    assert_eq!(h.ctx.drive_mode(), None);
    h.pump();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(DriveMode::Foreground));
    assert_eq!(h.ctx.drive_mode(), None);
}

#[test]
fn test_session_cleared_on_engine_error() {
    let h = Harness::connected();
    h.engine.fail_next(StatusCode::ConnLost);

    let err = h.ctx.driver().run_once(h.host.clone(), 0, 1).unwrap_err();

    assert!(err.is_recoverable());
    assert!(!h.ctx.is_driving());
}

#[test]
fn test_run_once_before_connect_reports_no_connection() {
    let h = Harness::new();
    let err = h.ctx.driver().run_once(h.host.clone(), 0, 1).unwrap_err();
    assert_eq!(err.code(), Some(4));
    assert!(err.is_recoverable());
}

#[test]
fn test_run_forever_returns_after_disconnect() {
    let h = Harness::connected();
    let weak = Arc::downgrade(&h.ctx);
    h.ctx.subscribe("cmd/stop", 0).unwrap();
    h.ctx
        .set_handler(
            EventKind::Message,
            TestHandler::hook("message", move |_| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.disconnect().unwrap();
                }
            }),
        )
        .unwrap();
    h.ctx
        .set_handler(EventKind::Disconnect, TestHandler::record("disconnect"))
        .unwrap();

    h.ctx.publish("cmd/stop", Some(b"now"), 0, false).unwrap();
    h.ctx.driver().run_forever(h.host.clone(), 10, 1).unwrap();

    assert_eq!(h.host.count("message"), 1);
    assert_eq!(
        h.host.calls_to("disconnect"),
        vec![vec![HostArg::Bool(true), int(0), text("client-initiated disconnect")]]
    );
    assert!(!h.ctx.is_driving());
}

#[test]
fn test_manual_read_write_misc() {
    let h = Harness::connected();
    h.ctx
        .set_handler(EventKind::Publish, TestHandler::record("puback"))
        .unwrap();
    h.ctx.publish("a", None, 0, false).unwrap();
    h.ctx.publish("b", None, 0, false).unwrap();

    // log, PUBACK, log, PUBACK: two packets reach the first PUBACK.
    h.ctx.driver().drive_read(h.host.clone(), 2).unwrap();
    assert_eq!(h.host.count("puback"), 1);
    h.ctx.driver().drive_write(h.host.clone(), 1).unwrap();
    h.ctx.driver().drive_misc(h.host.clone()).unwrap();
    h.ctx.driver().drive_read(h.host.clone(), 0).unwrap();
    assert_eq!(h.host.count("puback"), 2);
    assert!(!h.ctx.is_driving());
}

// ===== Background =====

#[test]
fn test_background_delivers_on_engine_thread() {
    let h = Harness::connected();
    h.ctx
        .set_handler(EventKind::Message, TestHandler::record("message"))
        .unwrap();
    h.ctx.subscribe("bg/#", 0).unwrap();

    h.ctx.driver().start_background(h.host.clone()).unwrap();
    assert_eq!(h.ctx.drive_mode(), Some(DriveMode::Background));
    h.ctx.publish("bg/one", Some(b"1"), 0, false).unwrap();

    assert!(h.host.wait_for("message", 1, WAIT));
    let call = h.host.calls().into_iter().find(|c| c.handler == "message").unwrap();
    assert!(call.thread.starts_with("scripted-loop-"));

    h.ctx.driver().stop_background(false).unwrap();
    assert!(!h.ctx.is_driving());
}

#[test]
fn test_graceful_stop_drains_pending_events() {
    let h = Harness::connected();
    h.ctx
        .set_handler(EventKind::Publish, TestHandler::record("puback"))
        .unwrap();
    h.ctx.driver().start_background(h.host.clone()).unwrap();

    for _ in 0..20 {
        h.ctx.publish("burst", None, 0, false).unwrap();
    }
    h.ctx.driver().stop_background(false).unwrap();

    assert_eq!(h.host.count("puback"), 20);
}

#[test]
fn test_forced_stop_with_handler_in_flight() {
    let h = Harness::connected();
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = parking_lot::Mutex::new(release_rx);

    h.ctx
        .set_handler(
            EventKind::Publish,
            TestHandler::hook("puback", move |_| {
                let _ = entered_tx.send(());
                let _ = release_rx.lock().recv_timeout(WAIT);
            }),
        )
        .unwrap();

    h.ctx.driver().start_background(h.host.clone()).unwrap();
    h.ctx.publish("slow", None, 0, false).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    // The handler is still blocked; a forced stop must not wait for it.
    h.ctx.driver().stop_background(true).unwrap();
    assert!(!h.ctx.is_driving());
    assert!(!h.engine.background_running());

    release_tx.send(()).unwrap();
}

#[test]
fn test_events_after_forced_stop_are_dropped() {
    let h = Harness::connected();
    h.ctx
        .set_handler(EventKind::Publish, TestHandler::record("puback"))
        .unwrap();
    h.ctx.driver().start_background(h.host.clone()).unwrap();
    h.ctx.driver().stop_background(true).unwrap();

    h.engine.raise_now(EngineEvent::Publish { mid: 42 });
    assert_eq!(h.host.count("puback"), 0);
}

#[test]
fn test_stop_without_background_loop() {
    let h = Harness::connected();
    assert!(matches!(
        h.ctx.driver().stop_background(true),
        Err(BridgeError::NotDriving)
    ));
}

#[test]
fn test_foreground_rejected_while_background_runs() {
    let h = Harness::connected();
    h.ctx.driver().start_background(h.host.clone()).unwrap();

    assert!(matches!(
        h.ctx.driver().run_once(h.host.clone(), 0, 1),
        Err(BridgeError::AlreadyDriving)
    ));
    assert_eq!(h.ctx.drive_mode(), Some(DriveMode::Background));

    h.ctx.driver().stop_background(true).unwrap();
}

#[test]
fn test_failed_start_leaves_no_session() {
    let h = Harness::connected();
    h.engine.fail_next(StatusCode::NoMem);

    let err = h.ctx.driver().start_background(h.host.clone()).unwrap_err();

    assert!(matches!(err, BridgeError::Engine { .. }));
    assert!(!h.ctx.is_driving());
}
