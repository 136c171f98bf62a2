// -----------------------------------------------------------------------------
// Rust SECoP playground
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA 02111-1307 USA
//
// Module authors:
// Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! End-to-end wire-protocol tests: a real `TcpStream` talking to a node
//! served by `worker::serve_node`, driving each other through a line at a
//! time.
//!
//! The Registry is a single process-wide static, so these tests share
//! `TEST_LOCK` to run one at a time even though the test harness otherwise
//! runs them concurrently; each test still binds its own port so a slow
//! `TcpListener` teardown from a previous test can't bleed into the next.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;

use secop_core::backend::{ActionKind, BackendAnswer, BackendOutcome};
use secop_core::errors::Error;
use secop_core::node::Node;
use secop_core::registry::Registry;
use secop_core::variant::{EnumInfo, IntegerInfo, StringInfo, Variant};
use secop_core::worker::serve_node;

static TEST_LOCK: Mutex<()> = Mutex::new(());
static NEXT_PORT: AtomicU16 = AtomicU16::new(17055);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn int_shape(min: i64, max: i64) -> Variant {
    Variant::Integer(IntegerInfo { value: 0, min, max })
}

fn status_shape() -> Variant {
    Variant::Tuple(vec![
            Variant::Enum(EnumInfo { value: 100, members: vec![("idle".into(), 100), ("busy".into(), 300)] }),
            Variant::Str(StringInfo { value: String::new(), min_chars: 0, max_chars: 255, is_utf8: true }),
    ])
}

fn status_value(code: i64, text: &str) -> Variant {
    Variant::Tuple(vec![
            Variant::Enum(EnumInfo { value: code, members: vec![("idle".into(), 100), ("busy".into(), 300)] }),
            Variant::Str(StringInfo { value: text.to_owned(), min_chars: 0, max_chars: 255, is_utf8: true }),
    ])
}

/// A minimal readable+writable module "m" on a freshly-initialized node,
/// with `value`/`target` backed by shared in-memory state and a `status`
/// satisfying the "readable" interface class's structural check.
fn build_basic_node(node_id: &str, port: u16) -> Arc<Node> {
    Registry::init();
    Registry::create_node(node_id, "integration test node", "127.0.0.1", port).unwrap();
    Registry::add_module("m").unwrap();
    Registry::add_property("description", json!("test module")).unwrap();
    Registry::add_property("interface_class", json!(["readable", "writable"])).unwrap();
    let module = Registry::module(node_id, "m").unwrap();

    let state = Arc::new(Mutex::new(0i64));

    {
        let state = Arc::clone(&state);
        module.add_readable_parameter("value", int_shape(0, 1000),
            Box::new(move |_| BackendOutcome::Ready(Ok((
                            Variant::Integer(IntegerInfo { value: *state.lock().unwrap(), min: 0, max: 1000 }),
                            None, 0.0,
        )))));
    }
    module.add_readable_parameter("status", status_shape(),
        Box::new(|_| BackendOutcome::Ready(Ok((status_value(100, ""), None, 0.0)))));
    {
        let getter_state = Arc::clone(&state);
        let setter_state = Arc::clone(&state);
        module.add_writable_parameter("target", int_shape(0, 1000),
            Box::new(move |_| BackendOutcome::Ready(Ok((
                            Variant::Integer(IntegerInfo { value: *getter_state.lock().unwrap(), min: 0, max: 1000 }),
                            None, 0.0,
            )))),
            Box::new(move |_, v| {
                    let v = match v {
                        Variant::Integer(i) => i.value,
                        _ => return BackendOutcome::Ready(Err(Error::bad_value("expected integer"))),
                    };
                    *setter_state.lock().unwrap() = v;
                    BackendOutcome::Ready(Ok((Variant::Integer(IntegerInfo { value: v, min: 0, max: 1000 }), None, 0.0)))
        }));
    }

    Registry::node_complete().unwrap();
    Registry::node(node_id).unwrap()
}

fn connect(port: u16) -> BufReader<TcpStream> {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return BufReader::new(stream);
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("could not connect to test node on port {}", port);
}

fn send(reader: &mut BufReader<TcpStream>, line: &str) {
    writeln!(reader.get_mut(), "{}", line).expect("write line");
}

fn recv(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read line");
    line.trim_end_matches(['\r', '\n']).to_owned()
}

#[test]
fn minimal_node_describe_roundtrip() {
    let _guard = TEST_LOCK.lock().unwrap();
    let port = next_port();
    let node = build_basic_node("n1", port);
    thread::spawn(move || serve_node(node));

    let mut reader = connect(port);
    send(&mut reader, "*IDN?");
    assert_eq!(recv(&mut reader), secop_core::proto::IDENT_REPLY);

    send(&mut reader, "describe");
    let line = recv(&mut reader);
    let rest = line.strip_prefix("describing. ").expect("describing reply");
    let doc: serde_json::Value = serde_json::from_str(rest).unwrap();
    assert_eq!(doc["modules"]["m"]["interface_class"], json!(["readable", "writable"]));
    assert_eq!(doc["modules"]["m"]["accessibles"]["value"]["datainfo"]["type"], "int");

    Registry::shutdown();
}

#[test]
fn change_cycle_updates_value_and_replies() {
    let _guard = TEST_LOCK.lock().unwrap();
    let port = next_port();
    let node = build_basic_node("n2", port);
    thread::spawn(move || serve_node(node));

    let mut reader = connect(port);
    send(&mut reader, "change m:target 7");
    let line = recv(&mut reader);
    assert!(line.starts_with("changed m:target ["), "unexpected reply: {}", line);
    let rest = line.strip_prefix("changed m:target ").unwrap();
    let doc: serde_json::Value = serde_json::from_str(rest).unwrap();
    assert_eq!(doc[0], json!(7));

    send(&mut reader, "read m:value");
    let line = recv(&mut reader);
    assert!(line.starts_with("reply m:value [7,"), "unexpected reply: {}", line);

    Registry::shutdown();
}

#[test]
fn activate_sends_snapshot_then_active() {
    let _guard = TEST_LOCK.lock().unwrap();
    let port = next_port();
    let node = build_basic_node("n3", port);
    thread::spawn(move || serve_node(node));

    let mut reader = connect(port);
    send(&mut reader, "activate m");

    // The snapshot (value, status, target -- in accessibles order) arrives
    // before the "active" confirmation
    let first = recv(&mut reader);
    assert!(first.starts_with("update m:value ["), "unexpected first line: {}", first);
    let second = recv(&mut reader);
    assert!(second.starts_with("update m:status ["), "unexpected second line: {}", second);
    let third = recv(&mut reader);
    assert!(third.starts_with("update m:target ["), "unexpected third line: {}", third);
    let fourth = recv(&mut reader);
    assert_eq!(fourth, "active m");

    // A later out-of-band write to "value" is now fanned out as an update.
    Registry::update_parameter("n3:m:value", Variant::Integer(IntegerInfo { value: 9, min: 0, max: 1000 }), None, 1.0).unwrap();
    let update = recv(&mut reader);
    assert!(update.starts_with("update m:value [9,"), "unexpected update: {}", update);

    Registry::shutdown();
}

#[test]
fn malformed_line_and_bad_value_report_correct_tokens() {
    let _guard = TEST_LOCK.lock().unwrap();
    let port = next_port();
    let node = build_basic_node("n4", port);
    thread::spawn(move || serve_node(node));

    let mut reader = connect(port);

    // A line the grammar can't parse at all is a ProtocolError, not silently dropped.
    send(&mut reader, "\u{0}\u{0}\u{0}");
    let line = recv(&mut reader);
    assert!(line.contains("\"ProtocolError\""), "unexpected reply: {}", line);

    // A value that fails the target's datainfo is BadValue, not a parse-level error.
    send(&mut reader, "change m:target notanumber");
    let line = recv(&mut reader);
    assert!(line.starts_with("error_change m:target ["), "unexpected reply: {}", line);
    assert!(line.contains("\"BadValue\""), "unexpected reply: {}", line);

    Registry::shutdown();
}

#[test]
fn deferred_read_is_answered_through_the_polling_bridge() {
    let _guard = TEST_LOCK.lock().unwrap();
    let port = next_port();
    Registry::init();
    Registry::create_node("n5", "deferred test node", "127.0.0.1", port).unwrap();
    Registry::add_module("m").unwrap();
    Registry::add_property("description", json!("test module")).unwrap();
    let module = Registry::module("n5", "m").unwrap();
    // "slow" has a getter, but it never answers inline: every read is
    // handed to the polling bridge, exactly like a parameter with no
    // getter at all registered through the embedding's own dispatch.
    module.add_readable_parameter("slow", int_shape(0, 100), Box::new(|_| BackendOutcome::Pending));
    Registry::node_complete().unwrap();
    let node = Registry::node("n5").unwrap();
    thread::spawn(move || serve_node(node));

    let mut reader = connect(port);
    send(&mut reader, "read m:slow");

    // Act as the polling embedding: pull the stored action and answer it.
    let mut popped = None;
    for _ in 0..50 {
        if let Some(entry) = Registry::next_stored_action().unwrap() {
            popped = Some(entry);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let (id, kind, module_id, name) = popped.expect("action was queued");
    assert_eq!(kind, ActionKind::Read);
    assert_eq!(module_id, "m");
    assert_eq!(name, "slow");
    Registry::put_answer(id, Ok(BackendAnswer::Value {
                value: Variant::Integer(IntegerInfo { value: 55, min: 0, max: 100 }),
                sigma: None,
                timestamp: 2.0,
    })).unwrap();

    let line = recv(&mut reader);
    assert!(line.starts_with("reply m:slow [55,"), "unexpected reply: {}", line);

    Registry::shutdown();
}

#[test]
fn queue_action_coalesces_concurrent_reads() {
    // Exercises the Registry-level read-coalescing rule directly: two
    // callers queueing a Read for the same module/parameter before it is
    // answered share one `ActionEntry`, and both completion callbacks
    // fire off the single `put_answer`.
    let _guard = TEST_LOCK.lock().unwrap();
    let port = next_port();
    Registry::init();
    Registry::create_node("n6", "coalesce test node", "127.0.0.1", port).unwrap();
    Registry::add_module("m").unwrap();
    Registry::add_property("description", json!("test module")).unwrap();
    let module = Registry::module("n6", "m").unwrap();

    let first_called = Arc::new(AtomicBool::new(false));
    let second_called = Arc::new(AtomicBool::new(false));
    let first_flag = Arc::clone(&first_called);
    let second_flag = Arc::clone(&second_called);

    let id1 = Registry::queue_action("n6", module.clone(), "slow", ActionKind::Read, None,
        Box::new(move |_| first_flag.store(true, Ordering::SeqCst))).unwrap();
    let id2 = Registry::queue_action("n6", module.clone(), "slow", ActionKind::Read, None,
        Box::new(move |_| second_flag.store(true, Ordering::SeqCst))).unwrap();
    assert_eq!(id1, id2, "both reads should coalesce onto the same action id");

    Registry::put_answer(id1, Ok(BackendAnswer::Value {
                value: Variant::Integer(IntegerInfo { value: 1, min: 0, max: 1 }),
                sigma: None,
                timestamp: 0.0,
    })).unwrap();

    assert!(first_called.load(Ordering::SeqCst));
    assert!(second_called.load(Ordering::SeqCst));

    Registry::shutdown();
}

#[test]
fn timed_out_action_reports_communication_failed() {
    // The real sweeper only expires entries after 60s; this
    // drives the same client-visible delivery path `put_answer` uses once
    // the sweeper decides an entry has expired, without waiting on it.
    let _guard = TEST_LOCK.lock().unwrap();
    let port = next_port();
    Registry::init();
    Registry::create_node("n7", "timeout test node", "127.0.0.1", port).unwrap();
    Registry::add_module("m").unwrap();
    Registry::add_property("description", json!("test module")).unwrap();
    let module = Registry::module("n7", "m").unwrap();
    module.add_readable_parameter("slow", int_shape(0, 100), Box::new(|_| BackendOutcome::Pending));
    Registry::node_complete().unwrap();
    let node = Registry::node("n7").unwrap();
    thread::spawn(move || serve_node(node));

    let mut reader = connect(port);
    send(&mut reader, "read m:slow");

    let mut popped = None;
    for _ in 0..50 {
        if let Some(entry) = Registry::next_stored_action().unwrap() {
            popped = Some(entry);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let (id, ..) = popped.expect("action was queued");
    Registry::put_answer(id, Err(Error::timeout())).unwrap();

    let line = recv(&mut reader);
    assert!(line.starts_with("error_read m:slow ["), "unexpected reply: {}", line);
    assert!(line.contains("\"CommunicationFailed\""), "unexpected reply: {}", line);

    Registry::shutdown();
}
