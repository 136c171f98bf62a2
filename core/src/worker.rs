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
//! Per-connection session: line framing, dispatch, activation tracking,
//! and the deferred-retry queue.

use std::collections::{HashSet, VecDeque};
use std::io::{BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{tick, unbounded, Sender};
use log::{debug, info, warn};
use memchr::memchr;
use mlzutil::time::localtime;
use parking_lot::Mutex;
use serde_json::json;

use crate::backend::{ActionKind, BackendAnswer};
use crate::errors::Error;
use crate::module::{Dispatch, Module};
use crate::node::Node;
use crate::proto::Msg;
use crate::registry::Registry;

const RECVBUF_LEN: usize = 4096;
const MAX_MSG_LEN: usize = 1024 * 1024;
/// Worker retry-timer period for colliding read/change requests.
const RETRY_PERIOD: Duration = Duration::from_millis(50);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

struct TodoEntry {
    kind: ActionKind,
    module: Arc<Module>,
    name: String,
    raw: String,
    verb: &'static str,
    spec: String,
}

pub struct Worker {
    id: u64,
    node: Arc<Node>,
    out_tx: Sender<String>,
    activated: Mutex<HashSet<String>>,
    todo: Mutex<VecDeque<TodoEntry>>,
}

/// Bind a node's TCP port and accept connections, one `Worker` per client.
pub fn serve_node(node: Arc<Node>) -> std::io::Result<()> {
    let addr = format!("{}:{}", node.bind_addr(), node.port());
    let listener = std::net::TcpListener::bind(&addr)?;
    info!("node {:?} listening on {}", node.id(), addr);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let node = Arc::clone(&node);
                thread::spawn(move || handle_connection(node, stream));
            }
            Err(err) => warn!("accept error: {}", err),
        }
    }
    Ok(())
}

fn handle_connection(node: Arc<Node>, stream: TcpStream) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".into());
    mlzlog::set_thread_prefix(format!("[{}] ", peer));

    let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
    let (out_tx, out_rx) = unbounded::<String>();

    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!("could not clone socket: {}", err);
            return;
        }
    };
    let writer_name = peer.clone();
    thread::spawn(move || {
            mlzlog::set_thread_prefix(format!("[{}] ", writer_name));
            let mut w = BufWriter::new(write_stream);
            for line in out_rx {
                if let Err(err) = writeln!(w, "{}", line) {
                    warn!("write error: {}", err);
                    break;
                }
                let _ = w.flush();
            }
    });

    let worker = Arc::new(Worker {
            id,
            node,
            out_tx,
            activated: Mutex::new(HashSet::new()),
            todo: Mutex::new(VecDeque::new()),
    });

    let retry_worker = Arc::clone(&worker);
    let retry_ticker = tick(RETRY_PERIOD);
    let retry_handle = thread::spawn(move || {
            for _ in retry_ticker {
                if Arc::strong_count(&retry_worker) <= 1 {
                    break;
                }
                retry_worker.retry_todo();
            }
    });

    run_read_loop(&worker, stream);

    // Disconnect: unsubscribe from everything, drop the todo queue outright.
    for module_id in worker.activated.lock().drain() {
        if let Some(module) = worker.node.module(&module_id) {
            module.unsubscribe(worker.id);
        }
    }
    worker.todo.lock().clear();
    drop(worker);
    let _ = retry_handle.join();
    info!("connection from {} closed", peer);
}

fn run_read_loop(worker: &Arc<Worker>, mut stream: TcpStream) {
    let mut buf = Vec::with_capacity(RECVBUF_LEN);
    let mut recvbuf = [0u8; RECVBUF_LEN];
    loop {
        let got = match stream.read(&mut recvbuf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("read error, closing connection: {}", err);
                break;
            }
        };
        buf.extend_from_slice(&recvbuf[..got]);
        let mut from = 0;
        while let Some(to) = memchr(b'\n', &buf[from..]) {
            let line = String::from_utf8_lossy(&buf[from..from + to]);
            let line = line.trim_end_matches('\r');
            worker.process(line);
            from += to + 1;
        }
        buf.drain(..from);
        if buf.len() > MAX_MSG_LEN {
            warn!("line too long, closing connection");
            break;
        }
    }
}

impl Worker {
    fn send(&self, msg: Msg) {
        let _ = self.out_tx.send(msg.to_string());
    }

    fn process(&self, line: &str) {
        debug!("< {}", line);
        match Msg::parse(line) {
            Ok(crate::proto::IncomingMsg(_, msg)) => self.dispatch(msg),
            Err(err_msg) => self.send(err_msg),
        }
    }

    fn dispatch(&self, msg: Msg) {
        match msg {
            Msg::Idn => self.send(Msg::IdnReply),
            Msg::Help => self.send(Msg::Help),
            Msg::Ping { token } => self.send(Msg::Pong { token, data: json!([null, {"t": localtime()}]) }),
            Msg::Describe => match self.node.descriptor() {
                Some(structure) => self.send(Msg::Describing { id: ".".into(), structure }),
                None => self.send(Error::not_initialized().into_msg("describe", ".".into())),
            },
            Msg::Activate { module } => self.activate(module),
            Msg::Deactivate { module } => self.deactivate(module),
            Msg::Read { module, param } => self.start_read(module, param),
            Msg::Change { module, param, value } => self.start_change(module, param, value),
            Msg::Do { module, command, arg } => self.start_do(module, command, arg),
            other => warn!("message should not arrive here: {}", other),
        }
    }

    fn modules_for(&self, module: &str) -> Vec<Arc<Module>> {
        if module.is_empty() {
            self.node.modules()
        } else {
            self.node.module(module).into_iter().collect()
        }
    }

    fn activate(&self, module: String) {
        let targets = self.modules_for(&module);
        if targets.is_empty() && !module.is_empty() {
            self.send(Error::no_module().into_msg("activate", module));
            return;
        }
        for m in &targets {
            for (name, payload) in m.activate_snapshot() {
                self.send(Msg::Update { module: m.id().to_owned(), param: name, data: payload });
            }
            m.subscribe(self.id, self.out_tx.clone());
            self.activated.lock().insert(m.id().to_owned());
        }
        self.send(Msg::Active { module });
    }

    fn deactivate(&self, module: String) {
        let targets = self.modules_for(&module);
        for m in &targets {
            m.unsubscribe(self.id);
            self.activated.lock().remove(m.id());
        }
        self.send(Msg::Inactive { module });
    }

    fn start_read(&self, module: String, param: String) {
        let spec = format!("{}:{}", module, param);
        let m = match self.node.module(&module) {
            Some(m) => m,
            None => return self.send(Error::no_module().into_msg("read", spec)),
        };
        if !m.has_parameter(&param) {
            return self.send(Error::no_param().into_msg("read", spec));
        }
        if m.begin_request(&param).is_none() {
            self.todo.lock().push_back(TodoEntry {
                    kind: ActionKind::Read, module: m, name: param, raw: String::new(),
                    verb: "read", spec,
            });
            return;
        }
        match m.dispatch_read(&param) {
            Ok(Dispatch::Ready(result)) => {
                m.end_request(&param);
                self.finish_read(&m, &param, &spec, result);
            }
            Ok(Dispatch::Queue) => self.queue(m, param, ActionKind::Read, None, "read", spec),
            Err(e) => {
                m.end_request(&param);
                self.send(e.into_msg("read", spec));
            }
        }
    }

    fn start_change(&self, module: String, param: String, value: String) {
        let spec = format!("{}:{}", module, param);
        let m = match self.node.module(&module) {
            Some(m) => m,
            None => return self.send(Error::no_module().into_msg("change", spec)),
        };
        if !m.has_parameter(&param) {
            return self.send(Error::no_param().into_msg("change", spec));
        }
        if m.begin_request(&param).is_none() {
            self.todo.lock().push_back(TodoEntry {
                    kind: ActionKind::Change, module: m, name: param, raw: value,
                    verb: "change", spec,
            });
            return;
        }
        match m.dispatch_change(&param, &value) {
            Ok(Dispatch::Ready(result)) => {
                m.end_request(&param);
                self.finish_change(&m, &param, &spec, result);
            }
            Ok(Dispatch::Queue) => {
                let payload = m.parameter_shape(&param).and_then(|s| s.import_secop(&value).ok());
                self.queue(m, param, ActionKind::Change, payload, "change", spec);
            }
            Err(e) => {
                m.end_request(&param);
                self.send(e.into_msg("change", spec));
            }
        }
    }

    fn start_do(&self, module: String, command: String, arg: String) {
        let spec = format!("{}:{}", module, command);
        let m = match self.node.module(&module) {
            Some(m) => m,
            None => return self.send(Error::no_module().into_msg("do", spec)),
        };
        if !m.has_command(&command) {
            return self.send(Error::no_command().into_msg("do", spec));
        }
        // Commands never defer: a collision replies CommandRunning immediately.
        if m.begin_request(&command).is_none() {
            return self.send(Error::command_running().into_msg("do", spec));
        }
        match m.dispatch_do(&command, &arg) {
            Ok(Dispatch::Ready(result)) => {
                m.end_request(&command);
                match result {
                    Ok(BackendAnswer::Done { result, timestamp: _ }) => {
                        self.send(Msg::Done { module, command, data: json!([result.export_json(), {}]) });
                    }
                    Ok(BackendAnswer::Value {.. }) => unreachable!("do never yields a bare value"),
                    Err(e) => self.send(e.into_msg("do", spec)),
                }
            }
            Ok(Dispatch::Queue) => {
                let payload = m.command_shapes(&command).and_then(|(arg_ty, _)| arg_ty.import_secop(&arg).ok());
                self.queue(m, command, ActionKind::Do, payload, "do", spec);
            }
            Err(e) => {
                m.end_request(&command);
                self.send(e.into_msg("do", spec));
            }
        }
    }

    fn finish_read(&self, m: &Arc<Module>, param: &str, spec: &str, result: Result<BackendAnswer, Error>) {
        match result {
            Ok(BackendAnswer::Value { value, sigma, timestamp }) => {
                let payload = m.apply_value(param, value, sigma, timestamp);
                m.fan_out(param, payload.clone(), None);
                self.send(Msg::Reply { module: m.id().to_owned(), param: param.to_owned(), data: payload });
            }
            Ok(BackendAnswer::Done {.. }) => unreachable!("read never yields Done"),
            Err(e) => self.send(e.into_msg("read", spec.to_owned())),
        }
    }

    fn finish_change(&self, m: &Arc<Module>, param: &str, spec: &str, result: Result<BackendAnswer, Error>) {
        match result {
            Ok(BackendAnswer::Value { value, sigma, timestamp }) => {
                let payload = m.apply_value(param, value, sigma, timestamp);
                m.fan_out(param, payload.clone(), None);
                self.send(Msg::Changed { module: m.id().to_owned(), param: param.to_owned(), data: payload });
            }
            Ok(BackendAnswer::Done {.. }) => unreachable!("change never yields Done"),
            Err(e) => self.send(e.into_msg("change", spec.to_owned())),
        }
    }

    fn queue(&self, m: Arc<Module>, name: String, kind: ActionKind, payload: Option<crate::variant::Variant>, verb: &'static str, spec: String) {
        let out_tx = self.out_tx.clone();
        let module = m.clone();
        let module_for_err = m.clone();
        let name_for_closure = name.clone();
        let spec_for_closure = spec.clone();
        let result = Registry::queue_action(
            self.node.id(), m, &name, kind, payload,
            Box::new(move |answer| {
                    let line = match (kind, answer) {
                        (ActionKind::Read, Ok(BackendAnswer::Value { value, sigma, timestamp })) => {
                            let payload = module.apply_value(&name_for_closure, value, sigma, timestamp);
                            module.fan_out(&name_for_closure, payload.clone(), None);
                            Msg::Reply { module: module.id().to_owned(), param: name_for_closure.clone(), data: payload }.to_string()
                        }
                        (ActionKind::Change, Ok(BackendAnswer::Value { value, sigma, timestamp })) => {
                            let payload = module.apply_value(&name_for_closure, value, sigma, timestamp);
                            module.fan_out(&name_for_closure, payload.clone(), None);
                            Msg::Changed { module: module.id().to_owned(), param: name_for_closure.clone(), data: payload }.to_string()
                        }
                        (ActionKind::Do, Ok(BackendAnswer::Done { result, .. })) => {
                            Msg::Done { module: module.id().to_owned(), command: name_for_closure.clone(), data: json!([result.export_json(), {}]) }.to_string()
                        }
                        (_, Err(e)) => e.into_msg(verb, spec_for_closure.clone()).to_string(),
                        _ => return,
                    };
                    let _ = out_tx.send(line);
            }),
        );
        if let Err(e) = result {
            module_for_err.end_request(&name);
            self.send(e.into_msg(verb, spec));
        }
    }

    /// Re-attempt deferred requests whose parameter/command has since
    /// become free.
    fn retry_todo(&self) {
        let mut still_todo = VecDeque::new();
        let mut ready = Vec::new();
        {
            let mut todo = self.todo.lock();
            while let Some(entry) = todo.pop_front() {
                if entry.module.begin_request(&entry.name).is_some() {
                    ready.push(entry);
                } else {
                    still_todo.push_back(entry);
                }
            }
            *todo = still_todo;
        }
        for entry in ready {
            match entry.kind {
                ActionKind::Read => match entry.module.dispatch_read(&entry.name) {
                    Ok(Dispatch::Ready(result)) => {
                        entry.module.end_request(&entry.name);
                        self.finish_read(&entry.module, &entry.name, &entry.spec, result);
                    }
                    Ok(Dispatch::Queue) => self.queue(entry.module, entry.name, ActionKind::Read, None, entry.verb, entry.spec),
                    Err(e) => {
                        entry.module.end_request(&entry.name);
                        self.send(e.into_msg(entry.verb, entry.spec));
                    }
                },
                ActionKind::Change => match entry.module.dispatch_change(&entry.name, &entry.raw) {
                    Ok(Dispatch::Ready(result)) => {
                        entry.module.end_request(&entry.name);
                        self.finish_change(&entry.module, &entry.name, &entry.spec, result);
                    }
                    Ok(Dispatch::Queue) => {
                        let payload = entry.module.parameter_shape(&entry.name).and_then(|s| s.import_secop(&entry.raw).ok());
                        self.queue(entry.module, entry.name, ActionKind::Change, payload, entry.verb, entry.spec);
                    }
                    Err(e) => {
                        entry.module.end_request(&entry.name);
                        self.send(e.into_msg(entry.verb, entry.spec));
                    }
                },
                ActionKind::Do => unreachable!("do requests never defer"),
            }
        }
    }
}

