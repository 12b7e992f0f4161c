//! Accept loop, command dispatch, and reply emission.
//!
//! The server owns the engine, the listening socket, the connection
//! registry, and the store. Its dispatch callback is the engine's single
//! registered completion handler, keyed on `IoKind`.

use crate::config::PORT;
use crate::connection::{Connection, ConnectionRegistry};
use crate::resp::{self, ParseItem};
use crate::runtime::engine::{Engine, IoKind, IoResult, OpKind};
use crate::signal;
use crate::store::Store;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, info, warn};

/// Outcome of parsing and dispatching one frame.
enum ProcessOutcome {
    /// `conn.reply_buf` holds an encoded reply; write it out.
    Reply,
    /// Parsed successfully but this frame shape produces no wire reply.
    NoReply,
    /// The frame failed to parse. Carries the RESP error message to send
    /// back before closing this connection only.
    ProtocolError(String),
}

/// The server singleton: engine, listening socket, connections, store.
pub struct Server {
    engine: Engine,
    listener: socket2::Socket,
    connections: ConnectionRegistry,
    store: Store,
}

impl Server {
    /// Bind `[::]:6379` dual-stack with `SO_REUSEPORT` and construct the
    /// engine. Does not yet submit the first accept or start the loop.
    pub fn bind() -> Result<Self, crate::error::RingError> {
        let engine = Engine::new()?;

        let addr: SocketAddr = format!("[::]:{PORT}")
            .parse()
            .expect("static listen address is well-formed");

        let listener = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        listener.set_only_v6(false)?;
        listener.set_reuse_address(true)?;
        listener.set_reuse_port(true)?;
        listener.set_nonblocking(true)?;
        listener.bind(&addr.into())?;
        listener.listen(1024)?;

        info!(address = %addr, "listening");

        Ok(Self {
            engine,
            listener,
            connections: ConnectionRegistry::new(),
            store: Store::new(),
        })
    }

    /// Install signal handlers, arm the first accept, and run the event
    /// loop until the running flag is cleared.
    pub fn run(self) -> io::Result<()> {
        signal::install()?;

        let Server {
            mut engine,
            listener,
            mut connections,
            mut store,
        } = self;

        let listen_fd = listener.as_raw_fd();
        engine.accept(listen_fd)?;

        engine.enter(move |engine, op, result| {
            dispatch(engine, listen_fd, &mut connections, &mut store, op, result)
        })
    }
}

/// The single dispatch entry point, keyed on the completed op's kind.
fn dispatch(
    engine: &mut Engine,
    listen_fd: RawFd,
    connections: &mut ConnectionRegistry,
    store: &mut Store,
    op: OpKind,
    result: IoResult,
) -> io::Result<()> {
    match op.kind() {
        IoKind::Accept => {
            // Always re-arm accept, regardless of this completion's outcome.
            engine.accept(listen_fd)?;

            if result.res < 0 {
                warn!(error = %result.errno().unwrap(), "accept failed");
                return Ok(());
            }

            let fd = result.res as RawFd;
            let conn_id = connections.insert(Connection::new(fd));
            debug!(conn_id, fd, "accepted connection");
            engine.recv(conn_id, fd)?;
        }

        IoKind::Recv => {
            let conn_id = op.conn_id().expect("recv op always carries a conn_id");

            if result.res < 0 {
                // Abandon the connection; see the open question this
                // resolves in the design notes.
                warn!(conn_id, error = %result.errno().unwrap(), "recv failed, abandoning connection");
                return Ok(());
            }

            if result.res == 0 {
                if let Some(conn) = connections.get(conn_id) {
                    engine.close(conn_id, conn.fd)?;
                }
                return Ok(());
            }

            let data = result.buf.unwrap_or(&[]);
            let outcome = {
                let conn = match connections.get_mut(conn_id) {
                    Some(c) => c,
                    None => return Ok(()),
                };
                process(conn, store, data)
            };

            let conn = match connections.get(conn_id) {
                Some(c) => c,
                None => return Ok(()),
            };

            match outcome {
                ProcessOutcome::Reply => {
                    engine.write(conn_id, conn.fd, &conn.reply_buf, 0)?;
                    engine.recv(conn_id, conn.fd)?;
                }
                ProcessOutcome::NoReply => {
                    engine.recv(conn_id, conn.fd)?;
                }
                ProcessOutcome::ProtocolError(msg) => {
                    warn!(conn_id, %msg, "protocol error, closing connection");
                    engine.write(conn_id, conn.fd, &conn.reply_buf, 0)?;
                    engine.close(conn_id, conn.fd)?;
                }
            }
        }

        IoKind::Close => {
            if let Some(conn_id) = op.conn_id() {
                if connections.remove(conn_id).is_some() {
                    debug!(conn_id, "connection closed");
                }
            }
        }

        IoKind::Write | IoKind::Read | IoKind::Nop => {
            if result.is_err() {
                if let Some(err) = result.errno() {
                    warn!(kind = ?op.kind(), error = %err, "operation failed");
                }
            }
        }
    }

    Ok(())
}

/// Parse one frame from `data` and dispatch it against `store`, writing
/// any reply into `conn.reply_buf`.
fn process(conn: &mut Connection, store: &mut Store, data: &[u8]) -> ProcessOutcome {
    conn.reply_buf.clear();

    let item = match resp::parse(data) {
        Ok((item, _consumed)) => item,
        Err(e) => {
            resp::encode_error(&mut conn.reply_buf, &format!("ERR {e}"));
            return ProcessOutcome::ProtocolError(e.0.to_string());
        }
    };

    match &item {
        ParseItem::String(s) if s.starts_with(b"PING") => {
            resp::encode_simple(&mut conn.reply_buf, b"PONG");
            ProcessOutcome::Reply
        }
        ParseItem::List(items) if !items.is_empty() => dispatch_command(conn, store, items),
        _ => ProcessOutcome::NoReply,
    }
}

fn dispatch_command(conn: &mut Connection, store: &mut Store, items: &[ParseItem]) -> ProcessOutcome {
    let cmd = match as_bytes(&items[0]) {
        Some(b) => b,
        None => return ProcessOutcome::NoReply,
    };

    match cmd {
        b"PING" => {
            resp::encode_simple(&mut conn.reply_buf, b"PONG");
            ProcessOutcome::Reply
        }
        b"CLIENT" => {
            if items.len() >= 3 {
                if let Some(sub) = as_bytes(&items[1]) {
                    if sub == b"SETNAME" {
                        if let Some(name) = as_bytes(&items[2]) {
                            conn.client_name = Some(String::from_utf8_lossy(name).into_owned());
                        }
                    } else if sub == b"SETINFO" {
                        if let Some(value) = as_bytes(&items[2]) {
                            conn.client_version = Some(String::from_utf8_lossy(value).into_owned());
                        }
                    }
                }
            }
            resp::encode_simple(&mut conn.reply_buf, b"OK");
            ProcessOutcome::Reply
        }
        b"SET" if items.len() >= 3 => {
            match (as_bytes(&items[1]), as_bytes(&items[2])) {
                (Some(key), Some(value)) => {
                    store.set(key, value);
                    resp::encode_simple(&mut conn.reply_buf, b"OK");
                }
                _ => resp::encode_simple(&mut conn.reply_buf, b"OK"),
            }
            ProcessOutcome::Reply
        }
        b"GET" if items.len() >= 2 => {
            match as_bytes(&items[1]) {
                Some(key) => match store.get(key) {
                    Some(value) => resp::encode_bulk(&mut conn.reply_buf, value),
                    None => resp::encode_nil(&mut conn.reply_buf),
                },
                None => resp::encode_nil(&mut conn.reply_buf),
            }
            ProcessOutcome::Reply
        }
        b"DEL" if items.len() >= 2 => {
            let keys: Vec<&[u8]> = items[1..].iter().filter_map(as_bytes).collect();
            let n = store.del(&keys);
            resp::encode_integer(&mut conn.reply_buf, n);
            ProcessOutcome::Reply
        }
        b"EXISTS" if items.len() >= 2 => {
            let keys: Vec<&[u8]> = items[1..].iter().filter_map(as_bytes).collect();
            let n = store.exists(&keys);
            resp::encode_integer(&mut conn.reply_buf, n);
            ProcessOutcome::Reply
        }
        b"COMMAND" => {
            resp::encode_empty_array(&mut conn.reply_buf);
            ProcessOutcome::Reply
        }
        _ => {
            resp::encode_simple(&mut conn.reply_buf, b"OK");
            ProcessOutcome::Reply
        }
    }
}

fn as_bytes<'a>(item: &ParseItem<'a>) -> Option<&'a [u8]> {
    match item {
        ParseItem::String(s) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_conn() -> Connection {
        Connection::new(-1)
    }

    #[test]
    fn inline_ping_replies_pong() {
        let mut conn = new_conn();
        let mut store = Store::new();
        let outcome = process(&mut conn, &mut store, b"+PING\r\n");
        assert!(matches!(outcome, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b"+PONG\r\n");
    }

    #[test]
    fn array_ping_replies_pong() {
        let mut conn = new_conn();
        let mut store = Store::new();
        let outcome = process(&mut conn, &mut store, b"*1\r\n$4\r\nPING\r\n");
        assert!(matches!(outcome, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b"+PONG\r\n");
    }

    #[test]
    fn set_then_get_roundtrip() {
        let mut conn = new_conn();
        let mut store = Store::new();

        let set_outcome = process(
            &mut conn,
            &mut store,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
        );
        assert!(matches!(set_outcome, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b"+OK\r\n");

        let get_outcome = process(&mut conn, &mut store, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert!(matches!(get_outcome, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b"$3\r\nbar\r\n");
    }

    #[test]
    fn get_before_set_replies_nil() {
        let mut conn = new_conn();
        let mut store = Store::new();
        process(&mut conn, &mut store, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert_eq!(&conn.reply_buf[..], b"$-1\r\n");
    }

    #[test]
    fn client_setname_replies_ok_and_records_name() {
        let mut conn = new_conn();
        let mut store = Store::new();
        let outcome = process(
            &mut conn,
            &mut store,
            b"*3\r\n$6\r\nCLIENT\r\n$7\r\nSETNAME\r\n$3\r\nfoo\r\n",
        );
        assert!(matches!(outcome, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b"+OK\r\n");
        assert_eq!(conn.client_name.as_deref(), Some("foo"));
    }

    #[test]
    fn client_setname_two_arg_form_replies_ok() {
        let mut conn = new_conn();
        let mut store = Store::new();
        let outcome = process(&mut conn, &mut store, b"*2\r\n$6\r\nCLIENT\r\n$7\r\nSETNAME\r\n");
        assert!(matches!(outcome, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b"+OK\r\n");
    }

    #[test]
    fn unknown_command_replies_ok() {
        let mut conn = new_conn();
        let mut store = Store::new();
        let outcome = process(&mut conn, &mut store, b"*1\r\n$4\r\nNOPE\r\n");
        assert!(matches!(outcome, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b"+OK\r\n");
    }

    #[test]
    fn del_and_exists_report_counts() {
        let mut conn = new_conn();
        let mut store = Store::new();
        process(&mut conn, &mut store, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");

        let exists = process(&mut conn, &mut store, b"*3\r\n$6\r\nEXISTS\r\n$1\r\na\r\n$1\r\nb\r\n");
        assert!(matches!(exists, ProcessOutcome::Reply));
        assert_eq!(&conn.reply_buf[..], b":1\r\n");

        let del = process(&mut conn, &mut store, b"*2\r\n$3\r\nDEL\r\n$1\r\na\r\n");
        assert_eq!(&conn.reply_buf[..], b":1\r\n");
        let _ = del;
    }

    #[test]
    fn a_bare_integer_frame_produces_no_reply() {
        let mut conn = new_conn();
        let mut store = Store::new();
        let outcome = process(&mut conn, &mut store, b":5\r\n");
        assert!(matches!(outcome, ProcessOutcome::NoReply));
        assert!(conn.reply_buf.is_empty());
    }

    #[test]
    fn malformed_input_produces_a_protocol_error_reply() {
        let mut conn = new_conn();
        let mut store = Store::new();
        let outcome = process(&mut conn, &mut store, b"$5\r\nabXXX");
        assert!(matches!(outcome, ProcessOutcome::ProtocolError(_)));
        assert!(conn.reply_buf.starts_with(b"-ERR "));
    }
}
