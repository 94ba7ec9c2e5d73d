//! The worker side of a readiness event: read, respond, re-arm.

use super::connection::{Connection, ReadOutcome};
use super::ServerContext;
use crate::http::{request, ParseResult, Response};
use crate::util::now_millis;
use bytes::Buf;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};

/// Most bytes buffered for one connection before parsing.
const READ_LIMIT: usize = request::MAX_HEAD_LEN + request::MAX_BODY_LEN;

#[derive(Debug, PartialEq, Eq)]
enum Next {
    Rearm,
    Close,
}

/// Serve everything the connection has buffered. Runs on a pool worker
/// while the connection is disarmed.
pub(crate) fn serve(ctx: &ServerContext, conn: Arc<Connection>) {
    let token = conn.token();
    let next = match process(ctx, &conn) {
        Ok(next) => next,
        Err(e) => {
            debug!(token = token.0, error = %e, "Connection error");
            Next::Close
        }
    };
    conn.touch(now_millis());
    conn.set_in_flight(false);

    match next {
        Next::Rearm => {
            if let Err(e) = conn.arm() {
                debug!(token = token.0, error = %e, "Failed to re-arm connection");
                close(ctx, &conn);
            }
        }
        Next::Close => close(ctx, &conn),
    }
}

fn close(ctx: &ServerContext, conn: &Connection) {
    if !ctx.timers.close(conn.token()) {
        conn.close();
    }
}

fn process(ctx: &ServerContext, conn: &Connection) -> io::Result<Next> {
    let mut pending = conn.pending();
    let outcome = conn.read_available(&mut pending, READ_LIMIT)?;
    let eof = outcome == ReadOutcome::Eof;

    loop {
        match request::parse(&pending) {
            ParseResult::Complete(req, consumed) => {
                pending.advance(consumed);
                trace!(token = conn.token().0, method = ?req.method, path = %req.path, "Request");

                let response = ctx.service.respond(&req);
                let keep_alive = req.keep_alive() && !eof;
                conn.write_all(&response.encode(keep_alive), ctx.settings.write_timeout)?;
                if !keep_alive {
                    return Ok(Next::Close);
                }
            }
            ParseResult::Incomplete => break,
            ParseResult::Error => {
                debug!(token = conn.token().0, "Malformed request");
                let _ = conn.write_all(&Response::error(400).encode(false), ctx.settings.write_timeout);
                return Ok(Next::Close);
            }
        }
    }

    Ok(if eof { Next::Close } else { Next::Rearm })
}
