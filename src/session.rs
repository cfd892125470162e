//! Session: owns the two stream interfaces and buffer pair for one client
//! connection, grounded on `include/types/session.h`'s `struct session`.

use crate::buffer::Buffer;
use crate::lb::ServerId;
use crate::stream_interface::StreamInterface;
use crate::time::Tick;

#[derive(Debug, Default, Copy, Clone)]
pub struct SessionFlags {
    pub direct: bool,
    pub assigned: bool,
    pub backend_assigned: bool,
    pub address_set: bool,
}

/// Why a session ended, recorded alongside the stream interfaces' final
/// state letters in the term trace.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TerminationReason {
    ClientTimeout,
    ClientClosed,
    ServerTimeout,
    ServerClosed,
    ProxyCondition,
    Resource,
    Internal,
    BackendDown,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct SessionTiming {
    pub accept: Option<Tick>,
    pub request: Option<Tick>,
    pub connect: Option<Tick>,
    pub first_byte: Option<Tick>,
    pub close: Option<Tick>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// A single client connection: two stream interfaces (client side, server
/// side) each with their own buffer, a possibly-assigned server, and the
/// bookkeeping needed to emit a log line and a term trace on close.
pub struct Session {
    pub flags: SessionFlags,
    pub client: StreamInterface,
    pub server: StreamInterface,
    pub request_buf: Buffer,
    pub response_buf: Buffer,
    pub assigned_server: Option<ServerId>,
    pub timing: SessionTiming,
    pub termination: Option<TerminationReason>,
}

impl Session {
    pub fn new(buffer_capacity: usize, now: Tick) -> Session {
        Session {
            flags: SessionFlags::default(),
            client: StreamInterface::new(),
            server: StreamInterface::new(),
            request_buf: Buffer::with_capacity(buffer_capacity),
            response_buf: Buffer::with_capacity(buffer_capacity),
            assigned_server: None,
            timing: SessionTiming {
                accept: Some(now),
                ..SessionTiming::default()
            },
            termination: None,
        }
    }

    pub fn assign_server(&mut self, server: ServerId) {
        self.assigned_server = Some(server);
        self.flags.backend_assigned = true;
        self.server.request_connection();
        self.server.assign(server);
    }

    /// Both sides have closed: the session is done and may be reclaimed.
    pub fn is_finished(&self) -> bool {
        self.client.is_closed() && self.server.is_closed()
    }

    /// Term-trace string, e.g. `"HH--"`-style in the original; here just the
    /// two stream interfaces' final-state letters.
    pub fn term_trace(&self) -> [char; 2] {
        [self.client.state.final_state_letter(), self.server.state.final_state_letter()]
    }

    pub fn terminate(&mut self, reason: TerminationReason, now: Tick) {
        self.termination = Some(reason);
        self.timing.close = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::ServerId;

    #[test]
    fn new_session_has_accept_tick_and_is_not_finished() {
        let now = Tick::from_millis(1000);
        let s = Session::new(4096, now);
        assert_eq!(s.timing.accept, Some(now));
        assert!(s.timing.close.is_none());
        assert!(!s.is_finished());
    }

    #[test]
    fn assign_server_sets_flag_and_stream_target() {
        let mut s = Session::new(4096, Tick::from_millis(0));
        s.client.request_connection();
        s.assign_server(ServerId(3));
        assert_eq!(s.assigned_server, Some(ServerId(3)));
        assert!(s.flags.backend_assigned);
        assert_eq!(s.server.target, crate::stream_interface::SiTarget::Server(ServerId(3)));
    }

    #[test]
    fn is_finished_requires_both_sides_closed() {
        let mut s = Session::new(4096, Tick::from_millis(0));
        assert!(!s.is_finished());
        s.client.close();
        assert!(!s.is_finished());
        s.server.close();
        assert!(s.is_finished());
    }

    #[test]
    fn term_trace_reflects_each_side_final_letter() {
        let mut s = Session::new(4096, Tick::from_millis(0));
        s.client.close();
        assert_eq!(s.term_trace(), ['L', 'R']);
    }

    #[test]
    fn terminate_records_reason_and_close_tick() {
        let mut s = Session::new(4096, Tick::from_millis(0));
        let close_at = Tick::from_millis(500);
        s.terminate(TerminationReason::ClientTimeout, close_at);
        assert_eq!(s.termination, Some(TerminationReason::ClientTimeout));
        assert_eq!(s.timing.close, Some(close_at));
    }
}
