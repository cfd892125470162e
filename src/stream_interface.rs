//! Stream interface sub-state machine, per one side (client or server) of a
//! session. The original calls this `struct stream_interface`
//! (`include/types/stream_interface.h`) and drives it from the analysers and
//! the connector.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::SiErrorKind;
use crate::lb::ServerId;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiState {
    Ini,
    Req,
    Que,
    Tar,
    Ass,
    Con,
    Cer,
    Est,
    Dis,
    Clo,
}

impl SiState {
    /// The single-letter final-state code recorded in the term trace. Only
    /// seven letters are ever emitted (R/C/H/D/L/Q/T); states with no turn-in
    /// of their own collapse into the nearest one: INI reads as R (no request
    /// issued yet), ASS and CON both read as C alongside CER.
    pub fn final_state_letter(self) -> char {
        match self {
            SiState::Ini => 'R',
            SiState::Req => 'R',
            SiState::Que => 'Q',
            SiState::Tar => 'T',
            SiState::Ass => 'C',
            SiState::Con => 'C',
            SiState::Cer => 'C',
            SiState::Est => 'H',
            SiState::Dis => 'D',
            SiState::Clo => 'L',
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiTarget {
    None,
    Proxy,
    Server(ServerId),
    Applet,
    Task,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SiFlags {
    pub expired: bool,
    pub error: bool,
    pub wait_for_room: bool,
    pub wait_for_data: bool,
    pub splice_capable: bool,
    pub dont_wake: bool,
    pub independent_streams: bool,
    pub no_linger: bool,
}

/// 2-bit source-binding capability: bit 0 = use remote address, bit 1 = use
/// remote port.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SourceBind(u8);

impl SourceBind {
    pub const IGNORE: SourceBind = SourceBind(0);
    pub const ADDRESS_ONLY: SourceBind = SourceBind(1);
    pub const PORT_ONLY: SourceBind = SourceBind(2);
    pub const BOTH: SourceBind = SourceBind(3);

    pub fn use_remote_address(self) -> bool {
        self.0 & 0b01 != 0
    }

    pub fn use_remote_port(self) -> bool {
        self.0 & 0b10 != 0
    }
}

pub struct StreamInterface {
    pub state: SiState,
    pub flags: SiFlags,
    pub error: Option<SiErrorKind>,
    pub fd: Option<RawFd>,
    pub target: SiTarget,
    pub remote_addr: Option<SocketAddr>,
    pub source_bind: SourceBind,
    pub connect_retries_left: u8,
}

impl StreamInterface {
    pub fn new() -> StreamInterface {
        StreamInterface {
            state: SiState::Ini,
            flags: SiFlags::default(),
            error: None,
            fd: None,
            target: SiTarget::None,
            remote_addr: None,
            source_bind: SourceBind::IGNORE,
            connect_retries_left: 3,
        }
    }

    fn set_error(&mut self, kind: SiErrorKind) {
        self.error = Some(kind);
        self.flags.error = true;
    }

    /// `INI -> REQ`: the session wants a backend connection.
    pub fn request_connection(&mut self) {
        debug_assert_eq!(self.state, SiState::Ini);
        self.state = SiState::Req;
    }

    /// `REQ -> QUE`: the load balancer found nothing, queue capacity exists.
    pub fn enqueue(&mut self) {
        debug_assert_eq!(self.state, SiState::Req);
        self.state = SiState::Que;
    }

    /// `REQ -> ASS` or `QUE -> ASS`: a server was selected.
    pub fn assign(&mut self, server: ServerId) {
        debug_assert!(matches!(self.state, SiState::Req | SiState::Que | SiState::Tar));
        self.target = SiTarget::Server(server);
        self.state = SiState::Ass;
    }

    /// `QUE -> CLO` on queue timeout/error/abort.
    pub fn queue_failed(&mut self, kind: SiErrorKind) {
        debug_assert_eq!(self.state, SiState::Que);
        self.set_error(kind);
        self.state = SiState::Clo;
    }

    /// `ASS -> CON`: the outbound connector issued `connect()`.
    pub fn connecting(&mut self, fd: RawFd) {
        debug_assert_eq!(self.state, SiState::Ass);
        self.fd = Some(fd);
        self.state = SiState::Con;
    }

    /// `CON -> EST`: connect completed successfully.
    pub fn established(&mut self) {
        debug_assert_eq!(self.state, SiState::Con);
        self.state = SiState::Est;
    }

    /// `CON -> CER`: connect failed.
    pub fn connect_failed(&mut self, kind: SiErrorKind) {
        debug_assert_eq!(self.state, SiState::Con);
        self.set_error(kind);
        self.state = SiState::Cer;
    }

    /// `CER -> TAR` if retries remain, else `CER -> CLO`.
    pub fn after_connect_failure(&mut self) {
        debug_assert_eq!(self.state, SiState::Cer);
        if self.connect_retries_left > 0 {
            self.connect_retries_left -= 1;
            self.state = SiState::Tar;
        } else {
            self.state = SiState::Clo;
        }
    }

    /// `TAR -> REQ` after the turn-around delay elapses.
    pub fn turn_around_elapsed(&mut self) {
        debug_assert_eq!(self.state, SiState::Tar);
        self.error = None;
        self.flags.error = false;
        self.state = SiState::Req;
    }

    /// `EST -> DIS` on either side's shut-read or shut-write.
    pub fn begin_disconnect(&mut self) {
        debug_assert_eq!(self.state, SiState::Est);
        self.state = SiState::Dis;
    }

    /// `DIS -> CLO` after last cleanup.
    pub fn close(&mut self) {
        self.state = SiState::Clo;
        self.fd = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SiState::Clo
    }
}

impl Default for StreamInterface {
    fn default() -> StreamInterface {
        StreamInterface::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SiErrorKind;

    #[test]
    fn happy_path_to_established_and_close() {
        let mut si = StreamInterface::new();
        assert_eq!(si.state, SiState::Ini);
        si.request_connection();
        assert_eq!(si.state, SiState::Req);
        si.assign(ServerId(0));
        assert_eq!(si.state, SiState::Ass);
        si.connecting(7);
        assert_eq!(si.state, SiState::Con);
        assert_eq!(si.fd, Some(7));
        si.established();
        assert_eq!(si.state, SiState::Est);
        si.begin_disconnect();
        assert_eq!(si.state, SiState::Dis);
        si.close();
        assert!(si.is_closed());
        assert_eq!(si.fd, None);
    }

    #[test]
    fn queue_then_assign() {
        let mut si = StreamInterface::new();
        si.request_connection();
        si.enqueue();
        assert_eq!(si.state, SiState::Que);
        si.assign(ServerId(1));
        assert_eq!(si.state, SiState::Ass);
        assert_eq!(si.target, SiTarget::Server(ServerId(1)));
    }

    #[test]
    fn queue_failure_closes_with_error_flag() {
        let mut si = StreamInterface::new();
        si.request_connection();
        si.enqueue();
        si.queue_failed(SiErrorKind::QueueTimeout);
        assert_eq!(si.state, SiState::Clo);
        assert!(si.flags.error);
        assert_eq!(si.error, Some(SiErrorKind::QueueTimeout));
    }

    /// `CON -> CER -> TAR -> REQ`, retrying after a failed connect.
    #[test]
    fn connect_timeout_retries_then_reissues_request() {
        let mut si = StreamInterface::new();
        si.request_connection();
        si.assign(ServerId(0));
        si.connecting(5);
        let retries_before = si.connect_retries_left;

        si.connect_failed(SiErrorKind::ConnectTimeout);
        assert_eq!(si.state, SiState::Cer);
        assert!(si.flags.error);

        si.after_connect_failure();
        assert_eq!(si.state, SiState::Tar);
        assert_eq!(si.connect_retries_left, retries_before - 1);

        si.turn_around_elapsed();
        assert_eq!(si.state, SiState::Req);
        assert!(si.error.is_none());
        assert!(!si.flags.error);
    }

    #[test]
    fn connect_failure_closes_once_retries_exhausted() {
        let mut si = StreamInterface::new();
        si.request_connection();
        si.assign(ServerId(0));
        si.connecting(5);
        si.connect_failed(SiErrorKind::ConnectError);
        while si.connect_retries_left > 0 {
            si.after_connect_failure();
            assert_eq!(si.state, SiState::Tar);
            si.turn_around_elapsed();
            si.assign(ServerId(0));
            si.connecting(5);
            si.connect_failed(SiErrorKind::ConnectError);
        }
        si.after_connect_failure();
        assert_eq!(si.state, SiState::Clo);
    }

    #[test]
    fn final_state_letters_match_the_seven_letter_set() {
        let letters: Vec<char> = [
            SiState::Ini,
            SiState::Req,
            SiState::Que,
            SiState::Tar,
            SiState::Ass,
            SiState::Con,
            SiState::Cer,
            SiState::Est,
            SiState::Dis,
            SiState::Clo,
        ]
        .into_iter()
        .map(SiState::final_state_letter)
        .collect();
        let mut distinct = letters.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 7);
        assert!("RCHDLQT".chars().all(|c| distinct.contains(&c)));
    }

    #[test]
    fn source_bind_bitmask() {
        assert!(!SourceBind::IGNORE.use_remote_address());
        assert!(!SourceBind::IGNORE.use_remote_port());
        assert!(SourceBind::ADDRESS_ONLY.use_remote_address());
        assert!(!SourceBind::ADDRESS_ONLY.use_remote_port());
        assert!(!SourceBind::PORT_ONLY.use_remote_address());
        assert!(SourceBind::PORT_ONLY.use_remote_port());
        assert!(SourceBind::BOTH.use_remote_address());
        assert!(SourceBind::BOTH.use_remote_port());
    }
}
