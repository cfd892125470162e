//! Proxy lifecycle and the periodic per-proxy management task, grounded on
//! the original's `maintain_proxies` (`proxy.c`).

use std::collections::VecDeque;
use std::time::Duration;

use crate::time::Tick;
use crate::token::Token;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProxyState {
    New,
    Ready,
    Full,
    Paused,
    Stopped,
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Capability {
    pub frontend: bool,
    pub backend: bool,
}

/// A per-second admission limiter: at most `limit` sessions may start within
/// any rolling one-second window; `admits_at` is the tick the limiter will
/// next allow one through.
#[derive(Debug, Copy, Clone)]
pub struct RateLimit {
    pub limit: u32,
    pub count_this_second: u32,
    pub window_start: Tick,
}

impl RateLimit {
    pub fn new(limit: u32, now: Tick) -> RateLimit {
        RateLimit { limit, count_this_second: 0, window_start: now }
    }

    /// Tick (possibly in the future) at which the limiter will next admit a
    /// session, given the current count.
    pub fn admits_at(&self, now: Tick) -> Tick {
        if now.as_millis().saturating_sub(self.window_start.as_millis()) >= 1000 {
            now
        } else if self.count_this_second < self.limit {
            now
        } else {
            self.window_start.add(Duration::from_millis(1000))
        }
    }

    pub fn record_admission(&mut self, now: Tick) {
        if now.as_millis().saturating_sub(self.window_start.as_millis()) >= 1000 {
            self.window_start = now;
            self.count_this_second = 0;
        }
        self.count_this_second += 1;
    }
}

/// A listener blocked waiting for the proxy to leave `Full`, or for the
/// rate limiter to admit again.
pub struct Proxy {
    pub capability: Capability,
    pub state: ProxyState,
    pub maxconn: u32,
    pub feconn: u32,
    pub stopping: bool,
    pub grace_deadline: Option<Tick>,
    pub rate_limit: Option<RateLimit>,
    pub listener_wait_queue: VecDeque<Token>,
    pub jobs: usize,
}

impl Proxy {
    pub fn new(capability: Capability) -> Proxy {
        Proxy {
            capability,
            state: ProxyState::New,
            maxconn: 0,
            feconn: 0,
            stopping: false,
            grace_deadline: None,
            rate_limit: None,
            listener_wait_queue: VecDeque::new(),
            jobs: 0,
        }
    }

    /// Called once every listener has successfully bound.
    pub fn mark_ready(&mut self) {
        self.state = ProxyState::Ready;
    }

    pub fn begin_soft_stop(&mut self, grace: Duration, now: Tick) {
        self.stopping = true;
        self.grace_deadline = Some(now.add(grace));
    }

    /// The unbind-listeners, decrement-job-counter sequence the management
    /// task runs once the grace window elapses.
    fn stop_proxy(&mut self) {
        self.listener_wait_queue.clear();
        self.state = ProxyState::Stopped;
        self.jobs = self.jobs.saturating_sub(1);
    }

    /// Run one turn of the periodic management task. Returns the tick at
    /// which it should be re-armed, or `None` if there is nothing left to
    /// wait for (the proxy has stopped).
    pub fn run_management_task(&mut self, now: Tick) -> Option<Tick> {
        if self.stopping {
            match self.grace_deadline {
                Some(d) if d.is_expired(now) => {
                    self.stop_proxy();
                    return None;
                }
                Some(d) => return Some(d),
                None => {
                    self.stop_proxy();
                    return None;
                }
            }
        }

        let was_full = self.state == ProxyState::Full;
        if self.capability.frontend && self.maxconn != 0 && self.feconn >= self.maxconn {
            self.state = ProxyState::Full;
        } else if was_full {
            self.state = ProxyState::Ready;
        }
        let left_full = was_full && self.state != ProxyState::Full;

        let mut rearm = None;
        if let Some(limiter) = &self.rate_limit {
            let at = limiter.admits_at(now);
            rearm = Some(at);
            if at.is_expired(now) || at == now {
                self.unblock_listeners();
            }
        }
        if left_full {
            self.unblock_listeners();
        }
        rearm
    }

    fn unblock_listeners(&mut self) {
        self.listener_wait_queue.clear();
    }

    pub fn block_listener(&mut self, token: Token) {
        self.listener_wait_queue.push_back(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fe_cap() -> Capability {
        Capability { frontend: true, backend: false }
    }

    #[test]
    fn becomes_full_at_maxconn_and_unblocks_listeners_on_recovery() {
        let mut p = Proxy::new(fe_cap());
        p.mark_ready();
        p.maxconn = 2;
        p.feconn = 2;
        p.block_listener(Token(0));

        p.run_management_task(Tick::from_millis(0));
        assert_eq!(p.state, ProxyState::Full);
        assert_eq!(p.listener_wait_queue.len(), 1);

        p.feconn = 1;
        p.run_management_task(Tick::from_millis(10));
        assert_eq!(p.state, ProxyState::Ready);
        assert!(p.listener_wait_queue.is_empty());
    }

    #[test]
    fn soft_stop_stops_once_grace_elapses() {
        let mut p = Proxy::new(fe_cap());
        p.mark_ready();
        p.jobs = 1;
        p.block_listener(Token(1));
        p.begin_soft_stop(Duration::from_millis(500), Tick::from_millis(0));

        let rearm = p.run_management_task(Tick::from_millis(100));
        assert_eq!(rearm, Some(Tick::from_millis(500)));
        assert_eq!(p.state, ProxyState::Ready);

        let rearm = p.run_management_task(Tick::from_millis(500));
        assert_eq!(rearm, None);
        assert_eq!(p.state, ProxyState::Stopped);
        assert_eq!(p.jobs, 0);
        assert!(p.listener_wait_queue.is_empty());
    }

    #[test]
    fn rate_limiter_rearms_at_next_window_once_exhausted() {
        let mut p = Proxy::new(fe_cap());
        p.mark_ready();
        p.rate_limit = Some(RateLimit::new(2, Tick::from_millis(0)));

        if let Some(limiter) = &mut p.rate_limit {
            limiter.record_admission(Tick::from_millis(0));
            limiter.record_admission(Tick::from_millis(100));
        }
        p.block_listener(Token(2));

        let rearm = p.run_management_task(Tick::from_millis(200));
        assert_eq!(rearm, Some(Tick::from_millis(1000)));
        assert_eq!(p.listener_wait_queue.len(), 1, "limiter still exhausted, listener stays blocked");

        let rearm = p.run_management_task(Tick::from_millis(1000));
        assert_eq!(rearm, Some(Tick::from_millis(1000)));
        assert!(p.listener_wait_queue.is_empty(), "window rolled over, listener unblocked");
    }
}
