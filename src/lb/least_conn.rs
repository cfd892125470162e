//! Weighted least-connections, grounded on `lb_fwlc.c`.

use super::{Pool, Server, ServerId, WeightTree, WEIGHT_SCALE_MAX};

#[derive(Default)]
pub struct LeastConn {
    pub active: WeightTree,
    pub backup: WeightTree,
    pub tot_wact: u64,
    pub tot_wbck: u64,
    pub srv_act: usize,
    pub srv_bck: usize,
    /// First usable backup server, used when the backend is configured to
    /// send all backup traffic to a single server rather than spreading it.
    pub fbck: Option<ServerId>,
}

impl LeastConn {
    pub fn new() -> LeastConn {
        LeastConn::default()
    }

    fn tree_mut(&mut self, pool: Pool) -> &mut WeightTree {
        match pool {
            Pool::Active => &mut self.active,
            Pool::Backup => &mut self.backup,
        }
    }

    fn tree(&self, pool: Pool) -> &WeightTree {
        match pool {
            Pool::Active => &self.active,
            Pool::Backup => &self.backup,
        }
    }

    /// `served × WEIGHT_SCALE_MAX / eweight`: load per unit weight.
    fn key(served: u32, eweight: u32) -> u32 {
        ((served as u64) * WEIGHT_SCALE_MAX as u64 / eweight.max(1) as u64) as u32
    }

    pub fn queue(&mut self, srv: &Server) {
        if !srv.is_usable() {
            return;
        }
        let key = Self::key(srv.served, srv.eweight);
        self.tree_mut(srv.pool).insert(key, srv.id);
    }

    pub fn dequeue(&mut self, srv: &Server) {
        self.tree_mut(srv.pool).remove(srv.id);
    }

    /// Recompute a server's position after its `served` count changes (a
    /// connection was taken or dropped). Called on every assignment and
    /// every release.
    pub fn reposition(&mut self, srv: &Server) {
        if srv.is_usable() {
            self.queue(srv);
        } else {
            self.dequeue(srv);
        }
    }

    fn recompute_fbck(&mut self, servers: &[Server], losing: ServerId) {
        if self.fbck != Some(losing) {
            return;
        }
        self.fbck = servers
            .iter()
            .find(|s| s.id.0 > losing.0 && s.pool == Pool::Backup && s.is_usable())
            .map(|s| s.id);
    }

    pub fn set_status_down(&mut self, srv: &mut Server, servers: &[Server]) {
        if srv.unchanged() {
            return;
        }
        if srv.is_usable() || !srv.was_usable() {
            srv.commit_snapshot();
            return;
        }
        match srv.pool {
            Pool::Backup => {
                self.tot_wbck -= srv.prev_eweight as u64;
                self.srv_bck -= 1;
                self.recompute_fbck(servers, srv.id);
            }
            Pool::Active => {
                self.tot_wact -= srv.prev_eweight as u64;
                self.srv_act -= 1;
            }
        }
        self.dequeue(srv);
        srv.commit_snapshot();
    }

    pub fn set_status_up(&mut self, srv: &mut Server, servers: &[Server], use_all_backup: bool) {
        if srv.unchanged() {
            return;
        }
        if !srv.is_usable() || srv.was_usable() {
            srv.commit_snapshot();
            return;
        }
        match srv.pool {
            Pool::Backup => {
                self.tot_wbck += srv.eweight as u64;
                self.srv_bck += 1;
                if !use_all_backup {
                    match self.fbck {
                        None => self.fbck = Some(srv.id),
                        Some(cur) if cur.0 > srv.id.0 => self.fbck = Some(srv.id),
                        _ => {}
                    }
                }
            }
            Pool::Active => {
                self.tot_wact += srv.eweight as u64;
                self.srv_act += 1;
            }
        }
        let _ = servers;
        self.queue(srv);
        srv.commit_snapshot();
    }

    pub fn update_eweight(&mut self, srv: &mut Server, servers: &[Server], use_all_backup: bool) {
        if srv.unchanged() {
            return;
        }
        let was = srv.was_usable();
        let now = srv.is_usable();
        if !was && !now {
            srv.commit_snapshot();
            return;
        }
        if !was && now {
            self.set_status_up(srv, servers, use_all_backup);
            return;
        }
        if was && !now {
            self.set_status_down(srv, servers);
            return;
        }
        match srv.pool {
            Pool::Active => {
                self.tot_wact = self.tot_wact - srv.prev_eweight as u64 + srv.eweight as u64;
            }
            Pool::Backup => {
                self.tot_wbck = self.tot_wbck - srv.prev_eweight as u64 + srv.eweight as u64;
            }
        }
        self.dequeue(srv);
        self.queue(srv);
        srv.commit_snapshot();
    }

    /// Returns the server this request should be assigned to, or `None` if
    /// the backend has no usable server at all.
    ///
    /// Walks the active tree lowest-key first, skipping saturated servers;
    /// `avoid`, if given, is skipped too unless it turns out to be the only
    /// candidate left, in which case it is returned anyway.
    pub fn next_server(&self, avoid: Option<ServerId>, servers: &[Server], use_all_backup: bool) -> Option<ServerId> {
        if self.srv_act > 0 {
            if let Some(id) = self.pick(&self.active, avoid, servers) {
                return Some(id);
            }
        }
        if !use_all_backup {
            if let Some(fbck) = self.fbck {
                return Some(fbck);
            }
        }
        if self.srv_bck > 0 {
            return self.pick(&self.backup, avoid, servers);
        }
        None
    }

    fn pick(&self, tree: &WeightTree, avoid: Option<ServerId>, servers: &[Server]) -> Option<ServerId> {
        let mut avoided = None;
        for id in tree.iter() {
            let srv = &servers[id.0];
            if srv.is_saturated() {
                continue;
            }
            if Some(id) == avoid && avoided.is_none() {
                avoided = Some(id);
                continue;
            }
            return Some(id);
        }
        avoided.or_else(|| tree.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: usize, pool: Pool, uweight: u32) -> Server {
        Server::new(ServerId(id), pool, uweight)
    }

    #[test]
    fn selection_sequence_matches_worked_example() {
        // A(eweight=16,served=0) B(32,0) C(64,0), via uweight 1/2/4 and the
        // crate's WEIGHT_SCALE=16 (spec's worked example uses eweight
        // directly; uweight*16 reproduces the same key ratios).
        let mut servers = vec![
            server(0, Pool::Active, 1),
            server(1, Pool::Active, 2),
            server(2, Pool::Active, 4),
        ];
        let mut lc = LeastConn::new();
        for s in &servers {
            lc.queue(s);
        }

        let mut picks = Vec::new();
        for _ in 0..7 {
            let id = lc.next_server(None, &servers, false).expect("a server");
            picks.push(id.0);
            servers[id.0].served += 1;
            lc.reposition(&servers[id.0]);
        }
        assert_eq!(picks, vec![0, 1, 2, 2, 2, 2, 1]);
    }

    #[test]
    fn status_down_updates_aggregates_and_removes_from_tree() {
        let mut servers = vec![server(0, Pool::Active, 1), server(1, Pool::Active, 2)];
        let mut lc = LeastConn::new();
        for s in &servers {
            lc.queue(s);
        }
        lc.tot_wact = servers[0].eweight as u64 + servers[1].eweight as u64;
        lc.srv_act = 2;

        servers[1].enabled = false;
        let (left, right) = servers.split_at_mut(1);
        lc.set_status_down(&mut right[0], left);

        assert_eq!(lc.tot_wact, servers[0].eweight as u64);
        assert_eq!(lc.srv_act, 1);
        assert!(!lc.active.contains(ServerId(1)));
        assert_eq!(lc.next_server(None, &servers, false), Some(ServerId(0)));
    }

    #[test]
    fn fbck_stays_on_first_registered_backup() {
        let mut servers = vec![server(0, Pool::Backup, 1)];
        let mut lc = LeastConn::new();
        servers[0].prev_enabled = false;
        servers[0].prev_checked_up = false;
        {
            let (left, right) = servers.split_at_mut(1);
            lc.set_status_up(&mut left[0], right, false);
        }
        assert_eq!(lc.fbck, Some(ServerId(0)));

        servers.push(server(1, Pool::Backup, 1));
        servers[1].prev_enabled = false;
        servers[1].prev_checked_up = false;
        {
            let (left, right) = servers.split_at_mut(2);
            lc.set_status_up(&mut left[1], &right[..0], false);
        }

        assert_eq!(lc.fbck, Some(ServerId(0)));
        assert_eq!(lc.next_server(None, &servers, false), Some(ServerId(0)));
    }
}
