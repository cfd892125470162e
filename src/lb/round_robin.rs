//! Weighted round robin, grounded on `lb_fwrr.c`.
//!
//! Each pool (active, backup) is a [`Group`] holding three roots: `curr`
//! (servers scheduled for this cycle, keyed by position), and two more that
//! alternate between the roles of `init` (not yet scheduled, keyed by
//! weight complement so heavier servers surface first) and `next` (already
//! consumed this cycle, waiting for the next one). `init`/`next` are tracked
//! here as an index into `[t0, t1]` rather than aliased pointers.

use super::{Pool, Server, ServerId, WeightTree, UWEIGHT_RANGE, WEIGHT_SCALE, WEIGHT_SCALE_MAX};

pub struct Group {
    t0: WeightTree,
    t1: WeightTree,
    /// Index into `[t0, t1]` of the not-yet-scheduled tree.
    init_is_t0: bool,
    curr: WeightTree,
    pub curr_pos: u64,
    pub curr_weight: u64,
    pub next_weight: u64,
    /// Count of usable servers in this pool, mirroring the original's
    /// `srv_act`/`srv_bck` proxy-level counters: maintained on every status
    /// transition rather than derived from tree sizes, since a usable server
    /// can legitimately sit in the `next` tree (neither `curr` nor `init`)
    /// between window switches.
    pub usable_count: usize,
}

impl Default for Group {
    fn default() -> Group {
        Group {
            t0: WeightTree::new(),
            t1: WeightTree::new(),
            init_is_t0: true,
            curr: WeightTree::new(),
            curr_pos: 0,
            curr_weight: 0,
            next_weight: 0,
            usable_count: 0,
        }
    }
}

impl Group {
    fn init(&self) -> &WeightTree {
        if self.init_is_t0 {
            &self.t0
        } else {
            &self.t1
        }
    }

    fn init_mut(&mut self) -> &mut WeightTree {
        if self.init_is_t0 {
            &mut self.t0
        } else {
            &mut self.t1
        }
    }

    fn next_mut(&mut self) -> &mut WeightTree {
        if self.init_is_t0 {
            &mut self.t1
        } else {
            &mut self.t0
        }
    }

    fn switch_trees(&mut self) {
        self.init_is_t0 = !self.init_is_t0;
        self.curr_weight = self.next_weight;
        self.curr_pos = self.curr_weight;
    }

    /// `WEIGHT_SCALE_MAX - eweight`: heaviest servers sort first in `init`.
    fn init_key(eweight: u32) -> u32 {
        WEIGHT_SCALE_MAX.saturating_sub(eweight)
    }

    fn rotation_key(&self, srv: &Server) -> u32 {
        let tie = (WEIGHT_SCALE_MAX + srv.rweight).saturating_sub(srv.eweight) / WEIGHT_SCALE;
        (UWEIGHT_RANGE * srv.npos + tie as u64) as u32
    }

    /// Queue `srv` into `curr` (or back into `init`/`next` if it doesn't fit
    /// in the current window).
    fn queue(&mut self, srv: &mut Server) {
        if !srv.is_usable() {
            self.curr.remove(srv.id);
            self.init_mut().remove(srv.id);
            self.next_mut().remove(srv.id);
            return;
        }
        if srv.eweight == 0
            || srv.npos >= 2 * self.curr_weight
            || srv.npos >= self.curr_weight + self.next_weight
        {
            srv.npos = srv.npos.saturating_sub(self.curr_weight);
            let key = Self::init_key(srv.eweight);
            self.next_mut().insert(key, srv.id);
        } else {
            let key = self.rotation_key(srv);
            self.curr.insert(key, srv.id);
        }
    }

    /// Prepare `srv`'s position fields after pulling it out of whichever
    /// tree it was in.
    fn prepare_extracted(&self, srv: &mut Server, came_from_init: bool, was_down: bool) {
        if was_down {
            srv.npos = self.curr_pos;
        } else if came_from_init {
            srv.npos = 0;
            srv.rweight = 0;
        } else {
            srv.npos += self.curr_weight;
        }
    }

    fn update_position(&self, srv: &mut Server) {
        if srv.npos == 0 {
            srv.lpos = self.curr_pos;
        } else {
            srv.lpos = srv.npos;
        }
        srv.npos = self.curr_pos + self.next_weight / srv.eweight as u64;
        srv.rweight += (self.next_weight % srv.eweight as u64) as u32;
        if srv.rweight >= srv.eweight {
            srv.rweight -= srv.eweight;
            srv.npos += 1;
        }
    }
}

#[derive(Default)]
pub struct RoundRobin {
    pub act: Group,
    pub bck: Group,
    pub fbck: Option<ServerId>,
}

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin::default()
    }

    fn group_mut(&mut self, pool: Pool) -> &mut Group {
        match pool {
            Pool::Active => &mut self.act,
            Pool::Backup => &mut self.bck,
        }
    }

    /// Build the initial trees for every server, called once at backend
    /// startup (mirrors `fwrr_init_server_groups`).
    pub fn init_servers(&mut self, servers: &mut [Server]) {
        for grp in [&mut self.act, &mut self.bck] {
            grp.curr_pos = 0;
            grp.curr_weight = 0;
            grp.next_weight = 0;
            grp.usable_count = 0;
        }
        for srv in servers.iter() {
            let grp = self.group_mut(srv.pool);
            grp.next_weight += srv.eweight as u64;
        }
        for grp in [&mut self.act, &mut self.bck] {
            grp.curr_pos = grp.curr_weight.max(grp.next_weight);
            grp.curr_weight = grp.curr_pos;
        }
        for srv in servers.iter_mut() {
            if !srv.is_usable() {
                continue;
            }
            let grp = self.group_mut(srv.pool);
            grp.usable_count += 1;
            let key = Group::init_key(srv.eweight);
            grp.init_mut().insert(key, srv.id);
        }
    }

    fn get_srv(&mut self, srv: &mut Server) {
        let grp = self.group_mut(srv.pool);
        let from_init = grp.init().contains(srv.id);
        let from_curr = grp.curr.contains(srv.id);
        grp.prepare_extracted(srv, from_init, !from_init && !from_curr);
    }

    pub fn dequeue(&mut self, srv: &Server) {
        let grp = self.group_mut(srv.pool);
        grp.curr.remove(srv.id);
        grp.init_mut().remove(srv.id);
        grp.next_mut().remove(srv.id);
    }

    pub fn queue(&mut self, srv: &mut Server) {
        let grp = self.group_mut(srv.pool);
        grp.queue(srv);
    }

    pub fn set_status_down(&mut self, srv: &mut Server) {
        if srv.unchanged() {
            return;
        }
        if srv.is_usable() || !srv.was_usable() {
            srv.commit_snapshot();
            return;
        }
        let grp = self.group_mut(srv.pool);
        grp.next_weight -= srv.prev_eweight as u64;
        grp.usable_count -= 1;
        self.dequeue(srv);
        srv.commit_snapshot();
    }

    pub fn set_status_up(&mut self, srv: &mut Server) {
        if srv.unchanged() {
            return;
        }
        if !srv.is_usable() || srv.was_usable() {
            srv.commit_snapshot();
            return;
        }
        {
            let grp = self.group_mut(srv.pool);
            grp.next_weight += srv.eweight as u64;
            grp.usable_count += 1;
        }
        // "FIXME: server was down. This is not possible right now but may be
        // needed soon for slowstart or graceful shutdown." — preserved as a
        // loud assertion: a server transitioning up must not already be
        // tracked in any of its pool's trees.
        {
            let grp = self.group_mut(srv.pool);
            debug_assert!(
                !grp.curr.contains(srv.id) && !grp.init().contains(srv.id) && !grp.next_mut().contains(srv.id),
                "server reported up while still present in a WRR tree"
            );
        }
        self.get_srv(srv);
        {
            let grp = self.group_mut(srv.pool);
            srv.npos = grp.curr_pos + (grp.next_weight + grp.curr_weight - grp.curr_pos) / srv.eweight as u64;
        }
        self.queue(srv);
        srv.commit_snapshot();
    }

    pub fn update_eweight(&mut self, srv: &mut Server) {
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
            self.set_status_up(srv);
            return;
        }
        if was && !now {
            self.set_status_down(srv);
            return;
        }
        {
            let grp = self.group_mut(srv.pool);
            grp.next_weight = grp.next_weight - srv.prev_eweight as u64 + srv.eweight as u64;
        }
        let in_init = self.group_mut(srv.pool).init().contains(srv.id);
        if in_init {
            self.dequeue(srv);
            self.queue(srv);
        } else if !self.group_mut(srv.pool).curr.contains(srv.id) {
            self.get_srv(srv);
            let grp = self.group_mut(srv.pool);
            // The original computes this term as a signed difference that is
            // never supposed to go negative; assert that explicitly instead
            // of letting an unsigned subtraction wrap silently.
            let sum = grp.next_weight + grp.curr_weight;
            debug_assert!(sum >= grp.curr_pos, "WRR position term went negative");
            srv.npos = grp.curr_pos + sum.saturating_sub(grp.curr_pos) / srv.eweight.max(1) as u64;
            self.queue(srv);
        } else {
            self.get_srv(srv);
            if srv.eweight > 0 {
                let grp = self.group_mut(srv.pool);
                let prev_next = srv.npos;
                let step = grp.next_weight / srv.eweight as u64;
                srv.npos = srv.lpos + step;
                srv.rweight = 0;
                if srv.npos > prev_next {
                    srv.npos = prev_next;
                }
                if srv.npos < grp.curr_pos + 2 {
                    srv.npos = grp.curr_pos + step;
                }
            } else {
                let grp = self.group_mut(srv.pool);
                srv.npos = grp.curr_pos + grp.curr_weight;
            }
            self.dequeue(srv);
            self.queue(srv);
        }
        srv.commit_snapshot();
    }

    /// Return the next server from `grp`'s current tree, or from `init` if
    /// `curr` is empty or its first entry isn't due yet (`npos` ahead of
    /// `curr_pos` — a hole left by a server that was requeued into a later
    /// window). Neither tree is mutated here; the caller dequeues whichever
    /// one the returned id actually came from.
    fn get_server_from_group(&mut self, pool: Pool, servers: &[Server]) -> Option<ServerId> {
        let grp = self.group_mut(pool);
        let curr_id = grp.curr.first();
        let has_hole = match curr_id {
            None => true,
            Some(id) => servers[id.0].npos > grp.curr_pos,
        };
        if has_hole {
            if let Some(init_id) = grp.init().first() {
                if servers[init_id.0].eweight == 0 {
                    return None;
                }
                return Some(init_id);
            }
        }
        curr_id
    }

    /// Selection over one pool, mirroring `fwrr_get_next_server`'s inner
    /// loop: pull candidates from `curr`/`init`, switch trees once if both
    /// run dry, skip saturated servers into a `full` side list and requeue
    /// them at the end (into `init` if a switch happened, back into place
    /// otherwise).
    fn next_from_pool(&mut self, pool: Pool, avoid: Option<ServerId>, servers: &mut [Server]) -> Option<ServerId> {
        let mut switched = false;
        let mut avoided = None;
        let mut full = Vec::new();
        let winner;
        loop {
            {
                let grp = self.group_mut(pool);
                if grp.curr_weight == 0 {
                    grp.curr_pos = grp.next_weight;
                    grp.curr_weight = grp.next_weight;
                }
            }
            let srv = loop {
                if let Some(id) = self.get_server_from_group(pool, servers) {
                    let came_from_curr = self.group_mut(pool).curr.contains(id);
                    if !came_from_curr {
                        // freshly pulled from init: reset npos/rweight.
                        servers[id.0].npos = 0;
                        servers[id.0].rweight = 0;
                    }
                    break Some(id);
                }
                if switched {
                    break avoided;
                }
                switched = true;
                self.group_mut(pool).switch_trees();
            };
            let Some(id) = srv else {
                winner = None;
                break;
            };
            {
                let grp = self.group_mut(pool);
                grp.update_position(&mut servers[id.0]);
                grp.curr.remove(id);
                grp.init_mut().remove(id);
                grp.curr_pos += 1;
            }
            let s = &servers[id.0];
            if !s.is_saturated() {
                if Some(id) != avoid || avoided.is_some() {
                    winner = Some(id);
                    break;
                }
                avoided = Some(id);
            }
            full.push(id);
        }

        if let Some(w) = winner {
            self.queue(&mut servers[w.0]);
        }
        for id in full {
            if Some(id) == winner {
                continue;
            }
            if switched {
                let key = Group::init_key(servers[id.0].eweight);
                self.group_mut(pool).init_mut().insert(key, id);
            } else {
                self.queue(&mut servers[id.0]);
            }
        }
        winner
    }

    pub fn next_server(&mut self, avoid: Option<ServerId>, servers: &mut [Server], use_all_backup: bool) -> Option<ServerId> {
        if self.act.usable_count > 0 {
            if let Some(id) = self.next_from_pool(Pool::Active, avoid, servers) {
                return Some(id);
            }
        }
        if !use_all_backup {
            if let Some(fbck) = self.fbck {
                return Some(fbck);
            }
        }
        self.next_from_pool(Pool::Backup, avoid, servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: usize, pool: Pool, uweight: u32) -> Server {
        Server::new(ServerId(id), pool, uweight)
    }

    #[test]
    fn wrr_cycle_with_uneven_weights() {
        let mut servers = vec![server(0, Pool::Active, 1), server(1, Pool::Active, 1)];
        servers[0].eweight = 3;
        servers[1].eweight = 1;
        let mut rr = RoundRobin::new();
        rr.init_servers(&mut servers);

        let mut picks = Vec::new();
        for _ in 0..8 {
            let id = rr.next_server(None, &mut servers, false).expect("a server");
            picks.push(id.0);
        }
        assert_eq!(picks, vec![0, 0, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn wrr_window_serves_each_server_in_proportion_to_eweight() {
        let mut servers = vec![server(0, Pool::Active, 1), server(1, Pool::Active, 1)];
        servers[0].eweight = 2;
        servers[1].eweight = 3;
        let mut rr = RoundRobin::new();
        rr.init_servers(&mut servers);

        let window = servers[0].eweight + servers[1].eweight;
        let mut counts = [0u32; 2];
        for _ in 0..window {
            let id = rr.next_server(None, &mut servers, false).expect("a server");
            counts[id.0] += 1;
        }
        assert_eq!(counts, [servers[0].eweight, servers[1].eweight]);
    }

    /// A lone active server eventually overruns its window and gets parked
    /// in the `next` tree instead of `curr` (see `Group::queue`'s overflow
    /// branch), leaving `curr` and `init` both empty for one call. The
    /// active-pool gate must stay keyed off a maintained usable-server
    /// count, not off `curr`/`init` tree sizes, or this call would
    /// incorrectly treat the active pool as empty and fall through to an
    /// empty backup pool.
    #[test]
    fn lone_active_server_is_found_even_when_parked_in_next_tree() {
        let mut servers = vec![server(0, Pool::Active, 1)];
        let mut rr = RoundRobin::new();
        rr.init_servers(&mut servers);

        for _ in 0..20 {
            assert_eq!(rr.next_server(None, &mut servers, false), Some(ServerId(0)));
        }
    }

    #[test]
    fn set_status_down_removes_server_from_rotation() {
        let mut servers = vec![server(0, Pool::Active, 1), server(1, Pool::Active, 1)];
        let mut rr = RoundRobin::new();
        rr.init_servers(&mut servers);

        servers[1].enabled = false;
        let (left, right) = servers.split_at_mut(1);
        rr.set_status_down(&mut right[0]);
        let _ = left;

        for _ in 0..4 {
            let id = rr.next_server(None, &mut servers, false).expect("a server");
            assert_eq!(id.0, 0);
        }
    }
}
