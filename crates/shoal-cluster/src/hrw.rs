//! Highest-random-weight (rendezvous) placement
//!
//! `score(node) = xxh64(node_id, seed = xxh64(uname))`; the highest score
//! wins, ties break by node id. Every caller holding an equal Smap resolves
//! the same owner, and a membership change relocates only the objects whose
//! winner actually changed. The same scheme ranks mountpaths inside a
//! target.

use crate::smap::{Smap, Snode};
use shoal_common::{Error, Result};
use shoal_fs::Mountpath;
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

/// Target owning the object named by `uname` under the given Smap
pub fn hrw_target<'a>(uname: &str, smap: &'a Smap) -> Result<&'a Arc<Snode>> {
    if smap.targets.is_empty() {
        return Err(Error::SmapOutOfSync("no targets in cluster map".into()));
    }
    let seed = xxh64(uname.as_bytes(), 0);
    let mut winner: Option<(&Arc<Snode>, u64)> = None;
    for node in smap.targets.values() {
        let score = xxh64(node.id.as_bytes(), seed);
        winner = match winner {
            None => Some((node, score)),
            Some((best, top)) => {
                if score > top || (score == top && node.id < best.id) {
                    Some((node, score))
                } else {
                    Some((best, top))
                }
            }
        };
    }
    Ok(winner.map(|(node, _)| node).unwrap())
}

/// All targets ranked by HRW score for `uname`, best first. Slice and
/// replica placement walks this order.
#[must_use]
pub fn hrw_rank(uname: &str, smap: &Smap) -> Vec<Arc<Snode>> {
    let seed = xxh64(uname.as_bytes(), 0);
    let mut ranked: Vec<(u64, Arc<Snode>)> = smap
        .targets
        .values()
        .map(|node| (xxh64(node.id.as_bytes(), seed), Arc::clone(node)))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
    ranked.into_iter().map(|(_, node)| node).collect()
}

/// Mountpath owning the object named by `uname` on this target
pub fn hrw_mpath(uname: &str, mpaths: &[Arc<Mountpath>]) -> Result<Arc<Mountpath>> {
    if mpaths.is_empty() {
        return Err(Error::NoMountpaths);
    }
    let seed = xxh64(uname.as_bytes(), 0);
    let mut winner: Option<(&Arc<Mountpath>, u64)> = None;
    for mp in mpaths {
        let key = mp.key();
        let score = xxh64(key.as_bytes(), seed);
        winner = match winner {
            None => Some((mp, score)),
            Some((best, top)) => {
                if score > top || (score == top && key < best.key()) {
                    Some((mp, score))
                } else {
                    Some((best, top))
                }
            }
        };
    }
    Ok(Arc::clone(winner.map(|(mp, _)| mp).unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smap::Snode;
    use shoal_common::{Bck, Provider};

    fn smap_with(ids: &[&str]) -> Smap {
        let mut smap = Smap {
            version: 1,
            ..Default::default()
        };
        for id in ids {
            smap.targets.insert(
                id.to_string(),
                Arc::new(Snode::new(*id, format!("http://{id}"))),
            );
        }
        smap
    }

    #[test]
    fn test_determinism_across_equal_smaps() {
        let a = smap_with(&["t1", "t2", "t3", "t4"]);
        let b = smap_with(&["t4", "t3", "t2", "t1"]);
        let bck = Bck::new("data", Provider::Ais);
        for i in 0..200 {
            let uname = bck.make_uname(&format!("obj-{i}"));
            let wa = hrw_target(&uname, &a).unwrap();
            let wb = hrw_target(&uname, &b).unwrap();
            assert_eq!(wa.id, wb.id);
        }
    }

    #[test]
    fn test_spread_over_targets() {
        let smap = smap_with(&["t1", "t2", "t3", "t4"]);
        let bck = Bck::new("data", Provider::Ais);
        let mut hits = std::collections::HashMap::new();
        for i in 0..1000 {
            let uname = bck.make_uname(&format!("obj-{i}"));
            let winner = hrw_target(&uname, &smap).unwrap();
            *hits.entry(winner.id.clone()).or_insert(0usize) += 1;
        }
        assert_eq!(hits.len(), 4);
        for (_, n) in hits {
            assert!(n > 100, "placement should not collapse onto few targets");
        }
    }

    #[test]
    fn test_membership_change_moves_a_minority() {
        let old = smap_with(&["t1", "t2", "t3", "t4"]);
        let new = smap_with(&["t1", "t2", "t3", "t4", "t5"]);
        let bck = Bck::new("data", Provider::Ais);
        let mut moved = 0usize;
        let total = 1000usize;
        for i in 0..total {
            let uname = bck.make_uname(&format!("obj-{i}"));
            if hrw_target(&uname, &old).unwrap().id != hrw_target(&uname, &new).unwrap().id {
                moved += 1;
            }
        }
        // adding one of five targets should move roughly 1/5 of the keys
        assert!(moved < total / 3, "moved {moved}/{total}");
        assert!(moved > 0);
    }

    #[test]
    fn test_empty_smap_errors() {
        let smap = Smap::default();
        assert!(hrw_target("x", &smap).is_err());
        assert!(hrw_mpath("x", &[]).is_err());
    }
}
