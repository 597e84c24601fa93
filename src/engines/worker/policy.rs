use crate::envconfig::LoadBalancing;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub id: usize,
    pub busy: bool,
    pub completed: u64,
    pub restarts: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

// Picks a free slot. `cursor` is the round-robin position and is advanced past the pick.
pub fn select_slot<R: Rng>(
    policy: LoadBalancing,
    slots: &[SlotStats],
    cursor: &mut usize,
    rng: &mut R,
) -> Option<usize> {
    if slots.is_empty() {
        return None;
    }
    match policy {
        LoadBalancing::RoundRobin => {
            let n = slots.len();
            let pick = (0..n).map(|offset| (*cursor + offset) % n).find(|&i| !slots[i].busy)?;
            *cursor = (pick + 1) % n;
            Some(pick)
        }
        LoadBalancing::LeastUsed => slots
            .iter()
            .filter(|s| !s.busy)
            .min_by_key(|s| (s.completed, s.last_used_at, s.id))
            .map(|s| s.id),
        LoadBalancing::Random => {
            let free: Vec<usize> = slots.iter().filter(|s| !s.busy).map(|s| s.id).collect();
            if free.is_empty() {
                None
            } else {
                Some(free[rng.gen_range(0..free.len())])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn slots(layout: &[(bool, u64)]) -> Vec<SlotStats> {
        layout.iter()
            .enumerate()
            .map(|(id, &(busy, completed))| SlotStats {
                id,
                busy,
                completed,
                restarts: 0,
                last_used_at: None,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_skips_busy() {
        let mut rng = StdRng::seed_from_u64(0);
        let s = slots(&[(false, 0), (true, 0), (false, 0)]);
        let mut cursor = 0;
        let picks: Vec<_> = (0..4)
            .map(|_| select_slot(LoadBalancing::RoundRobin, &s, &mut cursor, &mut rng).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
    }

    #[test]
    fn test_least_used() {
        let mut rng = StdRng::seed_from_u64(0);
        let s = slots(&[(false, 5), (true, 0), (false, 2), (false, 2)]);
        assert_eq!(select_slot(LoadBalancing::LeastUsed, &s, &mut 0, &mut rng), Some(2));
    }

    #[test]
    fn test_random_only_picks_free() {
        let mut rng = StdRng::seed_from_u64(7);
        let s = slots(&[(true, 0), (false, 0), (true, 0), (false, 0)]);
        for _ in 0..50 {
            let pick = select_slot(LoadBalancing::Random, &s, &mut 0, &mut rng).unwrap();
            assert!(pick == 1 || pick == 3);
        }
    }

    #[test]
    fn test_all_busy() {
        let mut rng = StdRng::seed_from_u64(0);
        let s = slots(&[(true, 0), (true, 0)]);
        for policy in [LoadBalancing::RoundRobin, LoadBalancing::LeastUsed, LoadBalancing::Random] {
            assert_eq!(select_slot(policy, &s, &mut 0, &mut rng), None);
        }
    }
}
