//! Cross-store laws: buffering must be semantically transparent, and the
//! structural invariants must survive arbitrary operation orders.

use betula::{BEpsilonStore, BPlusStore, CacheConfig, Error, NoBacking, StoreConfig};
use quickcheck::quickcheck;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

fn config(degree: usize, buffer_size: usize) -> StoreConfig {
    StoreConfig {
        degree,
        buffer_size,
        cache: CacheConfig {
            capacity: 4096,
            concurrent: false,
        },
    }
}

fn stores(degree: usize, buffer_size: usize) -> (BPlusStore<u64, u64, NoBacking>, BEpsilonStore<u64, u64, NoBacking>) {
    let bplus = BPlusStore::new(config(degree, buffer_size), NoBacking::new());
    bplus.init().unwrap();
    let beps = BEpsilonStore::new(config(degree, buffer_size), NoBacking::new());
    beps.init().unwrap();
    (bplus, beps)
}

/// Replays the same operation sequence on both stores and compares the
/// final key-value mappings over the whole key space.
fn replay_and_compare(ops: &[(bool, u64)], degree: usize, buffer_size: usize) {
    let (bplus, beps) = stores(degree, buffer_size);
    for &(is_insert, key) in ops {
        if is_insert {
            bplus.insert(key, key * 10 + 1).unwrap();
            beps.insert(key, key * 10 + 1).unwrap();
        } else {
            match bplus.remove(&key) {
                Ok(()) | Err(Error::KeyNotFound) => {}
                Err(err) => panic!("b+ remove failed: {err}"),
            }
            beps.remove(&key).unwrap();
        }
    }
    bplus.check_invariants().unwrap();
    beps.check_invariants().unwrap();

    let max_key = ops.iter().map(|(_, k)| *k).max().unwrap_or(0);
    for key in 0..=max_key {
        let lhs = bplus.search(&key);
        let rhs = beps.search(&key);
        match (lhs, rhs) {
            (Ok(a), Ok(b)) => assert_eq!(a, b, "stores disagree on key {key}"),
            (Err(Error::KeyNotFound), Err(Error::KeyNotFound)) => {}
            (lhs, rhs) => panic!("stores disagree on key {key}: {lhs:?} vs {rhs:?}"),
        }
    }
}

#[test]
fn replaying_a_workload_yields_identical_mappings() {
    let mut rng = XorShiftRng::seed_from_u64(0x5eed);
    for round in 0..8 {
        let ops: Vec<(bool, u64)> = (0..400)
            .map(|_| (rng.gen_bool(0.7), rng.gen_range(0..120)))
            .collect();
        let degree = [3, 4, 7][round % 3];
        let buffer_size = [1, 3, 8][round / 3 % 3];
        replay_and_compare(&ops, degree, buffer_size);
    }
}

#[test]
fn randomised_soak_keeps_invariants() {
    let mut rng = XorShiftRng::seed_from_u64(0xb3701a);
    let (bplus, beps) = stores(3, 3);
    let mut live: std::collections::BTreeMap<u64, u64> = std::collections::BTreeMap::new();

    for step in 0..2000u64 {
        let key = rng.gen_range(0..256);
        if rng.gen_bool(0.65) {
            let value = step;
            bplus.insert(key, value).unwrap();
            beps.insert(key, value).unwrap();
            live.insert(key, value);
        } else {
            match bplus.remove(&key) {
                Ok(()) | Err(Error::KeyNotFound) => {}
                Err(err) => panic!("b+ remove failed: {err}"),
            }
            beps.remove(&key).unwrap();
            live.remove(&key);
        }
        if step % 100 == 0 {
            bplus.check_invariants().unwrap();
            beps.check_invariants().unwrap();
        }
    }
    bplus.check_invariants().unwrap();
    beps.check_invariants().unwrap();

    for (key, value) in &live {
        assert_eq!(bplus.search(key).unwrap(), *value);
        assert_eq!(beps.search(key).unwrap(), *value);
    }
    let rows = beps.range_query(&0, &255).unwrap();
    let expected: Vec<(u64, u64)> = live.into_iter().collect();
    assert_eq!(rows, expected);
}

quickcheck! {
    fn insert_then_search(keys: Vec<u16>) -> bool {
        let (bplus, beps) = stores(4, 2);
        for &k in &keys {
            let k = u64::from(k);
            if bplus.insert(k, k + 7).is_err() || beps.insert(k, k + 7).is_err() {
                return false;
            }
        }
        keys.iter().all(|&k| {
            let k = u64::from(k);
            bplus.search(&k).map_or(false, |v| v == k + 7)
                && beps.search(&k).map_or(false, |v| v == k + 7)
        })
    }

    fn insert_remove_search_is_absent(keys: Vec<u16>) -> bool {
        let (bplus, beps) = stores(4, 2);
        for &k in &keys {
            let k = u64::from(k);
            bplus.insert(k, k).unwrap();
            beps.insert(k, k).unwrap();
        }
        for &k in &keys {
            let k = u64::from(k);
            match bplus.remove(&k) {
                Ok(()) | Err(Error::KeyNotFound) => {}
                Err(_) => return false,
            }
            if beps.remove(&k).is_err() {
                return false;
            }
        }
        keys.iter().all(|&k| {
            let k = u64::from(k);
            matches!(bplus.search(&k), Err(Error::KeyNotFound))
                && matches!(beps.search(&k), Err(Error::KeyNotFound))
        })
    }
}
