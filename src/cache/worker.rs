//! Background workers for the concurrent cache variant.
//!
//! `get` never blocks on the recency list: promotions are queued on a
//! channel and drained here. A second worker periodically trims the cache
//! back to capacity. Both exit when the stop channel closes.

use super::Shared;
use crate::{pod::KeyType, pod::ValueType, storage::Storage, uid::FatUid};
use crossbeam_channel::{select, tick, Receiver};
use log::warn;
use std::{sync::Arc, time::Duration};

pub(crate) enum Msg {
    Touch(FatUid),
}

pub(crate) const EVICT_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn lru_main<K, V, S>(rx: Receiver<Msg>, stop: Receiver<()>, shared: Arc<Shared<K, V, S>>)
where
    K: KeyType,
    V: ValueType,
    S: Storage,
{
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(Msg::Touch(uid)) => shared.lru.lock().touch(&uid),
                Err(_) => return,
            },
            recv(stop) -> _ => return,
        }
    }
}

pub(crate) fn evict_main<K, V, S>(stop: Receiver<()>, shared: Arc<Shared<K, V, S>>)
where
    K: KeyType,
    V: ValueType,
    S: Storage,
{
    let ticker = tick(EVICT_INTERVAL);
    loop {
        select! {
            recv(ticker) -> _ => {
                if let Err(err) = shared.evict_excess() {
                    warn!("cache: background eviction failed: {err}");
                }
            }
            recv(stop) -> _ => return,
        }
    }
}
