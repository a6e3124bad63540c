// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Virtual connections: the pairing objects joining an IN and an OUT tunnel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::{RpcInChannel, RpcOutChannel};
use crate::pdu::PduProcessor;

/// Index of a context in the pool.
pub type SlotId = usize;

/// An IN context currently bound into a virtual connection.
#[derive(Clone)]
pub struct InSlot {
    pub slot: SlotId,
    pub channel: Arc<Mutex<RpcInChannel>>,
}

/// An OUT context currently bound into a virtual connection.
#[derive(Clone)]
pub struct OutSlot {
    pub slot: SlotId,
    pub channel: Arc<Mutex<RpcOutChannel>>,
}

/// Everything guarded by the per-VC mutex: the channel slots, the successor
/// slots staged during recycling, and the PDU processor.
#[derive(Default)]
pub struct VconnState {
    pub processor: Option<Box<dyn PduProcessor>>,
    pub ctx_in: Option<InSlot>,
    pub ctx_in_succ: Option<InSlot>,
    pub ctx_out: Option<OutSlot>,
    pub ctx_out_succ: Option<OutSlot>,
}

pub struct Vconn {
    /// Outstanding [`VconnRef`]s. Adjusted under the registry lock.
    refs: AtomicI32,
    state: Mutex<VconnState>,
}

/// Process-wide map of virtual connections, keyed by lowercased
/// `cookie:port:host`. Bounded to the context pool size plus one.
pub struct VconnRegistry {
    capacity: usize,
    map: Mutex<HashMap<String, Arc<Vconn>>>,
}

fn vconn_key(host: &str, port: u16, conn_cookie: &str) -> String {
    format!("{conn_cookie}:{port}:{host}").to_lowercase()
}

/// Outcome of a create attempt.
pub enum CreateOutcome {
    Created(VconnRef),
    /// Somebody else created the same key concurrently; look it up again.
    Raced,
    /// Registry at capacity.
    Full,
    /// The engine declined to mint a processor for this endpoint.
    NoProcessor,
}

impl VconnRegistry {
    pub fn new(capacity: usize) -> Arc<VconnRegistry> {
        Arc::new(VconnRegistry {
            capacity,
            map: Mutex::new(HashMap::new()),
        })
    }

    /// Borrows the virtual connection for `(host, port, cookie)`, bumping its
    /// refcount so it cannot be torn down while held.
    pub fn get(self: &Arc<Self>, host: &str, port: u16, conn_cookie: &str) -> Option<VconnRef> {
        let key = vconn_key(host, port, conn_cookie);
        let map = self.map.lock().unwrap();
        let vc = map.get(&key)?.clone();
        vc.refs.fetch_add(1, Ordering::AcqRel);
        drop(map);
        Some(VconnRef {
            registry: self.clone(),
            vc,
            key,
        })
    }

    /// Creates the virtual connection, minting its processor via `make`
    /// inside the registry's critical section so the key is never observable
    /// half-made.
    pub fn create_with(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        conn_cookie: &str,
        make: impl FnOnce() -> Option<Box<dyn PduProcessor>>,
    ) -> CreateOutcome {
        let key = vconn_key(host, port, conn_cookie);
        let mut map = self.map.lock().unwrap();
        if map.contains_key(&key) {
            return CreateOutcome::Raced;
        }
        if map.len() >= self.capacity {
            tracing::debug!("vconn hash full");
            return CreateOutcome::Full;
        }
        let Some(processor) = make() else {
            return CreateOutcome::NoProcessor;
        };
        let vc = Arc::new(Vconn {
            refs: AtomicI32::new(1),
            state: Mutex::new(VconnState {
                processor: Some(processor),
                ..Default::default()
            }),
        });
        map.insert(key.clone(), vc.clone());
        drop(map);
        CreateOutcome::Created(VconnRef {
            registry: self.clone(),
            vc,
            key,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// Tears down every virtual connection, releasing the processors.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut map = self.map.lock().unwrap();
            map.drain().collect()
        };
        // Arcs (and processors) die here, outside the registry lock.
        drop(drained);
    }
}

/// A counted borrow of a virtual connection. The VC mutex is taken in short
/// scopes through [`VconnRef::lock`]; the reference itself pins the pairing
/// against teardown for as long as it is held.
pub struct VconnRef {
    registry: Arc<VconnRegistry>,
    vc: Arc<Vconn>,
    key: String,
}

impl VconnRef {
    pub fn lock(&self) -> MutexGuard<'_, VconnState> {
        self.vc.state.lock().unwrap()
    }
}

impl Drop for VconnRef {
    fn drop(&mut self) {
        let mut map = self.registry.map.lock().unwrap();
        let prev = self.vc.refs.fetch_sub(1, Ordering::AcqRel);
        let mut removed = None;
        if prev == 1 {
            // No other borrow exists, so the state lock cannot be contended.
            let state = self.vc.state.lock().unwrap();
            if state.ctx_in.is_none() && state.ctx_out.is_none() {
                removed = map.remove(&self.key);
            }
        }
        drop(map);
        // Destruction (including the PDU processor) runs with the registry
        // lock released.
        drop(removed);
    }
}
