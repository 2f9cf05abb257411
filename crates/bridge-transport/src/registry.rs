use std::sync::Mutex;

use crate::error::SelectionError;
use crate::transport::{ConnectionState, Transport, TransportKind};

/// What a smart-socket client asked to be connected to. Mirrors the
/// `-s`/`-d`/`-e`/`transport-*` selection family in the original
/// `sockets.c`'s `handle_host_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSelector {
    Any,
    AnyUsb,
    AnyLocal,
    Serial(String),
}

/// A queued `track-devices` or `wait-for-device` request. Woken whenever
/// the registry's transport list changes (`wait-for-device` was in the
/// original source; added back here alongside `track-devices`).
pub struct Waiter {
    pub selector: TransportSelector,
    pub notify: crossbeam_channel::Sender<()>,
}

#[derive(Default)]
struct Inner {
    transports: Vec<Transport>,
    waiters: Vec<Waiter>,
}

/// Mutex-protected ordered collection of live transports. A single mutex
/// is adequate here: the loop thread does the vast majority of accesses,
/// and contention only arises from rare cross-thread registry reads (e.g.
/// a CLI-adjacent admin call), matching the original `transport_list`
/// global guarded by `transport_lock`.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transport: Transport) {
        let mut inner = self.inner.lock().unwrap();
        inner.transports.push(transport);
        self.notify_waiters_locked(&mut inner);
    }

    pub fn remove(&self, id: u32) -> Option<Transport> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.transports.iter().position(|t| t.id == id)?;
        let removed = inner.transports.remove(idx);
        self.notify_waiters_locked(&mut inner);
        Some(removed)
    }

    /// Removes and returns every transport matching `pred`, used by
    /// `disconnect:` to tear down one or all TCP transports at once.
    pub fn remove_by(&self, pred: impl Fn(&Transport) -> bool) -> Vec<Transport> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = Vec::new();
        let mut i = 0;
        while i < inner.transports.len() {
            if pred(&inner.transports[i]) {
                removed.push(inner.transports.remove(i));
            } else {
                i += 1;
            }
        }
        if !removed.is_empty() {
            self.notify_waiters_locked(&mut inner);
        }
        removed
    }

    /// `serial-match:<prefix>`: succeeds only when exactly one live
    /// transport's serial starts with `prefix`.
    pub fn serial_match(&self, prefix: &str) -> Result<String, SelectionError> {
        let inner = self.inner.lock().unwrap();
        let mut matches = inner.transports.iter().filter(|t| t.serial.starts_with(prefix));
        let first = matches.next().ok_or(SelectionError::TargetNotFound)?;
        if matches.next().is_some() {
            return Err(SelectionError::MoreThanOneTarget);
        }
        Ok(first.serial.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_transport<R>(&self, id: u32, f: impl FnOnce(&mut Transport) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.transports.iter_mut().find(|t| t.id == id).map(f)
    }

    pub fn for_each<F: FnMut(&Transport)>(&self, mut f: F) {
        let inner = self.inner.lock().unwrap();
        for t in &inner.transports {
            f(t);
        }
    }

    /// Registers a waiter to be woken the next time the registry changes.
    /// The caller re-evaluates its selector after being woken; this
    /// registry never decides satisfaction itself.
    pub fn register_waiter(&self, waiter: Waiter) {
        self.inner.lock().unwrap().waiters.push(waiter);
    }

    pub fn drop_waiters(&self, pred: impl Fn(&Waiter) -> bool) {
        self.inner.lock().unwrap().waiters.retain(|w| !pred(w));
    }

    fn notify_waiters_locked(&self, inner: &mut Inner) {
        inner.waiters.retain(|w| w.notify.send(()).is_ok());
    }

    /// Implements `acquire_one_transport`: selects exactly one transport
    /// matching `selector`, failing with the same disambiguation errors the
    /// original CLI surfaces when more than one candidate matches.
    pub fn acquire_one(&self, selector: &TransportSelector) -> Result<u32, SelectionError> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<&Transport> = inner
            .transports
            .iter()
            .filter(|t| matches_selector(t, selector))
            .collect();

        match selector {
            TransportSelector::Serial(serial) => {
                candidates.retain(|t| &t.serial == serial);
                match candidates.len() {
                    0 => Err(SelectionError::TargetNotFound),
                    _ => select_state(candidates[0]),
                }
            }
            TransportSelector::Any => match candidates.len() {
                0 => Err(SelectionError::TargetNotFound),
                1 => select_state(candidates[0]),
                _ => Err(SelectionError::MoreThanOneTarget),
            },
            TransportSelector::AnyUsb => match candidates.len() {
                0 => Err(SelectionError::TargetNotFound),
                1 => select_state(candidates[0]),
                _ => Err(SelectionError::MoreThanOneDevice),
            },
            TransportSelector::AnyLocal => match candidates.len() {
                0 => Err(SelectionError::TargetNotFound),
                1 => select_state(candidates[0]),
                _ => Err(SelectionError::MoreThanOneEmulator),
            },
        }
    }
}

fn matches_selector(t: &Transport, selector: &TransportSelector) -> bool {
    match selector {
        TransportSelector::Any => true,
        TransportSelector::AnyUsb => t.kind == TransportKind::Usb,
        TransportSelector::AnyLocal => t.kind == TransportKind::Local || t.kind == TransportKind::HostProxy,
        TransportSelector::Serial(_) => true,
    }
}

fn select_state(t: &Transport) -> Result<u32, SelectionError> {
    match t.state {
        ConnectionState::Offline => Err(SelectionError::TargetOffline),
        ConnectionState::PasswordLocked => Err(SelectionError::TargetLocked),
        _ => Ok(t.id),
    }
}
