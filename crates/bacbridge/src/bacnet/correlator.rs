//! Transaction correlation
//!
//! Maps invoke ids to waiting callers. The pending table is the single source
//! of truth shared by the protocol loop (which resolves entries) and callers
//! (which time them out). Whoever removes an entry from the table owns its
//! resolution, so a transaction is resolved at most once.
//!
//! Each transaction gets a one-slot channel. The loop removes the entry and
//! sends the outcome while holding the table lock; a caller that loses the
//! race to time out therefore always finds the outcome already queued.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::types::{Device, ObjectId, PropertyIdentifier, PropertyValue};

/// Kind of confirmed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Positive answer from a device
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Property {
        object: ObjectId,
        property: PropertyIdentifier,
        value: PropertyValue,
    },
    Ack,
}

/// Why the correlator stopped accepting work
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    Shutdown,
    TransportFailed(String),
}

impl From<CloseReason> for Error {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Shutdown => Error::Shutdown,
            CloseReason::TransportFailed(msg) => Error::TransportFatal(msg),
        }
    }
}

/// Terminal state of a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Resolved(Reply),
    Rejected(String),
    /// The reply carried our invoke id but its payload did not decode
    Malformed(String),
    TimedOut,
    Closed(CloseReason),
}

/// What happened to an inbound reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered(RequestKind),
    /// The id belongs to a transaction that already timed out
    Late,
    /// The id matches a transaction addressed to someone else
    WrongSource { expected: SocketAddr },
    Unknown,
}

struct Pending {
    serial: u64,
    kind: RequestKind,
    target: SocketAddr,
    tx: SyncSender<Outcome>,
}

struct Aggregate {
    range: Option<(u32, u32)>,
    deadline: Instant,
    devices: BTreeMap<u32, Device>,
    /// Set when `close()` ended the window before its deadline
    interrupted: bool,
    wake: SyncSender<()>,
}

impl Aggregate {
    fn accepts(&self, device_id: u32) -> bool {
        match self.range {
            Some((low, high)) => (low..=high).contains(&device_id),
            None => true,
        }
    }
}

struct Table {
    next_invoke_id: u8,
    next_serial: u64,
    pending: HashMap<u8, Pending>,
    /// Ids whose transaction timed out, held back until the instant stored
    quarantine: HashMap<u8, Instant>,
    discoveries: HashMap<Uuid, Aggregate>,
    closed: Option<CloseReason>,
}

impl Table {
    fn allocate_invoke_id(&mut self, now: Instant) -> Option<u8> {
        self.quarantine.retain(|_, until| *until > now);
        for _ in 0..256 {
            let id = self.next_invoke_id;
            self.next_invoke_id = id.wrapping_add(1);
            if !self.pending.contains_key(&id) && !self.quarantine.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn remove_if_current(&mut self, invoke_id: u8, serial: u64) -> bool {
        match self.pending.get(&invoke_id) {
            Some(p) if p.serial == serial => {
                self.pending.remove(&invoke_id);
                true
            }
            _ => false,
        }
    }
}

/// Shared pending-transaction table
pub struct Correlator {
    table: Mutex<Table>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_invoke_id: 0,
                next_serial: 0,
                pending: HashMap::new(),
                quarantine: HashMap::new(),
                discoveries: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Register a confirmed request and return a handle to wait on
    pub fn submit(
        self: &Arc<Self>,
        kind: RequestKind,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<TransactionHandle> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument("timeout must be positive".to_string()));
        }

        let now = Instant::now();
        let mut table = self.table.lock();
        if let Some(reason) = &table.closed {
            return Err(reason.clone().into());
        }

        let invoke_id = table.allocate_invoke_id(now).ok_or(Error::Busy)?;
        let serial = table.next_serial;
        table.next_serial += 1;

        let (tx, rx) = mpsc::sync_channel(1);
        table.pending.insert(
            invoke_id,
            Pending {
                serial,
                kind,
                target,
                tx,
            },
        );

        Ok(TransactionHandle {
            invoke_id,
            serial,
            timeout,
            deadline: now + timeout,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Deliver a reply from the protocol loop
    ///
    /// Duplicates and replies to timed-out transactions are reported but never
    /// delivered.
    pub fn resolve(&self, invoke_id: u8, source: SocketAddr, outcome: Outcome) -> Resolution {
        let mut table = self.table.lock();

        let target = match table.pending.get(&invoke_id) {
            Some(p) => p.target,
            None if table.quarantine.contains_key(&invoke_id) => return Resolution::Late,
            None => return Resolution::Unknown,
        };
        if target != source {
            return Resolution::WrongSource { expected: target };
        }

        match table.pending.remove(&invoke_id) {
            Some(pending) => {
                let _ = pending.tx.try_send(outcome);
                Resolution::Delivered(pending.kind)
            }
            None => Resolution::Unknown,
        }
    }

    /// Open a discovery window
    pub fn begin_discovery(
        self: &Arc<Self>,
        range: Option<(u32, u32)>,
        timeout: Duration,
    ) -> Result<DiscoveryHandle> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument("timeout must be positive".to_string()));
        }
        if let Some((low, high)) = range {
            if low > high {
                return Err(Error::InvalidArgument(format!(
                    "device range {}..{} is empty",
                    low, high
                )));
            }
        }

        let mut table = self.table.lock();
        if let Some(reason) = &table.closed {
            return Err(reason.clone().into());
        }

        let session_id = Uuid::new_v4();
        let deadline = Instant::now() + timeout;
        let (wake, wake_rx) = mpsc::sync_channel(1);
        table.discoveries.insert(
            session_id,
            Aggregate {
                range,
                deadline,
                devices: BTreeMap::new(),
                interrupted: false,
                wake,
            },
        );

        Ok(DiscoveryHandle {
            session_id,
            deadline,
            wake_rx,
            correlator: Arc::clone(self),
        })
    }

    /// Add an I-Am to every open discovery window that covers the device
    ///
    /// Returns how many windows took it.
    pub fn record_iam(&self, device: &Device) -> usize {
        let mut table = self.table.lock();
        let mut taken = 0;
        for aggregate in table.discoveries.values_mut() {
            if aggregate.accepts(device.device_id) {
                aggregate.devices.insert(device.device_id, device.clone());
                taken += 1;
            }
        }
        taken
    }

    /// Stop accepting work and release every waiter
    pub fn close(&self, reason: CloseReason) {
        let mut table = self.table.lock();
        if table.closed.is_some() {
            return;
        }

        let pending = std::mem::take(&mut table.pending);
        if !pending.is_empty() {
            tracing::info!("Releasing {} pending transactions ({:?})", pending.len(), reason);
        }
        for (_, p) in pending {
            let _ = p.tx.try_send(Outcome::Closed(reason.clone()));
        }
        let now = Instant::now();
        for aggregate in table.discoveries.values_mut() {
            if now < aggregate.deadline {
                aggregate.interrupted = true;
                let _ = aggregate.wake.try_send(());
            }
        }
        table.closed = Some(reason);
    }

    pub fn closed_reason(&self) -> Option<CloseReason> {
        self.table.lock().closed.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    pub fn is_pending(&self, invoke_id: u8) -> bool {
        self.table.lock().pending.contains_key(&invoke_id)
    }

    pub fn active_discoveries(&self) -> usize {
        self.table.lock().discoveries.len()
    }
}

/// Caller's side of one outstanding request
pub struct TransactionHandle {
    invoke_id: u8,
    serial: u64,
    timeout: Duration,
    deadline: Instant,
    rx: Receiver<Outcome>,
    correlator: Arc<Correlator>,
}

impl TransactionHandle {
    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }

    /// Block until the transaction is resolved or its deadline passes
    pub fn wait(self) -> Outcome {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let expired = {
                    let mut table = self.correlator.table.lock();
                    let removed = table.remove_if_current(self.invoke_id, self.serial);
                    if removed {
                        table
                            .quarantine
                            .insert(self.invoke_id, Instant::now() + self.timeout);
                    }
                    removed
                };
                if expired {
                    return Outcome::TimedOut;
                }
                // Resolved between the timeout and taking the lock
                self.rx.try_recv().unwrap_or(Outcome::TimedOut)
            }
        }
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        let mut table = self.correlator.table.lock();
        if table.remove_if_current(self.invoke_id, self.serial) {
            // Abandoned before its deadline; a reply may still be in flight
            let until = self.deadline.max(Instant::now());
            table.quarantine.insert(self.invoke_id, until);
        }
    }
}

/// Caller's side of a discovery window
pub struct DiscoveryHandle {
    session_id: Uuid,
    deadline: Instant,
    wake_rx: Receiver<()>,
    correlator: Arc<Correlator>,
}

impl DiscoveryHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Block until the window closes, then return every device that answered
    ///
    /// Fails only when `close()` cut the window short. A window that ran to
    /// its deadline keeps its devices even if the correlator closed since.
    pub fn wait(self) -> Result<Vec<Device>> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        // Woken early only by close()
        let _ = self.wake_rx.recv_timeout(remaining);

        let (aggregate, closed) = {
            let mut table = self.correlator.table.lock();
            (table.discoveries.remove(&self.session_id), table.closed.clone())
        };
        match aggregate {
            Some(aggregate) if aggregate.interrupted => {
                Err(closed.unwrap_or(CloseReason::Shutdown).into())
            }
            Some(aggregate) => Ok(aggregate.devices.into_values().collect()),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.correlator
            .table
            .lock()
            .discoveries
            .remove(&self.session_id);
    }
}
