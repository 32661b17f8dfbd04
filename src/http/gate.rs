//! Per-connection ordered delivery.
//!
//! Every request on a connection reserves a [`Slot`] when its head arrives.
//! Slots are numbered in arrival order and a slot may only write once every
//! earlier slot has been released (or dropped). Application work for later
//! requests can finish first; their bytes simply wait here.
//!
//! ```text
//!   reserve()      reserve()      reserve()
//!      │              │              │
//!   ticket 0       ticket 1       ticket 2
//!      │              │              │
//!   write ──► sink  waits ...      waits ...
//!   release ────────► write ──► sink
//!                     release ───────► write ──► sink
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, watch};

/// Write half of a connection.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
pub enum GateError {
    /// The connection was closed by an earlier response or a write failure.
    Closed,
    Io(std::io::Error),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::Closed => f.write_str("connection closed"),
            GateError::Io(e) => write!(f, "write failed: {}", e),
        }
    }
}

impl std::error::Error for GateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GateError::Closed => None,
            GateError::Io(e) => Some(e),
        }
    }
}

struct Shared {
    sink: AsyncMutex<Sink>,
    /// Ticket currently allowed to write.
    serving: watch::Sender<u64>,
    /// Released tickets that the head has not reached yet.
    finished: Mutex<BTreeSet<u64>>,
    closed: watch::Sender<bool>,
    /// Set once the client stops sending (EOF or read error).
    gone: watch::Sender<bool>,
}

impl Shared {
    fn finish(&self, ticket: u64) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        finished.insert(ticket);
        self.serving.send_modify(|serving| {
            while finished.remove(&*serving) {
                *serving += 1;
            }
        });
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// FIFO of pending writers for one connection.
pub struct DeliveryGate {
    shared: Arc<Shared>,
    next_ticket: u64,
}

impl DeliveryGate {
    pub fn new(sink: Sink) -> Self {
        let (serving, _) = watch::channel(0);
        let (closed, _) = watch::channel(false);
        let (gone, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                sink: AsyncMutex::new(sink),
                serving,
                finished: Mutex::new(BTreeSet::new()),
                closed,
                gone,
            }),
            next_ticket: 0,
        }
    }

    /// Queues a new writer behind every slot reserved so far.
    pub fn reserve(&mut self) -> Slot {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        Slot {
            shared: Arc::clone(&self.shared),
            ticket,
            acquired: false,
            released: false,
            written: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Marks the client as gone. Every in-flight [`Hangup`] fires.
    pub fn hang_up(&self) {
        self.shared.gone.send_replace(true);
    }

    /// Resolves once a response has asked for the connection to close.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// One request's place in the delivery queue.
///
/// Dropping a slot without releasing it counts as a release, so a request
/// that never produced a response cannot stall the requests behind it.
pub struct Slot {
    shared: Arc<Shared>,
    ticket: u64,
    acquired: bool,
    released: bool,
    written: u64,
}

impl Slot {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// A handle that fires when this connection ends, independent of the slot.
    pub fn hangup(&self) -> Hangup {
        Hangup {
            gone: self.shared.gone.subscribe(),
            closed: self.shared.closed.subscribe(),
        }
    }

    /// Bytes written through this slot so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Waits until every earlier slot is done.
    async fn acquire(&mut self) {
        if self.acquired {
            return;
        }
        let mut rx = self.shared.serving.subscribe();
        let ticket = self.ticket;
        let _ = rx.wait_for(|serving| *serving >= ticket).await;
        self.acquired = true;
    }

    /// Writes `bytes` once this slot reaches the head of the queue.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), GateError> {
        self.acquire().await;
        if self.shared.is_closed() {
            return Err(GateError::Closed);
        }

        let mut sink = self.shared.sink.lock().await;
        let result = match sink.write_all(bytes).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            drop(sink);
            self.shared.close();
            return Err(GateError::Io(e));
        }

        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Hands the connection to the next slot.
    ///
    /// With `keep_open == false` the sink is shut down first and every later
    /// slot fails with [`GateError::Closed`].
    pub async fn release(mut self, keep_open: bool) -> Result<(), GateError> {
        let mut result = Ok(());

        if !keep_open {
            self.acquire().await;
            if !self.shared.is_closed() {
                self.shared.close();
                let mut sink = self.shared.sink.lock().await;
                result = sink.shutdown().await.map_err(GateError::Io);
            }
        }

        self.released = true;
        self.shared.finish(self.ticket);
        result
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.released {
            self.shared.finish(self.ticket);
        }
    }
}

/// Fires when the client hangs up or the connection gets closed.
#[derive(Debug, Clone)]
pub struct Hangup {
    gone: watch::Receiver<bool>,
    closed: watch::Receiver<bool>,
}

impl Hangup {
    pub async fn wait(&mut self) {
        tokio::select! {
            _ = self.gone.wait_for(|gone| *gone) => {}
            _ = self.closed.wait_for(|closed| *closed) => {}
        }
    }
}
