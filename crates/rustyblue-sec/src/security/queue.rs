//! Requests parked while another security procedure runs

use super::types::{LeSecAction, SecCallback};
use crate::gap::{BdAddr, Transport};
use std::collections::VecDeque;
use std::fmt;

/// A deferred access or encryption request
pub enum PendingRequest {
    /// Multiplexor (RFCOMM) service access
    Multiplexor {
        bd_addr: BdAddr,
        psm: u16,
        is_originator: bool,
        security_required: u16,
        callback: SecCallback,
    },
    /// Direct encryption request
    Encryption {
        bd_addr: BdAddr,
        transport: Transport,
        sec_act: LeSecAction,
        callback: Option<SecCallback>,
    },
}

impl PendingRequest {
    pub fn bd_addr(&self) -> &BdAddr {
        match self {
            PendingRequest::Multiplexor { bd_addr, .. } => bd_addr,
            PendingRequest::Encryption { bd_addr, .. } => bd_addr,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            PendingRequest::Multiplexor { .. } => Transport::BrEdr,
            PendingRequest::Encryption { transport, .. } => *transport,
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingRequest::Multiplexor {
                bd_addr,
                psm,
                is_originator,
                security_required,
                ..
            } => f
                .debug_struct("Multiplexor")
                .field("bd_addr", bd_addr)
                .field("psm", psm)
                .field("is_originator", is_originator)
                .field("security_required", security_required)
                .finish(),
            PendingRequest::Encryption {
                bd_addr,
                transport,
                sec_act,
                ..
            } => f
                .debug_struct("Encryption")
                .field("bd_addr", bd_addr)
                .field("transport", transport)
                .field("sec_act", sec_act)
                .finish(),
        }
    }
}

/// FIFO of deferred requests in arrival order
#[derive(Debug, Default)]
pub struct PendingQueue {
    requests: VecDeque<PendingRequest>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.requests.push_back(request);
    }

    /// Remove every queued request, oldest first
    pub fn take_all(&mut self) -> VecDeque<PendingRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Remove the requests accepted by `filter`, keeping the order of the rest
    pub fn take_matching<F>(&mut self, mut filter: F) -> Vec<PendingRequest>
    where
        F: FnMut(&PendingRequest) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.requests.len());
        for request in self.requests.drain(..) {
            if filter(&request) {
                taken.push(request);
            } else {
                kept.push_back(request);
            }
        }
        self.requests = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
