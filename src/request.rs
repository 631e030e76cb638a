//! One-shot operation bookkeeping.
//!
//! The original models every in-flight operation (connect, write, shutdown,
//! `getaddrinfo`, work, fs-op) as one tagged struct with a union payload.
//! Rust's type system makes the tag redundant: each kind gets its own typed
//! request living inside the subsystem that understands it (`WriteJob` in
//! `stream.rs`, `WorkItem` in `work.rs`, ...). What's shared across all of
//! them is identity (`RequestId`) and the liveness contract: a request keeps
//! its loop alive from registration until its callback has run
//! (`SPEC_FULL.md` §3, Request invariant). [`crate::Loop`] tracks that with a
//! plain in-flight counter rather than an arena, since nothing outside the
//! owning subsystem ever needs to look a request up by id.

/// Identifies one in-flight operation for tracing/debugging purposes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RequestId(pub(crate) u64);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RequestKind {
    Connect,
    Write,
    Shutdown,
    GetAddrInfo,
    Work,
    Fs,
}

/// Metadata about an in-flight operation. Kept around for tracing; the
/// callback and buffers themselves live in the kind-specific job struct.
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub handle: Option<crate::handle::HandleId>,
}

#[derive(Default)]
pub(crate) struct RequestIdGen(u64);

impl RequestIdGen {
    pub(crate) fn next(&mut self) -> RequestId {
        self.0 += 1;
        RequestId(self.0)
    }
}
