//! Handle lifecycle: kind, flags, and the id used to look a handle up inside
//! its owning [`crate::Loop`]'s arena.
//!
//! A [`Loop`](crate::Loop) owns every handle by value in a `slab::Slab`; user
//! code only ever holds a cheap `Copy` [`HandleId`] plus a typed wrapper
//! (`TimerHandle`, `AsyncHandle`, ...). This sidesteps the cyclic
//! handle-owns-a-reference-to-its-loop / loop-owns-its-handles relationship
//! that the C original expresses with raw pointers (see `SPEC_FULL.md` §9).

use bitflags::bitflags;

/// A stable index into the owning loop's handle arena. Not meaningful across
/// different [`crate::Loop`] instances.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct HandleId(pub(crate) usize);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HandleKind {
    Timer,
    Stream,
    Tcp,
    Pipe,
    Process,
    Async,
    Idle,
    Prepare,
    Check,
}

bitflags! {
    /// Per-handle state. `ACTIVE | REF` is exactly the condition under which a
    /// handle keeps its loop alive (`SPEC_FULL.md` §3, Handle invariants).
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Flags: u32 {
        const ACTIVE        = 1 << 0;
        const REF           = 1 << 1;
        const CLOSING       = 1 << 2;
        const CLOSED        = 1 << 3;
        const READABLE      = 1 << 4;
        const WRITABLE      = 1 << 5;
        const CONNECTED     = 1 << 6;
        const LISTENING     = 1 << 7;
        const SHUTTING      = 1 << 8;
        const EOF           = 1 << 9;
        const READ_PENDING  = 1 << 10;
        const WRITE_PENDING = 1 << 11;
    }
}

impl Default for Flags {
    fn default() -> Self {
        // Every handle starts ref'd; `unref` is an explicit opt-out, matching
        // the external API ("each handle supports ref/unref").
        Flags::REF
    }
}

impl Flags {
    /// Whether this handle currently contributes to loop liveness.
    pub fn keeps_loop_alive(&self) -> bool {
        self.contains(Flags::ACTIVE | Flags::REF) && !self.contains(Flags::CLOSING | Flags::CLOSED)
    }
}

/// A type-erased view of a handle's identity. Kind-specific wrappers
/// (`TimerHandle`, `AsyncHandle`, `ProcessHandle`, stream handles, ...) all
/// carry one of these and forward `id`/`kind` to it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Handle {
    pub(crate) id: HandleId,
    pub(crate) kind: HandleKind,
}

impl Handle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }
}
