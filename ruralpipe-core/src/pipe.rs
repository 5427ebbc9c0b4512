//! Bidirectional frame pipe chain.
//!
//! The data plane is a linear chain of stages. Frames travel toward the
//! network through [`PipeLinks::invoke_next`] and toward the tunnel device
//! through [`PipeLinks::invoke_prev`]; each delivery lands in the neighbor's
//! [`TunnelFramePipe::on_frame_from_prev`] or
//! [`TunnelFramePipe::on_frame_from_next`].
//!
//! Neighbor slots start out detached. Delivering toward a detached (or
//! already dropped) neighbor uniformly fails with [`PipeError::NotYetReady`],
//! which producers treat as retryable: it covers the window where the tunnel
//! side has data before the socket side has finished its initial exchange.

use std::io;
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::proto::FrameError;

/// Errors crossing stage boundaries in the pipe chain.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The neighbor stage has not been attached yet. Retryable.
    #[error("the other side of the tunnel is not connected yet")]
    NotYetReady,

    /// Graceful shutdown was requested.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The frame signature did not verify. The frame is dropped.
    #[error("tunnel frame signature mismatch")]
    SignatureMismatch,

    /// The frame payload could not be decompressed. The frame is dropped.
    #[error("tunnel frame decompression failed")]
    Decompress,
}

/// One stage of the pipe chain.
///
/// Handlers may be called by multiple threads at a time; implementers provide
/// their own synchronisation where they need it. A handler is allowed to
/// block if it cannot process the frame immediately.
pub trait TunnelFramePipe: Send + Sync {
    /// The neighbor slots of this stage.
    fn links(&self) -> &PipeLinks;

    /// A frame travelling toward the network arrived from the previous
    /// (tunnel-side) stage.
    fn on_frame_from_prev(&self, frame: &mut [u8]) -> Result<(), PipeError>;

    /// A frame travelling toward the tunnel device arrived from the next
    /// (network-side) stage.
    fn on_frame_from_next(&self, frame: &mut [u8]) -> Result<(), PipeError>;
}

struct Link {
    neighbor: Option<Weak<dyn TunnelFramePipe>>,
    in_flight: usize,
}

struct Side {
    link: Mutex<Link>,
    drained: Condvar,
}

impl Side {
    fn new() -> Self {
        Self {
            link: Mutex::new(Link {
                neighbor: None,
                in_flight: 0,
            }),
            drained: Condvar::new(),
        }
    }
}

/// The two neighbor slots a stage embeds, plus the bookkeeping which makes
/// detaching safe while calls are in flight.
pub struct PipeLinks {
    desc: &'static str,
    prev: Side,
    next: Side,
}

enum Direction {
    TowardNext,
    TowardPrev,
}

impl PipeLinks {
    pub fn new(desc: &'static str) -> Self {
        Self {
            desc,
            prev: Side::new(),
            next: Side::new(),
        }
    }

    /// Short human-readable name of the owning stage, for log lines.
    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// Delivers a frame to the next (network-side) neighbor.
    pub fn invoke_next(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        self.invoke(&self.next, frame, Direction::TowardNext)
    }

    /// Delivers a frame to the previous (tunnel-side) neighbor.
    pub fn invoke_prev(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        self.invoke(&self.prev, frame, Direction::TowardPrev)
    }

    fn invoke(
        &self,
        side: &Side,
        frame: &mut [u8],
        direction: Direction,
    ) -> Result<(), PipeError> {
        // The neighbor is resolved and the in-flight count bumped under the
        // same lock a detach swaps the slot under, so a detach started after
        // this point waits for the call to return.
        let target = {
            let mut link = side.link.lock().unwrap();
            match link.neighbor.as_ref().and_then(Weak::upgrade) {
                Some(target) => {
                    link.in_flight += 1;
                    target
                }
                None => return Err(PipeError::NotYetReady),
            }
        };

        let result = match direction {
            Direction::TowardNext => target.on_frame_from_prev(frame),
            Direction::TowardPrev => target.on_frame_from_next(frame),
        };

        let mut link = side.link.lock().unwrap();
        link.in_flight -= 1;
        if link.in_flight == 0 {
            side.drained.notify_all();
        }
        drop(link);

        result
    }
}

/// Attaches `stage` in front of `prev`: frames `prev` sends toward the
/// network land in `stage`, and vice versa.
///
/// Both slots involved must currently be detached.
pub fn attach(stage: Arc<dyn TunnelFramePipe>, prev: Arc<dyn TunnelFramePipe>) {
    {
        let mut link = stage.links().prev.link.lock().unwrap();
        assert!(
            link.neighbor.as_ref().and_then(Weak::upgrade).is_none(),
            "pipe stage '{}' is already attached on its tunnel side",
            stage.links().desc
        );
        link.neighbor = Some(Arc::downgrade(&prev));
    }
    {
        let mut link = prev.links().next.link.lock().unwrap();
        assert!(
            link.neighbor.as_ref().and_then(Weak::upgrade).is_none(),
            "pipe stage '{}' is already attached on its network side",
            prev.links().desc
        );
        link.neighbor = Some(Arc::downgrade(&stage));
    }

    tracing::info!(
        stage = stage.links().desc,
        prev = prev.links().desc,
        "pipe stage attached"
    );
}

/// Detaches `stage` from its previous neighbor.
///
/// `stage` must be the network-most attached stage of the chain. The call
/// returns only once every delivery in flight from the previous neighbor has
/// completed; no new delivery can begin because the slot is swapped under
/// the same lock which gates call entry.
pub fn detach(stage: &dyn TunnelFramePipe) {
    let prev = {
        let mut link = stage.links().prev.link.lock().unwrap();
        link.neighbor.take()
    };

    let Some(prev) = prev.and_then(|weak| weak.upgrade()) else {
        return;
    };

    let side = &prev.links().next;
    let mut link = side.link.lock().unwrap();
    link.neighbor = None;
    while link.in_flight > 0 {
        link = side.drained.wait(link).unwrap();
    }
    drop(link);

    tracing::info!(
        stage = stage.links().desc,
        prev = prev.links().desc,
        "pipe stage detached"
    );
}
