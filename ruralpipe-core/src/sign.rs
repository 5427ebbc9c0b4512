//! Signing stage of the pipe chain.
//!
//! Two profiles:
//!
//! - [`SigningPipe::passthrough`] leaves the 128-byte signature region as
//!   the writer produced it (zero-filled). This is the default.
//! - [`SigningPipe::with_key`] computes HMAC-SHA256 into the signature
//!   region on the way out and verifies it on the way in. A frame whose
//!   signature does not verify is dropped and logged at debug level; the
//!   stream carrying it stays up.
//!
//! The MAC covers the header fields before the sequence number plus the
//! whole record region. The sequence number is stamped at transmit time,
//! after this stage has run, so it cannot be part of the MAC; the signature
//! region itself is excluded for the obvious reason.

use std::sync::Arc;

use ring::{constant_time, hmac};

use crate::pipe::{attach, PipeError, PipeLinks, TunnelFramePipe};
use crate::proto::{FRAME_HEADER_SIZE, PRE_SEQ_NUM_RANGE, SIGNATURE_RANGE};

const MAC_LEN: usize = 32;

pub struct SigningPipe {
    links: PipeLinks,
    key: Option<hmac::Key>,
}

impl SigningPipe {
    pub fn passthrough() -> Arc<Self> {
        Arc::new(Self {
            links: PipeLinks::new("signing"),
            key: None,
        })
    }

    pub fn with_key(key: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            links: PipeLinks::new("signing"),
            key: Some(hmac::Key::new(hmac::HMAC_SHA256, key)),
        })
    }

    /// Creates a pass-through signing stage already attached in front of
    /// `prev`.
    pub fn attached(prev: Arc<dyn TunnelFramePipe>) -> Arc<Self> {
        let pipe = Self::passthrough();
        attach(pipe.clone(), prev);
        pipe
    }

    fn mac(&self, frame: &[u8]) -> Option<hmac::Tag> {
        let key = self.key.as_ref()?;
        let mut context = hmac::Context::with_key(key);
        context.update(&frame[PRE_SEQ_NUM_RANGE]);
        context.update(&frame[FRAME_HEADER_SIZE..]);
        Some(context.sign())
    }

    fn sign(&self, frame: &mut [u8]) {
        if let Some(tag) = self.mac(frame) {
            let start = SIGNATURE_RANGE.start;
            frame[start..start + MAC_LEN].copy_from_slice(tag.as_ref());
        }
    }

    fn verify(&self, frame: &[u8]) -> Result<(), PipeError> {
        let Some(tag) = self.mac(frame) else {
            return Ok(());
        };
        let start = SIGNATURE_RANGE.start;
        constant_time::verify_slices_are_equal(tag.as_ref(), &frame[start..start + MAC_LEN])
            .map_err(|_| PipeError::SignatureMismatch)
    }
}

impl TunnelFramePipe for SigningPipe {
    fn links(&self) -> &PipeLinks {
        &self.links
    }

    fn on_frame_from_prev(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        self.sign(frame);
        self.links.invoke_next(frame)
    }

    fn on_frame_from_next(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        match self.verify(frame) {
            Ok(()) => self.links.invoke_prev(frame),
            Err(PipeError::SignatureMismatch) => {
                tracing::debug!("dropping frame with mismatched signature");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
