//! Compressing stage of the pipe chain.
//!
//! Symmetric pass-through today: [`encode`](CompressingPipe::encode) and
//! [`decode`](CompressingPipe::decode) are the hooks a payload compressor
//! plugs into. Whatever the encode side does to the record region, the
//! decode side must restore bit-exactly.

use std::sync::Arc;

use crate::pipe::{attach, PipeError, PipeLinks, TunnelFramePipe};

pub struct CompressingPipe {
    links: PipeLinks,
}

impl CompressingPipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: PipeLinks::new("compressing"),
        })
    }

    /// Creates the stage already attached in front of `prev`.
    pub fn attached(prev: Arc<dyn TunnelFramePipe>) -> Arc<Self> {
        let pipe = Self::new();
        attach(pipe.clone(), prev);
        pipe
    }

    fn encode(&self, _frame: &mut [u8]) -> Result<(), PipeError> {
        Ok(())
    }

    fn decode(&self, _frame: &mut [u8]) -> Result<(), PipeError> {
        Ok(())
    }
}

impl TunnelFramePipe for CompressingPipe {
    fn links(&self) -> &PipeLinks {
        &self.links
    }

    fn on_frame_from_prev(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        self.encode(frame)?;
        self.links.invoke_next(frame)
    }

    fn on_frame_from_next(&self, frame: &mut [u8]) -> Result<(), PipeError> {
        match self.decode(frame) {
            Ok(()) => self.links.invoke_prev(frame),
            Err(PipeError::Decompress) => {
                // A frame that fails to decompress is dropped; the stream
                // itself stays healthy.
                tracing::debug!("dropping frame that failed to decompress");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
