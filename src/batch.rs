//! Generic transfer batch.
//!
//! A batch is the unit of work handed to a host controller: one endpoint,
//! one buffer, one direction, and for control transfers the 8 setup bytes.
//! Each personality wraps this structure with its own descriptor chain; the
//! fields here are what the issuer reads back when the batch finishes.

use alloc::boxed::Box;

use crate::dma::DmaBuffer;
use crate::error::Result;
use crate::usb::{Direction, Target, SETUP_PACKET_SIZE};

/// Called exactly once when the batch completes, from the interrupt path or
/// from the cancellation path. `transferred_size` and `error` are valid by
/// then; for IN transfers the data is in `buffer`.
pub type CompletionCallback = Box<dyn FnOnce(&mut TransferBatch) + Send>;

pub struct TransferBatch {
    pub target: Target,
    pub dir: Direction,
    /// SETUP stage bytes; unused for bulk/interrupt batches.
    pub setup: [u8; SETUP_PACKET_SIZE],
    /// Data buffer in DMA memory. The issuer fills it for OUT transfers and
    /// reads it back after IN completion.
    pub buffer: DmaBuffer,
    /// Requested transfer size in bytes.
    pub size: usize,
    /// Bytes actually moved, valid after completion. Never exceeds `size`.
    pub transferred_size: usize,
    /// Completion status.
    pub error: Result<()>,
    on_complete: Option<CompletionCallback>,
}

impl TransferBatch {
    pub fn new(
        target: Target,
        dir: Direction,
        setup: [u8; SETUP_PACKET_SIZE],
        buffer: DmaBuffer,
        size: usize,
        on_complete: CompletionCallback,
    ) -> TransferBatch {
        debug_assert!(size <= buffer.len() || size == 0);
        TransferBatch {
            target,
            dir,
            setup,
            buffer,
            size,
            transferred_size: 0,
            error: Ok(()),
            on_complete: Some(on_complete),
        }
    }

    /// Deliver the batch to its issuer. The callback runs at most once;
    /// later calls are no-ops.
    pub fn finish(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            callback(self);
        }
    }

    /// Finish with the given error and nothing transferred.
    pub fn fail(&mut self, error: crate::error::UsbError) {
        self.error = Err(error);
        self.transferred_size = 0;
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UsbError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn target() -> Target {
        Target {
            address: 1,
            endpoint: 2,
        }
    }

    #[test]
    fn finish_runs_callback_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let buffer = DmaBuffer::alloc(8, 16).unwrap();
        let mut batch = TransferBatch::new(
            target(),
            Direction::In,
            [0; SETUP_PACKET_SIZE],
            buffer,
            8,
            Box::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );
        batch.finish();
        batch.finish();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fail_reports_error_and_zero_size() {
        let buffer = DmaBuffer::alloc(8, 16).unwrap();
        let mut batch = TransferBatch::new(
            target(),
            Direction::Out,
            [0; SETUP_PACKET_SIZE],
            buffer,
            8,
            Box::new(|batch| {
                assert_eq!(batch.error, Err(UsbError::Interrupted));
                assert_eq!(batch.transferred_size, 0);
            }),
        );
        batch.transferred_size = 4;
        batch.fail(UsbError::Interrupted);
    }
}
