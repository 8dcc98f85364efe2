//! UHCI schedule lists.
//!
//! Each transfer class owns one list: a dummy queue head the frame list
//! (or the previous class) points at, a hardware chain of per-batch queue
//! heads behind it, and a software mirror of that chain. The mirror and
//! the hardware links are only ever edited under the list lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::dma::DmaBuffer;
use crate::error::{Result, UsbError};
use crate::mem::write_barrier;
use crate::usb::TransferType;

use super::batch::UhciBatch;
use super::hw::Qh;
use super::UhciEndpoint;

struct Entry {
    ep: Arc<UhciEndpoint>,
    /// The active batch's queue head; valid exactly while the entry is
    /// listed (the batch cannot be detached without going through this
    /// list's lock).
    qh: *mut Qh,
}

unsafe impl Send for Entry {}

pub struct TransferList {
    name: &'static str,
    head: DmaBuffer,
    entries: Mutex<Vec<Entry>>,
}

impl TransferList {
    pub fn new(name: &'static str) -> Result<TransferList> {
        let head = DmaBuffer::alloc(core::mem::size_of::<Qh>(), 16)?;
        let list = TransferList {
            name,
            head,
            entries: Mutex::new(Vec::new()),
        };
        list.head_qh().init();
        Ok(list)
    }

    fn head_qh(&self) -> &Qh {
        unsafe { &*(self.head.as_ptr() as *const Qh) }
    }

    pub fn head_phys(&self) -> u32 {
        self.head.phys()
    }

    /// Chain this class to the next one in the frame schedule.
    pub fn set_next(&self, next: &TransferList) {
        self.head_qh().set_next_qh(next.head_phys());
    }

    /// Activate `batch` on its endpoint and splice its queue head behind
    /// the current hardware tail.
    pub fn add_batch(&self, batch: Box<UhciBatch>) -> Result<()> {
        let ep = batch.ep.clone();
        let qh = batch.qh() as *const Qh as *mut Qh;
        let qh_phys = batch.qh_phys();

        let mut entries = self.entries.lock();

        if let Err((err, mut batch)) = ep.base.activate(batch) {
            drop(entries);
            batch.base.fail(err);
            return Err(err);
        }

        let last_qh: &Qh = match entries.last() {
            Some(entry) => unsafe { &*entry.qh },
            None => self.head_qh(),
        };

        // Make sure the whole chain is in memory before the tail link
        // makes it reachable.
        write_barrier();
        unsafe { &*qh }.set_next_raw(last_qh.next());
        last_qh.set_next_qh(qh_phys);
        write_barrier();

        entries.push(Entry { ep, qh });
        log::debug!("UHCI: batch scheduled in queue {}", self.name);
        Ok(())
    }

    /// Finish every batch whose TD chain is done. Batches complete in
    /// submission order per endpoint because each endpoint has at most one
    /// batch in flight.
    pub fn check_finished(&self) {
        let mut done: Vec<Box<UhciBatch>> = Vec::new();
        {
            let mut entries = self.entries.lock();
            let mut index = 0;
            while index < entries.len() {
                let completed = entries[index]
                    .ep
                    .base
                    .with_active(|batch| batch.map(|b| b.check_completed()).unwrap_or(true));
                if !completed {
                    index += 1;
                    continue;
                }
                let entry = self.unlink_locked(&mut entries, index);
                if let Some(batch) = entry.ep.base.deactivate() {
                    done.push(batch);
                }
            }
        }
        for mut batch in done {
            finish_batch(&mut batch);
        }
    }

    /// Drop every scheduled batch, failing each with an I/O error. Used by
    /// the host-error recovery path.
    pub fn abort_all(&self) {
        let mut done: Vec<Box<UhciBatch>> = Vec::new();
        {
            let mut entries = self.entries.lock();
            while !entries.is_empty() {
                let entry = self.unlink_locked(&mut entries, 0);
                if let Some(batch) = entry.ep.base.deactivate() {
                    done.push(batch);
                }
            }
        }
        for mut batch in done {
            batch.base.fail(UsbError::Io);
        }
    }

    /// Unlink the batch belonging to `ep`, if it is queued here. The
    /// caller owns the returned batch; used by endpoint cancellation.
    pub fn remove_endpoint(&self, ep: &Arc<UhciEndpoint>) -> Option<Box<UhciBatch>> {
        let mut entries = self.entries.lock();
        let index = entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.ep, ep))?;
        let entry = self.unlink_locked(&mut entries, index);
        entry.ep.base.deactivate()
    }

    /// Rewrite the predecessor's horizontal link past the entry at `index`
    /// and drop it from the mirror.
    fn unlink_locked(&self, entries: &mut Vec<Entry>, index: usize) -> Entry {
        let qh = unsafe { &*entries[index].qh };
        let prev: &Qh = if index == 0 {
            self.head_qh()
        } else {
            unsafe { &*entries[index - 1].qh }
        };
        prev.set_next_raw(qh.next());
        write_barrier();
        entries.remove(index)
    }

    /// Queue head physical addresses as the hardware would walk them.
    /// Test instrumentation for the schedule well-formedness invariant.
    #[cfg(test)]
    pub(crate) fn hw_chain(&self) -> Vec<u32> {
        use super::hw::link;
        let mut chain = Vec::new();
        let mut next = self.head_qh().next();
        while next & link::TERMINATE == 0 && next & link::QUEUE_HEAD != 0 {
            let phys = next & link::ADDRESS_MASK;
            let qh = crate::dma::phys_to_virt(phys) as *const Qh;
            if qh.is_null() {
                break;
            }
            chain.push(phys);
            next = unsafe { &*qh }.next();
        }
        chain
    }

    /// Software-mirror chain, same order as [`TransferList::hw_chain`].
    #[cfg(test)]
    pub(crate) fn sw_chain(&self) -> Vec<u32> {
        self.entries
            .lock()
            .iter()
            .map(|entry| {
                entry
                    .ep
                    .base
                    .with_active(|b| b.map(|b| b.qh_phys()).unwrap_or(0))
            })
            .collect()
    }
}

/// Deliver a finished batch, resetting the endpoint toggle first when the
/// chain failed on a toggle-carrying endpoint.
fn finish_batch(batch: &mut UhciBatch) {
    if batch.base.error.is_err() && batch.ep.base.props.transfer_type != TransferType::Control {
        batch.ep.set_toggle(0);
    }
    batch.base.finish();
}
