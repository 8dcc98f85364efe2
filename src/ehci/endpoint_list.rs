//! EHCI schedule lists: a dummy queue head fronting a hardware chain of
//! endpoint queue heads plus its software mirror.
//!
//! The async list is chained to itself into the ring the reclamation
//! logic requires; the interrupt list stays a plain terminated chain the
//! periodic frame entries point at.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::dma::DmaBuffer;
use crate::error::Result;
use crate::mem::write_barrier;

use super::hw::Qh;
use super::EhciEndpoint;

pub struct EndpointList {
    name: &'static str,
    head: DmaBuffer,
    qhs: Mutex<Vec<Arc<EhciEndpoint>>>,
}

impl EndpointList {
    pub fn new(name: &'static str) -> Result<EndpointList> {
        let head = DmaBuffer::alloc(core::mem::size_of::<Qh>(), 32)?;
        let list = EndpointList {
            name,
            head,
            qhs: Mutex::new(Vec::new()),
        };
        list.head_qh().init(None);
        Ok(list)
    }

    pub fn head_qh(&self) -> &Qh {
        unsafe { &*(self.head.as_ptr() as *const Qh) }
    }

    pub fn head_phys(&self) -> u32 {
        self.head.phys()
    }

    /// Link this list's tail to `next`'s head. Chaining a list to itself
    /// closes the async ring.
    pub fn chain(&self, next: &EndpointList) {
        self.head_qh().append_qh(next.head_phys());
    }

    /// Splice the endpoint's queue head behind the current hardware tail.
    pub fn append_ep(&self, ep: &Arc<EhciEndpoint>) {
        let mut qhs = self.qhs.lock();

        let last = qhs.last().cloned();
        let last_qh: &Qh = match &last {
            Some(last) => last.qh(),
            None => self.head_qh(),
        };

        // Inherit the tail link (ring closure or next chained list), then
        // publish.
        ep.qh().set_horizontal_raw(last_qh.horizontal_raw());
        write_barrier();
        last_qh.append_qh(ep.qh_phys());
        write_barrier();

        qhs.push(ep.clone());
        log::debug!("EHCI: endpoint appended to {} list", self.name);
    }

    /// Unlink the endpoint's queue head.
    ///
    /// The caller must ring the async-advance doorbell and wait for the
    /// acknowledgement before the queue head's memory is reused; the
    /// controller keeps a cached pointer until then.
    pub fn remove_ep(&self, ep: &Arc<EhciEndpoint>) {
        let mut qhs = self.qhs.lock();
        let Some(index) = qhs.iter().position(|e| Arc::ptr_eq(e, ep)) else {
            return;
        };

        let prev = (index > 0).then(|| qhs[index - 1].clone());
        let prev_qh: &Qh = match &prev {
            Some(prev) => prev.qh(),
            None => self.head_qh(),
        };
        prev_qh.set_horizontal_raw(ep.qh().horizontal_raw());
        write_barrier();

        qhs.remove(index);
        log::debug!("EHCI: endpoint removed from {} list", self.name);
    }

    #[cfg(test)]
    pub(crate) fn hw_chain(&self) -> Vec<u32> {
        use super::hw::link;
        let mut chain = Vec::new();
        let mut next = self.head_qh().horizontal_raw();
        while next & link::TERMINATE == 0 {
            let phys = next & link::ADDRESS_MASK;
            if phys == self.head_phys() {
                // Walked around the async ring.
                break;
            }
            let qh = crate::dma::phys_to_virt(phys) as *const Qh;
            if qh.is_null() {
                break;
            }
            chain.push(phys);
            next = unsafe { &*qh }.horizontal_raw();
        }
        chain
    }

    #[cfg(test)]
    pub(crate) fn sw_chain(&self) -> Vec<u32> {
        self.qhs.lock().iter().map(|ep| ep.qh_phys()).collect()
    }
}
