//! OHCI schedule lists: one chain of endpoint descriptors per transfer
//! class, headed by a permanently skipped dummy ED so the hardware head
//! registers never see an empty pointer.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::dma::DmaBuffer;
use crate::error::Result;
use crate::mem::write_barrier;

use super::hw::Ed;
use super::OhciEndpoint;

pub struct EndpointList {
    name: &'static str,
    head: DmaBuffer,
    eds: Mutex<Vec<Arc<OhciEndpoint>>>,
}

impl EndpointList {
    pub fn new(name: &'static str) -> Result<EndpointList> {
        let head = DmaBuffer::alloc(core::mem::size_of::<Ed>(), 32)?;
        let list = EndpointList {
            name,
            head,
            eds: Mutex::new(Vec::new()),
        };
        list.head_ed().init(None, 0);
        Ok(list)
    }

    pub fn head_ed(&self) -> &Ed {
        unsafe { &*(self.head.as_ptr() as *const Ed) }
    }

    pub fn head_phys(&self) -> u32 {
        self.head.phys()
    }

    /// Chain this class behind another (interrupt leads to isochronous).
    pub fn set_next(&self, next: &EndpointList) {
        self.head_ed().set_next(next.head_phys());
    }

    /// Splice the endpoint's ED behind the current hardware tail.
    pub fn append_ep(&self, ep: &Arc<OhciEndpoint>) {
        let mut eds = self.eds.lock();

        let last = eds.last().cloned();
        let last_ed: &Ed = match &last {
            Some(last) => last.ed(),
            None => self.head_ed(),
        };

        // Keep whatever the tail pointed at (next chained class), then
        // publish the new ED.
        ep.ed().set_next_raw(last_ed.next_raw());
        write_barrier();
        last_ed.set_next(ep.ed_phys());
        write_barrier();

        eds.push(ep.clone());
        log::debug!("OHCI: endpoint added to {} list", self.name);
    }

    /// Unlink the endpoint's ED from the chain.
    ///
    /// The caller observes the one-frame quiescence before reusing the
    /// ED's memory; the controller may be holding it for the rest of the
    /// current frame.
    pub fn remove_ep(&self, ep: &Arc<OhciEndpoint>) {
        let mut eds = self.eds.lock();
        let Some(index) = eds.iter().position(|e| Arc::ptr_eq(e, ep)) else {
            return;
        };

        let prev = (index > 0).then(|| eds[index - 1].clone());
        let prev_ed: &Ed = match &prev {
            Some(prev) => prev.ed(),
            None => self.head_ed(),
        };
        debug_assert_eq!(prev_ed.next(), ep.ed_phys());
        prev_ed.set_next_raw(ep.ed().next_raw());
        write_barrier();

        eds.remove(index);
        log::debug!("OHCI: endpoint removed from {} list", self.name);
    }

    #[cfg(test)]
    pub(crate) fn hw_chain(&self) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut next = self.head_ed().next();
        while next != 0 {
            let ed = crate::dma::phys_to_virt(next) as *const Ed;
            if ed.is_null() {
                break;
            }
            chain.push(next);
            next = unsafe { &*ed }.next();
        }
        chain
    }

    #[cfg(test)]
    pub(crate) fn sw_chain(&self) -> Vec<u32> {
        self.eds.lock().iter().map(|ep| ep.ed_phys()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_endpoint;
    use super::*;
    use crate::usb::{Direction, TransferType};

    #[test]
    fn append_remove_keeps_chains_consistent() {
        let list = EndpointList::new("bulk").unwrap();
        let eps: Vec<_> = (0..3)
            .map(|_| make_endpoint(TransferType::Bulk, Direction::Out, 64))
            .collect();
        for ep in &eps {
            list.append_ep(ep);
        }
        assert_eq!(list.hw_chain(), list.sw_chain());

        list.remove_ep(&eps[1]);
        assert_eq!(list.hw_chain(), list.sw_chain());
        list.remove_ep(&eps[2]);
        assert_eq!(list.hw_chain(), list.sw_chain());
        list.remove_ep(&eps[0]);
        assert!(list.hw_chain().is_empty());
        assert!(list.sw_chain().is_empty());
    }

    #[test]
    fn chained_class_link_survives_append_and_remove() {
        let interrupt = EndpointList::new("interrupt").unwrap();
        let iso = EndpointList::new("isochronous").unwrap();
        interrupt.set_next(&iso);

        let ep = make_endpoint(TransferType::Interrupt, Direction::In, 16);
        interrupt.append_ep(&ep);
        assert_eq!(ep.ed().next(), iso.head_phys());
        interrupt.remove_ep(&ep);
        assert_eq!(interrupt.head_ed().next(), iso.head_phys());
    }
}
