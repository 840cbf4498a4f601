// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Interrupt handling
//!
//! The interrupt layer decodes hardware status into `IrqEvent`s and feeds them to
//! `V3dDevice::handle_irq`. Handling may run concurrently with any other device operation; it goes
//! through the same locks as everything else.

use crate::debug::*;
use crate::device::V3dDevice;
use crate::error::{Error, Result};
use crate::hw::FaultInfo;
use crate::job::JobKind;
use crate::mmu::PAGE_SIZE;
use crate::queue::Queue;

const DEBUG_CLASS: DebugFlags = DebugFlags::Irq;

/// Size of each overflow object handed to the binner.
pub const BIN_OVERFLOW_SIZE: usize = 256 * 1024;

/// A decoded interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqEvent {
    /// The job with fence `seqno` finished on `queue`, having run from `start_ns` to `end_ns`.
    JobDone {
        queue: Queue,
        seqno: u64,
        start_ns: u64,
        end_ns: u64,
    },
    /// The MMU caught an access outside of any mapping.
    MmuFault(FaultInfo),
    /// The binner ran out of tile list memory.
    BinOutOfMemory,
}

impl V3dDevice {
    /// Process one interrupt event.
    pub fn handle_irq(&self, event: IrqEvent) -> Result {
        mod_dev_dbg!(self, "IRQ: {:?}", event);
        match event {
            IrqEvent::JobDone {
                queue,
                seqno,
                start_ns,
                end_ns,
            } => self.on_hardware_complete(queue, seqno, start_ns, end_ns),
            IrqEvent::MmuFault(info) => {
                self.handle_mmu_fault(info);
                Ok(())
            }
            IrqEvent::BinOutOfMemory => self.handle_bin_oom(),
        }
    }

    /// Blame the fault on the job(s) it could have come from. They fail when they finish.
    fn handle_mmu_fault(&self, info: FaultInfo) {
        dev_err!(
            self,
            "MMU error from client {} at {:#x}{}",
            info.queue.map_or("unknown", Queue::name),
            info.address,
            if info.write { " (write)" } else { "" }
        );

        let mut slots = self.slots.lock();
        let mut blamed = 0;
        for queue in Queue::ALL {
            if info.queue.is_some_and(|q| q != queue) {
                continue;
            }
            if let Some(active) = slots.active_mut(queue) {
                active.fault.get_or_insert(info);
                blamed += 1;
            }
        }
        if blamed == 0 {
            dev_warn!(self, "MMU fault with no job running");
        }
    }

    /// Give the binner another chunk of tile list memory.
    fn handle_bin_oom(&self) -> Result {
        let bo = self.alloc_bo(BIN_OVERFLOW_SIZE / PAGE_SIZE)?;
        let addr = bo
            .offset()
            .ok_or(Error::InternalConsistency("overflow object not mapped"))?;

        let slots = self.slots.lock();
        let Some(active) = slots.active(Queue::Bin) else {
            // The bin job finished before the interrupt was handled.
            mod_dev_dbg!(self, "Binner out of memory with no bin job");
            return Ok(());
        };
        let JobKind::Bin(bin) = active.job.kind() else {
            return Err(Error::InternalConsistency("non-bin job on the bin queue"));
        };

        mod_dev_dbg!(
            self,
            "Job {}: overflow memory at {:#x}",
            active.job.id(),
            addr
        );
        bin.add_overflow(bo);
        self.hw.bin_overflow(addr, BIN_OVERFLOW_SIZE as u32);
        Ok(())
    }
}
