//! Per-CPU variable resolution.
//!
//! Per-CPU variables are linked into the `.data..percpu` section, whose addresses only act as a
//! template. Each CPU's copy lives at the template address plus that CPU's entry in
//! `__per_cpu_offset[]`. CPUs that were never brought up have a zero offset.

use crate::error::{KernelError, Result};
use crate::layout::PerCpuLayout;
use crate::memory::{offset_addr, KernelMemory, POINTER_SIZE};
use memflow::prelude::v1::Address;

use log::*;

/// Copy of a per-CPU variable belonging to one CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerCpuInstance {
    pub cpu: usize,
    pub address: Address,
}

pub(crate) fn check_domain(layout: &PerCpuLayout, template: Address) -> Result<()> {
    if layout.contains(template) {
        Ok(())
    } else {
        Err(KernelError::OutOfDomain {
            address: template,
            start: layout.start,
            end: layout.end,
        })
    }
}

fn read_offset<M: KernelMemory>(mem: &mut M, layout: &PerCpuLayout, cpu: usize) -> Result<u64> {
    mem.read_pod::<u64>(layout.offsets + cpu * POINTER_SIZE)
}

/// Address of `cpu`'s copy of the per-CPU variable at `template`.
pub fn per_cpu_instance<M: KernelMemory>(
    mem: &mut M,
    layout: &PerCpuLayout,
    template: Address,
    cpu: usize,
) -> Result<Address> {
    check_domain(layout, template)?;

    if cpu >= layout.count {
        return Err(KernelError::RangeInvalid { cpu });
    }

    match read_offset(mem, layout, cpu)? {
        0 => Err(KernelError::RangeInvalid { cpu }),
        offset => Ok(offset_addr(template, offset)),
    }
}

/// Every CPU's copy of a per-CPU variable, in CPU order. Absent CPUs are left out.
pub struct PerCpuIter<'a, M> {
    mem: &'a mut M,
    layout: PerCpuLayout,
    template: Address,
    cpu: usize,
    done: bool,
}

impl<'a, M: KernelMemory> PerCpuIter<'a, M> {
    /// Fails right away if `template` is not a per-CPU address.
    pub fn new(mem: &'a mut M, layout: &PerCpuLayout, template: Address) -> Result<Self> {
        check_domain(layout, template)?;

        Ok(Self {
            mem,
            layout: *layout,
            template,
            cpu: 0,
            done: false,
        })
    }
}

impl<'a, M: KernelMemory> Iterator for PerCpuIter<'a, M> {
    type Item = Result<PerCpuInstance>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        while self.cpu < self.layout.count {
            let cpu = self.cpu;
            self.cpu += 1;

            match read_offset(self.mem, &self.layout, cpu) {
                Ok(0) => continue,
                Ok(offset) => {
                    let address = offset_addr(self.template, offset);
                    trace!("cpu {} instance of {:x} at {:x}", cpu, self.template, address);
                    return Some(Ok(PerCpuInstance { cpu, address }));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        self.done = true;
        None
    }
}
