//! Timer enumeration across every CPU.
//!
//! Classic timers hang off the hashed wheel buckets (`timer_base.vectors[]`) of each entry of a
//! CPU's `timer_bases[]`. High resolution timers sit in the `active` tree of every clock base
//! of a CPU's `hrtimer_cpu_base`.

use super::percpu::{PerCpuInstance, PerCpuIter};
use super::walk::{HlistIter, RbTreeIter};
use crate::error::Result;
use crate::layout::{PerCpuLayout, TimerLayout};
use crate::memory::{KernelMemory, POINTER_SIZE};
use memflow::prelude::v1::Address;

use log::*;

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerQueue {
    /// `timer_list`s on the timer wheel.
    Wheel,
    /// `hrtimer`s on the clock base trees.
    HighRes,
}

/// A queued timer and where it was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuTimer {
    pub cpu: usize,
    /// Index into the CPU's `timer_bases[]`, or into `clock_base[]` for hrtimers.
    pub base: usize,
    /// Address of the `timer_list` or `hrtimer`.
    pub timer: Address,
}

/// Every timer of one queue kind, CPU by CPU.
pub struct CpuTimerIter<'a, M> {
    mem: &'a mut M,
    layout: TimerLayout,
    queue: TimerQueue,
    cpus: VecDeque<PerCpuInstance>,
    /// Next bucket (wheel) or clock base (hrtimers) of the front CPU.
    slot: usize,
    pending: VecDeque<CpuTimer>,
    done: bool,
}

impl<'a, M: KernelMemory> CpuTimerIter<'a, M> {
    pub fn new(
        mem: &'a mut M,
        per_cpu: &PerCpuLayout,
        layout: &TimerLayout,
        queue: TimerQueue,
    ) -> Result<Self> {
        let template = match queue {
            TimerQueue::Wheel => layout.timer_bases,
            TimerQueue::HighRes => layout.hrtimer_bases,
        };
        let cpus = PerCpuIter::new(&mut *mem, per_cpu, template)?
            .collect::<Result<VecDeque<_>>>()?;

        Ok(Self {
            mem,
            layout: *layout,
            queue,
            cpus,
            slot: 0,
            pending: VecDeque::new(),
            done: false,
        })
    }

    fn slots_per_cpu(&self) -> usize {
        match self.queue {
            TimerQueue::Wheel => self.layout.timer_base_count * self.layout.vector_count,
            TimerQueue::HighRes => self.layout.clock_base_count,
        }
    }

    /// Queues the timers of the next slot. `false` once every CPU is done.
    fn fill(&mut self) -> Result<bool> {
        let instance = match self.cpus.front() {
            Some(instance) => *instance,
            None => return Ok(false),
        };

        if self.slot >= self.slots_per_cpu() {
            self.cpus.pop_front();
            self.slot = 0;
            return Ok(true);
        }

        let slot = self.slot;
        self.slot += 1;

        let layout = &self.layout;
        let (base, timers) = match self.queue {
            TimerQueue::Wheel => {
                let base = slot / layout.vector_count;
                let bucket = slot % layout.vector_count;
                let head = instance.address
                    + base * layout.timer_base_size
                    + layout.vectors
                    + bucket * POINTER_SIZE;
                let timers = HlistIter::new(&mut *self.mem, head, layout.timer_entry)
                    .collect::<Result<Vec<_>>>()?;
                (base, timers)
            }
            TimerQueue::HighRes => {
                let root = instance.address
                    + layout.clock_base
                    + slot * layout.clock_base_size
                    + layout.active;
                let timers = RbTreeIter::new(&mut *self.mem, root, layout.hrtimer_node)
                    .collect::<Result<Vec<_>>>()?;
                (slot, timers)
            }
        };

        if !timers.is_empty() {
            trace!(
                "cpu {} base {}: {} timers in slot {}",
                instance.cpu,
                base,
                timers.len(),
                slot
            );
        }

        let cpu = instance.cpu;
        self.pending.extend(
            timers
                .into_iter()
                .map(|timer| CpuTimer { cpu, base, timer }),
        );
        Ok(true)
    }
}

impl<'a, M: KernelMemory> Iterator for CpuTimerIter<'a, M> {
    type Item = Result<CpuTimer>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(timer) = self.pending.pop_front() {
                return Some(Ok(timer));
            }
            if self.done {
                return None;
            }

            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
