use crate::error::{KernelError, Result};
use crate::layout::{LayoutInfo, LayoutSource, PrintkLayout};
use crate::memory::{container_of, Endian, KernelMemory, POINTER_SIZE};
use crate::symbols::{KernelSymbols, KERNEL_MODULE};
use crate::vmcoreinfo::VmCoreInfo;
use memflow::prelude::v1::Address;

use log::*;

use std::collections::BTreeSet;

pub mod percpu;
pub mod printk;
pub mod timers;
pub mod walk;

use percpu::{PerCpuInstance, PerCpuIter};
use printk::PrintkLog;
use timers::{CpuTimerIter, TimerQueue};
use walk::{HlistIter, KlistIter, ListIter, RbTreeIter};

/// Low bits of a `dev_t` holding the minor number.
const MINORBITS: u32 = 20;
/// `blk_major_name.name` is an inline array of this many bytes.
const BLK_MAJOR_NAME_LEN: usize = 16;
/// Upper bound for a kernfs node name, `NAME_MAX` plus the terminator.
const KERNFS_NAME_MAX: usize = 256;

#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// Use the VMCOREINFO table when one is attached.
    pub permit_vmcoreinfo: bool,
    /// CPU per-CPU lookups default to. The host knows which CPU it stopped on, we don't.
    pub current_cpu: Option<usize>,
    /// Module core kernel symbols are looked up in.
    pub module: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            permit_vmcoreinfo: true,
            current_cpu: None,
            module: KERNEL_MODULE.to_string(),
        }
    }
}

/// Inspection session over one kernel image.
///
/// Layouts are resolved on first use and kept for the lifetime of the session.
pub struct Kernel<Mem, Sym> {
    mem: Mem,
    symbols: Sym,
    vmcoreinfo: Option<VmCoreInfo>,
    config: KernelConfig,
    layout: LayoutInfo,
}

impl<Mem: KernelMemory, Sym: KernelSymbols> Kernel<Mem, Sym> {
    pub fn new(mem: Mem, symbols: Sym) -> Self {
        Self::with_config(mem, symbols, KernelConfig::default())
    }

    pub fn with_config(mem: Mem, symbols: Sym, config: KernelConfig) -> Self {
        Self {
            mem,
            symbols,
            vmcoreinfo: None,
            config,
            layout: LayoutInfo::default(),
        }
    }

    /// Attaches the VMCOREINFO table of the image. Layouts resolved before are kept.
    pub fn set_vmcoreinfo(&mut self, vmcoreinfo: VmCoreInfo) {
        if let Some(release) = vmcoreinfo.os_release() {
            debug!("vmcoreinfo attached, kernel {}", release);
        }
        self.vmcoreinfo = Some(vmcoreinfo);
    }

    pub fn set_current_cpu(&mut self, cpu: Option<usize>) {
        self.config.current_cpu = cpu;
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn vmcoreinfo(&self) -> Option<&VmCoreInfo> {
        self.vmcoreinfo.as_ref()
    }

    pub fn symbols(&self) -> &Sym {
        &self.symbols
    }

    pub fn mem_mut(&mut self) -> &mut Mem {
        &mut self.mem
    }

    pub fn into_inner(self) -> (Mem, Sym) {
        (self.mem, self.symbols)
    }

    fn source(&self) -> LayoutSource<'_> {
        let vmcoreinfo = if self.config.permit_vmcoreinfo {
            self.vmcoreinfo.as_ref()
        } else {
            None
        };

        LayoutSource::new(&self.symbols, &self.config.module, vmcoreinfo)
    }

    pub fn printk_layout(&self) -> Result<&PrintkLayout> {
        self.layout.printk(&self.source())
    }

    /// Records of the kernel log, oldest first.
    pub fn printk_log(&mut self) -> Result<PrintkLog<'_, Mem>> {
        let src = self.source();
        let layout = self.layout.printk(&src)?;
        PrintkLog::new(&mut self.mem, layout)
    }

    /// Elements of type `ty` chained through their `list_head` field `field`, starting at the
    /// list head at `head`.
    pub fn list(&mut self, head: Address, ty: &str, field: &str) -> Result<ListIter<'_, Mem>> {
        let offset = self.source().offset(ty, field)?;
        Ok(ListIter::new(&mut self.mem, head, offset))
    }

    /// Elements of type `ty` on the klist at `klist`, linked through their `klist_node` field
    /// `field`.
    pub fn klist(&mut self, klist: Address, ty: &str, field: &str) -> Result<KlistIter<'_, Mem>> {
        let src = self.source();
        let offset = src.offset(ty, field)?;
        let layout = *self.layout.klist(&src)?;

        Ok(KlistIter::new(
            &mut self.mem,
            klist,
            layout.k_list,
            layout.n_node,
            offset,
        ))
    }

    /// Elements of type `ty` in the tree at the `rb_root` at `root`, linked through their
    /// `rb_node` field `field`.
    pub fn rb_tree(&mut self, root: Address, ty: &str, field: &str) -> Result<RbTreeIter<'_, Mem>> {
        let offset = self.source().offset(ty, field)?;
        Ok(RbTreeIter::new(&mut self.mem, root, offset))
    }

    pub fn hlist(&mut self, head: Address, ty: &str, field: &str) -> Result<HlistIter<'_, Mem>> {
        let offset = self.source().offset(ty, field)?;
        Ok(HlistIter::new(&mut self.mem, head, offset))
    }

    /// Address of a CPU's copy of the per-CPU variable at `template`.
    ///
    /// Without an explicit `cpu` the configured current CPU is used.
    pub fn per_cpu_instance(&mut self, template: Address, cpu: Option<usize>) -> Result<Address> {
        let src = self.source();
        let layout = self.layout.per_cpu(&src)?;
        percpu::check_domain(layout, template)?;

        let cpu = cpu
            .or(self.config.current_cpu)
            .ok_or_else(|| KernelError::unavailable("current cpu"))?;

        percpu::per_cpu_instance(&mut self.mem, layout, template, cpu)
    }

    /// The configured current CPU's copy of the per-CPU variable at `template`.
    pub fn this_cpu(&mut self, template: Address) -> Result<PerCpuInstance> {
        let cpu = self
            .config
            .current_cpu
            .ok_or_else(|| KernelError::unavailable("current cpu"))?;
        let address = self.per_cpu_instance(template, Some(cpu))?;
        Ok(PerCpuInstance { cpu, address })
    }

    /// Every present CPU's copy of the per-CPU variable at `template`.
    pub fn per_cpu_instances(&mut self, template: Address) -> Result<PerCpuIter<'_, Mem>> {
        let src = self.source();
        let layout = self.layout.per_cpu(&src)?;
        PerCpuIter::new(&mut self.mem, layout, template)
    }

    /// `block_device`s on `all_bdevs`. Kernels since 5.11 no longer keep that list.
    pub fn block_devices(&mut self) -> Result<ListIter<'_, Mem>> {
        let src = self.source();
        let head = self
            .layout
            .devices(&src)?
            .all_bdevs
            .ok_or_else(|| KernelError::unavailable("symbol all_bdevs"))?;
        let offset = src.offset("block_device", "bd_list")?;

        Ok(ListIter::new(&mut self.mem, head, offset))
    }

    /// Registered `char_device_struct`s, one per populated `chrdevs` slot.
    pub fn character_devices(&mut self) -> Result<Vec<Address>> {
        let layout = *self.layout.devices(&self.source())?;

        let slots = self.mem.read_values(
            layout.chrdevs,
            layout.chrdevs_len,
            POINTER_SIZE,
            Endian::Little,
        )?;

        Ok(slots
            .into_iter()
            .filter(|&ptr| ptr != 0)
            .map(Address::from)
            .collect())
    }

    /// Name a block major number was registered under, from the `major_names` hash.
    pub fn block_major_name(&mut self, major: u32) -> Result<Option<String>> {
        let src = self.source();
        let layout = *self.layout.devices(&src)?;
        if layout.major_names_len == 0 {
            return Ok(None);
        }
        let next = src.offset("blk_major_name", "next")?;
        let major_off = src.offset("blk_major_name", "major")?;
        let name = src.offset("blk_major_name", "name")?;

        let slot = major as usize % layout.major_names_len;
        let mut entry = self
            .mem
            .read_addr(layout.major_names + slot * POINTER_SIZE)?;
        let mut visited = BTreeSet::new();

        while !entry.is_null() && visited.insert(entry) {
            if self.mem.read_pod::<u32>(entry + major_off)? == major {
                return self
                    .mem
                    .read_c_string(entry + name, BLK_MAJOR_NAME_LEN)
                    .map(Some);
            }
            entry = self.mem.read_addr(entry + next)?;
        }

        Ok(None)
    }

    /// Driver name of the `block_device` at `bdev`, looked up by its major number.
    pub fn block_device_name(&mut self, bdev: Address) -> Result<Option<String>> {
        let bd_dev = self.source().offset("block_device", "bd_dev")?;
        let dev = self.mem.read_pod::<u32>(bdev + bd_dev)?;
        self.block_major_name(dev >> MINORBITS)
    }

    /// The root `kernfs_node` of sysfs.
    ///
    /// Found by climbing the parents of the node behind `system_kset`.
    pub fn kernfs_root(&mut self) -> Result<Address> {
        let layout = *self.layout.kernfs(&self.source())?;

        let kset = self.mem.read_addr(layout.system_kset)?;
        let mut node = self
            .mem
            .read_addr(kset + layout.kset_kobj + layout.kobject_sd)?;
        if node.is_null() {
            return Err(KernelError::unavailable("kernfs node of system_kset"));
        }

        let mut visited = BTreeSet::new();
        loop {
            if !visited.insert(node) {
                return Err(KernelError::Corrupted(format!(
                    "kernfs parents loop at {:x}",
                    node
                )));
            }
            let parent = self.mem.read_addr(node + layout.parent)?;
            if parent.is_null() {
                debug!("kernfs root at {:x}", node);
                return Ok(node);
            }
            node = parent;
        }
    }

    /// Entries of the kernfs directory `node`.
    pub fn kernfs_children(&mut self, node: Address) -> Result<RbTreeIter<'_, Mem>> {
        let layout = *self.layout.kernfs(&self.source())?;
        Ok(RbTreeIter::new(
            &mut self.mem,
            node + layout.children,
            layout.rb,
        ))
    }

    pub fn kernfs_name(&mut self, node: Address) -> Result<String> {
        let layout = *self.layout.kernfs(&self.source())?;
        let name = self.mem.read_addr(node + layout.name)?;
        if name.is_null() {
            return Ok(String::new());
        }
        self.mem.read_c_string(name, KERNFS_NAME_MAX)
    }

    /// `node` and its ancestors, starting at the root.
    fn kernfs_lineage(&mut self, node: Address) -> Result<Vec<Address>> {
        let layout = *self.layout.kernfs(&self.source())?;

        let mut lineage = vec![];
        let mut visited = BTreeSet::new();
        let mut cur = node;
        while !cur.is_null() {
            if !visited.insert(cur) {
                return Err(KernelError::Corrupted(format!(
                    "kernfs parents loop at {:x}",
                    cur
                )));
            }
            lineage.push(cur);
            cur = self.mem.read_addr(cur + layout.parent)?;
        }

        lineage.reverse();
        Ok(lineage)
    }

    /// Sysfs path of `node`, such as `/bus/pci`. The root itself has an empty path.
    pub fn kernfs_path(&mut self, node: Address) -> Result<String> {
        let mut names = vec![];
        for node in self.kernfs_lineage(node)? {
            names.push(self.kernfs_name(node)?);
        }
        Ok(names.join("/"))
    }

    /// The `subsys_private` of a bus directory below `/bus`.
    ///
    /// Bus directories keep a pointer to the kobject of `subsys_private.subsys` in their
    /// private data. Nodes elsewhere in sysfs give `None`.
    pub fn subsys_private(&mut self, node: Address) -> Result<Option<Address>> {
        let top = match self.kernfs_lineage(node)?.get(1) {
            Some(top) => *top,
            None => return Ok(None),
        };
        if top == node || self.kernfs_name(top)? != "bus" {
            return Ok(None);
        }

        let layout = *self.layout.kernfs(&self.source())?;
        let private = self.mem.read_addr(node + layout.private)?;
        if private.is_null() {
            return Ok(None);
        }

        Ok(Some(container_of(private, layout.subsys + layout.kset_kobj)))
    }

    /// Mounted `super_block`s.
    pub fn super_blocks(&mut self) -> Result<ListIter<'_, Mem>> {
        let src = self.source();
        let head = self.layout.file_systems(&src)?.super_blocks;
        let offset = src.offset("super_block", "s_list")?;

        Ok(ListIter::new(&mut self.mem, head, offset))
    }

    /// Network namespaces (`struct net`).
    pub fn net_namespaces(&mut self) -> Result<ListIter<'_, Mem>> {
        let src = self.source();
        let head = self.layout.namespaces(&src)?.net_namespace_list;
        let offset = src.offset("net", "list")?;

        Ok(ListIter::new(&mut self.mem, head, offset))
    }

    /// `device_private`s bound to the bus whose `subsys_private` is at `subsys`.
    pub fn bus_devices(&mut self, subsys: Address) -> Result<KlistIter<'_, Mem>> {
        let klist_devices = self.source().offset("subsys_private", "klist_devices")?;
        self.klist(subsys + klist_devices, "device_private", "knode_bus")
    }

    pub fn jiffies(&mut self) -> Result<u64> {
        let at = self.layout.timers(&self.source())?.jiffies_64;
        self.mem.read_pod::<u64>(at)
    }

    /// Per-CPU `timer_bases` arrays.
    pub fn timer_bases(&mut self) -> Result<PerCpuIter<'_, Mem>> {
        let template = self.layout.timers(&self.source())?.timer_bases;
        self.per_cpu_instances(template)
    }

    /// Per-CPU `hrtimer_cpu_base`s.
    pub fn hrtimer_cpu_bases(&mut self) -> Result<PerCpuIter<'_, Mem>> {
        let template = self.layout.timers(&self.source())?.hrtimer_bases;
        self.per_cpu_instances(template)
    }

    /// `timer_list`s hashed into the timer wheel bucket at `bucket`.
    pub fn timers(&mut self, bucket: Address) -> Result<HlistIter<'_, Mem>> {
        let entry = self.layout.timers(&self.source())?.timer_entry;
        Ok(HlistIter::new(&mut self.mem, bucket, entry))
    }

    /// `hrtimer`s queued on the clock base tree at `root`.
    pub fn hrtimers(&mut self, root: Address) -> Result<RbTreeIter<'_, Mem>> {
        let node = self.layout.timers(&self.source())?.hrtimer_node;
        Ok(RbTreeIter::new(&mut self.mem, root, node))
    }

    /// Every `timer_list` on the timer wheel of every present CPU.
    pub fn wheel_timers(&mut self) -> Result<CpuTimerIter<'_, Mem>> {
        self.cpu_timers(TimerQueue::Wheel)
    }

    /// Every queued `hrtimer` of every present CPU.
    pub fn queued_hrtimers(&mut self) -> Result<CpuTimerIter<'_, Mem>> {
        self.cpu_timers(TimerQueue::HighRes)
    }

    fn cpu_timers(&mut self, queue: TimerQueue) -> Result<CpuTimerIter<'_, Mem>> {
        let src = self.source();
        let timers = self.layout.timers(&src)?;
        let per_cpu = self.layout.per_cpu(&src)?;
        CpuTimerIter::new(&mut self.mem, per_cpu, timers, queue)
    }
}
