//! Structure layouts needed to decode kernel objects.
//!
//! Layouts come from one of two sources. Crash dumps carry VMCOREINFO, a small table with just
//! enough symbols, sizes and offsets for dump tools. Live targets usually have full symbol and
//! type information instead. Either one has to work on its own.
//!
//! Each layout is resolved at most once per [`Kernel`](crate::Kernel) session and kept in
//! [`LayoutInfo`].

use crate::error::{KernelError, Result};
use crate::memory::POINTER_SIZE;
use crate::symbols::KernelSymbols;
use crate::vmcoreinfo::VmCoreInfo;
use memflow::prelude::v1::Address;

use log::*;
use once_cell::unsync::OnceCell;

/// Flag bits of a descriptor `state_var` sit in the top two bits of the word.
const DESC_FLAGS_SHIFT: u32 = 62;

/// Layout of the printk log, in one of its two incompatible generations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrintkLayout {
    /// Flat cyclic byte buffer of `printk_log` records (before 5.10).
    Legacy(LegacyLayout),
    /// Lockless descriptor ring + data ring (5.10 and later).
    Modern(ModernLayout),
}

/// Where the facility and level bytes live inside a log record header.
///
/// Only known when full type information of the record type is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeverityFields {
    pub facility: usize,
    pub level: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyLayout {
    /// Address of the `log_buf` pointer variable.
    pub log_buf: Address,
    pub log_buf_len: Address,
    pub log_first_idx: Address,
    pub log_next_idx: Address,
    /// `sizeof(struct printk_log)`; text follows the header directly.
    pub header_size: usize,
    pub ts_nsec: usize,
    pub len: usize,
    pub text_len: usize,
    pub dict_len: usize,
    pub severity: Option<SeverityFields>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescRingOffsets {
    pub count_bits: usize,
    pub descs: usize,
    pub infos: usize,
    pub head_id: usize,
    pub tail_id: usize,
}

/// `struct prb_desc`, with the text block positions already folded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescOffsets {
    pub size: usize,
    pub state_var: usize,
    pub text_begin: usize,
    pub text_next: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRingOffsets {
    pub size_bits: usize,
    pub data: usize,
}

/// `struct dev_printk_info` strings, relative to the start of `printk_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevInfoOffsets {
    pub subsystem: usize,
    pub subsystem_len: usize,
    pub device: usize,
    pub device_len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InfoOffsets {
    pub size: usize,
    pub seq: usize,
    pub ts_nsec: usize,
    pub text_len: usize,
    pub caller_id: usize,
    pub dev_info: Option<DevInfoOffsets>,
}

/// Bit layout of a descriptor's packed `state_var`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateBits {
    pub flags_mask: u64,
    pub flags_shift: u32,
    pub id_mask: u64,
}

impl Default for StateBits {
    fn default() -> Self {
        let flags_mask = 3u64 << DESC_FLAGS_SHIFT;
        Self {
            flags_mask,
            flags_shift: DESC_FLAGS_SHIFT,
            id_mask: !flags_mask,
        }
    }
}

impl StateBits {
    pub fn id(&self, state_var: u64) -> u64 {
        state_var & self.id_mask
    }

    pub fn state(&self, state_var: u64) -> u64 {
        (state_var & self.flags_mask) >> self.flags_shift
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModernLayout {
    /// Address of the `prb` pointer variable.
    pub prb: Address,
    /// `printk_ringbuffer.desc_ring`
    pub desc_ring: usize,
    /// `printk_ringbuffer.text_data_ring`
    pub text_data_ring: usize,
    pub desc_ring_fields: DescRingOffsets,
    pub desc: DescOffsets,
    pub data_ring: DataRingOffsets,
    pub info: InfoOffsets,
    pub atomic_long_size: usize,
    pub state: StateBits,
    pub severity: Option<SeverityFields>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerCpuLayout {
    pub start: Address,
    pub end: Address,
    /// `__per_cpu_offset[]`
    pub offsets: Address,
    pub count: usize,
}

impl PerCpuLayout {
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr <= self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KlistLayout {
    /// `klist.k_list`
    pub k_list: usize,
    /// `klist_node.n_node`
    pub n_node: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLayout {
    /// `all_bdevs` list head. Gone in newer kernels.
    pub all_bdevs: Option<Address>,
    pub chrdevs: Address,
    pub chrdevs_len: usize,
    /// Hash table of `blk_major_name` chains, indexed by major number modulo its length.
    pub major_names: Address,
    pub major_names_len: usize,
}

/// Offsets for walking sysfs through its kernfs nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernfsLayout {
    /// `system_kset`, a pointer to the kset behind `/sys/devices/system`.
    pub system_kset: Address,
    /// `kset.kobj`
    pub kset_kobj: usize,
    /// `kobject.sd`
    pub kobject_sd: usize,
    /// `kernfs_node.parent`
    pub parent: usize,
    /// `kernfs_node.name`
    pub name: usize,
    /// `kernfs_node.dir.children`, the `rb_root` of a directory's entries.
    pub children: usize,
    /// `kernfs_node.rb`
    pub rb: usize,
    /// `kernfs_node.priv`
    pub private: usize,
    /// `subsys_private.subsys`
    pub subsys: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSystemLayout {
    pub super_blocks: Address,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamespaceLayout {
    pub net_namespace_list: Address,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerLayout {
    pub jiffies_64: Address,
    pub timer_bases: Address,
    pub hrtimer_bases: Address,
    /// `timer_list.entry`
    pub timer_entry: usize,
    /// `hrtimer.node`
    pub hrtimer_node: usize,
    /// `sizeof(struct timer_base)`
    pub timer_base_size: usize,
    /// Entries in each CPU's `timer_bases[]`.
    pub timer_base_count: usize,
    /// `timer_base.vectors`
    pub vectors: usize,
    /// Hash buckets in `timer_base.vectors[]`.
    pub vector_count: usize,
    /// `hrtimer_cpu_base.clock_base`
    pub clock_base: usize,
    /// `sizeof(struct hrtimer_clock_base)`
    pub clock_base_size: usize,
    /// Entries in `hrtimer_cpu_base.clock_base[]`.
    pub clock_base_count: usize,
    /// `hrtimer_clock_base.active`. The tree's `rb_root` opens the `timerqueue_head`.
    pub active: usize,
}

/// Per-session layout cache.
///
/// A layout that failed to resolve is not cached, the next request tries again.
#[derive(Default)]
pub struct LayoutInfo {
    printk: OnceCell<PrintkLayout>,
    per_cpu: OnceCell<PerCpuLayout>,
    klist: OnceCell<KlistLayout>,
    devices: OnceCell<DeviceLayout>,
    kernfs: OnceCell<KernfsLayout>,
    file_systems: OnceCell<FileSystemLayout>,
    namespaces: OnceCell<NamespaceLayout>,
    timers: OnceCell<TimerLayout>,
}

impl LayoutInfo {
    pub fn printk(&self, src: &LayoutSource) -> Result<&PrintkLayout> {
        self.printk.get_or_try_init(|| src.printk())
    }

    pub fn per_cpu(&self, src: &LayoutSource) -> Result<&PerCpuLayout> {
        self.per_cpu.get_or_try_init(|| src.per_cpu())
    }

    pub fn klist(&self, src: &LayoutSource) -> Result<&KlistLayout> {
        self.klist.get_or_try_init(|| src.klist())
    }

    pub fn devices(&self, src: &LayoutSource) -> Result<&DeviceLayout> {
        self.devices.get_or_try_init(|| src.devices())
    }

    pub fn kernfs(&self, src: &LayoutSource) -> Result<&KernfsLayout> {
        self.kernfs.get_or_try_init(|| src.kernfs())
    }

    pub fn file_systems(&self, src: &LayoutSource) -> Result<&FileSystemLayout> {
        self.file_systems.get_or_try_init(|| src.file_systems())
    }

    pub fn namespaces(&self, src: &LayoutSource) -> Result<&NamespaceLayout> {
        self.namespaces.get_or_try_init(|| src.namespaces())
    }

    pub fn timers(&self, src: &LayoutSource) -> Result<&TimerLayout> {
        self.timers.get_or_try_init(|| src.timers())
    }

    /// The printk layout, if it has been resolved already.
    pub fn resolved_printk(&self) -> Option<&PrintkLayout> {
        self.printk.get()
    }
}

/// One of the two places layout data can come from.
#[derive(Clone, Copy)]
enum Tier<'a> {
    VmCoreInfo(&'a VmCoreInfo),
    Symbols(&'a dyn KernelSymbols, &'a str),
}

impl<'a> Tier<'a> {
    fn symbol(&self, name: &str) -> Result<Address> {
        let found = match self {
            Tier::VmCoreInfo(info) => info.symbol(name),
            Tier::Symbols(syms, module) => syms.symbol_address(module, name),
        };
        found.ok_or_else(|| KernelError::unavailable(format!("symbol {}", name)))
    }

    fn size(&self, ty: &str) -> Result<usize> {
        let found = match self {
            Tier::VmCoreInfo(info) => info.size(ty),
            Tier::Symbols(syms, module) => syms.type_size(module, ty),
        };
        found.ok_or_else(|| KernelError::unavailable(format!("size of {}", ty)))
    }

    fn offset(&self, ty: &str, field: &str) -> Result<usize> {
        let found = match self {
            Tier::VmCoreInfo(info) => info.offset(ty, field),
            Tier::Symbols(syms, module) => syms.field_offset(module, ty, field),
        };
        found.ok_or_else(|| KernelError::unavailable(format!("offset of {}.{}", ty, field)))
    }

    fn dev_info(&self) -> Option<DevInfoOffsets> {
        let dev_info = self.offset("printk_info", "dev_info").ok()?;
        let subsystem = self.offset("dev_printk_info", "subsystem").ok()?;
        let device = self.offset("dev_printk_info", "device").ok()?;

        let (subsystem_len, device_len) = match self {
            Tier::VmCoreInfo(info) => (
                info.length("printk_info_subsystem")?,
                info.length("printk_info_device")?,
            ),
            Tier::Symbols(..) => (
                device.checked_sub(subsystem)?,
                self.size("dev_printk_info").ok()?.checked_sub(device)?,
            ),
        };

        Some(DevInfoOffsets {
            subsystem: dev_info + subsystem,
            subsystem_len,
            device: dev_info + device,
            device_len,
        })
    }

    fn legacy(&self) -> Result<LegacyLayout> {
        Ok(LegacyLayout {
            log_buf: self.symbol("log_buf")?,
            log_buf_len: self.symbol("log_buf_len")?,
            log_first_idx: self.symbol("log_first_idx")?,
            log_next_idx: self.symbol("log_next_idx")?,
            header_size: self.size("printk_log")?,
            ts_nsec: self.offset("printk_log", "ts_nsec")?,
            len: self.offset("printk_log", "len")?,
            text_len: self.offset("printk_log", "text_len")?,
            dict_len: self.offset("printk_log", "dict_len")?,
            severity: None,
        })
    }

    fn modern(&self) -> Result<ModernLayout> {
        let text_blk_lpos = self.offset("prb_desc", "text_blk_lpos")?;

        Ok(ModernLayout {
            prb: self.symbol("prb")?,
            desc_ring: self.offset("printk_ringbuffer", "desc_ring")?,
            text_data_ring: self.offset("printk_ringbuffer", "text_data_ring")?,
            desc_ring_fields: DescRingOffsets {
                count_bits: self.offset("prb_desc_ring", "count_bits")?,
                descs: self.offset("prb_desc_ring", "descs")?,
                infos: self.offset("prb_desc_ring", "infos")?,
                head_id: self.offset("prb_desc_ring", "head_id")?,
                tail_id: self.offset("prb_desc_ring", "tail_id")?,
            },
            desc: DescOffsets {
                size: self.size("prb_desc")?,
                state_var: self.offset("prb_desc", "state_var")?,
                text_begin: text_blk_lpos + self.offset("prb_data_blk_lpos", "begin")?,
                text_next: text_blk_lpos + self.offset("prb_data_blk_lpos", "next")?,
            },
            data_ring: DataRingOffsets {
                size_bits: self.offset("prb_data_ring", "size_bits")?,
                data: self.offset("prb_data_ring", "data")?,
            },
            info: InfoOffsets {
                size: self.size("printk_info")?,
                seq: self.offset("printk_info", "seq")?,
                ts_nsec: self.offset("printk_info", "ts_nsec")?,
                text_len: self.offset("printk_info", "text_len")?,
                caller_id: self.offset("printk_info", "caller_id")?,
                dev_info: self.dev_info(),
            },
            atomic_long_size: self.size("atomic_long_t").unwrap_or(POINTER_SIZE),
            state: StateBits::default(),
            severity: None,
        })
    }
}

/// Read-only view of the layout data sources of a session.
pub struct LayoutSource<'a> {
    symbols: &'a dyn KernelSymbols,
    module: &'a str,
    vmcoreinfo: Option<&'a VmCoreInfo>,
}

impl<'a> LayoutSource<'a> {
    /// `vmcoreinfo` should already be `None` if its use is not permitted.
    pub fn new(
        symbols: &'a dyn KernelSymbols,
        module: &'a str,
        vmcoreinfo: Option<&'a VmCoreInfo>,
    ) -> Self {
        Self {
            symbols,
            module,
            vmcoreinfo,
        }
    }

    fn symbols(&self) -> Tier<'a> {
        Tier::Symbols(self.symbols, self.module)
    }

    fn severity(&self, record_ty: &str) -> Option<SeverityFields> {
        Some(SeverityFields {
            facility: self.symbols.field_offset(self.module, record_ty, "facility")?,
            level: self.symbols.field_offset(self.module, record_ty, "level")?,
        })
    }

    pub fn printk(&self) -> Result<PrintkLayout> {
        if let Some(info) = self.vmcoreinfo {
            let tier = Tier::VmCoreInfo(info);

            if info.symbol("log_buf").is_some() {
                debug!("printk: legacy log buffer from vmcoreinfo");
                let mut layout = tier.legacy()?;
                layout.severity = self.severity("printk_log");
                return Ok(PrintkLayout::Legacy(layout));
            } else if info.symbol("prb").is_some() {
                debug!("printk: ring buffer from vmcoreinfo");
                let mut layout = tier.modern()?;
                layout.severity = self.severity("printk_info");
                return Ok(PrintkLayout::Modern(layout));
            }
        }

        let tier = self.symbols();

        if self.symbols.has_type(self.module, "printk_log") {
            debug!("printk: legacy log buffer from symbols");
            let mut layout = tier.legacy()?;
            layout.severity = self.severity("printk_log");
            Ok(PrintkLayout::Legacy(layout))
        } else {
            debug!("printk: ring buffer from symbols");
            let mut layout = tier.modern()?;
            layout.severity = self.severity("printk_info");
            Ok(PrintkLayout::Modern(layout))
        }
    }

    /// Symbol lookup through VMCOREINFO first, then symbols.
    pub fn symbol(&self, name: &str) -> Result<Address> {
        self.vmcoreinfo
            .and_then(|info| info.symbol(name))
            .map(Ok)
            .unwrap_or_else(|| self.symbols().symbol(name))
    }

    /// Field offset lookup through VMCOREINFO first, then symbols.
    pub fn offset(&self, ty: &str, field: &str) -> Result<usize> {
        self.vmcoreinfo
            .and_then(|info| info.offset(ty, field))
            .map(Ok)
            .unwrap_or_else(|| self.symbols().offset(ty, field))
    }

    /// Type size lookup through VMCOREINFO first, then symbols.
    pub fn size(&self, ty: &str) -> Result<usize> {
        self.vmcoreinfo
            .and_then(|info| info.size(ty))
            .map(Ok)
            .unwrap_or_else(|| self.symbols().size(ty))
    }

    /// Number of `elem_size` byte entries in an array symbol.
    fn array_len(&self, name: &str, elem_size: usize) -> Result<usize> {
        self.vmcoreinfo
            .and_then(|info| info.length(name))
            .or_else(|| {
                self.symbols
                    .symbol_size(self.module, name)
                    .and_then(|size| size.checked_div(elem_size))
            })
            .ok_or_else(|| KernelError::unavailable(format!("length of {}", name)))
    }

    fn pointer_array_len(&self, name: &str) -> Result<usize> {
        self.array_len(name, POINTER_SIZE)
    }

    /// Number of entries in the array `ty.field` that closes its structure.
    ///
    /// A `LENGTH(ty.field)` entry wins. Otherwise the array is taken to run up to the end of the
    /// structure. Alignment padding behind it reads as empty entries.
    fn trailing_array_len(&self, ty: &str, field: &str, elem_size: usize) -> Result<usize> {
        let key = format!("{}.{}", ty, field);
        if let Some(len) = self.vmcoreinfo.and_then(|info| info.length(&key)) {
            return Ok(len);
        }

        let size = self.size(ty)?;
        let offset = self.offset(ty, field)?;
        size.checked_sub(offset)
            .and_then(|rest| rest.checked_div(elem_size))
            .filter(|&len| len > 0)
            .ok_or_else(|| KernelError::Corrupted(format!("{} lies outside its structure", key)))
    }

    pub fn per_cpu(&self) -> Result<PerCpuLayout> {
        let layout = PerCpuLayout {
            start: self.symbol("__per_cpu_start")?,
            end: self.symbol("__per_cpu_end")?,
            offsets: self.symbol("__per_cpu_offset")?,
            count: self.pointer_array_len("__per_cpu_offset")?,
        };
        debug!("per-cpu layout: {:x?}", layout);
        Ok(layout)
    }

    pub fn klist(&self) -> Result<KlistLayout> {
        Ok(KlistLayout {
            k_list: self.offset("klist", "k_list")?,
            n_node: self.offset("klist_node", "n_node")?,
        })
    }

    pub fn devices(&self) -> Result<DeviceLayout> {
        Ok(DeviceLayout {
            all_bdevs: self.symbol("all_bdevs").ok(),
            chrdevs: self.symbol("chrdevs")?,
            chrdevs_len: self.pointer_array_len("chrdevs")?,
            major_names: self.symbol("major_names")?,
            major_names_len: self.pointer_array_len("major_names")?,
        })
    }

    pub fn kernfs(&self) -> Result<KernfsLayout> {
        Ok(KernfsLayout {
            system_kset: self.symbol("system_kset")?,
            kset_kobj: self.offset("kset", "kobj")?,
            kobject_sd: self.offset("kobject", "sd")?,
            parent: self.offset("kernfs_node", "parent")?,
            name: self.offset("kernfs_node", "name")?,
            children: self.offset("kernfs_node", "dir")?
                + self.offset("kernfs_elem_dir", "children")?,
            rb: self.offset("kernfs_node", "rb")?,
            private: self.offset("kernfs_node", "priv")?,
            subsys: self.offset("subsys_private", "subsys")?,
        })
    }

    pub fn file_systems(&self) -> Result<FileSystemLayout> {
        Ok(FileSystemLayout {
            super_blocks: self.symbol("super_blocks")?,
        })
    }

    pub fn namespaces(&self) -> Result<NamespaceLayout> {
        Ok(NamespaceLayout {
            net_namespace_list: self.symbol("net_namespace_list")?,
        })
    }

    pub fn timers(&self) -> Result<TimerLayout> {
        let timer_base_size = self.size("timer_base")?;
        let clock_base_size = self.size("hrtimer_clock_base")?;

        let layout = TimerLayout {
            jiffies_64: self.symbol("jiffies_64")?,
            timer_bases: self.symbol("timer_bases")?,
            hrtimer_bases: self.symbol("hrtimer_bases")?,
            timer_entry: self.offset("timer_list", "entry")?,
            hrtimer_node: self.offset("hrtimer", "node")?,
            timer_base_size,
            timer_base_count: self.array_len("timer_bases", timer_base_size)?,
            vectors: self.offset("timer_base", "vectors")?,
            vector_count: self.trailing_array_len("timer_base", "vectors", POINTER_SIZE)?,
            clock_base: self.offset("hrtimer_cpu_base", "clock_base")?,
            clock_base_size,
            clock_base_count: self.trailing_array_len(
                "hrtimer_cpu_base",
                "clock_base",
                clock_base_size,
            )?,
            active: self.offset("hrtimer_clock_base", "active")?,
        };
        debug!("timer layout: {:x?}", layout);
        Ok(layout)
    }
}
