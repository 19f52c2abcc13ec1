//! Linux kernel object reconstruction on top of memflow.
//!
//! Given read access to a kernel's address space and either its symbols or the VMCOREINFO table
//! of a crash dump, this crate walks the kernel's intrusive collections, decodes the printk log
//! and resolves per-CPU variables.
//!
//! ```ignore
//! let mut kernel = Kernel::new(virt_mem, NoSymbols);
//! kernel.set_vmcoreinfo(VmCoreInfo::parse(&note_text));
//!
//! for entry in kernel.printk_log()? {
//!     let entry = entry?;
//!     println!("[{}] {}", entry.timestamp_ns(), entry.text().unwrap_or_default());
//! }
//! ```

pub mod error;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod symbols;
pub mod vmcoreinfo;

#[cfg(test)]
mod fixture;

pub use error::{KernelError, Result};
pub use kernel::percpu::{PerCpuInstance, PerCpuIter};
pub use kernel::printk::{
    parse_dictionary, DeviceInfo, Facility, LegacyEntry, Level, LogEntry, ModernEntry, PrintkLog,
};
pub use kernel::timers::{CpuTimer, CpuTimerIter, TimerQueue};
pub use kernel::walk::{HlistIter, KlistIter, ListIter, RbTreeIter};
pub use kernel::{Kernel, KernelConfig};
pub use layout::{LayoutInfo, PrintkLayout};
pub use memory::{container_of, Endian, KernelMemory};
pub use symbols::{KernelSymbols, NoSymbols, SymbolTable, KERNEL_MODULE};
pub use vmcoreinfo::VmCoreInfo;
