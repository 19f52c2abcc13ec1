//! VMCOREINFO, the compact layout table embedded in kernel crash dumps.
//!
//! The note is plain text, one `KEY=value` pair per line:
//!
//! ```text
//! OSRELEASE=5.10.0-8-amd64
//! SYMBOL(prb)=ffffffff91473580
//! SIZE(printk_ringbuffer)=80
//! OFFSET(printk_ringbuffer.desc_ring)=0
//! LENGTH(printk_info_subsystem)=16
//! NUMBER(NR_FREE_PAGES)=0
//! ```
//!
//! Symbol addresses are hexadecimal without prefix, everything else is decimal.

use memflow::prelude::v1::Address;

use log::*;

use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct VmCoreInfo {
    symbols: HashMap<String, Address>,
    sizes: HashMap<String, usize>,
    offsets: HashMap<String, HashMap<String, usize>>,
    lengths: HashMap<String, usize>,
    numbers: HashMap<String, i64>,
    values: HashMap<String, String>,
}

impl VmCoreInfo {
    /// Parses the note text. Lines that do not parse are skipped.
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if info.parse_line(line).is_none() {
                debug!("skipping vmcoreinfo line {:?}", line);
            }
        }

        info
    }

    fn parse_line(&mut self, line: &str) -> Option<()> {
        let (key, value) = line.split_once('=')?;

        if let Some(name) = keyed(key, "SYMBOL") {
            let addr = u64::from_str_radix(value.trim_start_matches("0x"), 16).ok()?;
            self.symbols.insert(name.to_string(), Address::from(addr));
        } else if let Some(name) = keyed(key, "SIZE") {
            self.sizes.insert(name.to_string(), value.parse().ok()?);
        } else if let Some(name) = keyed(key, "OFFSET") {
            let (ty, field) = name.split_once('.')?;
            self.offsets
                .entry(ty.to_string())
                .or_default()
                .insert(field.to_string(), value.parse().ok()?);
        } else if let Some(name) = keyed(key, "LENGTH") {
            self.lengths.insert(name.to_string(), value.parse().ok()?);
        } else if let Some(name) = keyed(key, "NUMBER") {
            self.numbers.insert(name.to_string(), value.parse().ok()?);
        } else {
            self.values.insert(key.to_string(), value.to_string());
        }

        Some(())
    }

    pub fn symbol(&self, name: &str) -> Option<Address> {
        self.symbols.get(name).copied()
    }

    pub fn size(&self, name: &str) -> Option<usize> {
        self.sizes.get(name).copied()
    }

    pub fn offset(&self, ty: &str, field: &str) -> Option<usize> {
        self.offsets.get(ty)?.get(field).copied()
    }

    pub fn length(&self, name: &str) -> Option<usize> {
        self.lengths.get(name).copied()
    }

    pub fn number(&self, name: &str) -> Option<i64> {
        self.numbers.get(name).copied()
    }

    /// Any other `KEY=value` entry, such as `OSRELEASE` or `PAGESIZE`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn os_release(&self) -> Option<&str> {
        self.value("OSRELEASE")
    }

    /// KASLR slide of the kernel image, if the dump recorded one.
    pub fn kernel_offset(&self) -> Option<u64> {
        u64::from_str_radix(self.value("KERNELOFFSET")?, 16).ok()
    }
}

fn keyed<'a>(key: &'a str, kind: &str) -> Option<&'a str> {
    key.strip_prefix(kind)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: &str = "OSRELEASE=5.10.0-8-amd64
PAGESIZE=4096
SYMBOL(prb)=ffffffff91473580
SIZE(printk_ringbuffer)=80
OFFSET(printk_ringbuffer.text_data_ring)=40
OFFSET(prb_desc.state_var)=0
LENGTH(printk_info_device)=48
NUMBER(KERNEL_IMAGE_SIZE)=-1
KERNELOFFSET=10000000
CMDLINE=root=/dev/vda1
SYMBOL(broken)=xyz
OFFSET(nodot)=4
garbage
";

    #[test]
    fn every_key_form() {
        let info = VmCoreInfo::parse(NOTE);

        assert_eq!(info.os_release(), Some("5.10.0-8-amd64"));
        assert_eq!(info.value("PAGESIZE"), Some("4096"));
        assert_eq!(
            info.symbol("prb"),
            Some(Address::from(0xffff_ffff_9147_3580u64))
        );
        assert_eq!(info.size("printk_ringbuffer"), Some(80));
        assert_eq!(info.offset("printk_ringbuffer", "text_data_ring"), Some(40));
        assert_eq!(info.offset("prb_desc", "state_var"), Some(0));
        assert_eq!(info.length("printk_info_device"), Some(48));
        assert_eq!(info.number("KERNEL_IMAGE_SIZE"), Some(-1));
        assert_eq!(info.kernel_offset(), Some(0x1000_0000));
        // Only the first '=' separates key and value.
        assert_eq!(info.value("CMDLINE"), Some("root=/dev/vda1"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let info = VmCoreInfo::parse(NOTE);

        assert_eq!(info.symbol("broken"), None);
        assert_eq!(info.offset("nodot", ""), None);
        assert_eq!(info.value("garbage"), None);
        assert_eq!(info.symbol("log_buf"), None);
    }
}
