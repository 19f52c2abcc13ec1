//! Kernel log (printk) decoding.
//!
//! Two ring generations exist. Up to 5.9 the log is a flat cyclic byte buffer of variable sized
//! `printk_log` records. From 5.10 on it is a lockless ring of fixed size descriptors, each
//! pointing into a separate data ring that holds the text.

use crate::error::{KernelError, Result};
use crate::layout::{LegacyLayout, ModernLayout, PrintkLayout, SeverityFields};
use crate::memory::{bytes_to_text, offset_addr, until_nul, Endian, KernelMemory};
use memflow::prelude::v1::Address;

use dataview::{DataView, Pod};

use log::*;

use std::collections::BTreeMap;

const FACILITY_NAMES: [Option<&str>; 24] = [
    Some("LOG_KERN"),
    Some("LOG_USER"),
    Some("LOG_MAIL"),
    Some("LOG_DAEMON"),
    Some("LOG_AUTH"),
    Some("LOG_SYSLOG"),
    Some("LOG_LPR"),
    Some("LOG_NEWS"),
    Some("LOG_UUCP"),
    Some("LOG_CRON"),
    Some("LOG_AUTHPRIV"),
    Some("LOG_FTP"),
    None,
    None,
    None,
    None,
    Some("LOG_LOCAL0"),
    Some("LOG_LOCAL1"),
    Some("LOG_LOCAL2"),
    Some("LOG_LOCAL3"),
    Some("LOG_LOCAL4"),
    Some("LOG_LOCAL5"),
    Some("LOG_LOCAL6"),
    Some("LOG_LOCAL7"),
];

const LEVEL_NAMES: [&str; 8] = [
    "LOG_EMERG",
    "LOG_ALERT",
    "LOG_CRIT",
    "LOG_ERR",
    "LOG_WARNING",
    "LOG_NOTICE",
    "LOG_INFO",
    "LOG_DEBUG",
];

/// Size of the owner id that prefixes every data ring block.
const DATA_BLOCK_ID_SIZE: u64 = 8;

/// Descriptor states holding a committed record.
const DESC_COMMITTED: u64 = 1;
const DESC_FINALIZED: u64 = 2;

/// Syslog facility of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Facility(pub u8);

impl Facility {
    /// Syslog name, `None` for codes without one.
    pub fn name(self) -> Option<&'static str> {
        FACILITY_NAMES.get(self.0 as usize).copied().flatten()
    }
}

/// Syslog level of a record, always in `0..8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Level(u8);

impl Level {
    /// Keeps only the low 3 bits of `raw`.
    pub fn new(raw: u8) -> Self {
        Self(raw & 0x7)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        LEVEL_NAMES[self.0 as usize]
    }
}

/// Device a modern record was emitted for (`dev_printk_info`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub subsystem: String,
    pub device: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyEntry {
    pub timestamp_ns: u64,
    pub text: String,
    /// `KEY=value` pairs the record carried after its text.
    pub dictionary: BTreeMap<String, String>,
    pub facility: Option<Facility>,
    pub level: Option<Level>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModernEntry {
    pub sequence: u64,
    pub timestamp_ns: u64,
    /// `None` for dataless records.
    pub text: Option<String>,
    pub caller_id: u32,
    pub device: Option<DeviceInfo>,
    pub facility: Option<Facility>,
    pub level: Option<Level>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEntry {
    Legacy(LegacyEntry),
    Modern(ModernEntry),
}

impl LogEntry {
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            LogEntry::Legacy(e) => e.timestamp_ns,
            LogEntry::Modern(e) => e.timestamp_ns,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            LogEntry::Legacy(e) => Some(e.text.as_str()),
            LogEntry::Modern(e) => e.text.as_deref(),
        }
    }

    pub fn facility(&self) -> Option<Facility> {
        match self {
            LogEntry::Legacy(e) => e.facility,
            LogEntry::Modern(e) => e.facility,
        }
    }

    pub fn level(&self) -> Option<Level> {
        match self {
            LogEntry::Legacy(e) => e.level,
            LogEntry::Modern(e) => e.level,
        }
    }
}

/// Splits a record dictionary into its `KEY=value` pairs.
///
/// The dictionary is a run of NUL terminated pairs. A pair without `=` ends parsing, whatever
/// was parsed up to that point is kept.
pub fn parse_dictionary(bytes: &[u8]) -> BTreeMap<String, String> {
    let mut dict = BTreeMap::new();

    for pair in bytes.split(|&b| b == 0).filter(|p| !p.is_empty()) {
        match pair.iter().position(|&b| b == b'=') {
            Some(eq) => {
                let key = bytes_to_text(&pair[..eq]);
                let value = bytes_to_text(&pair[eq + 1..]);
                dict.insert(key, value);
            }
            None => {
                warn!(
                    "dictionary entry {:?} has no '=', dropping the rest",
                    bytes_to_text(pair)
                );
                break;
            }
        }
    }

    dict
}

fn severity(header: &[u8], fields: Option<SeverityFields>) -> (Option<Facility>, Option<Level>) {
    let view = DataView::from(header);
    match fields {
        Some(f) => (
            view.try_read::<u8>(f.facility).map(Facility),
            view.try_read::<u8>(f.level).map(Level::new),
        ),
        None => (None, None),
    }
}

/// Reads a field out of a record header that was copied in one piece.
fn header_field<T: Pod>(header: &[u8], offset: usize, record: &str, field: &str) -> Result<T> {
    DataView::from(header).try_read::<T>(offset).ok_or_else(|| {
        KernelError::Corrupted(format!("{} header too small for {}", record, field))
    })
}

/// Reader of the flat cyclic buffer used before 5.10.
pub struct LegacyLogIter<'a, M> {
    mem: &'a mut M,
    layout: LegacyLayout,
    buf: Address,
    next_idx: u64,
    cursor: u64,
    remaining: u64,
    wrapped: bool,
    done: bool,
}

impl<'a, M: KernelMemory> LegacyLogIter<'a, M> {
    pub fn new(mem: &'a mut M, layout: &LegacyLayout) -> Result<Self> {
        let buf = mem.read_addr(layout.log_buf)?;
        let buf_len = u64::from(mem.read_pod::<u32>(layout.log_buf_len)?);
        let first_idx = u64::from(mem.read_pod::<u32>(layout.log_first_idx)?);
        let next_idx = u64::from(mem.read_pod::<u32>(layout.log_next_idx)?);

        debug!(
            "legacy log at {:x}, {} bytes, first {} next {}",
            buf, buf_len, first_idx, next_idx
        );

        // A next index past the first one means the live records never cross the end of the
        // buffer.
        let (wrapped, remaining) = if next_idx > first_idx {
            (true, next_idx - first_idx)
        } else {
            (false, buf_len.saturating_sub(first_idx))
        };

        Ok(Self {
            mem,
            layout: layout.clone(),
            buf,
            next_idx,
            cursor: first_idx,
            remaining,
            wrapped,
            done: false,
        })
    }

    /// Continues at the start of the buffer, once.
    fn wrap(&mut self) -> bool {
        if self.wrapped {
            return false;
        }

        trace!("legacy log wraps to the start of the buffer");
        self.cursor = 0;
        self.remaining = self.next_idx;
        self.wrapped = true;
        true
    }

    fn advance(&mut self) -> Result<Option<LegacyEntry>> {
        let header_size = self.layout.header_size;

        loop {
            if self.remaining < header_size as u64 {
                if self.wrap() {
                    continue;
                }
                return Ok(None);
            }

            let record = offset_addr(self.buf, self.cursor);
            let mut header = vec![0; header_size];
            self.mem.read_bytes(record, &mut header)?;

            let len: u16 = header_field(&header, self.layout.len, "printk_log", "len")?;

            if len == 0 {
                if self.wrap() {
                    continue;
                }
                return Ok(None);
            }

            let entry = self.decode(record, &header)?;

            self.remaining = self.remaining.saturating_sub(u64::from(len));
            self.cursor += u64::from(len);

            return Ok(Some(entry));
        }
    }

    fn decode(&mut self, record: Address, header: &[u8]) -> Result<LegacyEntry> {
        let layout = &self.layout;

        let timestamp_ns: u64 = header_field(header, layout.ts_nsec, "printk_log", "ts_nsec")?;
        let text_len = header_field::<u16>(header, layout.text_len, "printk_log", "text_len")?;
        let dict_len = header_field::<u16>(header, layout.dict_len, "printk_log", "dict_len")?;
        let (text_len, dict_len) = (usize::from(text_len), usize::from(dict_len));
        let (facility, level) = severity(header, layout.severity);

        let text_addr = record + layout.header_size;
        let text = self.mem.read_text(text_addr, text_len)?;

        let dictionary = if dict_len > 0 {
            let mut raw = vec![0; dict_len];
            self.mem.read_bytes(text_addr + text_len, &mut raw)?;
            parse_dictionary(&raw)
        } else {
            BTreeMap::new()
        };

        trace!("legacy record at {:x}: {:?}", record, text);

        Ok(LegacyEntry {
            timestamp_ns,
            text,
            dictionary,
            facility,
            level,
        })
    }
}

impl<'a, M: KernelMemory> Iterator for LegacyLogIter<'a, M> {
    type Item = Result<LegacyEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let res = self.advance().transpose();
        if !matches!(res, Some(Ok(_))) {
            self.done = true;
        }
        res
    }
}

/// Reader of the descriptor ring used since 5.10.
pub struct ModernLogIter<'a, M> {
    mem: &'a mut M,
    layout: ModernLayout,
    descs: Address,
    infos: Address,
    data: Address,
    desc_mask: u64,
    data_size: u64,
    data_mask: u64,
    /// Next descriptor id to look at.
    id: u64,
    head_id: u64,
    /// Ids still to look at. Never more than the ring has descriptors.
    remaining: u64,
    done: bool,
}

impl<'a, M: KernelMemory> ModernLogIter<'a, M> {
    pub fn new(mem: &'a mut M, layout: &ModernLayout) -> Result<Self> {
        let prb = mem.read_addr(layout.prb)?;
        let desc_ring = offset_addr(prb, layout.desc_ring as u64);
        let data_ring = offset_addr(prb, layout.text_data_ring as u64);
        let ring = &layout.desc_ring_fields;

        let count_bits = mem.read_pod::<u32>(desc_ring + ring.count_bits)?;
        let size_bits = mem.read_pod::<u32>(data_ring + layout.data_ring.size_bits)?;
        if count_bits >= 64 || size_bits >= 64 {
            return Err(KernelError::Corrupted(format!(
                "ring bit counts {}/{} out of range",
                count_bits, size_bits
            )));
        }

        let word = layout.atomic_long_size;
        let id_mask = layout.state.id_mask;
        let tail_id = read_word(mem, desc_ring + ring.tail_id, word)? & id_mask;
        let head_id = read_word(mem, desc_ring + ring.head_id, word)? & id_mask;

        let descs = mem.read_addr(desc_ring + ring.descs)?;
        let infos = mem.read_addr(desc_ring + ring.infos)?;
        let data = mem.read_addr(data_ring + layout.data_ring.data)?;

        let desc_count = 1u64 << count_bits;
        let data_size = 1u64 << size_bits;

        // Only the newest `desc_count` ids can still own a slot.
        let pending = head_id.wrapping_sub(tail_id) & id_mask;
        let (first_id, remaining) = if pending > desc_count {
            debug!("{} descriptors pending, ring only holds {}", pending, desc_count);
            (head_id.wrapping_sub(desc_count) & id_mask, desc_count)
        } else {
            (tail_id, pending)
        };

        debug!(
            "printk ring: {} descriptors at {:x}, {} data bytes at {:x}, ids {}..{}",
            desc_count, descs, data_size, data, first_id, head_id
        );

        Ok(Self {
            mem,
            layout: layout.clone(),
            descs,
            infos,
            data,
            desc_mask: desc_count - 1,
            data_size,
            data_mask: data_size - 1,
            id: first_id,
            head_id,
            remaining,
            done: false,
        })
    }

    fn advance(&mut self) -> Result<Option<ModernEntry>> {
        while self.remaining > 0 && self.id != self.head_id {
            let id = self.id;
            self.id = id.wrapping_add(1) & self.layout.state.id_mask;
            self.remaining -= 1;

            let slot = id & self.desc_mask;
            let desc = offset_addr(self.descs, slot * self.layout.desc.size as u64);

            let state_var = read_word(
                self.mem,
                desc + self.layout.desc.state_var,
                self.layout.atomic_long_size,
            )?;
            let state = self.layout.state.state(state_var);

            if self.layout.state.id(state_var) != id {
                trace!("descriptor slot {} holds another id, skipping {}", slot, id);
                continue;
            }
            if state != DESC_COMMITTED && state != DESC_FINALIZED {
                trace!("descriptor {} in state {}, skipping", id, state);
                continue;
            }

            let info = offset_addr(self.infos, slot * self.layout.info.size as u64);
            return self.decode(desc, info).map(Some);
        }

        Ok(None)
    }

    /// Start and length of a descriptor's data block, `None` if it has none.
    fn data_block(&mut self, desc: Address) -> Result<Option<(u64, u64)>> {
        let begin = self.mem.read_pod::<u64>(desc + self.layout.desc.text_begin)?;
        let next = self.mem.read_pod::<u64>(desc + self.layout.desc.text_next)?;

        if begin & 1 == 1 && next & 1 == 1 {
            return Ok(None);
        }

        let mut begin = begin & self.data_mask;
        let next = next & self.data_mask;

        // A block that would not fit before the end of the ring is stored whole at its start.
        if next < begin && next != 0 {
            begin = 0;
        }

        let len = if next == 0 && begin > 0 {
            self.data_size - begin
        } else {
            next.saturating_sub(begin)
        };

        Ok(Some((begin, len)))
    }

    fn decode(&mut self, desc: Address, info_addr: Address) -> Result<ModernEntry> {
        let mut info = vec![0; self.layout.info.size];
        self.mem.read_bytes(info_addr, &mut info)?;

        let fields = &self.layout.info;
        let sequence: u64 = header_field(&info, fields.seq, "printk_info", "seq")?;
        let timestamp_ns: u64 = header_field(&info, fields.ts_nsec, "printk_info", "ts_nsec")?;
        let text_len: u16 = header_field(&info, fields.text_len, "printk_info", "text_len")?;
        let caller_id: u32 = header_field(&info, fields.caller_id, "printk_info", "caller_id")?;
        let device = fields.dev_info.and_then(|d| {
            let subsystem = info.get(d.subsystem..d.subsystem + d.subsystem_len)?;
            let device = info.get(d.device..d.device + d.device_len)?;
            let subsystem = until_nul(subsystem);
            if subsystem.is_empty() {
                return None;
            }
            Some(DeviceInfo {
                subsystem: bytes_to_text(subsystem),
                device: bytes_to_text(until_nul(device)),
            })
        });
        let (facility, level) = severity(&info, self.layout.severity);

        let text = match self.data_block(desc)? {
            Some((begin, len)) => {
                let len = std::cmp::min(
                    u64::from(text_len),
                    len.saturating_sub(DATA_BLOCK_ID_SIZE),
                );
                let text_addr = offset_addr(self.data, begin + DATA_BLOCK_ID_SIZE);
                Some(self.mem.read_text(text_addr, len as usize)?)
            }
            None => None,
        };

        trace!("printk record {}: {:?}", sequence, text);

        Ok(ModernEntry {
            sequence,
            timestamp_ns,
            text,
            caller_id,
            device,
            facility,
            level,
        })
    }
}

impl<'a, M: KernelMemory> Iterator for ModernLogIter<'a, M> {
    type Item = Result<ModernEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let res = self.advance().transpose();
        if !matches!(res, Some(Ok(_))) {
            self.done = true;
        }
        res
    }
}

fn read_word<M: KernelMemory>(mem: &mut M, addr: Address, width: usize) -> Result<u64> {
    let values = mem.read_values(addr, 1, width, Endian::Little)?;
    values
        .first()
        .copied()
        .ok_or_else(|| KernelError::Corrupted(format!("empty read at {:x}", addr)))
}

/// Kernel log records, oldest first.
pub enum PrintkLog<'a, M> {
    Legacy(LegacyLogIter<'a, M>),
    Modern(ModernLogIter<'a, M>),
}

impl<'a, M: KernelMemory> PrintkLog<'a, M> {
    pub fn new(mem: &'a mut M, layout: &PrintkLayout) -> Result<Self> {
        match layout {
            PrintkLayout::Legacy(l) => LegacyLogIter::new(mem, l).map(PrintkLog::Legacy),
            PrintkLayout::Modern(l) => ModernLogIter::new(mem, l).map(PrintkLog::Modern),
        }
    }
}

impl<'a, M: KernelMemory> Iterator for PrintkLog<'a, M> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            PrintkLog::Legacy(iter) => iter.next().map(|r| r.map(LogEntry::Legacy)),
            PrintkLog::Modern(iter) => iter.next().map(|r| r.map(LogEntry::Modern)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{init_log, FixtureMemory};
    use crate::layout::tests::{legacy_symbols, modern_symbols, LEGACY_NOTE, MODERN_NOTE};
    use crate::layout::LayoutSource;
    use crate::symbols::{NoSymbols, KERNEL_MODULE};
    use crate::vmcoreinfo::VmCoreInfo;

    const LOG_BUF: u64 = 0xffff_8880_0200_0000;

    fn legacy_layout() -> LegacyLayout {
        let info = VmCoreInfo::parse(LEGACY_NOTE);
        let syms = legacy_symbols();
        match LayoutSource::new(&syms, KERNEL_MODULE, Some(&info)).printk() {
            Ok(PrintkLayout::Legacy(layout)) => layout,
            other => panic!("unexpected layout {:?}", other),
        }
    }

    fn legacy_buffer(mem: &mut FixtureMemory, len: u32, first: u32, next: u32) {
        mem.write_u64(0xffff_ffff_8200_0000, LOG_BUF);
        mem.map(0xffff_ffff_8200_0008, 0x10);
        mem.write_u32(0xffff_ffff_8200_0008, len);
        mem.write_u32(0xffff_ffff_8200_0010, first);
        mem.write_u32(0xffff_ffff_8200_0014, next);
        mem.map(LOG_BUF, len as usize);
    }

    /// Writes a 32 byte record with a one line text and no dictionary.
    fn legacy_record(mem: &mut FixtureMemory, idx: u64, ts: u64, text: &str) {
        legacy_record_with(mem, idx, ts, 32, text, b"", 0, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn legacy_record_with(
        mem: &mut FixtureMemory,
        idx: u64,
        ts: u64,
        len: u16,
        text: &str,
        dict: &[u8],
        facility: u8,
        level: u8,
    ) {
        let at = LOG_BUF + idx;
        mem.write_u64(at, ts);
        mem.write_u16(at + 8, len);
        mem.write_u16(at + 10, text.len() as u16);
        mem.write_u16(at + 12, dict.len() as u16);
        mem.write_u8(at + 14, facility);
        mem.write_u8(at + 15, level);
        mem.write(at + 16, text.as_bytes());
        mem.write(at + 16 + text.len() as u64, dict);
    }

    fn legacy_texts(mem: &mut FixtureMemory) -> Vec<String> {
        LegacyLogIter::new(mem, &legacy_layout())
            .unwrap()
            .map(|e| e.map(|e| e.text))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn legacy_records_in_order() {
        init_log();
        let mut mem = FixtureMemory::new();
        legacy_buffer(&mut mem, 128, 0, 96);
        legacy_record(&mut mem, 0, 1, "A");
        legacy_record(&mut mem, 32, 2, "B");
        legacy_record(&mut mem, 64, 3, "C");

        let entries = LegacyLogIter::new(&mut mem, &legacy_layout())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let texts = entries.iter().map(|e| e.text.as_str()).collect::<Vec<_>>();
        let stamps = entries.iter().map(|e| e.timestamp_ns).collect::<Vec<_>>();
        assert_eq!(texts, vec!["A", "B", "C"]);
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[test]
    fn legacy_wraps_once() {
        let mut mem = FixtureMemory::new();
        legacy_buffer(&mut mem, 128, 64, 64);
        legacy_record(&mut mem, 64, 3, "A");
        // Zero length marker at 96 sends the reader back to the start.
        legacy_record(&mut mem, 0, 4, "B");
        legacy_record(&mut mem, 32, 5, "C");

        assert_eq!(legacy_texts(&mut mem), vec!["A", "B", "C"]);
    }

    #[test]
    fn legacy_second_wrap_ends_log() {
        let mut mem = FixtureMemory::new();
        legacy_buffer(&mut mem, 128, 64, 64);
        legacy_record(&mut mem, 64, 3, "A");
        legacy_record(&mut mem, 0, 4, "B");
        // Record at 32 is left zeroed.

        assert_eq!(legacy_texts(&mut mem), vec!["A", "B"]);
    }

    #[test]
    fn legacy_dictionary_and_severity() {
        let mut mem = FixtureMemory::new();
        legacy_buffer(&mut mem, 128, 0, 64);
        legacy_record_with(
            &mut mem,
            0,
            1_500_000_000,
            64,
            "usb 1-1: new",
            b"SUBSYSTEM=usb\0DEVICE=c189:1\0",
            0,
            0xEE,
        );

        let entries = LegacyLogIter::new(&mut mem, &legacy_layout())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.timestamp_ns, 1_500_000_000);
        assert_eq!(entry.text, "usb 1-1: new");
        assert_eq!(entry.dictionary["SUBSYSTEM"], "usb");
        assert_eq!(entry.dictionary["DEVICE"], "c189:1");
        assert_eq!(entry.facility.and_then(Facility::name), Some("LOG_KERN"));
        assert_eq!(entry.level.map(Level::value), Some(6));
    }

    #[test]
    fn legacy_without_type_information_has_no_severity() {
        let mut mem = FixtureMemory::new();
        legacy_buffer(&mut mem, 128, 0, 32);
        legacy_record(&mut mem, 0, 1, "A");

        let info = VmCoreInfo::parse(LEGACY_NOTE);
        let layout = match LayoutSource::new(&NoSymbols, KERNEL_MODULE, Some(&info)).printk() {
            Ok(PrintkLayout::Legacy(layout)) => layout,
            other => panic!("unexpected layout {:?}", other),
        };

        let entry = LegacyLogIter::new(&mut mem, &layout)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(entry.level, None);
        assert_eq!(entry.facility, None);
    }

    #[test]
    fn dictionary_pairs() {
        let dict = parse_dictionary(b"a=1\0b=2\0");
        assert_eq!(dict.len(), 2);
        assert_eq!(dict["a"], "1");
        assert_eq!(dict["b"], "2");

        let dict = parse_dictionary(b"a=1\0junk\0b=2");
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["a"]);

        let dict = parse_dictionary(b"EMPTY=\0x=y=z");
        assert_eq!(dict["EMPTY"], "");
        assert_eq!(dict["x"], "y=z");

        assert!(parse_dictionary(b"").is_empty());
    }

    #[test]
    fn severity_names() {
        assert_eq!(Facility(3).name(), Some("LOG_DAEMON"));
        assert_eq!(Facility(13).name(), None);
        assert_eq!(Facility(23).name(), Some("LOG_LOCAL7"));
        assert_eq!(Facility(200).name(), None);
        assert_eq!(Level::new(0xEE).name(), "LOG_INFO");
        assert_eq!(Level::new(3).name(), "LOG_ERR");
    }

    const PRB: u64 = 0xffff_8880_0300_0000;
    const DESCS: u64 = 0xffff_8880_0310_0000;
    const INFOS: u64 = 0xffff_8880_0320_0000;
    const DATA: u64 = 0xffff_8880_0330_0000;

    fn modern_layout() -> ModernLayout {
        let info = VmCoreInfo::parse(MODERN_NOTE);
        let syms = modern_symbols();
        match LayoutSource::new(&syms, KERNEL_MODULE, Some(&info)).printk() {
            Ok(PrintkLayout::Modern(layout)) => layout,
            other => panic!("unexpected layout {:?}", other),
        }
    }

    /// Ring of 4 descriptors and 256 data bytes.
    fn modern_ring(mem: &mut FixtureMemory, tail: u64, head: u64) {
        mem.write_u64(0xffff_ffff_8300_0000, PRB);
        mem.map(PRB, 80);
        mem.write_u32(PRB, 2);
        mem.write_u64(PRB + 8, DESCS);
        mem.write_u64(PRB + 16, INFOS);
        mem.write_u64(PRB + 24, head);
        mem.write_u64(PRB + 32, tail);
        mem.write_u32(PRB + 40, 8);
        mem.write_u64(PRB + 48, DATA);

        mem.map(DESCS, 24 * 4);
        mem.map(INFOS, 88 * 4);
        mem.map(DATA, 256);
    }

    fn modern_desc(mem: &mut FixtureMemory, id: u64, state: u64, begin: u64, next: u64) {
        let desc = DESCS + (id & 3) * 24;
        mem.write_u64(desc, id | (state << 62));
        mem.write_u64(desc + 8, begin);
        mem.write_u64(desc + 16, next);
    }

    fn modern_info(mem: &mut FixtureMemory, id: u64, seq: u64, text_len: u16) {
        let info = INFOS + (id & 3) * 88;
        mem.write_u64(info, seq);
        mem.write_u64(info + 8, seq * 1000);
        mem.write_u16(info + 16, text_len);
        mem.write_u32(info + 20, 0x8000_0001);
    }

    /// Record `id` with its text in the 32 byte data block `id & 3`.
    fn modern_record(mem: &mut FixtureMemory, id: u64, state: u64, text: &str) {
        let begin = (id & 3) * 32;
        modern_desc(mem, id, state, begin, begin + 32);
        modern_info(mem, id, id, text.len() as u16);
        mem.write_u64(DATA + begin, id);
        mem.write(DATA + begin + 8, text.as_bytes());
    }

    fn modern_entries(mem: &mut FixtureMemory) -> Vec<ModernEntry> {
        ModernLogIter::new(mem, &modern_layout())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn modern_only_committed_descriptors() {
        init_log();
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 4);
        for id in 0..4 {
            modern_record(&mut mem, id, id, &format!("msg {}", id));
        }

        let entries = modern_entries(&mut mem);
        let texts = entries
            .iter()
            .map(|e| e.text.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["msg 1", "msg 2"]);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].timestamp_ns, 2000);
        assert_eq!(entries[1].caller_id, 0x8000_0001);
    }

    #[test]
    fn modern_skips_stale_descriptor() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 3);
        modern_record(&mut mem, 0, 2, "old");
        modern_record(&mut mem, 1, 2, "mine");
        modern_record(&mut mem, 2, 2, "new");
        // Slot 1 was reused by id 5.
        modern_desc(&mut mem, 5, 2, 32, 64);

        let texts = modern_entries(&mut mem)
            .into_iter()
            .map(|e| e.text.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["old", "new"]);
    }

    #[test]
    fn modern_block_stored_at_ring_start() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 1);
        modern_desc(&mut mem, 0, 2, 240, 512 + 32);
        modern_info(&mut mem, 0, 0, 7);
        mem.write_u64(DATA + 240, 0);
        mem.write_u64(DATA, 0);
        mem.write(DATA + 8, b"wrapped");

        let entries = modern_entries(&mut mem);
        assert_eq!(entries[0].text.as_deref(), Some("wrapped"));
    }

    #[test]
    fn modern_block_ending_at_ring_end() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 1);
        modern_desc(&mut mem, 0, 2, 224, 256);
        // Text length claims more than the block holds.
        modern_info(&mut mem, 0, 0, 200);
        mem.write(DATA + 232, b"tail end of ring");
        mem.write(DATA + 248, b"12345678");

        let entries = modern_entries(&mut mem);
        assert_eq!(entries[0].text.as_deref(), Some("tail end of ring12345678"));
    }

    #[test]
    fn modern_dataless_record() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 1);
        modern_desc(&mut mem, 0, 2, 3, 3);
        modern_info(&mut mem, 0, 42, 0);

        let entries = modern_entries(&mut mem);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 42);
        assert_eq!(entries[0].text, None);
    }

    #[test]
    fn modern_severity_and_device() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 1);
        modern_record(&mut mem, 0, 2, "usb 1-1: new");
        mem.write_u8(INFOS + 18, 3);
        mem.write_u8(INFOS + 19, 0xEE);
        mem.write(INFOS + 24, b"usb\0");
        mem.write(INFOS + 40, b"+usb:1-1\0");

        let entry = &modern_entries(&mut mem)[0];
        assert_eq!(entry.facility, Some(Facility(3)));
        assert_eq!(entry.level.map(Level::value), Some(6));
        assert_eq!(
            entry.device,
            Some(DeviceInfo {
                subsystem: "usb".into(),
                device: "+usb:1-1".into(),
            })
        );
    }

    #[test]
    fn modern_ids_clamped_to_ring_size() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 10);
        for id in 6..10 {
            modern_record(&mut mem, id, 2, &format!("msg {}", id));
        }

        let seqs = modern_entries(&mut mem)
            .into_iter()
            .map(|e| e.sequence)
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![6, 7, 8, 9]);
    }

    #[test]
    fn modern_ids_carrying_state_bits_terminate() {
        init_log();
        let mut mem = FixtureMemory::new();
        // The head id still carries state bits. Without masking it would never be reached.
        modern_ring(&mut mem, 0, (1 << 63) | 2);
        for id in 0..4 {
            modern_record(&mut mem, id, 2, &format!("msg {}", id));
        }

        let seqs = modern_entries(&mut mem)
            .into_iter()
            .map(|e| e.sequence)
            .collect::<Vec<_>>();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn modern_walk_never_exceeds_ring_size() {
        let mut mem = FixtureMemory::new();
        // Tail ahead of head: the pending count wraps to nearly the whole id space.
        modern_ring(&mut mem, 5, 1);
        for id in 0..4 {
            modern_record(&mut mem, id, 2, &format!("msg {}", id));
        }

        let entries = modern_entries(&mut mem);
        assert!(entries.len() <= 4);
    }

    #[test]
    fn modern_bad_bit_count() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 1);
        mem.write_u32(PRB, 64);

        assert!(matches!(
            ModernLogIter::new(&mut mem, &modern_layout()),
            Err(KernelError::Corrupted(_))
        ));
    }

    #[test]
    fn log_dispatches_on_layout() {
        let mut mem = FixtureMemory::new();
        modern_ring(&mut mem, 0, 2);
        modern_record(&mut mem, 0, 2, "first");
        modern_record(&mut mem, 1, 1, "second");

        let layout = PrintkLayout::Modern(modern_layout());
        let texts = PrintkLog::new(&mut mem, &layout)
            .unwrap()
            .map(|e| e.map(|e| e.text().map(str::to_string)))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(texts, vec![Some("first".into()), Some("second".into())]);
    }
}
