//! Symbol and type information for the inspected kernel.
//!
//! This is the "full fidelity" layout source: live targets usually come with kernel symbols
//! (DWARF, BTF, a symbol server...) and the host exposes them through [`KernelSymbols`].
//! Post-mortem images often only carry VMCOREINFO, in which case [`NoSymbols`] can be used.

use memflow::prelude::v1::Address;

use std::collections::HashMap;

/// Module all core kernel symbols live in.
pub const KERNEL_MODULE: &str = "vmlinux";

pub trait KernelSymbols {
    fn symbol_address(&self, module: &str, name: &str) -> Option<Address>;

    /// Size in bytes of the object a symbol refers to.
    fn symbol_size(&self, module: &str, name: &str) -> Option<usize>;

    fn type_size(&self, module: &str, ty: &str) -> Option<usize>;

    fn field_offset(&self, module: &str, ty: &str, field: &str) -> Option<usize>;

    fn has_type(&self, module: &str, ty: &str) -> bool {
        self.type_size(module, ty).is_some()
    }
}

impl<'a, T: KernelSymbols + ?Sized> KernelSymbols for &'a T {
    fn symbol_address(&self, module: &str, name: &str) -> Option<Address> {
        (**self).symbol_address(module, name)
    }

    fn symbol_size(&self, module: &str, name: &str) -> Option<usize> {
        (**self).symbol_size(module, name)
    }

    fn type_size(&self, module: &str, ty: &str) -> Option<usize> {
        (**self).type_size(module, ty)
    }

    fn field_offset(&self, module: &str, ty: &str, field: &str) -> Option<usize> {
        (**self).field_offset(module, ty, field)
    }
}

/// Symbol source for sessions without any symbol information.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSymbols;

impl KernelSymbols for NoSymbols {
    fn symbol_address(&self, _: &str, _: &str) -> Option<Address> {
        None
    }

    fn symbol_size(&self, _: &str, _: &str) -> Option<usize> {
        None
    }

    fn type_size(&self, _: &str, _: &str) -> Option<usize> {
        None
    }

    fn field_offset(&self, _: &str, _: &str, _: &str) -> Option<usize> {
        None
    }
}

#[derive(Clone, Debug, Default)]
struct TypeInfo {
    size: usize,
    fields: HashMap<String, usize>,
}

/// Symbols and types of a single module, kept in memory.
///
/// Hosts that already parsed the kernel's debug information can fill one of these instead of
/// implementing [`KernelSymbols`] themselves.
#[derive(Clone, Debug)]
pub struct SymbolTable {
    module: String,
    symbols: HashMap<String, (Address, usize)>,
    types: HashMap<String, TypeInfo>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new(KERNEL_MODULE)
    }
}

impl SymbolTable {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            symbols: HashMap::new(),
            types: HashMap::new(),
        }
    }

    pub fn add_symbol(&mut self, name: impl Into<String>, address: Address, size: usize) {
        self.symbols.insert(name.into(), (address, size));
    }

    pub fn add_type(&mut self, name: impl Into<String>, size: usize, fields: &[(&str, usize)]) {
        let fields = fields
            .iter()
            .map(|(name, off)| ((*name).to_string(), *off))
            .collect();
        self.types.insert(name.into(), TypeInfo { size, fields });
    }

    pub fn with_symbol(mut self, name: impl Into<String>, address: Address, size: usize) -> Self {
        self.add_symbol(name, address, size);
        self
    }

    pub fn with_type(mut self, name: impl Into<String>, size: usize, fields: &[(&str, usize)]) -> Self {
        self.add_type(name, size, fields);
        self
    }

    fn is_module(&self, module: &str) -> bool {
        self.module == module
    }
}

impl KernelSymbols for SymbolTable {
    fn symbol_address(&self, module: &str, name: &str) -> Option<Address> {
        if !self.is_module(module) {
            return None;
        }
        self.symbols.get(name).map(|(addr, _)| *addr)
    }

    fn symbol_size(&self, module: &str, name: &str) -> Option<usize> {
        if !self.is_module(module) {
            return None;
        }
        self.symbols.get(name).map(|(_, size)| *size)
    }

    fn type_size(&self, module: &str, ty: &str) -> Option<usize> {
        if !self.is_module(module) {
            return None;
        }
        self.types.get(ty).map(|t| t.size)
    }

    fn field_offset(&self, module: &str, ty: &str, field: &str) -> Option<usize> {
        if !self.is_module(module) {
            return None;
        }
        self.types.get(ty)?.fields.get(field).copied()
    }
}
