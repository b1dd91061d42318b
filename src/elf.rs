use simple_error::{bail, try_with};
use std::fs;
use std::path::Path;
use xmas_elf::program::Type;
use xmas_elf::sections::SectionData;
use xmas_elf::symbol_table::Entry;
use xmas_elf::ElfFile;

use crate::result::Result;

/// One entry of an ELF dynamic-symbol table. `address` is the value recorded
/// in the file, not a runtime address.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
}

pub struct DynamicSymbols {
    /// Lowest `p_vaddr` among the file's `PT_LOAD` segments. The runtime
    /// address of a symbol is `address + module_base - load_bias`.
    pub load_bias: u64,
    pub symbols: Vec<Symbol>,
}

/// Load the `.dynsym` table of the ELF file at `path`.
pub fn load_dynamic_symbols(path: &Path) -> Result<DynamicSymbols> {
    let bytes = try_with!(fs::read(path), "cannot read {}", path.display());
    let elf = match ElfFile::new(&bytes) {
        Ok(elf) => elf,
        Err(e) => bail!("cannot parse {} as ELF: {}", path.display(), e),
    };

    let mut load_bias = u64::MAX;
    for header in elf.program_iter() {
        if header.get_type() == Ok(Type::Load) {
            load_bias = load_bias.min(header.virtual_addr());
        }
    }
    if load_bias == u64::MAX {
        load_bias = 0;
    }

    let section = match elf.find_section_by_name(".dynsym") {
        Some(section) => section,
        None => bail!("{} has no .dynsym section", path.display()),
    };
    let data = match section.get_data(&elf) {
        Ok(data) => data,
        Err(e) => bail!("cannot read .dynsym of {}: {}", path.display(), e),
    };
    let entries = match data {
        SectionData::DynSymbolTable64(entries) => entries,
        _ => bail!(".dynsym of {} is not a 64-bit symbol table", path.display()),
    };

    let mut symbols = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = match entry.get_name(&elf) {
            Ok(name) => name,
            // unnamed or corrupt entries are of no use for lookups
            Err(_) => continue,
        };
        symbols.push(Symbol {
            name: name.to_string(),
            address: entry.value(),
        });
    }

    Ok(DynamicSymbols { load_bias, symbols })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::compile_shared_object;
    use tempfile::tempdir;

    #[test]
    fn test_dynamic_symbols_of_shared_object() {
        let dir = tempdir().expect("cannot create tempdir");
        let so_path = dir.path().join("libtarget.so");
        compile_shared_object(
            r#"
int exported_fn(int a) { return a + 1; }
"#,
            &so_path,
        );
        let syms = load_dynamic_symbols(&so_path).expect("cannot load symbols");
        let sym = syms
            .symbols
            .iter()
            .find(|s| s.name == "exported_fn")
            .expect("exported_fn not in .dynsym");
        assert!(sym.address > 0);
    }
}
