use log::debug;
use nix::unistd::Pid;
use regex::Regex;
use simple_error::{bail, try_with};

use crate::elf;
use crate::proc::{self, Module};
use crate::result::Result;

/// Whether `name` is `module_prefix` followed by any (possibly empty)
/// combination of `.`, `-` and digits around a single optional `so`. For the
/// prefix `libc` this accepts `libc`, `libc-2.31.so`, `libc.so.6` and
/// `libc1.so` but rejects `libc-something.so` and `i-am-not-libc-2.31.so`.
fn module_matches(name: &str, module_prefix: &str) -> Result<bool> {
    let re_as_string = format!("^{}[\\.\\-0-9]*(so)*[\\.\\-0-9]*$", module_prefix);
    let re = match Regex::new(&re_as_string) {
        Ok(re) => re,
        Err(e) => bail!("module prefix \"{}\" is not usable: {}", module_prefix, e),
    };
    Ok(re.is_match(name))
}

/// When several modules match the prefix the last one iterated wins. Ties are
/// rare in practice, but this keeps the behavior deterministic.
fn select_module<'a>(modules: &'a [Module], module_prefix: &str) -> Result<Option<&'a Module>> {
    let mut selected = None;
    for module in modules {
        if module_matches(&module.name, module_prefix)? {
            selected = Some(module);
        }
    }
    Ok(selected)
}

/// Absolute virtual address of `function_name` inside the module of `pid`
/// whose short name matches `module_prefix`.
pub fn find_function_address(pid: Pid, function_name: &str, module_prefix: &str) -> Result<u64> {
    let modules = try_with!(proc::read_modules(pid), "cannot read modules of {}", pid);
    let module = match select_module(&modules, module_prefix)? {
        Some(module) => module,
        None => bail!("there is no module \"{}\" in process {}", module_prefix, pid),
    };

    let syms = try_with!(
        elf::load_dynamic_symbols(&module.path),
        "failed to load symbols for module \"{}\"",
        module_prefix
    );
    for sym in &syms.symbols {
        if sym.name == function_name {
            let address = sym.address + module.address_start - syms.load_bias;
            debug!(
                "resolved {} in {} to {:#x}",
                function_name, module.name, address
            );
            return Ok(address);
        }
    }

    bail!(
        "unable to locate function symbol \"{}\" in module \"{}\"",
        function_name,
        module_prefix
    )
}

/// As `find_function_address`, but probes a second `(function, module)` pair
/// if the first cannot be resolved. Both failures end up in the error.
pub fn find_function_address_with_fallback(
    pid: Pid,
    function_name: &str,
    module_prefix: &str,
    fallback_function_name: &str,
    fallback_module_prefix: &str,
) -> Result<u64> {
    let primary_error = match find_function_address(pid, function_name, module_prefix) {
        Ok(address) => return Ok(address),
        Err(e) => e,
    };
    let fallback_error =
        match find_function_address(pid, fallback_function_name, fallback_module_prefix) {
            Ok(address) => {
                debug!(
                    "resolved {} via fallback {} in {}",
                    function_name, fallback_function_name, fallback_module_prefix
                );
                return Ok(address);
            }
            Err(e) => e,
        };
    bail!(
        "failed to load symbol \"{}\" from module \"{}\" with error: \"{}\"\n\
         and also failed to load fallback symbol \"{}\" from module \"{}\" with error: \"{}\"",
        function_name,
        module_prefix,
        primary_error,
        fallback_function_name,
        fallback_module_prefix,
        fallback_error
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;
    use std::path::PathBuf;

    #[test]
    fn test_module_matches() {
        for name in &["libc", "libc.so", "libc-2.31.so", "libc.so.6", "libc1.so"] {
            assert!(
                module_matches(name, "libc").expect("cannot match"),
                "{} should match",
                name
            );
        }
        for name in &[
            "libc-something-3.14.so",
            "i-am-not-libc-2.31.so",
            "libcpp.so",
        ] {
            assert!(
                !module_matches(name, "libc").expect("cannot match"),
                "{} should not match",
                name
            );
        }
    }

    #[test]
    fn test_select_module_last_match_wins() {
        let modules = vec![
            Module {
                name: "libc-2.31.so".to_string(),
                path: PathBuf::from("/usr/lib/libc-2.31.so"),
                address_start: 0x1000,
            },
            Module {
                name: "ld-2.31.so".to_string(),
                path: PathBuf::from("/usr/lib/ld-2.31.so"),
                address_start: 0x2000,
            },
            Module {
                name: "libc.so.6".to_string(),
                path: PathBuf::from("/lib/libc.so.6"),
                address_start: 0x3000,
            },
        ];
        let selected = select_module(&modules, "libc")
            .expect("cannot select")
            .expect("no module selected");
        assert_eq!(selected.address_start, 0x3000);
    }

    #[test]
    fn test_resolve_malloc_in_own_process() {
        let address = find_function_address(getpid(), "malloc", "libc")
            .expect("cannot resolve malloc in own libc");
        assert!(address > 0);
    }

    #[test]
    fn test_symbol_address_formula() {
        let pid = getpid();
        let modules = crate::proc::read_modules(pid).expect("cannot read own modules");
        let module = select_module(&modules, "libc")
            .expect("cannot select module")
            .expect("no libc module in own process");
        let syms =
            crate::elf::load_dynamic_symbols(&module.path).expect("cannot load libc symbols");
        let sym = syms
            .symbols
            .iter()
            .find(|s| s.name == "malloc")
            .expect("malloc not in libc .dynsym");
        let expected = sym.address + module.address_start - syms.load_bias;
        let resolved =
            find_function_address(pid, "malloc", "libc").expect("cannot resolve malloc");
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_fallback_error_names_both_pairs() {
        let err = find_function_address_with_fallback(
            getpid(),
            "primary_fn",
            "libnosuchmodule",
            "fallback_fn",
            "libothermissing",
        )
        .expect_err("resolution should fail");
        let msg = err.to_string();
        assert!(msg.contains("primary_fn"));
        assert!(msg.contains("libnosuchmodule"));
        assert!(msg.contains("fallback_fn"));
        assert!(msg.contains("libothermissing"));
    }

    #[test]
    fn test_fallback_used_when_primary_missing() {
        let address = find_function_address_with_fallback(
            getpid(),
            "malloc",
            "libnosuchmodule",
            "malloc",
            "libc",
        )
        .expect("fallback resolution failed");
        assert!(address > 0);
    }
}
