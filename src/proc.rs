use nix::unistd::Pid;
use simple_error::{bail, try_with};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::result::Result;

#[derive(Clone, Debug, PartialEq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub pathname: String,
}

impl Mapping {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// One loaded object of a process, condensed from its file-backed mappings.
#[derive(Clone, Debug)]
pub struct Module {
    /// Final component of `path`, e.g. `libc-2.31.so`.
    pub name: String,
    /// Absolute path of the backing file on the host filesystem.
    pub path: PathBuf,
    /// Lowest virtual address at which the file is mapped.
    pub address_start: u64,
}

pub fn pid_path(pid: Pid) -> PathBuf {
    PathBuf::from("/proc").join(pid.as_raw().to_string())
}

fn parse_line(line: &str) -> Result<Mapping> {
    let fields = line.splitn(6, ' ').collect::<Vec<_>>();
    if fields.len() != 6 {
        bail!("unexpected number of fields in line: {}", line);
    }
    let range = fields[0].splitn(2, '-').collect::<Vec<_>>();

    let start = try_with!(
        u64::from_str_radix(range[0], 16),
        "start address is not a number: {}",
        range[0]
    );
    let end = try_with!(
        u64::from_str_radix(range[1], 16),
        "end address is not a number: {}",
        range[1]
    );
    let pathname = fields[5].trim_start().trim_end_matches('\n').to_string();

    Ok(Mapping {
        start,
        end,
        pathname,
    })
}

pub fn maps(pid: Pid) -> Result<Vec<Mapping>> {
    let path = pid_path(pid).join("maps");
    let f = try_with!(File::open(&path), "cannot open {}", path.display());
    let buf = BufReader::new(f);
    let mut maps = vec![];
    for line in buf.lines() {
        let line = try_with!(line, "cannot read from {}", path.display());
        maps.push(try_with!(parse_line(&line), "cannot parse line {}", line));
    }
    Ok(maps)
}

/// Condense the maps of `pid` into one entry per file-backed object. Entries
/// appear in the order their first mapping appears in `/proc/<pid>/maps`.
pub fn read_modules(pid: Pid) -> Result<Vec<Module>> {
    let mappings = maps(pid)?;
    let mut modules: Vec<Module> = vec![];
    for m in mappings.iter().filter(|m| m.pathname.starts_with('/')) {
        match modules.iter_mut().find(|module| module.path == Path::new(&m.pathname)) {
            Some(module) => module.address_start = module.address_start.min(m.start),
            None => {
                let path = PathBuf::from(&m.pathname);
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n.to_string(),
                    None => continue,
                };
                modules.push(Module {
                    name,
                    path,
                    address_start: m.start,
                });
            }
        }
    }
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_parse_line() {
        let line = "7f1bca9a7000-7f1bcab8e000 r-xp 00022000 00:19 59510 /usr/lib/libc-2.31.so";
        let mapping = parse_line(line).expect("cannot parse line");
        assert_eq!(mapping.start, 0x7f1b_ca9a_7000);
        assert_eq!(mapping.end, 0x7f1b_cab8_e000);
        assert_eq!(mapping.pathname, "/usr/lib/libc-2.31.so");
        assert!(mapping.contains(0x7f1b_ca9a_7000));
        assert!(!mapping.contains(0x7f1b_cab8_e000));

        let line = "7ffd0e20e000-7ffd0e22f000 rw-p 00000000 00:00 0 ";
        let mapping = parse_line(line).expect("cannot parse anonymous line");
        assert_eq!(mapping.pathname, "");
    }

    #[test]
    fn test_read_own_modules() {
        let modules = read_modules(getpid()).expect("cannot read own modules");
        assert!(!modules.is_empty());
        let libc = modules
            .iter()
            .find(|m| m.name.starts_with("libc"))
            .expect("no libc module in own process");
        assert!(libc.address_start > 0);
        assert!(libc.path.is_absolute());
    }
}
