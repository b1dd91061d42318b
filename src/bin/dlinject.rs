use log::error;
use std::fs;
use std::path::PathBuf;

use clap::{
    crate_version, value_t_or_exit, App, AppSettings, Arg, ArgMatches, SubCommand,
};
use nix::unistd::Pid;

use dlinject::{inject_dl, ptrace, symbols};

fn pid_arg(index: u64) -> Arg<'static, 'static> {
    Arg::with_name("pid")
        .help("Pid of the process to operate on")
        .required(true)
        .index(index)
}

fn parse_pid_arg(args: &ArgMatches) -> Pid {
    Pid::from_raw(value_t_or_exit!(args, "pid", i32))
}

fn inject(args: &ArgMatches) {
    let pid = parse_pid_arg(args);
    let library = PathBuf::from(value_t_or_exit!(args, "library", String));
    // dlopen resolves relative paths against the tracee's working directory
    let library = match fs::canonicalize(&library) {
        Ok(library) => library,
        Err(e) => {
            error!("cannot resolve {}: {}", library.display(), e);
            std::process::exit(1);
        }
    };
    let flags = if args.is_present("flags") {
        value_t_or_exit!(args, "flags", u32)
    } else {
        (libc::RTLD_NOW | libc::RTLD_GLOBAL) as u32
    };

    let thread = match ptrace::attach(pid) {
        Ok(thread) => thread,
        Err(e) => {
            error!("cannot attach to process {}: {}", pid, e);
            std::process::exit(1);
        }
    };
    match inject_dl::dlopen_in_tracee(&thread, &library, flags) {
        Ok(0) => {
            error!("dlopen in process {} returned NULL", pid);
            std::process::exit(1);
        }
        Ok(handle) => println!("{:#x}", handle),
        Err(e) => {
            error!("cannot load {} into process {}: {}", library.display(), pid, e);
            std::process::exit(1);
        }
    }
}

fn eject(args: &ArgMatches) {
    let pid = parse_pid_arg(args);
    let raw_handle = value_t_or_exit!(args, "handle", String);
    let handle = match u64::from_str_radix(raw_handle.trim_start_matches("0x"), 16) {
        Ok(handle) => handle,
        Err(e) => {
            error!("handle {} is not a hex number: {}", raw_handle, e);
            std::process::exit(1);
        }
    };

    let thread = match ptrace::attach(pid) {
        Ok(thread) => thread,
        Err(e) => {
            error!("cannot attach to process {}: {}", pid, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = inject_dl::dlclose_in_tracee(&thread, handle) {
        error!("cannot unload {:#x} from process {}: {}", handle, pid, e);
        std::process::exit(1);
    }
}

fn resolve(args: &ArgMatches) {
    let pid = parse_pid_arg(args);
    let function = value_t_or_exit!(args, "function", String);
    let module = value_t_or_exit!(args, "module", String);

    match symbols::find_function_address(pid, &function, &module) {
        Ok(address) => println!("{:#x}", address),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn setup_logging(matches: &clap::ArgMatches) {
    if matches.is_present("verbose") {
        env_logger::Builder::new().parse_filters("debug").init();
        return;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() {
    let inject_command = SubCommand::with_name("inject")
        .about("Load a shared library into a running process.")
        .version(crate_version!())
        .arg(pid_arg(1))
        .arg(
            Arg::with_name("library")
                .help("Path of the shared library to load")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::with_name("flags")
                .long("flags")
                .takes_value(true)
                .help("dlopen mode flags. Defaults to RTLD_NOW | RTLD_GLOBAL"),
        );

    let eject_command = SubCommand::with_name("eject")
        .about("Unload a previously injected library from a running process.")
        .version(crate_version!())
        .arg(pid_arg(1))
        .arg(
            Arg::with_name("handle")
                .help("Handle printed by the inject command (hex)")
                .required(true)
                .index(2),
        );

    let resolve_command = SubCommand::with_name("resolve")
        .about("Print the absolute address of a function in a process's module.")
        .version(crate_version!())
        .arg(pid_arg(1))
        .arg(
            Arg::with_name("function")
                .help("Name of the dynamic symbol to resolve")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::with_name("module")
                .help("Short module name, e.g. libc")
                .required(true)
                .index(3),
        );

    let main_app = App::new("dlinject")
        .about("Load, resolve and unload shared libraries in running processes via ptrace.")
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .help("shorthand for RUST_LOG=debug"),
        )
        .subcommand(inject_command)
        .subcommand(eject_command)
        .subcommand(resolve_command);

    let matches = main_app.get_matches();
    setup_logging(&matches);
    match matches.subcommand() {
        ("inject", Some(sub_matches)) => inject(sub_matches),
        ("eject", Some(sub_matches)) => eject(sub_matches),
        ("resolve", Some(sub_matches)) => resolve(sub_matches),
        ("", None) => unreachable!(), // because of AppSettings::SubcommandRequiredElseHelp
        _ => unreachable!(),
    }
}
