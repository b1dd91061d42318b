#![allow(clippy::print_stdout)]

use nix::fcntl::OFlag;
use nix::unistd::{pipe2, Pid};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use tempfile::{tempdir, TempDir};

pub fn compile_executable(source: &str, target: &Path) {
    let cc = std::env::var("CC").unwrap_or_else(|_| String::from("cc"));
    let args = &[
        "-xc",
        "-",
        "-g",
        "-Wall",
        "-o",
        target.to_str().expect("target path is not utf-8"),
    ];
    println!("$ {} {}", cc, args.join(" "));
    let mut child = Command::new(cc)
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
        .expect("cannot compile program");
    {
        let stdin = child.stdin.as_mut().expect("cannot get child stdin");
        stdin
            .write_all(source.as_bytes())
            .expect("cannot write stdin");
    }
    assert!(child.wait().expect("process failed").success());
}

pub fn compile_shared_object(source: &str, target: &Path) {
    let cc = std::env::var("CC").unwrap_or_else(|_| String::from("cc"));
    let args = &[
        "-xc",
        "-",
        "-shared",
        "-fPIC",
        "-o",
        target.to_str().expect("target path is not utf-8"),
    ];
    println!("$ {} {}", cc, args.join(" "));
    let mut child = Command::new(cc)
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
        .expect("cannot compile shared object");
    {
        let stdin = child.stdin.as_mut().expect("cannot get child stdin");
        stdin
            .write_all(source.as_bytes())
            .expect("cannot write stdin");
    }
    assert!(child.wait().expect("process failed").success());
}

/// A freshly compiled child process that announces itself on stdout, then
/// blocks on its stdin pipe until released. Gives tests a quiescent target
/// to attach to.
pub struct TracedChild {
    dir: TempDir,
    child: Child,
    stdout: BufReader<ChildStdout>,
    write_end: Option<File>,
}

impl TracedChild {
    pub fn spawn() -> Self {
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <unistd.h>
#include <stdio.h>
int main() {
  int a;
  puts("READY");
  fflush(stdout);
  a = read(0, &a, sizeof(a));
  puts("OK");
  return 0;
}
"#,
            &binary,
        );
        let (readfd, writefd) = pipe2(OFlag::O_CLOEXEC).expect("cannot create pipe");
        let read_end = unsafe { Stdio::from_raw_fd(readfd) };
        let write_end = unsafe { File::from_raw_fd(writefd) };
        let mut child = Command::new(&binary)
            .stdin(read_end)
            .stdout(Stdio::piped())
            .spawn()
            .expect("test program failed");
        let mut stdout = BufReader::new(child.stdout.take().expect("child has no stdout"));
        let mut line = String::new();
        stdout
            .read_line(&mut line)
            .expect("cannot read READY line from child");
        assert_eq!(line, "READY\n");
        TracedChild {
            dir,
            child,
            stdout,
            write_end: Some(write_end),
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Directory the child's binary lives in; tests drop fixture files here.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Release the child and assert that it runs to completion unharmed.
    pub fn finish(mut self) {
        drop(self.write_end.take());
        let mut line = String::new();
        self.stdout
            .read_line(&mut line)
            .expect("cannot read OK line from child");
        assert_eq!(line, "OK\n");
        let status = self.child.wait().expect("cannot wait for child");
        assert!(status.success());
    }
}

impl Drop for TracedChild {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
