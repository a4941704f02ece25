//! Processes started at boot. Between them they use every syscall.

use core::fmt::{self, Write};

use arrayvec::ArrayString;

use crate::{constants::processes::PROCESS_DATA_START, syscalls::user};

const LINE_LEN: usize = 128;

/// Formats a line into this process's data page and writes it out from there.
fn print(args: fmt::Arguments) {
    let mut line = ArrayString::<LINE_LEN>::new();
    // overlong lines are cut short
    let _ = line.write_fmt(args);

    let data = unsafe { core::slice::from_raw_parts_mut(PROCESS_DATA_START as *mut u8, LINE_LEN) };
    data[..line.len()].copy_from_slice(line.as_bytes());
    user::write(&data[..line.len()]);
}

fn busy_wait() {
    for _ in 0..5_000_000 {
        core::hint::spin_loop();
    }
}

/// Cooperative: gives up the CPU after every line, then returns into `exit(0)`.
pub extern "C" fn ping() {
    user::hello();
    let pid = user::getpid();
    for round in 0..3 {
        print(format_args!("ping (pid {}) round {}\n", pid, round));
        user::yield_now();
    }
}

/// Never yields; relies on the timer to be preempted.
pub extern "C" fn pong() {
    let pid = user::getpid();
    for round in 0..3 {
        print(format_args!("pong (pid {}) round {}\n", pid, round));
        busy_wait();
    }
    user::exit(3);
}
