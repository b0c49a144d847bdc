//! Interactive kernel shell.
//!
//! Runs as an ordinary HIGH-priority task: blocking keyboard reads,
//! line editing with backspace, a small command set over the kernel
//! subsystems, and a fixed-capacity history. The panic path restarts
//! it in place as its soft-recovery story, so all state is local to
//! [`run`].

use arrayvec::{ArrayString, ArrayVec};

use crate::arch::x86_64::time::timer;
use crate::arch::x86_64::{keyboard, vga};
use crate::caps::{self, capability_name};
use crate::ipc::{self, MessageType};
use crate::memory;
use crate::sched;

const CMD_MAX: usize = 128;
const HISTORY_SIZE: usize = 16;

const VERSION: &str = "corten 0.1.0";

/// Task entry point; spawned at HIGH priority during boot.
pub extern "C" fn shell_task() {
    init();
    run();
}

/// Print the shell banner.
pub fn init() {
    vga::set_color(vga::Color::LightCyan, vga::Color::Black);
    vga::print("\n=== corten shell ===\n");
    vga::set_color(vga::Color::Yellow, vga::Color::Black);
    vga::print("Type 'help' for available commands\n\n");
    vga::set_color(vga::Color::White, vga::Color::Black);
}

/// Read-eval loop; never returns in normal operation.
pub fn run() {
    let mut line: ArrayString<CMD_MAX> = ArrayString::new();
    let mut history: ArrayVec<ArrayString<CMD_MAX>, HISTORY_SIZE> = ArrayVec::new();

    prompt();
    loop {
        let ch = keyboard::getchar();
        match ch {
            b'\n' => {
                vga::print("\n");
                if !line.is_empty() {
                    if history.is_full() {
                        history.remove(0);
                    }
                    history.push(line.clone());
                    execute(line.as_str(), &history);
                    line.clear();
                }
                prompt();
            }
            0x08 => {
                if line.pop().is_some() {
                    vga::backspace();
                }
            }
            ch if (0x20..0x7F).contains(&ch) => {
                if line.try_push(ch as char).is_ok() {
                    let echo = [ch];
                    if let Ok(s) = core::str::from_utf8(&echo) {
                        vga::print(s);
                    }
                }
            }
            _ => {}
        }
    }
}

fn prompt() {
    vga::set_color(vga::Color::LightGreen, vga::Color::Black);
    vga::print("corten");
    vga::set_color(vga::Color::White, vga::Color::Black);
    vga::print("$ ");
}

fn execute(line: &str, history: &ArrayVec<ArrayString<CMD_MAX>, HISTORY_SIZE>) {
    let mut parts = line.trim().splitn(2, ' ');
    let cmd = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    match cmd {
        "help" => cmd_help(),
        "clear" => vga::clear(),
        "echo" => {
            vga::print(args);
            vga::print("\n");
        }
        "mem" => cmd_mem(),
        "uptime" => cmd_uptime(),
        "ps" => cmd_ps(),
        "perms" => cmd_perms(),
        "msg" => cmd_msg(args),
        "history" => {
            for entry in history.iter() {
                vga::print_fmt(format_args!("  {}\n", entry));
            }
        }
        "version" => {
            vga::print(VERSION);
            vga::print("\n");
        }
        "reboot" => {
            vga::print("Rebooting...\n");
            crate::arch::x86_64::reboot();
        }
        "" => {}
        other => {
            vga::print_fmt(format_args!("unknown command: {}\n", other));
        }
    }
}

fn cmd_help() {
    vga::print("Commands:\n");
    vga::print("  help      this list\n");
    vga::print("  clear     clear the screen\n");
    vga::print("  echo      print arguments\n");
    vga::print("  mem       heap statistics\n");
    vga::print("  uptime    time since boot\n");
    vga::print("  ps        task table\n");
    vga::print("  perms     current task capabilities\n");
    vga::print("  msg       IPC self-test\n");
    vga::print("  history   recent commands\n");
    vga::print("  version   kernel version\n");
    vga::print("  reboot    reset the machine\n");
}

fn cmd_mem() {
    let stats = memory::stats();
    vga::print_fmt(format_args!(
        "heap: {} KiB total, {} KiB used, {} KiB free\n",
        stats.total / 1024,
        stats.used / 1024,
        stats.free / 1024
    ));
}

fn cmd_uptime() {
    vga::print_fmt(format_args!(
        "up {} ms ({} timer ticks, tsc {} MHz)\n",
        timer::ms(),
        timer::pit_ticks(),
        timer::frequency_hz() / 1_000_000
    ));
}

fn cmd_ps() {
    vga::print("  pid  state       pri  uid  cpu\n");
    sched::for_each_task(|task| {
        vga::print_fmt(format_args!(
            "  {:<4} {:<11} {:<4} {:<4} {}\n",
            task.pid,
            state_name(task.state),
            task.priority,
            task.uid,
            task.cpu_time
        ));
    });
}

fn state_name(state: sched::TaskState) -> &'static str {
    match state {
        sched::TaskState::Ready => "ready",
        sched::TaskState::Running => "running",
        sched::TaskState::Sleeping => "sleeping",
        sched::TaskState::WaitingMsg => "waiting-msg",
        sched::TaskState::Blocked => "blocked",
        sched::TaskState::Terminated => "terminated",
    }
}

fn cmd_perms() {
    let pid = sched::current_pid() as usize;
    let mask = caps::get(pid);
    vga::print_fmt(format_args!("task {} capabilities {:#06x}:\n", pid, mask));
    for bit in 0..16u16 {
        let flag = 1 << bit;
        if mask & flag != 0 {
            vga::print_fmt(format_args!("  {}\n", capability_name(flag)));
        }
    }
}

fn cmd_msg(args: &str) {
    let pid = sched::current_pid() as usize;
    let payload = if args.is_empty() { "ping" } else { args };

    if ipc::send(pid, pid, MessageType::Data, payload.as_bytes()) != 0 {
        vga::print("send failed\n");
        return;
    }
    // Kernel task stacks are 4 KiB; keep the receive buffer small.
    let mut buf = [0u8; CMD_MAX];
    match ipc::try_receive(pid, &mut buf) {
        Some(header) => {
            let len = header.size as usize;
            let text = core::str::from_utf8(&buf[..len]).unwrap_or("<binary>");
            vga::print_fmt(format_args!(
                "loopback ok: '{}' ({} bytes, stamp {})\n",
                text, header.size, header.timestamp
            ));
        }
        None => vga::print("receive failed\n"),
    }
}
