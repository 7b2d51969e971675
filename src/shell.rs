//! Kernel shell.
//!
//! One builtin thread on the console: reads lines, looks commands up in
//! a hashmap registry, and pokes the core subsystems. This is the
//! example integration consumer of the scheduler, signal and memory
//! APIs.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::ds::hashmap::HashMap;
use crate::scheduler::{self, mlfq, process, thread};
use crate::signal::{self, SigVal};
use crate::{console, percpu, serial_print, serial_println, time};

const MAX_LINE: usize = 256;

type Command = fn(&[&str]);

fn command_table() -> HashMap<String, (Command, &'static str)> {
    let mut table: HashMap<String, (Command, &'static str)> = HashMap::new();
    table.insert("help".to_string(), (cmd_help as Command, "list commands"));
    table.insert("ps".to_string(), (cmd_ps as Command, "list threads"));
    table.insert("procs".to_string(), (cmd_procs as Command, "list processes"));
    table.insert("uptime".to_string(), (cmd_uptime as Command, "show jiffies and uptime"));
    table.insert("mem".to_string(), (cmd_mem as Command, "show init's address space"));
    table.insert("kill".to_string(), (cmd_kill as Command, "kill <tid> [signo]"));
    table.insert("boost".to_string(), (cmd_boost as Command, "force a priority boost"));
    table.insert("load".to_string(), (cmd_load as Command, "per-cpu run-queue loads"));
    table.insert("tests".to_string(), (cmd_tests as Command, "run the in-kernel test suites"));
    table
}

/// Shell main loop: prompt, line-edit, dispatch.
pub fn shell_entry(_arg: usize) {
    serial_println!();
    serial_println!("CORVUS kernel shell; 'help' lists commands.");
    let table = command_table();

    let mut line: heapless::String<MAX_LINE> = heapless::String::new();
    serial_print!("corvus> ");
    loop {
        let ch = match console::read_char() {
            Ok(ch) => ch,
            Err(_) => continue,
        };
        match ch {
            '\r' | '\n' => {
                console::write_char('\n');
                execute(&table, line.trim());
                line.clear();
                serial_print!("corvus> ");
            }
            '\x08' | '\x7f' => {
                if line.pop().is_some() {
                    console::backspace();
                }
            }
            ch if !ch.is_control() => {
                if line.push(ch).is_ok() {
                    console::write_char(ch);
                }
            }
            _ => {}
        }
    }
}

fn execute(table: &HashMap<String, (Command, &'static str)>, line: &str) {
    if line.is_empty() {
        return;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    match table.get(&parts[0].to_string()) {
        Some((cmd, _)) => cmd(&parts[1..]),
        None => serial_println!("{}: unknown command", parts[0]),
    }
}

fn cmd_help(_args: &[&str]) {
    for (name, (_, help)) in command_table().iter() {
        serial_println!("{:<8} {}", name, help);
    }
}

fn cmd_ps(_args: &[&str]) {
    serial_println!("{:>5} {:>5} {:<10} {:>4} {:>3} {:>10} NAME", "TID", "PID", "STATE", "PRIO", "CPU", "CPUTIME");
    for t in thread::all_threads() {
        let info = t.info();
        let (prio, cpu) = {
            let inner = t.lock();
            (inner.sched.prio, inner.sched.cpu)
        };
        serial_println!(
            "{:>5} {:>5} {:<10} {:>4} {:>3} {:>10} {}",
            info.tid,
            info.tgid,
            info.state.as_str(),
            prio,
            cpu,
            time::jiffies_to_ms(info.cpu_time),
            info.name
        );
    }
}

fn cmd_procs(_args: &[&str]) {
    serial_println!("{:>5} {:<10} {:>7} NAME", "PID", "STATE", "THREADS");
    for p in process::all_processes() {
        serial_println!(
            "{:>5} {:<10} {:>7} {}",
            p.pid(),
            if p.is_zombie() { "ZOMBIE" } else { "RUNNING" },
            p.threads().len(),
            p.name()
        );
    }
}

fn cmd_uptime(_args: &[&str]) {
    let ms = time::uptime_ms();
    serial_println!("jiffies {}  uptime {}.{:03}s", time::jiffies(), ms / 1000, ms % 1000);
}

fn cmd_mem(_args: &[&str]) {
    let Some(init) = process::all_processes().into_iter().find(|p| p.mmap.is_some()) else {
        serial_println!("no user process");
        return;
    };
    let mmap = init.mmap.as_ref().unwrap();
    serial_println!("address space of pid {} ({}):", init.pid(), init.name());
    serial_println!("{:<18} {:<18} {:>10} FLAGS", "START", "END", "KIB");
    for r in mmap.regions_snapshot() {
        serial_println!(
            "{:#018x} {:#018x} {:>10} {}{}{}{}{}",
            r.start,
            r.end,
            r.size() / 1024,
            if r.readable() { 'r' } else { '-' },
            if r.writable() { 'w' } else { '-' },
            if r.executable() { 'x' } else { '-' },
            if r.is_stack() { 's' } else { '-' },
            if r.is_guard() { 'g' } else { '-' },
        );
    }
    serial_println!("used: {} KiB in {} regions", mmap.used_space() / 1024, mmap.region_count());
}

fn cmd_kill(args: &[&str]) {
    let Some(tid) = args.first().and_then(|s| s.parse::<usize>().ok()) else {
        serial_println!("usage: kill <tid> [signo]");
        return;
    };
    let signo = args.get(1).and_then(|s| s.parse::<usize>().ok()).unwrap_or(signal::SIGKILL);
    match signal::pthread_sigqueue(tid, signo, SigVal::Int(0)) {
        Ok(()) => serial_println!("sent signal {} to tid {}", signo, tid),
        Err(err) => serial_println!("kill: {}", err),
    }
}

fn cmd_boost(_args: &[&str]) {
    for cpu in 0..percpu::online() {
        mlfq::priority_boost(cpu);
    }
    serial_println!("boost done");
}

fn cmd_load(_args: &[&str]) {
    for cpu in 0..percpu::online() {
        serial_println!("cpu{}: load {}", cpu, mlfq::load(cpu));
    }
    let _ = scheduler::reap_terminated();
}

fn cmd_tests(_args: &[&str]) {
    crate::tests::run_all();
}
