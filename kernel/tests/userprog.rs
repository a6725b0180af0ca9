//! User-process scenarios: virtual-memory transfers, the syscall surface,
//! exec/join/exit, frame starvation, halt.

mod common;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use queso_kernel::{
    SchedPolicy,
    proc::Process,
    progs::{self, exit},
    syscall::SyscallCode,
    thread,
    thread::{Thread, ThreadState},
};
use queso_machine::{MachineConfig, PAGE_SIZE};

fn sys(code: SyscallCode) -> i32 {
    code as i32
}

#[test]
fn virtual_memory_round_trips_within_a_page() {
    common::run(SchedPolicy::Priority, |k| {
        let p = Process::new(k);
        p.allocate_page(2).unwrap();
        let vaddr = (2 * PAGE_SIZE + 100) as u32;

        assert_eq!(p.write_virtual_memory(vaddr, b"donation"), 8);
        let mut back = [0_u8; 8];
        assert_eq!(p.read_virtual_memory(vaddr, &mut back), 8);
        assert_eq!(&back, b"donation");

        // Unmapped pages transfer zero bytes, quietly.
        assert_eq!(p.read_virtual_memory(0, &mut back), 0);
        assert_eq!(p.write_virtual_memory(0, b"x"), 0);

        // NUL-terminated reads.
        assert_eq!(p.write_virtual_memory(vaddr, b"name\0"), 5);
        assert_eq!(p.read_virtual_memory_str(vaddr, 64).unwrap(), "name");
        assert!(p.read_virtual_memory_str(0, 64).is_err());
    });
}

/// The file half of the syscall table, driven from a real guest program.
/// Results are recorded through the closure and asserted on the host.
#[test]
fn file_syscalls_from_a_guest() {
    let k = common::boot(SchedPolicy::Priority);
    let results: Arc<Mutex<Vec<(&'static str, i32)>>> = Arc::new(Mutex::new(Vec::new()));

    let r = results.clone();
    k.machine().install_binary(
        "files",
        progs::binary(move |cpu| {
            let mut push = |tag, value| r.lock().unwrap().push((tag, value));
            let sp = cpu.registers().sp as u32;
            let name = sp - 64;
            let data = sp - 256;
            let readback = sp - 512;

            cpu.store(name, b"data\0");
            cpu.store(data, b"sixteen byte msg");

            let fd = cpu.syscall(sys(SyscallCode::Create), [name as i32, 0, 0, 0]);
            push("create", fd);
            push(
                "write",
                cpu.syscall(sys(SyscallCode::Write), [fd, data as i32, 16, 0]),
            );
            push("close", cpu.syscall(sys(SyscallCode::Close), [fd, 0, 0, 0]));
            push("close-again", cpu.syscall(sys(SyscallCode::Close), [fd, 0, 0, 0]));

            let fd = cpu.syscall(sys(SyscallCode::Open), [name as i32, 0, 0, 0]);
            push("open", fd);
            push(
                "read",
                cpu.syscall(sys(SyscallCode::Read), [fd, readback as i32, 32, 0]),
            );
            let mut buf = [0_u8; 16];
            cpu.load(readback, &mut buf);
            push("read-matches", i32::from(&buf == b"sixteen byte msg"));
            push(
                "read-bad-fd",
                cpu.syscall(sys(SyscallCode::Read), [99, readback as i32, 4, 0]),
            );
            push(
                "read-bad-buf",
                cpu.syscall(sys(SyscallCode::Read), [fd, -1, 4, 0]),
            );
            push("close2", cpu.syscall(sys(SyscallCode::Close), [fd, 0, 0, 0]));

            push(
                "unlink",
                cpu.syscall(sys(SyscallCode::Unlink), [name as i32, 0, 0, 0]),
            );
            push(
                "open-after-unlink",
                cpu.syscall(sys(SyscallCode::Open), [name as i32, 0, 0, 0]),
            );
            push(
                "unlink-again",
                cpu.syscall(sys(SyscallCode::Unlink), [name as i32, 0, 0, 0]),
            );
            exit(cpu, 0);
        }),
    );

    k.run_program("files", &[]);

    let results = results.lock().unwrap();
    let expected: Vec<(&str, i32)> = vec![
        ("create", 2),
        ("write", 16),
        ("close", 0),
        ("close-again", -1),
        ("open", 3),
        ("read", 16),
        ("read-matches", 1),
        ("read-bad-fd", -1),
        ("read-bad-buf", -1),
        ("close2", 0),
        ("unlink", 0),
        ("open-after-unlink", -1),
        ("unlink-again", -1),
    ];
    assert_eq!(*results, expected);
}

/// Scenario: exec a child that writes 128 bytes and exits 0; join returns
/// 1 with status 0, the file holds the bytes, and unlink then works.
#[test]
fn exec_join_exit_round_trip() {
    let k = common::boot(SchedPolicy::Priority);
    let parent_log: Arc<Mutex<Vec<(&'static str, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let child_args: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let argv_raw: Arc<Mutex<Option<(u32, u32, u32)>>> = Arc::new(Mutex::new(None));

    let pattern: Vec<u8> = (0..128_u8).map(|i| i.wrapping_mul(3)).collect();

    {
        let (child_args, argv_raw) = (child_args.clone(), argv_raw.clone());
        let pattern = pattern.clone();
        k.machine().install_binary(
            "writer",
            progs::binary(move |cpu| {
                let regs = cpu.registers();
                *child_args.lock().unwrap() = progs::read_args(cpu);
                let argv = regs.a1 as u32;
                *argv_raw.lock().unwrap() =
                    Some((argv, cpu.load_u32(argv), cpu.load_u32(argv + 4)));

                let sp = regs.sp as u32;
                let name = sp - 16;
                let buf = sp - 256;
                cpu.store(name, b"out\0");
                cpu.store(buf, &pattern);
                let fd = cpu.syscall(sys(SyscallCode::Create), [name as i32, 0, 0, 0]);
                let wrote = cpu.syscall(sys(SyscallCode::Write), [fd, buf as i32, 128, 0]);
                cpu.syscall(sys(SyscallCode::Close), [fd, 0, 0, 0]);
                exit(cpu, if wrote == 128 { 0 } else { 10 });
            }),
        );
    }

    {
        let log = parent_log.clone();
        let pattern = pattern.clone();
        k.machine().install_binary(
            "parent",
            progs::binary(move |cpu| {
                let mut push = |tag, value| log.lock().unwrap().push((tag, value));
                let sp = cpu.registers().sp as u32;
                let name = sp - 64;
                let strings = sp - 128;
                let ptrs = sp - 160;
                let status = sp - 32;
                let readback = sp - 512;

                cpu.store(name, b"writer\0");
                cpu.store(strings, b"alpha\0bx\0");
                let mut table = Vec::new();
                table.extend_from_slice(&strings.to_le_bytes());
                table.extend_from_slice(&(strings + 6).to_le_bytes());
                cpu.store(ptrs, &table);

                let pid =
                    cpu.syscall(sys(SyscallCode::Exec), [name as i32, 2, ptrs as i32, 0]);
                push("exec", pid);
                push(
                    "join",
                    cpu.syscall(sys(SyscallCode::Join), [pid, status as i32, 0, 0]),
                );
                push("status", cpu.load_u32(status) as i32);

                cpu.store(name, b"out\0");
                let fd = cpu.syscall(sys(SyscallCode::Open), [name as i32, 0, 0, 0]);
                let n = cpu.syscall(sys(SyscallCode::Read), [fd, readback as i32, 256, 0]);
                push("read", n);
                let mut got = vec![0_u8; 128];
                cpu.load(readback, &mut got);
                push("contents-match", i32::from(got == pattern));
                cpu.syscall(sys(SyscallCode::Close), [fd, 0, 0, 0]);
                push(
                    "unlink",
                    cpu.syscall(sys(SyscallCode::Unlink), [name as i32, 0, 0, 0]),
                );
                push(
                    "open-after-unlink",
                    cpu.syscall(sys(SyscallCode::Open), [name as i32, 0, 0, 0]),
                );
                exit(cpu, 0);
            }),
        );
    }

    k.run_program("parent", &[]);

    let log = parent_log.lock().unwrap();
    let expected: Vec<(&str, i32)> = vec![
        ("exec", 1),
        ("join", 1),
        ("status", 0),
        ("read", 128),
        ("contents-match", 1),
        ("unlink", 0),
        ("open-after-unlink", -1),
    ];
    assert_eq!(*log, expected);

    assert_eq!(*child_args.lock().unwrap(), ["alpha", "bx"]);
    // The argv page: pointers are little-endian and point just past the
    // two-entry pointer array, strings back to back.
    let (argv, p0, p1) = argv_raw.lock().unwrap().unwrap();
    assert_eq!(p0, argv + 8);
    assert_eq!(p1, p0 + 6);

    // The parent unlinked the file.
    assert!(k.machine().stub_file_system().contents("out").is_none());
}

#[test]
fn join_of_a_stranger_is_refused() {
    let k = common::boot(SchedPolicy::Priority);
    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    k.machine().install_binary(
        "joiner",
        progs::binary(move |cpu| {
            let sp = cpu.registers().sp as u32;
            // pid 5 exists nowhere, and certainly not as our child.
            let ret = cpu.syscall(sys(SyscallCode::Join), [5, (sp - 32) as i32, 0, 0]);
            l.lock().unwrap().push(ret);
            exit(cpu, 0);
        }),
    );
    k.run_program("joiner", &[]);
    assert_eq!(*log.lock().unwrap(), [-1]);
}

/// A fault with an empty pool blocks until frames come back.
#[test]
fn page_fault_waits_out_frame_starvation() {
    let machine = MachineConfig {
        phys_pages: 4,
        ..MachineConfig::default()
    };
    let k = common::boot_with(SchedPolicy::Priority, machine);
    let inner = k.clone();
    k.run(move || {
        let k = &inner;
        let mut taken = Vec::new();
        while let Some(frame) = k.frame_pool().allocate() {
            taken.push(frame);
        }
        assert_eq!(taken.len(), 4);

        let p = Process::new(k);
        let t = Thread::new(k, "faulter");
        let done = Arc::new(AtomicBool::new(false));
        {
            let (p, done) = (p.clone(), done.clone());
            thread::fork(k, &t, move || {
                p.allocate_page(0).unwrap();
                done.store(true, Ordering::Relaxed);
            });
        }

        while t.state() != ThreadState::Blocked {
            k.alarm().wait_until(200);
        }
        assert!(!done.load(Ordering::Relaxed));

        // "A process exits": its frames come back and starved threads
        // retry their fault.
        k.frame_pool().release_and_wake(taken);
        thread::join(k, &t);
        assert!(done.load(Ordering::Relaxed));
        assert_eq!(p.write_virtual_memory(0, b"ok"), 2);
    });
}

#[test]
fn non_root_halt_is_refused() {
    let k = common::boot(SchedPolicy::Priority);
    progs::install(k.machine());
    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    k.machine().install_binary(
        "parent",
        progs::binary(move |cpu| {
            let sp = cpu.registers().sp as u32;
            let name = sp - 64;
            let status = sp - 32;
            cpu.store(name, b"halt\0");
            let pid = cpu.syscall(sys(SyscallCode::Exec), [name as i32, 0, 0, 0]);
            let ret = cpu.syscall(sys(SyscallCode::Join), [pid, status as i32, 0, 0]);
            let mut log = l.lock().unwrap();
            log.push(pid);
            log.push(ret);
            log.push(cpu.load_u32(status) as i32);
            exit(cpu, 0);
        }),
    );
    k.run_program("parent", &[]);

    // The child's halt came back -1 and it exited with that; join reports
    // an abnormal exit.
    assert_eq!(*log.lock().unwrap(), [1, 0, -1]);
}

#[test]
fn root_halt_stops_the_machine() {
    let k = common::boot(SchedPolicy::Priority);
    progs::install(k.machine());
    k.run_program("halt", &[]);
    // Reaching this point is the assertion; halt tore the machine down.
}

#[test]
fn echo_writes_its_arguments_to_the_console() {
    let k = common::boot(SchedPolicy::Priority);
    progs::install(k.machine());
    k.run_program("echo", &["hello".into(), "world".into()]);
    assert_eq!(k.machine().console().take_output(), b"hello world\n");
}
