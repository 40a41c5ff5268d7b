//! Integration tests for process and module enumeration

mod common;

use common::{exit, load, setup, setup_with, unload};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::HashSet;
use vmi_core::guest::{TraceModule, TraceProcess};
use vmi_core::{GuestAddress, GuestTrace, ProcessFlags, ProcessHandle, VmiError, Walk};

fn collect_processes(core: &vmi_core::Core) -> Vec<ProcessHandle> {
    let mut handles = Vec::new();
    core.list_processes(|handle| {
        handles.push(handle);
        Walk::Continue
    })
    .expect("process walk should succeed");
    handles
}

#[test]
fn test_list_modules_in_load_order() {
    let (_, core) = setup();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();

    let mut names = Vec::new();
    core.list_modules(explorer, |module| {
        names.push(core.module_name(explorer, module).unwrap());
        Walk::Continue
    })
    .unwrap();
    assert_eq!(names, vec!["explorer.exe", "ntdll.dll"]);
}

#[test]
fn test_list_modules_stops_on_request() {
    let (_, core) = setup();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();
    let mut visited = 0;
    core.list_modules(explorer, |_| {
        visited += 1;
        Walk::Stop
    })
    .unwrap();
    assert_eq!(visited, 1);
}

#[test]
fn test_list_modules_of_stale_process_fails() {
    let (guest, core) = setup();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();
    guest.push_event(exit(2));
    guest.run(&core);

    let result = core.list_modules(explorer, |_| Walk::Continue);
    assert!(matches!(result, Err(VmiError::EnumerationFailed(_))));
}

#[test]
fn test_process_exit_during_walk() {
    let (guest, core) = setup();
    let mut visited = Vec::new();
    let mut exited = false;
    core.list_processes(|handle| {
        if !exited {
            guest.push_event(exit(2));
            guest.run(&core);
            exited = true;
        }
        visited.push(handle);
        Walk::Continue
    })
    .unwrap();

    // The snapshot still presents explorer, but its handle no longer resolves.
    assert_eq!(visited.len(), 2);
    assert!(core.resolve(visited[0]).is_ok());
    assert!(core.resolve(visited[1]).unwrap_err().is_not_found());
}

#[test]
fn test_module_span_and_address_lookup() {
    let (_, core) = setup();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();
    let ntdll = core.find_module_by_name(explorer, "ntdll.dll").unwrap();

    let span = core.module_span(explorer, ntdll).unwrap();
    assert_eq!(span.base, GuestAddress::new(0x7ff0_0000));
    assert_eq!(span.size, 0x20_0000);

    let inside = GuestAddress::new(0x7ff0_1234);
    assert_eq!(core.find_module_by_address(explorer, inside).unwrap(), ntdll);

    let last = GuestAddress::new(0x7ff0_0000 + 0x20_0000 - 1);
    assert_eq!(core.find_module_by_address(explorer, last).unwrap(), ntdll);

    let past_end = GuestAddress::new(0x7ff0_0000 + 0x20_0000);
    assert!(core
        .find_module_by_address(explorer, past_end)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_module_lookup_sees_new_loads() {
    let (guest, core) = setup();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();
    guest.push_event(load(2, 30, "shell32.dll", 0x1000_0000, 0x40_0000));
    guest.run(&core);

    let shell32 = core
        .find_module_by_address(explorer, GuestAddress::new(0x1020_0000))
        .unwrap();
    assert_eq!(core.module_name(explorer, shell32).unwrap(), "shell32.dll");
}

#[test]
fn test_module_lookup_follows_remapped_module() {
    let (guest, core) = setup();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();
    let old = core.find_module_by_name(explorer, "ntdll.dll").unwrap();

    // No module-load subscription, so only a walk can notice the move.
    guest.push_event(load(2, 21, "ntdll.dll", 0x1_0000_0000, 0x1000));
    guest.run(&core);

    let moved = core
        .find_module_by_address(explorer, GuestAddress::new(0x1_0000_0000))
        .unwrap();
    assert_ne!(moved, old);
    assert_eq!(core.module_name(explorer, moved).unwrap(), "ntdll.dll");
    assert!(core.module_name(explorer, old).unwrap_err().is_not_found());
    assert!(core
        .find_module_by_address(explorer, GuestAddress::new(0x7ff0_1000))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_failed_module_walk_leaves_modules_untouched() {
    let (guest, core) = setup();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();
    let before = core.modules(explorer).unwrap();
    let spans: Vec<_> = before
        .iter()
        .map(|m| core.module_span(explorer, *m).unwrap())
        .collect();

    // ntdll goes away while a module lands on top of explorer.exe's image.
    guest.push_event(unload(2, 21));
    guest.push_event(load(2, 30, "hook.dll", 0x48_0000, 0x1000));
    guest.run(&core);

    let result = core.list_modules(explorer, |_| Walk::Continue);
    assert!(matches!(result, Err(VmiError::EnumerationFailed(_))));

    let after: Vec<_> = before
        .iter()
        .map(|m| core.module_span(explorer, *m).unwrap())
        .collect();
    assert_eq!(after, spans);
}

#[test]
fn test_module_of_other_process_is_not_found() {
    let (_, core) = setup();
    let system = core.find_process("System", ProcessFlags::X64).unwrap();
    let explorer = core.find_process("explorer.exe", ProcessFlags::X64).unwrap();
    let ntdll = core.find_module_by_name(explorer, "ntdll.dll").unwrap();

    assert!(core.module_name(system, ntdll).unwrap_err().is_not_found());
    assert!(core.module_span(system, ntdll).unwrap_err().is_not_found());
}

#[test]
fn test_overlapping_modules_fail_walk() {
    let trace = GuestTrace {
        processes: vec![TraceProcess::new(1, 4, "broken.exe", ProcessFlags::X86)
            .with_module(TraceModule::new(1, "a.dll", 0x1000, 0x2000))
            .with_module(TraceModule::new(2, "b.dll", 0x2000, 0x2000))],
        events: Vec::new(),
    };
    let (_, core) = setup_with(trace);
    let broken = core.find_process("broken.exe", ProcessFlags::X86).unwrap();

    let result = core.list_modules(broken, |_| Walk::Continue);
    assert!(matches!(result, Err(VmiError::EnumerationFailed(_))));
}

#[test]
fn test_unreadable_guest() {
    let (guest, core) = setup();
    guest.set_unreadable(true);
    let result = core.list_processes(|_| Walk::Continue);
    assert!(matches!(result, Err(VmiError::EnumerationFailed(_))));
}

fn trace_with(count: usize) -> GuestTrace {
    GuestTrace {
        processes: (0..count as u64)
            .map(|i| TraceProcess::new(i + 1, 100 + i, format!("p{}.exe", i), ProcessFlags::X64))
            .collect(),
        events: Vec::new(),
    }
}

proptest! {
    #[test]
    fn prop_enumerating_twice_yields_same_set(count in 0usize..40) {
        let (_, core) = setup_with(trace_with(count));
        let first = collect_processes(&core);
        let second = collect_processes(&core);

        prop_assert_eq!(first.len(), count);
        prop_assert_eq!(&first, &second);
        let unique: HashSet<_> = first.iter().collect();
        prop_assert_eq!(unique.len(), first.len());
    }

    #[test]
    fn prop_exits_drop_exactly_those_handles(count in 1usize..20, exits in proptest::collection::vec(0usize..20, 0..10)) {
        let (guest, core) = setup_with(trace_with(count));
        let before = collect_processes(&core);

        let mut gone = HashSet::new();
        for index in exits.into_iter().filter(|i| *i < count) {
            if gone.insert(index) {
                guest.push_event(exit(index as u64 + 1));
            }
        }
        guest.run(&core);

        let after = collect_processes(&core);
        let expected: Vec<_> = before
            .iter()
            .enumerate()
            .filter(|(i, _)| !gone.contains(i))
            .map(|(_, h)| *h)
            .collect();
        prop_assert_eq!(after, expected);
    }
}
