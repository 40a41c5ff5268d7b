//! Integration tests for handle lifetime and process queries

mod common;

use common::{create, exit, load, setup};
use pretty_assertions::assert_eq;
use vmi_core::guest::TraceEvent;
use vmi_core::{ModuleHandle, ProcessFlags, ProcessHandle, VmiError, Walk};

fn find(core: &vmi_core::Core, name: &str) -> ProcessHandle {
    core.find_process(name, ProcessFlags::X64)
        .expect("process should be running")
}

#[test]
fn test_resolve_until_exit() {
    let (guest, core) = setup();
    let explorer = find(&core, "explorer.exe");
    assert!(core.is_valid(explorer));
    assert_eq!(core.process_pid(explorer).unwrap(), 1200);

    guest.push_event(exit(2));
    guest.run(&core);

    assert!(!core.is_valid(explorer));
    assert!(core.resolve(explorer).unwrap_err().is_not_found());
    assert!(core.process_name(explorer).unwrap_err().is_not_found());
}

#[test]
fn test_guest_id_reuse_issues_new_handle() {
    let (guest, core) = setup();
    core.listen_process_create(|_| Ok(())).unwrap();

    guest.push_event(create(7, 500, "calc.exe", ProcessFlags::X64));
    guest.run(&core);
    let first = find(&core, "calc.exe");

    // Exit never observed, then the guest hands out the same identifier again.
    guest.push_event(create(7, 501, "calc.exe", ProcessFlags::X64));
    guest.run(&core);
    let second = find(&core, "calc.exe");

    assert_ne!(first, second);
    assert!(core.resolve(first).is_err());
    assert_eq!(core.process_pid(second).unwrap(), 501);
}

#[test]
fn test_creation_trap_for_walked_process_keeps_handle() {
    let (guest, core) = setup();
    let explorer = find(&core, "explorer.exe");
    core.listen_process_create(|_| Ok(())).unwrap();

    // The walk saw explorer before its creation trap was serviced.
    guest.push_event(create(2, 1200, "explorer.exe", ProcessFlags::X64));
    let report = guest.step(&core).unwrap();

    assert_eq!(report.event, Some(vmi_core::GuestEvent::ProcessCreated(explorer)));
    assert!(core.is_valid(explorer));
    assert_eq!(core.process_name(explorer).unwrap(), "explorer.exe");
    assert_eq!(find(&core, "explorer.exe"), explorer);
}

#[test]
fn test_exit_without_delete_subscription_invalidates() {
    let (guest, core) = setup();
    let explorer = find(&core, "explorer.exe");
    let modules = core.modules(explorer).unwrap();
    assert_eq!(modules.len(), 2);

    guest.push_event(exit(2));
    guest.run(&core);

    for module in modules {
        assert!(core.module_name(explorer, module).unwrap_err().is_not_found());
    }
}

#[test]
fn test_handles_visited_by_enumeration_resolve() {
    let (_, core) = setup();
    let mut handles = Vec::new();
    core.list_processes(|handle| {
        handles.push(handle);
        Walk::Continue
    })
    .unwrap();

    let names: Vec<String> = handles
        .iter()
        .map(|h| core.process_name(*h).unwrap())
        .collect();
    assert_eq!(names, vec!["System".to_string(), "explorer.exe".to_string()]);
}

#[test]
fn test_current_process_follows_schedule() {
    let (guest, core) = setup();
    let system = core.current_process().unwrap();
    assert_eq!(core.process_name(system).unwrap(), "System");

    guest.push_event(TraceEvent::Schedule { id: Some(2) });
    guest.run(&core);
    let current = core.current_process().unwrap();
    assert_eq!(current, find(&core, "explorer.exe"));

    guest.push_event(TraceEvent::Schedule { id: None });
    guest.run(&core);
    assert!(matches!(core.current_process(), Err(VmiError::Unavailable(_))));
}

#[test]
fn test_process_parent() {
    let (_, core) = setup();
    let explorer = find(&core, "explorer.exe");
    let system = core.process_parent(explorer).unwrap();
    assert_eq!(core.process_pid(system).unwrap(), 4);
    assert!(core.process_parent(system).unwrap_err().is_not_found());
}

#[test]
fn test_malformed_flags_are_reported() {
    let (guest, core) = setup();
    core.listen_process_create(|_| Ok(())).unwrap();
    let bogus = ProcessFlags {
        is_x86: true,
        is_x64: true,
    };
    guest.push_event(create(9, 900, "odd.exe", bogus));
    guest.run(&core);

    let mut odd = None;
    core.list_processes(|handle| {
        if core.process_name(handle).map(|n| n == "odd.exe").unwrap_or(false) {
            odd = Some(handle);
            return Walk::Stop;
        }
        Walk::Continue
    })
    .unwrap();

    let result = core.process_flags(odd.expect("odd.exe should be listed"));
    assert!(matches!(
        result,
        Err(VmiError::InvalidFlags {
            is_x86: true,
            is_x64: true
        })
    ));
}

#[test]
fn test_handle_text_and_byte_encoding() {
    let (guest, core) = setup();
    let explorer = find(&core, "explorer.exe");

    let parsed: ProcessHandle = explorer.to_string().parse().unwrap();
    assert_eq!(parsed, explorer);
    assert_eq!(ProcessHandle::from_bytes(&explorer.to_bytes()).unwrap(), explorer);
    assert!(matches!(
        ProcessHandle::from_bytes(&[1, 2, 3]),
        Err(VmiError::InvalidHandle(_))
    ));

    let module = core.find_module_by_name(explorer, "NTDLL.DLL").unwrap();
    let decoded = ModuleHandle::from_bytes(&module.to_bytes()).unwrap();
    assert_eq!(decoded, module);
    assert_eq!(decoded.process(), explorer);

    guest.push_event(load(2, 22, "user32.dll", 0x7fe0_0000, 0x1_0000));
    guest.run(&core);
    let user32 = core.find_module_by_name(explorer, "user32.dll").unwrap();
    assert_ne!(user32, module);
}
