//! End-to-end boot tests.
//!
//! These need a usable virtualisation backend plus a bootable host kernel,
//! modules and busybox, so they are inert unless FAKEMACHINE_TESTS=1 is
//! set in the environment and a backend reports itself supported.

use fakemachine::Machine;

fn test_machine() -> Option<Machine> {
    if std::env::var_os("FAKEMACHINE_TESTS").is_none() {
        eprintln!("skipping: set FAKEMACHINE_TESTS=1 to run boot tests");
        return None;
    }
    if !fakemachine::supported() {
        eprintln!("skipping: no usable virtualisation backend");
        return None;
    }
    Some(Machine::new().expect("failed to create machine"))
}

#[test]
fn successful_command() {
    let Some(mut m) = test_machine() else { return };
    assert_eq!(m.run("ls /").unwrap(), 0);
}

#[test]
fn command_not_found() {
    let Some(mut m) = test_machine() else { return };
    assert_eq!(m.run("/a/b/c /").unwrap(), 127);
}

#[test]
fn exit_codes_are_plumbed_through() {
    for code in [0, 1, 2] {
        let Some(mut m) = test_machine() else { return };
        assert_eq!(m.run(&format!("sh -c 'exit {code}'")).unwrap(), code);
    }
}

#[test]
fn image_appears_under_by_label() {
    let Some(mut m) = test_machine() else { return };

    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("test.img");
    let device = m.create_image(img.to_str().unwrap(), 1024 * 1024).unwrap();
    assert_eq!(device, "/dev/disk/by-fakemachine-label/fakedisk-0");

    assert_eq!(m.run(&format!("test -b {device}")).unwrap(), 0);
}

#[test]
fn scratch_is_tmpfs_by_default() {
    let Some(mut m) = test_machine() else { return };
    let probe = r#"mountpoint -q /scratch && [ "$(awk '$2=="/scratch"{print $3}' /proc/mounts)" = tmpfs ]"#;
    assert_eq!(m.run(probe).unwrap(), 0);
}

#[test]
fn scratch_is_ext4_when_disk_backed() {
    let Some(mut m) = test_machine() else { return };
    m.set_scratch(1 << 30, "");
    let probe = r#"mountpoint -q /scratch && [ "$(awk '$2=="/scratch"{print $3}' /proc/mounts)" = ext4 ]"#;
    assert_eq!(m.run(probe).unwrap(), 0);
}

#[test]
fn memory_setting_is_honoured() {
    let Some(mut m) = test_machine() else { return };
    m.set_memory(1024);
    // MemTotal is usable rather than physical ram, so accept a range
    let probe = r#"
MEM=$(grep MemTotal /proc/meminfo | awk '{ print $2 }')
if [ ${MEM} -lt 900000 -o ${MEM} -gt 1024000 ]; then
  exit 1
fi
"#;
    assert_eq!(m.run(probe).unwrap(), 0);
}

#[test]
fn environment_reaches_the_command() {
    let Some(mut m) = test_machine() else { return };
    m.set_environ(vec!["TEST_VALUE=correct".to_string()]);
    assert_eq!(
        m.run(r#"[ "$TEST_VALUE" = correct ] && [ "$IN_FAKE_MACHINE" = yes ]"#)
            .unwrap(),
        0
    );
}

#[test]
fn missing_volume_fails_before_boot() {
    let Some(mut m) = test_machine() else { return };
    m.add_volume("/nonexistent-fakemachine-path");
    assert!(m.run("true").is_err());
}

#[test]
fn whitespace_volume_fails_before_boot() {
    let Some(mut m) = test_machine() else { return };
    m.add_volume_at("/dev", "/dev ices");
    assert!(m.run("true").is_err());
}
