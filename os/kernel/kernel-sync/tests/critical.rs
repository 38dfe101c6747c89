use kernel_sync::CriticalSection;

#[test]
fn enter_and_exit_pairs() {
    let mut c = CriticalSection::new();
    assert!(!c.is_held());

    c.enter();
    c.assert_held();
    c.exit();

    // a second round must start from a clean state
    c.enter();
    assert_eq!(c.depth(), 1);
    c.exit();
    c.assert_sleepable();
}

#[test]
fn unlocked_drops_and_restores_depth() {
    let mut c = CriticalSection::new();
    c.enter();
    c.enter();

    let mut seen = None;
    let r = c.unlocked(|| {
        seen = Some(42);
        7
    });

    assert_eq!(r, 7);
    assert_eq!(seen, Some(42));
    assert_eq!(c.depth(), 2);
}

#[test]
fn unlocked_without_section_just_runs() {
    let mut c = CriticalSection::new();
    let v = c.unlocked(|| String::from("ok"));
    assert_eq!(v, "ok");
    assert!(!c.is_held());
}

#[test]
fn default_is_not_held() {
    let c = CriticalSection::default();
    assert!(!c.is_held());
    assert_eq!(c.depth(), 0);
}
