//! End-to-end tests of copy-on-write fork, driven through the emulated
//! kernel: both sides of the duplication, the sharing discipline, fault
//! classification, failure behavior, and frame accounting.

use ufork::{ForkResult, Process, pgfault, scan::UserPages};
use uvm::{
    EnvId, EnvStatus, Kernel, SysError,
    addressing::{DIR_SPAN, Va},
    layout::{USTACK_TOP, uxstack_page},
    page_table::PteFlags,
};

const UP: PteFlags =
    PteFlags::from_bits_truncate(PteFlags::U.bits() | PteFlags::P.bits());
const UPW: PteFlags = PteFlags::from_bits_truncate(
    PteFlags::U.bits() | PteFlags::P.bits() | PteFlags::W.bits(),
);
const UPC: PteFlags = PteFlags::from_bits_truncate(
    PteFlags::U.bits() | PteFlags::P.bits() | PteFlags::COW.bits(),
);

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

fn fork_parent(proc: &mut Process, k: &mut Kernel) -> EnvId {
    match proc.fork(k).unwrap() {
        ForkResult::Parent(child) => child,
        ForkResult::Child => unreachable!("drove the parent side"),
    }
}

#[test]
fn fork_return() {
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    let parent = proc.id();
    k.page_alloc(parent, va(0x1000), UPW).unwrap();

    let child = fork_parent(&mut proc, &mut k);
    assert_ne!(child, parent);
    assert_eq!(proc.id(), parent);
    assert_eq!(k.status(child), Some(EnvStatus::Runnable));

    // The child resumes the same call with the same inherited state,
    // including the stale cached identity, and must repair it.
    k.switch_to(child).unwrap();
    let mut inherited = proc.clone();
    assert_eq!(inherited.id(), parent);
    assert_eq!(inherited.fork(&mut k).unwrap(), ForkResult::Child);
    assert_eq!(inherited.id(), child);
}

#[test]
fn cow() {
    // Scenario: the parent writes S to a private page, forks, and both
    // sides then write independently without ever observing the other.
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    let x = va(0x0040_3000);
    k.page_alloc(proc.id(), x, UPW).unwrap();
    k.write(x + 0x10, b"written before fork").unwrap();

    let parent = proc.id();
    let child = fork_parent(&mut proc, &mut k);

    // Child observes the parent's bytes through the shared frame.
    k.switch_to(child).unwrap();
    let mut buf = [0u8; 19];
    k.read(x + 0x10, &mut buf).unwrap();
    assert_eq!(&buf, b"written before fork");

    // Child's write privatizes its view...
    k.write(x + 0x10, b"child wrote this 19").unwrap();
    let child_pte = k.mappings(child).unwrap().pte(x).unwrap();
    assert_eq!(child_pte.flags(), UPW);

    // ...and the parent is unaffected, still holding its COW entry.
    k.switch_to(parent).unwrap();
    k.read(x + 0x10, &mut buf).unwrap();
    assert_eq!(&buf, b"written before fork");
    assert!(k.mappings(parent).unwrap().pte(x).unwrap().flags().contains(PteFlags::COW));

    // The converse direction: a parent write leaves the child alone.
    k.write(x + 0x10, b"parent wrote this 1").unwrap();
    k.switch_to(child).unwrap();
    k.read(x + 0x10, &mut buf).unwrap();
    assert_eq!(&buf, b"child wrote this 19");
}

#[test]
fn cow_marks_both_sides() {
    // Every page that was writable or copy-on-write before duplication
    // must end up marked copy-on-write, and not writable, in both
    // environments, still sharing one frame.
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    let parent = proc.id();
    for addr in [0x0000_2000, 0x0040_0000, 5 * DIR_SPAN + 0x7000] {
        k.page_alloc(parent, va(addr), UPW).unwrap();
    }
    let before: Vec<(Va, PteFlags)> =
        UserPages::new(k.mappings(parent).unwrap(), USTACK_TOP)
            .map(|(va, pte)| (va, pte.flags()))
            .collect();
    assert_eq!(before.len(), 3);

    let child = fork_parent(&mut proc, &mut k);
    for (page, flags) in before {
        assert!(flags.intersects(PteFlags::W | PteFlags::COW));
        let ours = k.mappings(parent).unwrap().pte(page).unwrap();
        let theirs = k.mappings(child).unwrap().pte(page).unwrap();
        assert_eq!(ours.flags(), UPC, "parent entry for {page}");
        assert_eq!(theirs.flags(), UPC, "child entry for {page}");
        assert_eq!(ours.pa(), theirs.pa(), "sharing one frame for {page}");
        assert_eq!(k.frame_refs(ours.pa().unwrap()), Some(2));
    }
}

#[test]
fn cow_perm() {
    // A present page that is neither writable nor copy-on-write is
    // shared read-only with identical permissions and no marker; an
    // empty directory span needs no child-side mappings at all.
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    let parent = proc.id();
    let y = va(2 * DIR_SPAN + 0x4000);
    k.page_alloc(parent, y, UPW).unwrap();
    k.write(y, b"read-only contents").unwrap();
    k.page_map(parent, y, parent, y, UP).unwrap();

    let empty_span = 9;
    let child = fork_parent(&mut proc, &mut k);

    let ours = k.mappings(parent).unwrap().pte(y).unwrap();
    let theirs = k.mappings(child).unwrap().pte(y).unwrap();
    assert_eq!(ours.flags(), UP);
    assert_eq!(theirs.flags(), UP);
    assert_eq!(ours.pa(), theirs.pa());
    assert!(k.mappings(parent).unwrap().pde(empty_span).pa().is_none());
    assert!(k.mappings(child).unwrap().pde(empty_span).pa().is_none());

    // Still readable from the child, byte-identical.
    k.switch_to(child).unwrap();
    let mut buf = [0u8; 18];
    k.read(y, &mut buf).unwrap();
    assert_eq!(&buf, b"read-only contents");
}

#[test]
fn content_identical_before_write() {
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    let base = va(0x0080_0000);
    k.page_alloc(proc.id(), base, UPW).unwrap();
    k.page_alloc(proc.id(), base + 0x1000, UPW).unwrap();
    let pattern: Vec<u8> = (0..0x2000).map(|i| (i * 7) as u8).collect();
    k.write(base, &pattern).unwrap();

    let child = fork_parent(&mut proc, &mut k);
    k.switch_to(child).unwrap();
    let mut copy = vec![0u8; 0x2000];
    k.read(base, &mut copy).unwrap();
    assert_eq!(copy, pattern);
}

#[test]
fn uxstack_fresh() {
    // The exception stack is excluded from duplication entirely: the
    // child gets a fresh, independently writable page, never a shared
    // or copy-on-write one.
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    let parent = proc.id();
    k.page_alloc(parent, va(0x1000), UPW).unwrap();
    let child = fork_parent(&mut proc, &mut k);

    let ours = k.mappings(parent).unwrap().pte(uxstack_page()).unwrap();
    let theirs = k.mappings(child).unwrap().pte(uxstack_page()).unwrap();
    assert_eq!(ours.flags(), UPW);
    assert_eq!(theirs.flags(), UPW);
    assert_ne!(ours.pa(), theirs.pa());
    assert_eq!(k.frame_refs(theirs.pa().unwrap()), Some(1));
}

#[test]
fn non_write_fault_is_fatal() {
    let mut k = Kernel::new();
    let me = k.getenvid();
    pgfault::register(&mut k, pgfault::resolve_cow).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(k.read(va(0x6000), &mut buf), Err(SysError::InvalidAccess));
    assert_eq!(k.status(me), Some(EnvStatus::Dead));
}

#[test]
fn write_fault_without_marker_is_fatal() {
    let mut k = Kernel::new();
    let me = k.getenvid();
    k.page_alloc(me, va(0x6000), UPW).unwrap();
    k.page_map(me, va(0x6000), me, va(0x6000), UP).unwrap();
    pgfault::register(&mut k, pgfault::resolve_cow).unwrap();
    assert_eq!(k.write(va(0x6000), b"x"), Err(SysError::InvalidAccess));
    assert_eq!(k.status(me), Some(EnvStatus::Dead));
}

#[test]
fn fork_fails_on_exhaustion() {
    // Capacity chosen so that duplication dies while providing the
    // child's exception stack, before any page of the parent has been
    // remapped.
    let mut k = Kernel::builder().frame_capacity(7).build();
    let mut proc = Process::current(&k);
    let parent = proc.id();
    let x = va(0x1000);
    k.page_alloc(parent, x, UPW).unwrap();
    k.write(x, b"precious").unwrap();

    assert_eq!(proc.fork(&mut k), Err(SysError::NoMemory));

    // The parent's own address space is untouched: the page is still
    // private, plain-writable, and singly referenced.
    let pte = k.mappings(parent).unwrap().pte(x).unwrap();
    assert_eq!(pte.flags(), UPW);
    assert_eq!(k.frame_refs(pte.pa().unwrap()), Some(1));
    let ux = k.mappings(parent).unwrap().pte(uxstack_page()).unwrap();
    assert_eq!(ux.flags(), UPW);
    k.write(x, b"still ok").unwrap();
    assert_eq!(k.status(parent), Some(EnvStatus::Running));
}

#[test]
fn fork_from_child() {
    // Only the first invocation of the creation primitive in a fresh
    // environment reports the child side; after observing its own
    // creation the child can fork a grandchild normally.
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    let x = va(0x2000);
    k.page_alloc(proc.id(), x, UPW).unwrap();
    k.write(x, b"heirloom").unwrap();

    let child = fork_parent(&mut proc, &mut k);
    k.switch_to(child).unwrap();
    let mut cproc = proc.clone();
    assert_eq!(cproc.fork(&mut k).unwrap(), ForkResult::Child);

    let grandchild = fork_parent(&mut cproc, &mut k);
    assert_ne!(grandchild, child);
    k.switch_to(grandchild).unwrap();
    let mut buf = [0u8; 8];
    k.read(x, &mut buf).unwrap();
    assert_eq!(&buf, b"heirloom");
}

#[test]
fn cleanup_stress() {
    // Forking and reaping repeatedly must not leak frames: every frame
    // the child held goes back to the pool, and the shared data frames
    // drop back to a single reference.
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    k.page_alloc(proc.id(), va(0x3000), UPW).unwrap();
    k.page_alloc(proc.id(), va(0x0100_0000), UPW).unwrap();
    k.write(va(0x3000), b"stress").unwrap();

    let first = fork_parent(&mut proc, &mut k);
    k.destroy(first).unwrap();
    let baseline = k.frames_in_use();
    for _ in 0..12 {
        let child = fork_parent(&mut proc, &mut k);
        k.destroy(child).unwrap();
        assert_eq!(k.frames_in_use(), baseline);
    }
}

#[test]
fn fork_shared_unsupported() {
    let mut k = Kernel::new();
    let mut proc = Process::current(&k);
    assert_eq!(proc.fork_shared(&mut k), Err(SysError::NotSupported));
    assert_eq!(SysError::NotSupported.into_isize(), -95);
}
