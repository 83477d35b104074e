//! Tests of the demand-zero handler riding the same fault upcall seam
//! the copy-on-write resolver uses.

use ufork::{demand, pgfault};
use uvm::{
    EnvStatus, Kernel, SysError,
    addressing::Va,
    layout::USTACK_TOP,
    page_table::PteFlags,
};

const UPW: PteFlags = PteFlags::from_bits_truncate(
    PteFlags::U.bits() | PteFlags::P.bits() | PteFlags::W.bits(),
);

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

#[test]
fn zero_fill_on_read() {
    let mut k = Kernel::new();
    let me = k.getenvid();
    pgfault::register(&mut k, demand::resolve_zero_fill).unwrap();

    let mut buf = [0xaau8; 32];
    k.read(va(0x0dea_d000), &mut buf).unwrap();
    assert_eq!(buf, [0u8; 32]);
    let pte = k.mappings(me).unwrap().pte(va(0x0dea_d000)).unwrap();
    assert_eq!(pte.flags(), UPW);
}

#[test]
fn faulted_in_string() {
    let mut k = Kernel::new();
    pgfault::register(&mut k, demand::resolve_zero_fill).unwrap();

    // An unaligned store that crosses two unmapped pages faults twice
    // and lands in two freshly provided pages.
    let addr = va(0x0caf_eff8);
    k.write(addr, b"this string was faulted in").unwrap();
    let mut buf = [0u8; 26];
    k.read(addr, &mut buf).unwrap();
    assert_eq!(&buf, b"this string was faulted in");

    let me = k.getenvid();
    let view = k.mappings(me).unwrap();
    assert!(view.pte(va(0x0caf_e000)).is_some());
    assert!(view.pte(va(0x0caf_f000)).is_some());
}

#[test]
fn above_stack_is_fatal() {
    let mut k = Kernel::new();
    let me = k.getenvid();
    pgfault::register(&mut k, demand::resolve_zero_fill).unwrap();

    assert_eq!(k.write(USTACK_TOP, b"x"), Err(SysError::InvalidAccess));
    assert_eq!(k.status(me), Some(EnvStatus::Dead));
}

#[test]
fn protection_fault_is_refused() {
    // A present but read-only page is a protection violation, not a
    // missing page; the zero-fill handler must not paper over it.
    let mut k = Kernel::new();
    let me = k.getenvid();
    k.page_alloc(
        me,
        va(0x4000),
        PteFlags::U | PteFlags::P,
    )
    .unwrap();
    pgfault::register(&mut k, demand::resolve_zero_fill).unwrap();

    assert_eq!(k.write(va(0x4000), b"x"), Err(SysError::InvalidAccess));
    assert_eq!(k.status(me), Some(EnvStatus::Dead));
}
