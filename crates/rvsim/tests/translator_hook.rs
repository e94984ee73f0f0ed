//! The binary-translator plug-in contract: registered addresses decode
//! to the translator bytecode and the callback table drives the machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rvsim::{
    Machine, MachineError, MachineOptions, Rv64, StopReason, TranslatorCallbacks, TranslatorFn,
};
use rvsim_isa::{asm, REG_A0};

const CODE_BASE: u64 = 0x1_0000;

fn machine_with(code: &[u32]) -> Machine<Rv64> {
    let mut m = Machine::<Rv64>::new(MachineOptions::default());
    m.init_execute_area(CODE_BASE, &asm::assemble(code)).unwrap();
    m.cpu.pc = CODE_BASE;
    m
}

#[test]
fn test_translated_block_replaces_decoded_entry() {
    let mut m = machine_with(&[
        asm::addi(10, 0, 5), // replaced by the translation
        asm::wfi(),
    ]);

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_handler = Arc::clone(&hits);
    let handler: TranslatorFn<Rv64> = Arc::new(move |m: &mut Machine<Rv64>| {
        hits_in_handler.fetch_add(1, Ordering::Relaxed);
        // Emulate the replaced instruction through the callback table
        let cb = TranslatorCallbacks::<Rv64>::standard();
        m.cpu.set_reg(REG_A0, 99);
        (cb.set_counter)(m, (cb.counter)(m));
        Ok(())
    });

    m.install_translation([(CODE_BASE, handler)]).unwrap();
    if m.is_binary_translated() {
        let reason = m.simulate(u64::MAX).unwrap();
        assert_eq!(reason, StopReason::Stopped);
        assert_eq!(m.return_value(), 99);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    } else {
        // NO_TRANSLATE was set in the environment; the plain path runs
        let reason = m.simulate(u64::MAX).unwrap();
        assert_eq!(reason, StopReason::Stopped);
        assert_eq!(m.return_value(), 5);
    }
}

#[test]
fn test_double_activation_is_rejected() {
    let mut m = machine_with(&[asm::wfi()]);
    let noop: TranslatorFn<Rv64> = Arc::new(|_| Ok(()));

    m.install_translation([(CODE_BASE, Arc::clone(&noop))]).unwrap();
    if m.is_binary_translated() {
        let err = m.install_translation([(CODE_BASE + 4, noop)]).unwrap_err();
        assert!(matches!(err, MachineError::IllegalOperation(_)));
    }
}

#[test]
fn test_callback_table_memory_and_jump() {
    let mut m = machine_with(&[asm::wfi()]);
    let cb = TranslatorCallbacks::<Rv64>::standard();

    (cb.store_u32)(&mut m, 0x9000, 0xC0FFEE).unwrap();
    assert_eq!((cb.load_u32)(&mut m, 0x9000).unwrap(), 0xC0FFEE);
    assert_eq!((cb.load_u64)(&mut m, 0x9100).unwrap(), 0);

    (cb.jump)(&mut m, 0x4000).unwrap();
    assert_eq!(m.cpu.pc, 0x4000);
    assert!((cb.jump)(&mut m, 0x4001).is_err());

    assert_eq!((cb.sqrt_f64)(9.0), 3.0);
    assert_eq!((cb.sqrt_f32)(4.0), 2.0);

    (cb.stop)(&mut m);
    assert!(m.stopped());
}

#[test]
fn test_translation_respects_block_budget() {
    let options = MachineOptions {
        translate_blocks_max: 0,
        ..MachineOptions::default()
    };
    let mut m = Machine::<Rv64>::new(options);
    m.init_execute_area(CODE_BASE, &asm::assemble(&[asm::wfi()]))
        .unwrap();
    m.cpu.pc = CODE_BASE;

    let noop: TranslatorFn<Rv64> = Arc::new(|_| Ok(()));
    // A zero block budget disables translation entirely
    m.install_translation([(CODE_BASE, noop)]).unwrap();
    assert!(!m.is_binary_translated());
}
