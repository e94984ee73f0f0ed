//! Tail-call threading.
//!
//! Each bytecode gets a continuation function that executes its step and
//! returns the next continuation, picked from the table by the successor
//! entry's bytecode. Rust offers no guaranteed tail-call elimination, so
//! a trampoline bounces between continuations; the structure (handlers
//! selecting their successor through one shared table) is the same.

use rvsim_isa::Xlen;

use super::{for_each_bytecode, Dispatch, Flow};
use crate::bytecode::{Bytecode, BYTECODES_MAX};
use crate::error::{Result, StopReason};
use crate::machine::Machine;

type TailFn<X> = for<'a, 'b, 'c> fn(
    &'a mut Dispatch<'b, X>,
    &'c TailTable<X>,
) -> Result<TailCall<X>>;

struct TailTable<X: Xlen>([TailFn<X>; BYTECODES_MAX]);

enum TailCall<X: Xlen> {
    Call(TailFn<X>),
    Return(StopReason),
}

pub(crate) fn run<X: Xlen>(machine: &mut Machine<X>) -> Result<StopReason> {
    let table = build_table::<X>();
    let mut d = Dispatch::new(machine)?;
    if let Some(reason) = d.prologue() {
        return Ok(reason);
    }
    let result = trampoline(&mut d, &table);
    d.finish(&result);
    result
}

fn trampoline<X: Xlen>(d: &mut Dispatch<'_, X>, table: &TailTable<X>) -> Result<StopReason> {
    let mut current = table.0[d.bytecode_index()];
    loop {
        match current(d, table)? {
            TailCall::Call(next) => current = next,
            TailCall::Return(reason) => return Ok(reason),
        }
    }
}

macro_rules! gen_continuations {
    ($(($bc:ident, $step:ident)),+ $(,)?) => {
        $(
            #[allow(non_snake_case)]
            fn $bc<X: Xlen>(
                d: &mut Dispatch<'_, X>,
                table: &TailTable<X>,
            ) -> Result<TailCall<X>> {
                match Dispatch::$step(d)? {
                    Flow::Continue => Ok(TailCall::Call(table.0[d.bytecode_index()])),
                    Flow::Halt(reason) => Ok(TailCall::Return(reason)),
                }
            }
        )+

        fn build_table<X: Xlen>() -> TailTable<X> {
            let mut table: [TailFn<X>; BYTECODES_MAX] = [Invalid::<X>; BYTECODES_MAX];
            $(table[Bytecode::$bc as usize] = $bc::<X>;)+
            TailTable(table)
        }
    };
}

for_each_bytecode!(gen_continuations);
