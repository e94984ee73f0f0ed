//! Threaded dispatch: a function-pointer table indexed by the next
//! entry's bytecode, with no per-instruction decode of the id.

use rvsim_isa::Xlen;

use super::{for_each_bytecode, Dispatch, Flow};
use crate::bytecode::{Bytecode, BYTECODES_MAX};
use crate::error::{Result, StopReason};
use crate::machine::Machine;

type StepFn<X> = for<'a, 'b> fn(&'a mut Dispatch<'b, X>) -> Result<Flow>;

pub(crate) fn run<X: Xlen>(machine: &mut Machine<X>) -> Result<StopReason> {
    let table = build_table::<X>();
    let mut d = Dispatch::new(machine)?;
    if let Some(reason) = d.prologue() {
        return Ok(reason);
    }
    let result = run_loop(&mut d, &table);
    d.finish(&result);
    result
}

fn run_loop<X: Xlen>(
    d: &mut Dispatch<'_, X>,
    table: &[StepFn<X>; BYTECODES_MAX],
) -> Result<StopReason> {
    loop {
        let step = table[d.bytecode_index()];
        if let Flow::Halt(reason) = step(d)? {
            return Ok(reason);
        }
    }
}

fn build_table<X: Xlen>() -> [StepFn<X>; BYTECODES_MAX] {
    macro_rules! gen_table {
        ($(($bc:ident, $step:ident)),+ $(,)?) => {{
            let mut table: [StepFn<X>; BYTECODES_MAX] = [|d| d.step_invalid(); BYTECODES_MAX];
            $(table[Bytecode::$bc as usize] = |d| d.$step();)+
            table
        }};
    }
    for_each_bytecode!(gen_table)
}
