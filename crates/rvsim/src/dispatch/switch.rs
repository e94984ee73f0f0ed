//! Match-based dispatch: the portable baseline.

use rvsim_isa::Xlen;

use super::{for_each_bytecode, Dispatch, Flow};
use crate::bytecode::Bytecode;
use crate::error::{Result, StopReason};
use crate::machine::Machine;

pub(crate) fn run<X: Xlen>(machine: &mut Machine<X>) -> Result<StopReason> {
    let mut d = Dispatch::new(machine)?;
    if let Some(reason) = d.prologue() {
        return Ok(reason);
    }
    let result = run_loop(&mut d);
    d.finish(&result);
    result
}

fn run_loop<X: Xlen>(d: &mut Dispatch<'_, X>) -> Result<StopReason> {
    macro_rules! gen_match {
        ($(($bc:ident, $step:ident)),+ $(,)?) => {
            match Bytecode::from_u8(d.entry().bytecode) {
                $(Bytecode::$bc => d.$step(),)+
            }
        };
    }

    loop {
        let flow = for_each_bytecode!(gen_match)?;
        if let Flow::Halt(reason) = flow {
            return Ok(reason);
        }
    }
}
