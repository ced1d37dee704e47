//! Calling-convention inference.
//!
//! The distance comes from RET versus RETF and the cleanup from the
//! immediate of `RET n`. The first real return fixes the convention; any
//! later return that disagrees is fatal.

use tracing::trace;

use dosrec_core::{
    CallDistance, CallModel, CallingConvention, CodeAddress, Instruction, Mnemonic, Operand,
    Register, StackCleanup,
};

use crate::error::{AnalysisError, Result};

/// Infers the convention of the function at `function` from its body.
///
/// Bodies with only synthesized returns take the distance of the segment's
/// call model.
pub fn infer_convention(
    function: CodeAddress,
    instructions: &[Instruction],
    model: CallModel,
) -> Result<CallingConvention> {
    let mut first: Option<CallingConvention> = None;
    for inst in instructions.iter().filter(|i| !i.synthetic) {
        let Some(observed) = observed_convention(inst) else {
            continue;
        };
        check_model(function, inst, observed, model)?;
        match first {
            None => {
                trace!(%function, convention = %observed, "convention fixed by first return");
                first = Some(observed);
            }
            Some(known) if known != observed => {
                return Err(AnalysisError::InconsistentConvention {
                    function,
                    first: known,
                    second: observed,
                    at: inst.offset(),
                });
            }
            Some(_) => {}
        }
    }

    Ok(first.unwrap_or_else(|| {
        let distance = match model {
            CallModel::Near => Some(CallDistance::Near),
            CallModel::Far => Some(CallDistance::Far),
            CallModel::Mixed => None,
        };
        CallingConvention {
            distance,
            cleanup: distance.map(|_| StackCleanup::Caller),
            argument_bytes: 0,
        }
    }))
}

/// Requires `POP BP` or `LEAVE` right before every real return of a
/// function that set up a BP frame.
pub fn check_frame_teardown(function: CodeAddress, instructions: &[Instruction]) -> Result<()> {
    for (idx, inst) in instructions.iter().enumerate() {
        if inst.synthetic || !matches!(inst.mnemonic, Mnemonic::Ret | Mnemonic::Retf) {
            continue;
        }
        let torn_down = idx
            .checked_sub(1)
            .and_then(|prev| instructions.get(prev))
            .is_some_and(restores_frame);
        if !torn_down {
            return Err(AnalysisError::FrameShape {
                function,
                reason: format!("return at {:04X} leaves the BP frame in place", inst.offset()),
            });
        }
    }
    Ok(())
}

fn observed_convention(inst: &Instruction) -> Option<CallingConvention> {
    let distance = match inst.mnemonic {
        Mnemonic::Ret => CallDistance::Near,
        Mnemonic::Retf => CallDistance::Far,
        _ => return None,
    };
    let argument_bytes = inst
        .op(0)
        .and_then(Operand::as_immediate)
        .map_or(0, |bytes| bytes as u16);
    let cleanup = if argument_bytes > 0 {
        StackCleanup::Callee
    } else {
        StackCleanup::Caller
    };
    Some(CallingConvention {
        distance: Some(distance),
        cleanup: Some(cleanup),
        argument_bytes,
    })
}

fn check_model(
    function: CodeAddress,
    inst: &Instruction,
    observed: CallingConvention,
    model: CallModel,
) -> Result<()> {
    let expected = match model {
        CallModel::Near => CallDistance::Near,
        CallModel::Far => CallDistance::Far,
        CallModel::Mixed => return Ok(()),
    };
    if observed.distance == Some(expected) {
        return Ok(());
    }
    Err(AnalysisError::FrameShape {
        function,
        reason: format!(
            "{} at {:04X} in a segment of {:?} functions",
            inst.mnemonic,
            inst.offset(),
            model
        ),
    })
}

fn restores_frame(inst: &Instruction) -> bool {
    match inst.mnemonic {
        Mnemonic::Leave => true,
        Mnemonic::Pop => inst.op(0).and_then(Operand::as_register) == Some(Register::BP),
        _ => false,
    }
}
