//! Removal of calls to known hooks.
//!
//! The call goes, together with the argument pushes its `ADD SP,n` cleanup
//! accounts for and any `MOV r,imm` feeding a pushed register. For a
//! source-name hook the argument closest to the call is read as the offset
//! of a NUL-terminated string.

use tracing::debug;

use dosrec_core::{CallTarget, ControlFlow, Instruction, Mnemonic, Operand, Register, SegOff, Segment};

use crate::config::{AnalysisConfig, HookKind};

/// Longest source name harvested.
const MAX_NAME: usize = 128;

pub(super) struct HookRemoval {
    pub instructions: Vec<Instruction>,
    pub source_names: Vec<String>,
    pub calls: usize,
}

pub(super) fn apply(
    instructions: Vec<Instruction>,
    config: &AnalysisConfig,
    strings: &Segment,
) -> HookRemoval {
    let mut remove = vec![false; instructions.len()];
    let mut source_names = Vec::new();
    let mut calls = 0;

    for i in 0..instructions.len() {
        let Some(hook) = call_target(&instructions[i]).and_then(|t| config.hook_at(t)) else {
            continue;
        };
        remove[i] = true;
        calls += 1;

        let cleanup = instructions.get(i + 1).and_then(stack_cleanup);
        if cleanup.is_some() {
            remove[i + 1] = true;
        }
        let mut words = cleanup.map_or(0, |bytes| usize::from(bytes / 2));
        if hook.kind == HookKind::SourceName {
            words = words.max(1);
        }

        let mut nearest_argument = None;
        let mut j = i;
        while words > 0 && j > 0 {
            j -= 1;
            let push = &instructions[j];
            if remove[j] || push.mnemonic != Mnemonic::Push {
                break;
            }
            remove[j] = true;
            words -= 1;
            let mut value = push.op(0).and_then(Operand::as_immediate);
            if let Some(reg) = push.op(0).and_then(Operand::as_register) {
                if j > 0 && !remove[j - 1] {
                    if let Some(loaded) = load_immediate(&instructions[j - 1], reg) {
                        value = Some(loaded);
                        remove[j - 1] = true;
                        j -= 1;
                    }
                }
            }
            if nearest_argument.is_none() {
                nearest_argument = Some(value);
            }
        }

        debug!(
            call = %instructions[i].address,
            kind = ?hook.kind,
            "removing hook call"
        );
        if hook.kind == HookKind::SourceName {
            let offset = nearest_argument.flatten().map(|v| v as u16);
            match offset.and_then(|o| read_c_string(strings, o)) {
                Some(name) => source_names.push(name),
                None => debug!(call = %instructions[i].address, "hook argument is not a readable string"),
            }
        }
    }

    let instructions = instructions
        .into_iter()
        .zip(remove)
        .filter_map(|(inst, removed)| (!removed).then_some(inst))
        .collect();
    HookRemoval {
        instructions,
        source_names,
        calls,
    }
}

fn call_target(inst: &Instruction) -> Option<SegOff> {
    match inst.control_flow() {
        ControlFlow::Call {
            target: CallTarget::Near(offset),
            ..
        } => Some(inst.address.with_offset(offset)),
        ControlFlow::Call {
            target: CallTarget::Far(address),
            ..
        } => Some(address),
        _ => None,
    }
}

/// `ADD SP, n`.
fn stack_cleanup(inst: &Instruction) -> Option<u16> {
    if inst.mnemonic != Mnemonic::Add || inst.op(0)?.as_register()? != Register::SP {
        return None;
    }
    Some(inst.op(1)?.as_immediate()? as u16)
}

fn load_immediate(inst: &Instruction, reg: Register) -> Option<i32> {
    if inst.mnemonic != Mnemonic::Mov || inst.op(0)?.as_register()? != reg {
        return None;
    }
    inst.op(1)?.as_immediate()
}

fn read_c_string(segment: &Segment, offset: u16) -> Option<String> {
    let bytes: Vec<u8> = segment
        .tail(offset)
        .iter()
        .copied()
        .take_while(|b| *b != 0)
        .take(MAX_NAME + 1)
        .collect();
    if bytes.is_empty() || bytes.len() > MAX_NAME {
        return None;
    }
    if !bytes.iter().all(|b| (0x20..0x7F).contains(b)) {
        return None;
    }
    String::from_utf8(bytes).ok()
}
