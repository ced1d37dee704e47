//! Text listings of recovered functions.

use std::collections::BTreeMap;
use std::fmt;

use crate::{Function, FunctionKind, Instruction, Operand};

/// Renders a function as an assembly listing.
///
/// Branch targets that carry a label ordinal are printed as `L{n}`, and call
/// sites with a resolved callee print the callee's name.
pub struct FunctionListing<'a> {
    function: &'a Function,
    call_names: BTreeMap<u16, String>,
    show_bytes: bool,
}

impl<'a> FunctionListing<'a> {
    pub fn new(function: &'a Function) -> Self {
        Self {
            function,
            call_names: BTreeMap::new(),
            show_bytes: false,
        }
    }

    /// Names to print for call sites, keyed by the call instruction's offset.
    pub fn with_call_names(mut self, call_names: BTreeMap<u16, String>) -> Self {
        self.call_names = call_names;
        self
    }

    /// Prints instruction sizes in a column.
    pub fn with_sizes(mut self, show: bool) -> Self {
        self.show_bytes = show;
        self
    }

    fn label_of(&self, offset: u16) -> Option<u32> {
        let idx = self.function.instruction_index(offset)?;
        self.function.instructions[idx].label
    }

    fn write_operand(&self, f: &mut fmt::Formatter<'_>, op: &Operand) -> fmt::Result {
        match op {
            Operand::Relative { target, .. } => match self.label_of(*target) {
                Some(label) => write!(f, "L{}", label),
                None => write!(f, "{}", op),
            },
            Operand::Case { value, target } => match self.label_of(*target) {
                Some(label) => write!(f, "case {} => L{}", value, label),
                None => write!(f, "{}", op),
            },
            Operand::Default { target } => match self.label_of(*target) {
                Some(label) => write!(f, "default => L{}", label),
                None => write!(f, "{}", op),
            },
            _ => write!(f, "{}", op),
        }
    }

    fn write_instruction(&self, f: &mut fmt::Formatter<'_>, inst: &Instruction) -> fmt::Result {
        write!(f, "    {}", inst.address)?;
        if self.show_bytes {
            write!(f, " {:>2}", inst.size)?;
        }
        write!(f, "  {}", inst.mnemonic)?;

        if inst.mnemonic.is_call() {
            if let Some(name) = self.call_names.get(&inst.offset()) {
                return writeln!(f, " {}", name);
            }
        }

        for (i, op) in inst.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            self.write_operand(f, op)?;
        }
        writeln!(f)
    }
}

impl fmt::Display for FunctionListing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let func = self.function;
        write!(f, "{} proc ; {}:{:04X}", func.display_name(), func.segment, func.entry)?;
        if func.convention.is_known() {
            write!(f, " {}", func.convention)?;
        }
        writeln!(f)?;

        if let FunctionKind::Library { module } = &func.kind {
            writeln!(f, "    ; library module {}", module)?;
            return writeln!(f, "{} endp", func.display_name());
        }

        for var in func.frame.parameters.values().chain(func.frame.locals.values()) {
            write!(f, "    {} = {:+}", var.name, var.displacement)?;
            if var.is_array {
                write!(f, " ; array")?;
            }
            writeln!(f)?;
        }

        for inst in &func.instructions {
            if let Some(label) = inst.label {
                writeln!(f, "L{}:", label)?;
            }
            self.write_instruction(f, inst)?;
        }
        writeln!(f, "{} endp", func.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionId, Mnemonic, Register, SegOff, SegmentId};

    fn function() -> Function {
        let mut func = Function::new(FunctionId(0), 0, SegmentId::resident(0), 0);
        let mut target = Instruction::new(SegOff::new(0, 4), 1, Mnemonic::Ret);
        target.is_label = true;
        target.label = Some(1);
        func.instructions = vec![
            Instruction::new(SegOff::new(0, 0), 2, Mnemonic::Jcc(crate::Condition::Equal))
                .with_operand(Operand::relative(2, 4)),
            Instruction::new(SegOff::new(0, 2), 2, Mnemonic::Xor)
                .with_operands(vec![Operand::reg(Register::AX), Operand::reg(Register::AX)]),
            target,
        ];
        func
    }

    #[test]
    fn test_labels_replace_targets() {
        let text = FunctionListing::new(&function()).to_string();
        assert!(text.contains("je L1"));
        assert!(text.contains("L1:\n"));
        assert!(text.starts_with("sub_0 proc"));
        assert!(text.trim_end().ends_with("sub_0 endp"));
    }

    #[test]
    fn test_call_names() {
        let mut func = function();
        func.instructions[1] = Instruction::new(SegOff::new(0, 2), 2, Mnemonic::Call)
            .with_operand(Operand::relative(0, 0x40));
        let mut names = BTreeMap::new();
        names.insert(2, "_printf".to_string());
        let text = FunctionListing::new(&func).with_call_names(names).to_string();
        assert!(text.contains("call _printf"));
    }
}
