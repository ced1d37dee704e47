#![no_main]

use dosrec_core::SegOff;
use dosrec_disasm::{Decoder16, Disassembler};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let decoder = Decoder16::new();

    // Single instruction: errors are fine, panics are not
    let _ = decoder.decode_instruction(data, SegOff::new(0x1000, 0));

    // Linear sweep over the whole input
    let mut offset = 0;
    let mut count = 0;
    while offset < data.len() && count < 256 {
        let address = SegOff::new(0x1000, offset as u16);
        match decoder.decode_instruction(&data[offset..], address) {
            Ok(decoded) => {
                assert!(decoded.size > 0);
                offset += decoded.size;
            }
            Err(_) => offset += 1,
        }
        count += 1;
    }
});
