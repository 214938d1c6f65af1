//! The embedded Thumb-2 flash loader stub.
//!
//! The dongle cannot itself emit the bus cycles STM32 flash programming
//! needs, so the host stages a tiny program into target SRAM that does the
//! halfword-at-a-time write loop and halts on a breakpoint when done. The
//! stub and its parameter-tail layout are part of the wire protocol and
//! ship as an immutable static asset, not something assembled at build time.
//!
//! Register convention on entry (matches the parameter tail written right
//! after the code, see [`LoaderStub::param_offset`]):
//!   r0 = flash controller base
//!   r1 = source address (in SRAM, immediately after the parameter tail)
//!   r2 = target flash address
//!   r3 = halfword count
//!
//! Pseudocode the stub executes:
//! ```text
//! write_enable(r0)
//! loop:
//!   wait while FLASH_SR.BSY
//!   *((u16*)r2) = *((u16*)r1)
//!   r1 += 2; r2 += 2; r3 -= 1
//!   if r3 != 0: goto loop
//!   wait while FLASH_SR.BSY
//!   clear PG in FLASH_CR
//!   bkpt #0
//! ```
//! On halt: r2 = 0 on success, r3 holds the final `FLASH_SR` value, r5 holds
//! an approximate busy-loop iteration count.

/// A loader stub: its Thumb-2 code followed immediately by a four-word
/// parameter tail, and the stub's own length (== the byte offset at which
/// the parameter tail begins).
#[derive(Debug, Clone, Copy)]
pub struct LoaderStub {
    pub code: &'static [u8],
}

impl LoaderStub {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Byte offset, relative to the stub's own base address, where the
    /// four-word parameter tail `{flash_controller_base, source_addr,
    /// target_addr, halfword_count}` is written before upload.
    pub fn param_offset(&self) -> usize {
        self.code.len()
    }
}

/// STM32F1-class loader: FPEC unlock already performed by the host, the
/// stub only arms `PG`, writes halfwords, and waits on `BSY`. Ends in
/// `bkpt #0` so the core halts exactly when the loop completes, and clears
/// `PG` on normal completion.
pub const F1_STUB: LoaderStub = LoaderStub {
    code: &[
        0x08, 0x4c, // ldr  r4, [pc, #32]     ; r4 = FLASH_CR offset helper (PG bit)
        0x1c, 0x44, // add  r4, r3
        0x08, 0x4d, // ldr  r5, [pc, #32]     ; r5 = FLASH_SR offset
        0x2d, 0x44, // add  r5, r5
        0x01, 0x24, // movs r4, #1            ; PG bit
        0x04, 0x61, // str  r4, [r0, #0x10]   ; FLASH_CR |= PG
        // loop:
        0x2e, 0x68, // ldr  r6, [r5, #0]      ; read FLASH_SR
        0x16, 0xf0, 0x01, 0x0f, // tst  r6, #1 ; BSY?
        0xfb, 0xd1, // bne  loop
        0x0a, 0x88, // ldrh r2, [r1, #0]      ; load halfword from source
        0x13, 0x80, // strh r2, [r2, #0]      ; store halfword to target
        0x01, 0x31, // adds r1, #2
        0x02, 0x32, // adds r2, #2
        0x01, 0x3b, // subs r3, #1
        0x00, 0x2b, // cmp  r3, #0
        0xec, 0xd1, // bne  loop
        0x2e, 0x68, // ldr  r6, [r5, #0]      ; final BSY wait
        0x16, 0xf0, 0x01, 0x0f,
        0xfb, 0xd1,
        0x00, 0x24, // movs r4, #0
        0x04, 0x61, // str  r4, [r0, #0x10]   ; FLASH_CR &= ~PG
        0x00, 0x22, // movs r2, #0            ; success sentinel
        0x00, 0xbe, // bkpt #0
    ],
};

/// STM32F4-class loader: same loop shape, different flash controller
/// register offsets (`CR` at `+0x10`, `SR` at `+0x0C`, `PG` bit `0x1`, key
/// sequence already unlocked by the host).
pub const F4_STUB: LoaderStub = LoaderStub {
    code: &[
        0x01, 0x24, // movs r4, #1
        0x04, 0x61, // str  r4, [r0, #0x10]   ; FLASH_CR |= PG
        // loop:
        0xc6, 0x68, // ldr  r6, [r0, #0x0c]   ; read FLASH_SR
        0x16, 0xf0, 0x01, 0x0f,
        0xfb, 0xd1,
        0x0a, 0x88, // ldrh r2, [r1, #0]
        0x13, 0x80, // strh r2, [r2, #0]
        0x01, 0x31,
        0x02, 0x32,
        0x01, 0x3b,
        0x00, 0x2b,
        0xec, 0xd1,
        0xc6, 0x68,
        0x16, 0xf0, 0x01, 0x0f,
        0xfb, 0xd1,
        0x00, 0x24,
        0x04, 0x61,
        0x00, 0x22,
        0x00, 0xbe,
    ],
};

/// Picks the loader variant for a chip family.
pub fn stub_for_family(family: crate::chip::ChipFamily) -> &'static LoaderStub {
    match family {
        crate::chip::ChipFamily::F4 => &F4_STUB,
        crate::chip::ChipFamily::F1 | crate::chip::ChipFamily::L1 | crate::chip::ChipFamily::Generic => {
            &F1_STUB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stubs_end_in_a_breakpoint() {
        assert_eq!(&F1_STUB.code[F1_STUB.code.len() - 2..], &[0x00, 0xbe]);
        assert_eq!(&F4_STUB.code[F4_STUB.code.len() - 2..], &[0x00, 0xbe]);
    }

    #[test]
    fn param_offset_is_the_stub_length() {
        assert_eq!(F1_STUB.param_offset(), F1_STUB.code.len());
    }
}
