//! x86_64 instruction emitter.
//!
//! Emits the small, fixed code sequences the engine needs: the absolute
//! branch written over a target's entry, the proxy tail branch, and the
//! per-mock dispatch stub.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
}

impl Reg {
    #[inline]
    fn lo3(self) -> u8 {
        self as u8 & 7
    }

    #[inline]
    fn extended(self) -> bool {
        self as u8 >= 8
    }
}

/// Integer argument registers, System V order.
pub const ARG_REGS: [Reg; 6] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9];

/// Bounded little-endian code buffer writer.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Writer<'a> {
        Writer { buf, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    fn emit(&mut self, b: u8) {
        self.buf[self.pos] = b;
        self.pos += 1;
    }

    fn emit_u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn emit_u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, bs: &[u8]) {
        self.buf[self.pos..self.pos + bs.len()].copy_from_slice(bs);
        self.pos += bs.len();
    }

    fn rex(w: bool, r: bool, b: bool) -> u8 {
        0x40 | (w as u8) << 3 | (r as u8) << 2 | b as u8
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        (mode & 3) << 6 | (reg & 7) << 3 | (rm & 7)
    }

    /// `push reg`
    pub fn push_reg(&mut self, reg: Reg) {
        if reg.extended() {
            self.emit(Self::rex(false, false, true));
        }
        self.emit(0x50 + reg.lo3());
    }

    /// `pop reg`
    pub fn pop_reg(&mut self, reg: Reg) {
        if reg.extended() {
            self.emit(Self::rex(false, false, true));
        }
        self.emit(0x58 + reg.lo3());
    }

    /// `mov reg, imm64`
    pub fn mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.emit(Self::rex(true, false, reg.extended()));
        self.emit(0xB8 + reg.lo3());
        self.emit_u64(imm);
    }

    /// `mov dst, src` (64-bit)
    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(Self::rex(true, src.extended(), dst.extended()));
        self.emit(0x89);
        self.emit(Self::modrm(0b11, src.lo3(), dst.lo3()));
    }

    /// ModRM + SIB + disp32 for `[base + disp32]`. mod=10 keeps the encoding
    /// unambiguous for every base register.
    fn mem_operand(&mut self, reg_field: u8, base: Reg, disp: i32) {
        if base.lo3() == 4 {
            self.emit(Self::modrm(0b10, reg_field, 0b100));
            self.emit(0x24); // SIB: no index, base = rsp/r12
        } else {
            self.emit(Self::modrm(0b10, reg_field, base.lo3()));
        }
        self.emit_u32(disp as u32);
    }

    /// `mov [base + disp], src` (64-bit)
    pub fn mov_mem_reg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit(Self::rex(true, src.extended(), base.extended()));
        self.emit(0x89);
        self.mem_operand(src.lo3(), base, disp);
    }

    /// `mov dst, [base + disp]` (64-bit)
    pub fn mov_reg_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit(Self::rex(true, dst.extended(), base.extended()));
        self.emit(0x8B);
        self.mem_operand(dst.lo3(), base, disp);
    }

    /// `lea dst, [base + disp]`
    pub fn lea_reg_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit(Self::rex(true, dst.extended(), base.extended()));
        self.emit(0x8D);
        self.mem_operand(dst.lo3(), base, disp);
    }

    /// `sub reg, imm32`
    pub fn sub_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(Self::rex(true, false, reg.extended()));
        self.emit(0x81);
        self.emit(Self::modrm(0b11, 5, reg.lo3()));
        self.emit_u32(imm);
    }

    /// `call reg`
    pub fn call_reg(&mut self, reg: Reg) {
        if reg.extended() {
            self.emit(Self::rex(false, false, true));
        }
        self.emit(0xFF);
        self.emit(Self::modrm(0b11, 2, reg.lo3()));
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.emit(0xC3);
    }

    /// Absolute jump: `jmp [rip+2]; ud2; .quad target` (16 bytes). The UD2
    /// pad traps if execution ever falls into the literal.
    pub fn jmp_abs(&mut self, target: u64) {
        self.bytes(&[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B]);
        self.emit_u64(target);
    }
}

/// Encoded length of [`Writer::jmp_abs`].
pub const ABS_JUMP_LEN: usize = 16;

/// Branch sequence redirecting a patched entry into `hook`.
pub fn branch_into(hook: usize) -> Vec<u8> {
    let mut buf = [0u8; ABS_JUMP_LEN];
    let mut w = Writer::new(&mut buf);
    w.jmp_abs(hook as u64);
    buf.to_vec()
}

/// Branch sequence returning from a proxy block to `addr`.
pub fn branch_to(addr: usize) -> Vec<u8> {
    branch_into(addr)
}

/// Stack frame reserved by the dispatch stub for spilled argument registers.
const SPILL_FRAME: u32 = 64;

/// Emit the per-mock dispatch stub.
///
/// The stub replaces the target's entry: it spills the integer argument
/// registers, calls `dispatcher(state, argv)` with the engine's C ABI, and
/// returns the dispatcher's result in the return register. Frame layout
/// keeps the stack 16-byte aligned at the call.
pub fn emit_dispatch_stub(buf: &mut [u8], state: usize, dispatcher: usize) -> usize {
    let mut w = Writer::new(buf);
    w.push_reg(Reg::RBP);
    w.mov_reg_reg(Reg::RBP, Reg::RSP);
    w.sub_reg_imm32(Reg::RSP, SPILL_FRAME);
    for (i, reg) in ARG_REGS.into_iter().enumerate() {
        w.mov_mem_reg(Reg::RSP, (i * 8) as i32, reg);
    }
    w.mov_reg_imm64(Reg::RDI, state as u64);
    w.lea_reg_mem(Reg::RSI, Reg::RSP, 0);
    w.mov_reg_imm64(Reg::R11, dispatcher as u64);
    w.call_reg(Reg::R11);
    w.mov_reg_reg(Reg::RSP, Reg::RBP);
    w.pop_reg(Reg::RBP);
    w.ret();
    w.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut Writer<'_>)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        f(&mut w);
        let n = w.len();
        buf[..n].to_vec()
    }

    #[test]
    fn push_pop() {
        assert_eq!(encode(|w| w.push_reg(Reg::RBP)), &[0x55]);
        assert_eq!(encode(|w| w.pop_reg(Reg::RBP)), &[0x5D]);
        assert_eq!(encode(|w| w.push_reg(Reg::R11)), &[0x41, 0x53]);
    }

    #[test]
    fn mov_imm64() {
        let b = encode(|w| w.mov_reg_imm64(Reg::RDI, 0x1122_3344_5566_7788));
        assert_eq!(b[0], 0x48);
        assert_eq!(b[1], 0xBF);
        assert_eq!(u64::from_le_bytes(b[2..10].try_into().unwrap()), 0x1122_3344_5566_7788);

        let b = encode(|w| w.mov_reg_imm64(Reg::R11, 0x1234));
        assert_eq!(&b[..2], &[0x49, 0xBB]);
    }

    #[test]
    fn mov_reg_reg_encoding() {
        // mov rbp, rsp
        assert_eq!(encode(|w| w.mov_reg_reg(Reg::RBP, Reg::RSP)), &[0x48, 0x89, 0xE5]);
        // mov rsp, rbp
        assert_eq!(encode(|w| w.mov_reg_reg(Reg::RSP, Reg::RBP)), &[0x48, 0x89, 0xEC]);
    }

    #[test]
    fn spill_store_uses_sib_for_rsp_base() {
        // mov [rsp+0x10], rdi
        assert_eq!(
            encode(|w| w.mov_mem_reg(Reg::RSP, 0x10, Reg::RDI)),
            &[0x48, 0x89, 0xBC, 0x24, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn lea_and_sub() {
        assert_eq!(
            encode(|w| w.lea_reg_mem(Reg::RSI, Reg::RSP, 0)),
            &[0x48, 0x8D, 0xB4, 0x24, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|w| w.sub_reg_imm32(Reg::RSP, 0x40)),
            &[0x48, 0x81, 0xEC, 0x40, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn call_reg_r11() {
        assert_eq!(encode(|w| w.call_reg(Reg::R11)), &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn abs_jump_layout() {
        let b = branch_into(0xDEAD_BEEF_0000_1234);
        assert_eq!(b.len(), ABS_JUMP_LEN);
        assert_eq!(&b[..6], &[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&b[6..8], &[0x0F, 0x0B]);
        assert_eq!(u64::from_le_bytes(b[8..16].try_into().unwrap()), 0xDEAD_BEEF_0000_1234);
        assert_eq!(branch_to(0x1000), branch_into(0x1000));
    }

    #[test]
    fn dispatch_stub_shape() {
        let mut buf = [0u8; 256];
        let n = emit_dispatch_stub(&mut buf, 0x1111_2222_3333_4444, 0x5555_6666_7777_8888);
        assert!(n < buf.len());
        // Prologue: push rbp; mov rbp, rsp; sub rsp, imm32
        assert_eq!(&buf[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(&buf[4..7], &[0x48, 0x81, 0xEC]);
        // Epilogue: mov rsp, rbp; pop rbp; ret
        assert_eq!(&buf[n - 5..n], &[0x48, 0x89, 0xEC, 0x5D, 0xC3]);
        // Both absolute operands are embedded.
        let hay = &buf[..n];
        let has = |needle: u64| {
            hay.windows(8).any(|w| w == needle.to_le_bytes())
        };
        assert!(has(0x1111_2222_3333_4444));
        assert!(has(0x5555_6666_7777_8888));
    }

    #[test]
    fn stub_decodes_cleanly() {
        // Every emitted instruction must be decodable by our own decoder —
        // the patcher length-walks stubs and entries alike.
        let mut buf = [0u8; 256];
        let n = emit_dispatch_stub(&mut buf, 0x1000, 0x2000);
        let mut pos = 0;
        while pos < n {
            let insn = super::super::decoder::decode(&buf[pos..n]).expect("decodable");
            pos += insn.len;
        }
        assert_eq!(pos, n);
    }
}
