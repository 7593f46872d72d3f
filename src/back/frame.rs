//! Stack-frame layout and call lowering.
//!
//! After allocation the frame knows every stack slot (address-taken locals
//! plus spills) and the callee-saved registers in use.  This pass lays the
//! frame out, materializes prologue and epilogue, resolves the slot
//! pseudo-instructions to sp-relative accesses, and expands each `VCall`
//! into the caller-save protocol.
//!
//! The frame grows downward and every slot is word-aligned:
//!
//! ```txt
//!   | caller's frame     |
//!   +--------------------+  <- sp on entry
//!   | ra                 |
//!   | saved callee regs  |
//!   | locals and spills  |
//!   +--------------------+  <- sp after prologue
//! ```

use log::trace;

use crate::back::arch::{AluOp, Arch, LoadOp, MBlock, MFunction, MInst, Reg, StoreOp};
use crate::common::{Map, Set};

/// Per-function frame state, created at instruction selection and grown by
/// the register allocator.
#[derive(Debug, Default)]
pub struct Frame {
    /// Slot sizes in bytes, already rounded up to whole words.
    slots: Vec<u32>,
    /// Registers holding incoming parameters.
    pub arg_regs: Vec<Reg>,
    /// Callee-saved registers the allocator handed out.
    pub used_callee_saved: Set<Reg>,
}

impl Frame {
    pub fn new() -> Frame {
        Frame::default()
    }

    pub fn add_slot(&mut self, size: u32, word: u32) -> usize {
        let size = size.max(1).div_ceil(word) * word;
        self.slots.push(size);
        self.slots.len() - 1
    }

    /// A one-word slot for a spilled virtual register.
    pub fn spill_slot(&mut self, word: u32) -> usize {
        self.add_slot(word, word)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn layout(&self, word: u32) -> (Vec<i32>, i32) {
        let mut offsets = Vec::with_capacity(self.slots.len());
        let mut next = 0i32;
        for &size in &self.slots {
            offsets.push(next);
            next += size as i32;
        }
        // A function with no slots and no saved registers needs no frame;
        // ra is protected around calls by the call lowering itself.
        if next == 0 && self.used_callee_saved.is_empty() {
            return (offsets, 0);
        }
        let saved = (self.used_callee_saved.len() as i32 + 1) * word as i32;
        (offsets, next + saved)
    }
}

/// Lower the frame of an allocated function.
pub fn lower_frame<A: Arch>(
    arch: &A,
    func: MFunction<Reg>,
    frame: &Frame,
) -> MFunction<Reg> {
    let word = arch.word_size() as i32;
    let sp = arch.stack_pointer();
    let ra = arch.return_address();
    let (slot_offsets, frame_size) = frame.layout(word as u32);
    trace!("frame of {}: {frame_size} bytes, {} slots", func.name, slot_offsets.len());

    // Saved registers live above the locals, ra on top.
    let saved: Vec<Reg> = frame.used_callee_saved.iter().copied().collect();
    let locals_size = frame_size - (saved.len() as i32 + 1) * word;
    let reg_offset = |i: usize| locals_size + i as i32 * word;
    let ra_offset = frame_size - word;

    let live_over_calls = call_live_sets(arch, &func);

    let mut blocks = Vec::with_capacity(func.blocks.len());
    for (bi, block) in func.blocks.into_iter().enumerate() {
        let mut insts: Vec<MInst<Reg>> = Vec::with_capacity(block.insts.len());

        if bi == 0 && frame_size > 0 {
            insts.push(MInst::AluImm {
                op: AluOp::Add,
                dst: sp,
                src: sp,
                imm: -frame_size,
            });
            insts.push(store_word(ra, sp, ra_offset));
            for (i, &r) in saved.iter().enumerate() {
                insts.push(store_word(r, sp, reg_offset(i)));
            }
        }

        for (ii, inst) in block.insts.into_iter().enumerate() {
            match inst {
                MInst::LoadSlot { dst, slot } => {
                    insts.push(MInst::Load {
                        op: LoadOp::Lw,
                        dst,
                        base: sp,
                        offset: slot_offsets[slot],
                    });
                }
                MInst::StoreSlot { src, slot } => {
                    insts.push(store_word(src, sp, slot_offsets[slot]));
                }
                MInst::SlotAddr { dst, slot } => {
                    insts.push(MInst::AluImm {
                        op: AluOp::Add,
                        dst,
                        src: sp,
                        imm: slot_offsets[slot],
                    });
                }
                MInst::VCall { name, ret, .. } => {
                    let empty = Vec::new();
                    let saved_here = live_over_calls.get(&(bi, ii)).unwrap_or(&empty);
                    insts.extend(arch.make_call(saved_here, name, ret));
                }
                MInst::Ret => {
                    if frame_size > 0 {
                        for (i, &r) in saved.iter().enumerate() {
                            insts.push(load_word(r, sp, reg_offset(i)));
                        }
                        insts.push(load_word(ra, sp, ra_offset));
                        insts.push(MInst::AluImm {
                            op: AluOp::Add,
                            dst: sp,
                            src: sp,
                            imm: frame_size,
                        });
                    }
                    insts.push(MInst::Ret);
                }
                other => insts.push(other),
            }
        }
        blocks.push(MBlock { label: block.label, insts, loop_depth: block.loop_depth });
    }

    MFunction { name: func.name, blocks }
}

/// For every `VCall` site, the caller-saved registers whose values are
/// still needed after the call.  Computed by backward liveness over the
/// allocated code.
fn call_live_sets<A: Arch>(arch: &A, func: &MFunction<Reg>) -> Map<(usize, usize), Vec<Reg>> {
    let caller_saved: Set<Reg> = arch.caller_saved().iter().copied().collect();
    let (_, live_out) = crate::back::regalloc::block_liveness(func);

    let mut result = Map::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        let mut live = live_out[bi].clone();
        for (ii, inst) in block.insts.iter().enumerate().rev() {
            for d in inst.defs() {
                live.remove(&d);
            }
            if let MInst::VCall { .. } = inst {
                let saved: Vec<Reg> =
                    live.iter().copied().filter(|r| caller_saved.contains(r)).collect();
                result.insert((bi, ii), saved);
            }
            for u in inst.uses() {
                live.insert(u);
            }
        }
    }
    result
}

fn store_word(src: Reg, base: Reg, offset: i32) -> MInst<Reg> {
    MInst::Store { op: StoreOp::Sw, src, base, offset }
}

fn load_word(dst: Reg, base: Reg, offset: i32) -> MInst<Reg> {
    MInst::Load { op: LoadOp::Lw, dst, base, offset }
}
