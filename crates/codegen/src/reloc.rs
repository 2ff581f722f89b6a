//! Relocation resolution with long-jump trampolines.
//!
//! Function bodies are concatenated 16-byte aligned. Every direct call was
//! emitted as a `bl` with a zero displacement plus a relocation record; once
//! all bodies have offsets the resolver patches each call with its real
//! displacement. A call whose displacement does not fit the instruction's
//! immediate field is redirected to a trampoline in a region reserved
//! directly after the calling function's body; reserving a region shifts
//! every later function, so planning iterates to a fixpoint, re-checking
//! displacements against the updated offsets each round.

use kestrel_environ::CompileError;

use crate::buffer::Reloc;
use crate::CompiledFunction;

/// Size of one long-jump trampoline: an address materialization, an
/// indirect branch, and padding to the next 16-byte boundary.
pub const TRAMPOLINE_SIZE: u32 = 16;

/// ISA hooks the resolver needs.
pub trait RelocPatcher: Send + Sync {
    /// Maximum direct-call displacement magnitude, in bytes.
    fn call_range(&self) -> i64;
    /// Patch the call instruction at `at` with the given displacement.
    fn patch_call(&self, code: &mut [u8], at: usize, disp: i64);
    /// Write a position-independent trampoline at image offset `at` that
    /// jumps to image offset `target`. Both offsets are relative to the
    /// (page-aligned) image base, so the encoding must not depend on the
    /// base address and the image stays cacheable.
    fn write_trampoline(&self, buf: &mut [u8], at: u32, target: u32);
}

/// One function's placement in the image.
#[derive(Clone, Debug)]
pub struct LaidOutFunction {
    pub offset: u32,
    pub body_len: u32,
    pub preamble_size: u32,
    /// Defined-function targets that go through this function's trailing
    /// trampoline region, in slot order.
    pub trampoline_targets: Vec<u32>,
}

impl LaidOutFunction {
    /// The guest-visible entry, past the host-entry preamble.
    pub fn entry(&self) -> u32 {
        self.offset + self.preamble_size
    }

    /// Bytes of long-jump trampoline region reserved after this function.
    pub fn trampoline_region_size(&self) -> u32 {
        self.trampoline_targets.len() as u32 * TRAMPOLINE_SIZE
    }

    fn trampoline_region(&self) -> u32 {
        self.offset + align16(self.body_len)
    }

    fn end(&self) -> u32 {
        self.trampoline_region() + self.trampoline_targets.len() as u32 * TRAMPOLINE_SIZE
    }
}

/// The planned image: final function offsets and total size.
pub struct ImageLayout {
    pub functions: Vec<LaidOutFunction>,
    pub total_size: u32,
}

fn align16(v: u32) -> u32 {
    (v + 15) & !15
}

/// Compute final offsets, reserving trampoline regions for out-of-range
/// calls. `resolve_target` maps a relocation target (a module-level function
/// index) to a defined-function index.
pub fn plan_image(
    patcher: &dyn RelocPatcher,
    funcs: &[CompiledFunction],
    resolve_target: &dyn Fn(u32) -> Option<u32>,
) -> Result<ImageLayout, CompileError> {
    let mut layout: Vec<LaidOutFunction> = funcs
        .iter()
        .map(|f| LaidOutFunction {
            offset: 0,
            body_len: f.body.len() as u32,
            preamble_size: f.preamble_size,
            trampoline_targets: Vec::new(),
        })
        .collect();

    let range = patcher.call_range();
    loop {
        // Recompute offsets with the current trampoline regions.
        let mut offset = 0u32;
        for f in layout.iter_mut() {
            f.offset = offset;
            offset = align16(f.end());
        }

        // Check every relocation against the current offsets.
        let mut changed = false;
        for (fi, func) in funcs.iter().enumerate() {
            for reloc in &func.relocs {
                let target = resolve_target(reloc.target).ok_or_else(|| {
                    CompileError::Codegen(format!(
                        "relocation against unresolvable function {}",
                        reloc.target
                    ))
                })?;
                if layout[fi].trampoline_targets.contains(&target) {
                    continue;
                }
                let site = i64::from(layout[fi].offset + reloc.offset);
                let callee = i64::from(layout[target as usize].entry());
                if (callee - site).abs() >= range {
                    layout[fi].trampoline_targets.push(target);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    let total_size = layout.last().map(|f| align16(f.end())).unwrap_or(0);
    Ok(ImageLayout {
        functions: layout,
        total_size,
    })
}

/// Copy the bodies into `image` at their planned offsets, patch every call,
/// and write the trampolines. The image is position-independent; it only
/// has to be mapped page-aligned.
pub fn link_image(
    patcher: &dyn RelocPatcher,
    funcs: &[CompiledFunction],
    layout: &ImageLayout,
    resolve_target: &dyn Fn(u32) -> Option<u32>,
    image: &mut [u8],
) -> Result<(), CompileError> {
    debug_assert!(image.len() >= layout.total_size as usize);
    for (f, laid) in funcs.iter().zip(&layout.functions) {
        let start = laid.offset as usize;
        image[start..start + f.body.len()].copy_from_slice(&f.body);
    }
    for (laid, _) in layout.functions.iter().zip(funcs) {
        let region = laid.trampoline_region();
        for (slot, &target) in laid.trampoline_targets.iter().enumerate() {
            let at = region + slot as u32 * TRAMPOLINE_SIZE;
            let entry = layout.functions[target as usize].entry();
            patcher.write_trampoline(
                &mut image[at as usize..(at + TRAMPOLINE_SIZE) as usize],
                at,
                entry,
            );
        }
    }
    for (fi, func) in funcs.iter().enumerate() {
        let laid = &layout.functions[fi];
        for reloc in &func.relocs {
            let target = resolve_target(reloc.target).ok_or_else(|| {
                CompileError::Codegen(format!(
                    "relocation against unresolvable function {}",
                    reloc.target
                ))
            })?;
            let site = laid.offset + reloc.offset;
            let dest = match laid
                .trampoline_targets
                .iter()
                .position(|&t| t == target)
            {
                Some(slot) => laid.trampoline_region() + slot as u32 * TRAMPOLINE_SIZE,
                None => layout.functions[target as usize].entry(),
            };
            let disp = i64::from(dest) - i64::from(site);
            patcher.patch_call(image, site as usize, disp);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A patcher with an artificially small range so the shifting logic can
    /// be exercised without huge buffers.
    struct NarrowPatcher;

    impl RelocPatcher for NarrowPatcher {
        fn call_range(&self) -> i64 {
            64
        }
        fn patch_call(&self, code: &mut [u8], at: usize, disp: i64) {
            code[at..at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
        }
        fn write_trampoline(&self, buf: &mut [u8], _at: u32, target: u32) {
            buf[0..4].copy_from_slice(&target.to_le_bytes());
            buf[4..16].copy_from_slice(&[0xEE; 12]);
        }
    }

    fn func(len: usize, relocs: Vec<Reloc>) -> CompiledFunction {
        CompiledFunction {
            body: vec![0; len],
            relocs,
            preamble_size: 0,
        }
    }

    #[test]
    fn near_calls_are_patched_in_place() {
        let funcs = vec![
            func(16, vec![Reloc { offset: 0, target: 1 }]),
            func(16, vec![]),
        ];
        let layout = plan_image(&NarrowPatcher, &funcs, &|t| Some(t)).unwrap();
        assert!(layout.functions[0].trampoline_targets.is_empty());
        assert_eq!(layout.functions[1].offset, 16);
        assert_eq!(layout.total_size, 32);

        let mut image = vec![0u8; layout.total_size as usize];
        link_image(&NarrowPatcher, &funcs, &layout, &|t| Some(t), &mut image).unwrap();
        let disp = i32::from_le_bytes(image[0..4].try_into().unwrap());
        assert_eq!(disp, 16);
    }

    #[test]
    fn far_call_gets_a_trailing_trampoline() {
        // Function 0 calls function 2, which lands beyond the 64-byte range.
        let funcs = vec![
            func(16, vec![Reloc { offset: 0, target: 2 }]),
            func(64, vec![]),
            func(16, vec![]),
        ];
        let layout = plan_image(&NarrowPatcher, &funcs, &|t| Some(t)).unwrap();
        assert_eq!(layout.functions[0].trampoline_targets, vec![2]);
        // The region shifts later functions by one trampoline slot.
        assert_eq!(layout.functions[0].offset, 0);
        assert_eq!(layout.functions[1].offset, 32);
        assert_eq!(layout.functions[2].offset, 96);

        let mut image = vec![0u8; layout.total_size as usize];
        link_image(&NarrowPatcher, &funcs, &layout, &|t| Some(t), &mut image).unwrap();
        // The call now targets the trampoline at offset 16.
        let disp = i32::from_le_bytes(image[0..4].try_into().unwrap());
        assert_eq!(disp, 16);
        // The trampoline records the callee's image offset.
        let target = u32::from_le_bytes(image[16..20].try_into().unwrap());
        assert_eq!(target, 96);
    }

    #[test]
    fn trampolines_are_deduplicated_per_caller() {
        let funcs = vec![
            func(
                16,
                vec![
                    Reloc { offset: 0, target: 2 },
                    Reloc { offset: 4, target: 2 },
                ],
            ),
            func(64, vec![]),
            func(16, vec![]),
        ];
        let layout = plan_image(&NarrowPatcher, &funcs, &|t| Some(t)).unwrap();
        assert_eq!(layout.functions[0].trampoline_targets.len(), 1);
    }

    #[test]
    fn unresolvable_target_is_an_error() {
        let funcs = vec![func(16, vec![Reloc { offset: 0, target: 7 }])];
        assert!(plan_image(&NarrowPatcher, &funcs, &|_| None).is_err());
    }
}
