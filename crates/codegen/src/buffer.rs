//! The machine-code emission buffer: bytes, labels, fixups, relocations.
//!
//! Labels are function-local. Fixups are resolved at finalization; there is
//! no veneer machinery, so a single function body must keep conditional
//! branches within their 19-bit range (±1 MiB), which bounds function size
//! far beyond anything the front end produces. Calls to other functions are
//! recorded as relocations and patched later by the engine.

use kestrel_environ::CompileError;

/// A position in the buffer, bindable and branchable-to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Label(pub(crate) u32);

/// How a fixup site encodes its displacement.
#[derive(Copy, Clone, Debug)]
pub enum LabelUse {
    /// A 26-bit word displacement in the low bits (`b`, `bl`).
    Branch26,
    /// A 19-bit word displacement in bits 5..24 (`b.cond`, `cbz`, `cbnz`).
    Branch19,
    /// A signed 32-bit byte offset stored as data, relative to `base`.
    Offset32 { base: u32 },
    /// The 21-bit immediate of an `adr`.
    Adr21,
}

/// An unresolved direct call: `target` is a function index of the module.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u32,
    pub target: u32,
}

#[derive(Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(u32, Label, LabelUse)>,
    relocs: Vec<Reloc>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cur_offset(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn put4(&mut self, word: u32) {
        self.data.extend_from_slice(&word.to_le_bytes());
    }

    pub fn new_label(&mut self) -> Label {
        let l = Label(self.labels.len() as u32);
        self.labels.push(None);
        l
    }

    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(
            self.labels[label.0 as usize].is_none(),
            "label bound twice"
        );
        self.labels[label.0 as usize] = Some(self.cur_offset());
    }

    /// Record that the word about to be emitted at the current offset
    /// references `label`.
    pub fn use_label(&mut self, label: Label, kind: LabelUse) {
        self.fixups.push((self.cur_offset(), label, kind));
    }

    /// Record a call relocation for the word about to be emitted.
    pub fn add_reloc(&mut self, target: u32) {
        self.relocs.push(Reloc {
            offset: self.cur_offset(),
            target,
        });
    }

    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels[label.0 as usize]
    }

    /// Resolve all fixups and return the bytes plus relocations.
    pub fn finalize(mut self) -> Result<(Vec<u8>, Vec<Reloc>), CompileError> {
        for &(at, label, kind) in &self.fixups {
            let target = self.labels[label.0 as usize]
                .ok_or_else(|| CompileError::Codegen(format!("unbound label {label:?}")))?;
            let disp = target as i64 - at as i64;
            let at = at as usize;
            match kind {
                LabelUse::Branch26 => {
                    if disp % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&disp) {
                        return Err(CompileError::Codegen(format!(
                            "branch26 displacement {disp} out of range"
                        )));
                    }
                    let word = u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
                    let word = word | (((disp / 4) as u32) & 0x03ff_ffff);
                    self.data[at..at + 4].copy_from_slice(&word.to_le_bytes());
                }
                LabelUse::Branch19 => {
                    if disp % 4 != 0 || !(-(1 << 20)..(1 << 20)).contains(&disp) {
                        return Err(CompileError::Codegen(format!(
                            "branch19 displacement {disp} out of range"
                        )));
                    }
                    let word = u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
                    let word = word | ((((disp / 4) as u32) & 0x7ffff) << 5);
                    self.data[at..at + 4].copy_from_slice(&word.to_le_bytes());
                }
                LabelUse::Adr21 => {
                    if !(-(1 << 20)..(1 << 20)).contains(&disp) {
                        return Err(CompileError::Codegen(format!(
                            "adr displacement {disp} out of range"
                        )));
                    }
                    let off = disp as u32;
                    let immlo = off & 3;
                    let immhi = (off >> 2) & ((1 << 19) - 1);
                    let word = u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
                    let word = word | (immlo << 29) | (immhi << 5);
                    self.data[at..at + 4].copy_from_slice(&word.to_le_bytes());
                }
                LabelUse::Offset32 { base } => {
                    let rel = target as i64 - base as i64;
                    let rel = i32::try_from(rel).map_err(|_| {
                        CompileError::Codegen("jump table offset out of range".to_string())
                    })?;
                    self.data[at..at + 4].copy_from_slice(&rel.to_le_bytes());
                }
            }
        }
        Ok((self.data, self.relocs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_branch_fixup() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        // An unconditional branch: opcode bits only, displacement patched in.
        buf.use_label(label, LabelUse::Branch26);
        buf.put4(0b000101 << 26);
        buf.put4(0xd503201f); // nop
        buf.bind_label(label);
        buf.put4(0xd65f03c0); // ret
        let (bytes, relocs) = buf.finalize().unwrap();
        assert!(relocs.is_empty());
        let b = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(b, (0b000101 << 26) | 2); // two words forward
    }

    #[test]
    fn backward_branch19() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.bind_label(label);
        buf.put4(0xd503201f);
        buf.use_label(label, LabelUse::Branch19);
        buf.put4(0x54000000); // b.eq with zero displacement
        let (bytes, _) = buf.finalize().unwrap();
        let word = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let disp = ((word >> 5) & 0x7ffff) as i32;
        // Sign bits live above bit 18; -1 word is 0x7ffff.
        assert_eq!(disp, 0x7ffff);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.use_label(label, LabelUse::Branch26);
        buf.put4(0b000101 << 26);
        assert!(buf.finalize().is_err());
    }
}
