/// Append-only buffer of x86-64 machine code under construction.
///
/// The builder knows nothing about instructions; callers append opcode bytes
/// and immediates. Immediates are encoded little-endian, as the CPU expects.
#[derive(Default, Debug)]
pub struct MachineCode {
    bytes: Vec<u8>,
}

impl MachineCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn append_imm32(&mut self, imm: u32) -> &mut Self {
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    pub fn append_imm64(&mut self, imm: u64) -> &mut Self {
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}
