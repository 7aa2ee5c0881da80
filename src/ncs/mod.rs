pub mod codec;
pub mod disasm;
pub mod instruction;
pub mod opcode;
pub mod optimize;

pub use codec::{decode, encode, CorruptBinaryError, EncodeError};
pub use instruction::{Instruction, Operand, Program};
pub use opcode::{Opcode, Qualifier};
