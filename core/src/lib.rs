pub mod context;
pub mod dump;
pub mod helper;
pub mod ir_builder;
pub mod label;
pub mod op;
pub mod opcode;
pub mod serialize;
pub mod tb;
pub mod temp;
pub mod types;

pub use context::Context;
pub use helper::{HelperFlags, HelperInfo, HelperRegistry};
pub use label::{Label, LabelUse, RelocKind};
pub use op::{LifeData, Op, OpIdx, MAX_OP_ARGS};
pub use opcode::{OpDef, OpFlags, Opcode, OPCODE_DEFS};
pub use tb::{JumpCache, TranslationBlock, TB_HASH_SIZE, TB_JMP_CACHE_SIZE};
pub use temp::{Temp, TempIdx, TempKind};
pub use types::{Cond, MemOp, RegSet, TempVal, Type};
