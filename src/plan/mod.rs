//! Call-flow documents: parsing, validation and sequential execution.

pub mod instruction;
pub mod parser;
pub mod producer;

pub use instruction::{Instruction, VerbKind};
pub use parser::parse_document;
pub use producer::{PlanProducer, PlanSource};
