//! BSON utilities: the extended-document codec and id rendering.

mod formatter;
mod parser;

pub use formatter::*;
pub use parser::*;
