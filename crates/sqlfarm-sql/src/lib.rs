pub mod fingerprint;
pub mod literal;
pub mod parser;
pub mod table_finder;

pub use fingerprint::fingerprint;
pub use literal::{escape_literal, interpolate};
pub use parser::{command_of, normalize, parse_statement, Command, ParsedStatement};
pub use table_finder::find_tables;
