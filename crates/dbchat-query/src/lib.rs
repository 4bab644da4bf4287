//! Query mini-language for dbchat.
//!
//! Parses the shell-style call expressions produced by the oracle, such as
//! `db.sales.find({region: "EU"}).sort({total: -1}).limit(5)`, into a
//! [`ParsedQuery`]. Arguments are read by a closed grammar; nothing in the
//! query text is ever evaluated.

pub mod error;
pub mod expr;
pub mod parser;

pub use error::ParseError;
pub use expr::{Expr, TimeExpr};
pub use parser::{parse, Method, ParsedQuery, ResolvedQuery};
