//! Crescent compiler: lexer, Lua 5.1 bytecode, and the single-pass
//! source-to-Proto compiler.

pub mod compiler;
pub mod lexer;
pub mod opcode;
pub mod proto;
pub mod token;
