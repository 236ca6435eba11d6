//! # toolscript checks
//!
//! Everything that looks at guest code before it runs:
//! - [`analyzer`]: syntax, forbidden constructs and host-only globals
//! - [`signatures`]: ambient declarations generated from tool schemas
//! - [`cache`]: fingerprint-keyed memoization of those declarations
//! - [`validator`]: structural type checking of tool calls and results
//!
//! ## Example
//!
//! ```ignore
//! let tools = vec![ToolDescriptor::new("file_read", "Read a file", schema)];
//! let decls = generate_declarations("mux", &tools);
//!
//! let analysis = analyze_code("return mux.file_read({ path: 'a.txt' });")?;
//! let types = validate_types("return mux.file_read({ file: 'a.txt' });", &decls)?;
//! assert!(analysis.valid && !types.valid);
//! ```

pub mod analyzer;
pub mod cache;
pub mod error;
pub mod globals;
pub mod signatures;
pub mod syntax;
pub mod types;
pub mod validator;

#[cfg(test)]
mod tests;

pub use analyzer::{analyze_code, AnalysisError, AnalysisErrorKind, AnalysisResult, StaticAnalyzer};
pub use cache::{CacheStats, DeclarationCache, Fingerprint};
pub use error::{CheckError, Result, SourcePosition};
pub use globals::{friendly_reference_error, DEFAULT_NAMESPACE, UNAVAILABLE_GLOBALS};
pub use signatures::{generate_declarations, Declarations, ToolSignature, MCP_RESULT_TYPE};
pub use types::{Literal, ObjectType, TsType};
pub use validator::{validate_types, TypeValidator, ValidationError, ValidationResult};

pub use toolscript_types::ToolDescriptor;
