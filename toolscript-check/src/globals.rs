//! Global names known to the sandbox
//!
//! The deny-list here is shared by the static analyzer and by the runtime's
//! friendly `ReferenceError` rewriting, so both layers agree on what is
//! unavailable.

/// Namespace object that holds bridged tools unless configured otherwise
pub const DEFAULT_NAMESPACE: &str = "mux";

/// Host-runtime globals that do not exist inside the sandbox
pub const UNAVAILABLE_GLOBALS: &[&str] = &[
    // Node.js
    "process",
    "require",
    "module",
    "exports",
    "__dirname",
    "__filename",
    // Browser
    "window",
    "document",
    "navigator",
    "fetch",
    "XMLHttpRequest",
];

/// Standard ECMAScript globals available to guest code
pub const ES_GLOBALS: &[&str] = &[
    "AggregateError",
    "Array",
    "ArrayBuffer",
    "Atomics",
    "BigInt",
    "BigInt64Array",
    "BigUint64Array",
    "Boolean",
    "DataView",
    "Date",
    "Error",
    "EvalError",
    "FinalizationRegistry",
    "Float32Array",
    "Float64Array",
    "Function",
    "Infinity",
    "Int16Array",
    "Int32Array",
    "Int8Array",
    "Intl",
    "JSON",
    "Map",
    "Math",
    "NaN",
    "Number",
    "Object",
    "Promise",
    "Proxy",
    "RangeError",
    "ReferenceError",
    "Reflect",
    "RegExp",
    "Set",
    "SharedArrayBuffer",
    "String",
    "Symbol",
    "SyntaxError",
    "TypeError",
    "URIError",
    "Uint16Array",
    "Uint32Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "WeakMap",
    "WeakRef",
    "WeakSet",
    "arguments",
    "console",
    "decodeURI",
    "decodeURIComponent",
    "encodeURI",
    "encodeURIComponent",
    "escape",
    "eval",
    "globalThis",
    "isFinite",
    "isNaN",
    "parseFloat",
    "parseInt",
    "undefined",
    "unescape",
];

pub fn is_unavailable_global(name: &str) -> bool {
    UNAVAILABLE_GLOBALS.contains(&name)
}

pub fn is_es_global(name: &str) -> bool {
    ES_GLOBALS.binary_search(&name).is_ok()
}

/// Analyzer message for a reference to a deny-listed global
pub fn unavailable_global_message(name: &str) -> String {
    format!("'{}' is not available in the sandbox", name)
}

/// Runtime replacement for the engine's "not defined" error
pub fn friendly_reference_error(name: &str, namespace: &str) -> String {
    format!(
        "ReferenceError: '{}' is not available in the sandbox. Use {}.* tools instead.",
        name, namespace
    )
}
